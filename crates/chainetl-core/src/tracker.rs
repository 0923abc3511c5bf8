//! Head tracker — keeps a sliding window of the most recently committed
//! block headers for parent-hash verification and fork detection.

use std::collections::VecDeque;

use crate::types::BlockHeader;

/// Tracks the last N committed headers of the local chain.
///
/// When a new block is committed the tracker checks that its `predecessor`
/// matches the hash of the current head. The window only ever holds a
/// single linear chain: rollback pops from the back.
pub struct BlockTracker {
    /// Sliding window of committed headers (oldest first).
    window: VecDeque<BlockHeader>,
    /// Maximum number of headers to retain.
    window_size: usize,
}

impl BlockTracker {
    /// Create a new tracker with the given window size.
    ///
    /// The window should be at least as deep as the maximum reorg depth so
    /// the common-ancestor search rarely has to fall back to storage.
    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
        }
    }

    /// Append a newly committed header.
    ///
    /// Returns `Err(depth)` if the header does not extend the current head;
    /// `depth` is how many tracked headers sit above the fork point.
    pub fn push(&mut self, header: BlockHeader) -> Result<(), u64> {
        if let Some(head) = self.window.back() {
            if !header.extends(head) {
                return Err(self.find_fork_depth(&header));
            }
        }
        if self.window.len() >= self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(header);
        Ok(())
    }

    /// Returns the current local head (most recently committed header).
    pub fn head(&self) -> Option<&BlockHeader> {
        self.window.back()
    }

    /// Returns the tracked header at `height`, if it is inside the window.
    pub fn get(&self, height: u64) -> Option<&BlockHeader> {
        let first = self.window.front()?.height;
        let idx = height.checked_sub(first)? as usize;
        self.window.get(idx).filter(|h| h.height == height)
    }

    /// Returns the lowest height still inside the window.
    pub fn tail_height(&self) -> Option<u64> {
        self.window.front().map(|h| h.height)
    }

    /// Number of headers in the window.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Returns `true` if the window is empty.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Remove and return the current head (used after a rollback).
    pub fn pop(&mut self) -> Option<BlockHeader> {
        self.window.pop_back()
    }

    /// Rewind the tracker to `height` (discard everything above it).
    pub fn rewind_to(&mut self, height: u64) {
        while let Some(back) = self.window.back() {
            if back.height > height {
                self.window.pop_back();
            } else {
                break;
            }
        }
    }

    /// Replace the window content, e.g. when reloading from storage.
    /// `headers` must be ordered oldest first.
    pub fn reset(&mut self, headers: impl IntoIterator<Item = BlockHeader>) {
        self.window.clear();
        for header in headers {
            if self.window.len() >= self.window_size {
                self.window.pop_front();
            }
            self.window.push_back(header);
        }
    }

    fn find_fork_depth(&self, new_header: &BlockHeader) -> u64 {
        for (i, tracked) in self.window.iter().enumerate().rev() {
            if tracked.hash == new_header.predecessor {
                return (self.window.len() - 1 - i) as u64;
            }
        }
        // fork point is older than the window
        self.window.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn header(height: u64, hash: &str, pred: &str) -> BlockHeader {
        BlockHeader {
            height,
            hash: hash.into(),
            predecessor: pred.into(),
            timestamp: DateTime::from_timestamp(height as i64 * 30, 0).unwrap_or_default(),
        }
    }

    fn chain(tracker: &mut BlockTracker, from: u64, to: u64) {
        for i in from..=to {
            let pred = if i == from { "BL0".to_string() } else { format!("BL{}", i - 1) };
            tracker.push(header(i, &format!("BL{i}"), &pred)).unwrap();
        }
    }

    #[test]
    fn push_linear_chain() {
        let mut tracker = BlockTracker::new(10);
        chain(&mut tracker, 100, 102);
        assert_eq!(tracker.head().unwrap().height, 102);
        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.get(101).unwrap().hash, "BL101");
        assert!(tracker.get(99).is_none());
        assert!(tracker.get(103).is_none());
    }

    #[test]
    fn push_detects_fork() {
        let mut tracker = BlockTracker::new(10);
        chain(&mut tracker, 100, 103);
        // competing 103' on top of 101
        let depth = tracker.push(header(102, "BL102b", "BL101")).unwrap_err();
        assert_eq!(depth, 2);
        // unrelated parent: the fork point is outside the window
        let depth = tracker.push(header(104, "BLx", "BLunknown")).unwrap_err();
        assert_eq!(depth, 4);
    }

    #[test]
    fn rewind_and_pop() {
        let mut tracker = BlockTracker::new(20);
        chain(&mut tracker, 100, 110);
        tracker.rewind_to(105);
        assert_eq!(tracker.head().unwrap().height, 105);
        assert_eq!(tracker.pop().unwrap().height, 105);
        assert_eq!(tracker.head().unwrap().height, 104);
    }

    #[test]
    fn window_size_enforced() {
        let mut tracker = BlockTracker::new(5);
        chain(&mut tracker, 0, 9);
        assert_eq!(tracker.len(), 5);
        assert_eq!(tracker.tail_height(), Some(5));
    }

    #[test]
    fn reset_keeps_newest() {
        let mut tracker = BlockTracker::new(3);
        tracker.reset((1..=6).map(|i| header(i, &format!("BL{i}"), &format!("BL{}", i - 1))));
        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.tail_height(), Some(4));
        assert_eq!(tracker.head().unwrap().hash, "BL6");
    }
}
