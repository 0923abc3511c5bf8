//! The chain synchronization state machine.
//!
//! # Lifecycle
//! `Uninitialized → init(Sync | Info) → start() → Running ⇄ Rollback → Stopped`,
//! with `Failed` reachable from any running state on a fatal error.
//!
//! # Poll cycle
//! 1. Ask the node for its head.
//! 2. Linear extension: build and commit every missing block in ascending
//!    order, fetching the next block while the current one commits.
//! 3. Fork: find the common ancestor, roll back every local block above it
//!    in descending order, then replay the competing chain ascending.
//!
//! A single driver task owns every state transition. Errors that survive
//! the client's own retries abort the cycle; fatal ones halt the crawler,
//! the rest back off and retry the whole cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use chainetl_core::config::CrawlerConfig;
use chainetl_core::error::IndexerError;
use chainetl_core::reorg::ReorgDetector;
use chainetl_core::retry::RetryPolicy;
use chainetl_core::snapshot::SnapshotSchedule;
use chainetl_core::status::{CrawlerState, SyncMode, SyncStatus};
use chainetl_core::store::TableStore;
use chainetl_core::tracker::BlockTracker;
use chainetl_core::types::{BlockHeader, BlockId};

use crate::builder::{BlockBuilder, BlockPools, BuiltBlock};
use crate::indexer::Indexer;
use crate::rpc::{NodeHeaders, RawBlock, RawClient};

/// One index mutation performed by a poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Apply(u64),
    Rollback(u64),
}

/// What a single poll cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Already at the node head (or the stop height).
    Idle,
    /// Linear extension by these heights.
    Applied(Vec<u64>),
    /// A fork was resolved.
    Reorged { ancestor: u64, steps: Vec<Step> },
}

// ─── SyncLoop ─────────────────────────────────────────────────────────────────

/// The driver loop behind a started [`Crawler`].
pub struct SyncLoop<C, S> {
    config: CrawlerConfig,
    client: Arc<C>,
    indexer: Indexer<S>,
    builder: BlockBuilder,
    tracker: BlockTracker,
    detector: ReorgDetector,
    snapshots: SnapshotSchedule,
    backoff: RetryPolicy,
    status: Arc<watch::Sender<SyncStatus>>,
    token: CancellationToken,
}

impl<C, S> SyncLoop<C, S>
where
    C: RawClient + 'static,
    S: TableStore + 'static,
{
    pub fn new(
        config: CrawlerConfig,
        client: Arc<C>,
        indexer: Indexer<S>,
        pools: BlockPools,
        status: Arc<watch::Sender<SyncStatus>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            builder: BlockBuilder::new(pools, config.validate),
            tracker: BlockTracker::new(config.max_reorg_depth as usize + 1),
            detector: ReorgDetector::new(config.max_reorg_depth),
            snapshots: SnapshotSchedule::new(config.snapshot.clone()),
            backoff: RetryPolicy::new(config.retry.clone()),
            config,
            client,
            indexer,
            status,
            token,
        }
    }

    /// Reload the head window from the index.
    pub async fn init(&mut self) -> Result<(), IndexerError> {
        let Some(head) = self.indexer.head().await? else {
            self.tracker.reset(std::iter::empty());
            return Ok(());
        };
        let window = self.config.max_reorg_depth + 1;
        let from = (head.height + 1).saturating_sub(window);
        let mut headers = Vec::new();
        for h in from..=head.height {
            if let Some(block) = self.indexer.block(h).await? {
                headers.push(block.header());
            }
        }
        self.tracker.reset(headers);
        self.status.send_modify(|s| {
            s.height = Some(head.height);
            s.hash = Some(head.hash.clone());
        });
        debug!(height = head.height, window = self.tracker.len(), "loaded head window");
        Ok(())
    }

    fn local_head(&self) -> Option<&BlockHeader> {
        self.tracker.head()
    }

    fn reached_stop(&self) -> bool {
        match (self.config.stop_height, self.local_head()) {
            (Some(stop), Some(head)) => head.height >= stop,
            _ => false,
        }
    }

    fn set_state(&self, state: CrawlerState) {
        self.status.send_modify(|s| s.state = state);
    }

    /// Run one poll cycle.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, IndexerError> {
        let node = self.client.get_head().await?;
        self.status.send_modify(|s| s.node_height = Some(node.height));

        let target = self
            .config
            .stop_height
            .map_or(node.height, |stop| node.height.min(stop));

        let local = self.local_head().cloned();
        if let Some(local) = &local {
            if node.height <= local.height {
                let ours = self.indexer.block_hash(node.height).await?;
                if ours.as_deref() == Some(node.hash.as_str()) {
                    return Ok(PollOutcome::Idle);
                }
                return self.reorg(node, local.height, target).await;
            }
        }

        let next = local.map_or(self.config.start_height, |l| l.height + 1);
        if next > target {
            return Ok(PollOutcome::Idle);
        }

        let mut applied = Vec::new();
        let mut pending = Some(self.client.get_block(BlockId::Height(next)).await?);
        while let Some(raw) = pending.take() {
            if let Some(head) = self.local_head() {
                if raw.predecessor != head.hash {
                    let local_height = head.height;
                    return self.reorg(raw.header(), local_height, target).await;
                }
            }
            let built = self.build(&raw).await?;
            let height = raw.height;
            let client = &self.client;
            let prefetch = async move {
                if height < target {
                    client.get_block(BlockId::Height(height + 1)).await.map(Some)
                } else {
                    Ok(None)
                }
            };
            let (committed, fetched) =
                tokio::join!(self.indexer.commit(built, &self.token), prefetch);
            committed?;
            self.committed(raw.header()).await?;
            applied.push(height);
            pending = fetched?;
        }
        Ok(PollOutcome::Applied(applied))
    }

    /// Resolve a fork whose competing tip is `candidate`.
    async fn reorg(
        &mut self,
        candidate: BlockHeader,
        local_head: u64,
        target: u64,
    ) -> Result<PollOutcome, IndexerError> {
        self.set_state(CrawlerState::Rollback);
        let event = self
            .detector
            .find_common_ancestor(&NodeHeaders(&*self.client), &self.indexer, &candidate, local_head)
            .await?;

        let mut steps = Vec::new();
        for h in event.rollback_heights(local_head) {
            self.indexer.rollback(h, &self.token).await?;
            self.tracker.rewind_to(h.saturating_sub(1));
            if h == 0 {
                self.tracker.reset(std::iter::empty());
            }
            steps.push(Step::Rollback(h));
        }
        if self.tracker.is_empty() && event.ancestor < local_head {
            self.init().await?;
        }
        self.status.send_modify(|s| {
            s.height = self.tracker.head().map(|h| h.height);
            s.hash = self.tracker.head().map(|h| h.hash.clone());
        });

        self.set_state(CrawlerState::Running);
        for header in &event.replay {
            if header.height > target {
                break;
            }
            let raw = self.client.get_block(BlockId::Hash(header.hash.clone())).await?;
            let built = self.build(&raw).await?;
            self.indexer.commit(built, &self.token).await?;
            self.committed(raw.header()).await?;
            steps.push(Step::Apply(raw.height));
        }
        info!(
            ancestor = event.ancestor,
            depth = event.depth,
            replayed = event.replay.len(),
            "fork resolved"
        );
        Ok(PollOutcome::Reorged {
            ancestor: event.ancestor,
            steps,
        })
    }

    async fn build(&self, raw: &RawBlock) -> Result<BuiltBlock, IndexerError> {
        let parent = match (self.local_head(), raw.height) {
            (Some(_), h) if h > 0 => self.indexer.block(h - 1).await?,
            _ => None,
        };
        self.builder
            .build(raw, parent.as_ref(), &*self.client, &self.indexer)
            .await
    }

    /// Book-keeping after `header` was committed.
    async fn committed(&mut self, header: BlockHeader) -> Result<(), IndexerError> {
        let height = header.height;
        self.status.send_modify(|s| {
            s.height = Some(height);
            s.hash = Some(header.hash.clone());
            s.last_error = None;
        });
        self.tracker.push(header).map_err(|depth| {
            IndexerError::invariant(height, format!("committed block forks {depth} below head"))
        })?;
        if let Some(path) = self.snapshots.due(height) {
            match self.indexer.snapshot(&path).await {
                Ok(()) => info!(height, path = %path.display(), "snapshot written"),
                Err(e) => warn!(height, path = %path.display(), error = %e, "snapshot failed"),
            }
        }
        Ok(())
    }

    /// Drive poll cycles until cancelled, stopped or failed.
    pub async fn run(mut self) -> Result<(), IndexerError> {
        let token = self.token.clone();
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        self.init().await?;
        self.set_state(CrawlerState::Running);
        info!(crawler = %self.config.id, "crawler running");

        let mut failures = 0u32;
        loop {
            if self.reached_stop() {
                info!(height = ?self.local_head().map(|h| h.height), "stop height reached");
                self.set_state(CrawlerState::Stopped);
                return Ok(());
            }

            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Err(IndexerError::Cancelled),
                r = self.poll_once() => r,
            };
            let delay = match outcome {
                Ok(PollOutcome::Idle) => {
                    failures = 0;
                    poll
                }
                Ok(_) => {
                    failures = 0;
                    Duration::ZERO
                }
                Err(IndexerError::Cancelled) => {
                    self.set_state(CrawlerState::Stopped);
                    info!(crawler = %self.config.id, "crawler stopped");
                    return Ok(());
                }
                Err(e) if e.is_fatal() => {
                    error!(crawler = %self.config.id, error = %e, "crawler halted");
                    self.status.send_modify(|s| {
                        s.state = CrawlerState::Failed;
                        s.last_error = Some(e.to_string());
                    });
                    return Err(e);
                }
                Err(e) => {
                    failures += 1;
                    let delay = self.backoff.backoff(failures);
                    warn!(
                        error = %e,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        "poll cycle failed"
                    );
                    self.status.send_modify(|s| {
                        s.state = CrawlerState::Running;
                        s.last_error = Some(e.to_string());
                    });
                    delay
                }
            };

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        self.set_state(CrawlerState::Stopped);
                        info!(crawler = %self.config.id, "crawler stopped");
                        return Ok(());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

// ─── Crawler ──────────────────────────────────────────────────────────────────

/// Lifecycle handle around the driver loop.
pub struct Crawler<C, S> {
    config: CrawlerConfig,
    client: Arc<C>,
    indexer: Indexer<S>,
    pools: BlockPools,
    status: Arc<watch::Sender<SyncStatus>>,
    token: CancellationToken,
    task: Option<JoinHandle<Result<(), IndexerError>>>,
}

impl<C, S> Crawler<C, S>
where
    C: RawClient + 'static,
    S: TableStore + 'static,
{
    pub fn new(config: CrawlerConfig, client: Arc<C>, store: Arc<S>) -> Self {
        let (status, _) = watch::channel(SyncStatus::default());
        Self {
            config,
            client,
            indexer: Indexer::new(store),
            pools: BlockPools::default(),
            status: Arc::new(status),
            token: CancellationToken::new(),
            task: None,
        }
    }

    pub fn with_pools(mut self, pools: BlockPools) -> Self {
        self.pools = pools;
        self
    }

    pub fn config(&self) -> &CrawlerConfig {
        &self.config
    }

    pub fn indexer(&self) -> &Indexer<S> {
        &self.indexer
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Select the mode and load the committed head.
    pub async fn init(&mut self, mode: SyncMode) -> Result<(), IndexerError> {
        let state = self.status.borrow().state;
        if state != CrawlerState::Uninitialized {
            return Err(IndexerError::Config(format!("crawler already initialised ({state})")));
        }
        let head = self.indexer.head().await?;
        self.status.send_modify(|s| {
            s.mode = Some(mode);
            s.state = match mode {
                SyncMode::Sync => CrawlerState::Sync,
                SyncMode::Info => CrawlerState::Info,
            };
            s.height = head.as_ref().map(|h| h.height);
            s.hash = head.as_ref().map(|h| h.hash.clone());
        });
        info!(crawler = %self.config.id, ?mode, height = ?head.map(|h| h.height), "crawler initialised");
        Ok(())
    }

    /// Spawn the driver loop. Does nothing in `Info` mode.
    pub fn start(&mut self) -> Result<(), IndexerError> {
        match self.status.borrow().state {
            CrawlerState::Info => {
                debug!(crawler = %self.config.id, "info mode, not starting");
                return Ok(());
            }
            CrawlerState::Sync => {}
            state => {
                return Err(IndexerError::Config(format!("cannot start crawler in state {state}")))
            }
        }
        let sync = SyncLoop::new(
            self.config.clone(),
            Arc::clone(&self.client),
            self.indexer.clone(),
            self.pools.clone(),
            Arc::clone(&self.status),
            self.token.clone(),
        );
        self.status.send_modify(|s| s.state = CrawlerState::Running);
        self.task = Some(tokio::spawn(sync.run()));
        Ok(())
    }

    /// Cancel the driver loop and wait for it to exit.
    pub async fn stop(&mut self) -> Result<(), IndexerError> {
        self.token.cancel();
        let result = self.wait().await;
        self.status.send_modify(|s| {
            if s.state != CrawlerState::Failed {
                s.state = CrawlerState::Stopped;
            }
        });
        result
    }

    /// Wait for the driver loop to exit on its own.
    pub async fn wait(&mut self) -> Result<(), IndexerError> {
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| IndexerError::Other(format!("crawler task: {e}")))?,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{self, MockNode};
    use chainetl_core::retry::RetryConfig;
    use chainetl_storage::MemoryStore;

    fn config() -> CrawlerConfig {
        CrawlerConfig {
            id: "test".into(),
            poll_interval_ms: 5,
            max_reorg_depth: 8,
            retry: RetryConfig {
                max_retries: u32::MAX,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                multiplier: 2.0,
                jitter_fraction: 0.0,
            },
            ..Default::default()
        }
    }

    fn sync_loop(
        config: CrawlerConfig,
        node: &Arc<MockNode>,
        store: &Arc<MemoryStore>,
    ) -> SyncLoop<MockNode, MemoryStore> {
        let (status, _) = watch::channel(SyncStatus::default());
        SyncLoop::new(
            config,
            Arc::clone(node),
            Indexer::new(Arc::clone(store)),
            BlockPools::new(2, 64, 64),
            Arc::new(status),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn reorg_rolls_back_descending_then_replays() {
        let node = Arc::new(MockNode::new(mock::constants()));
        let store = Arc::new(MemoryStore::new());
        node.push_chain(mock::chain("A", 0, 11));
        let mut sync = sync_loop(config(), &node, &store);
        sync.init().await.unwrap();
        let outcome = sync.poll_once().await.unwrap();
        assert_eq!(outcome, PollOutcome::Applied((0..=11).collect()));

        node.push_chain(mock::fork("B", "A9", 10, 12));
        let outcome = sync.poll_once().await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Reorged {
                ancestor: 9,
                steps: vec![
                    Step::Rollback(11),
                    Step::Rollback(10),
                    Step::Apply(10),
                    Step::Apply(11),
                    Step::Apply(12),
                ],
            }
        );
        assert_eq!(sync.poll_once().await.unwrap(), PollOutcome::Idle);

        // same canonical chain indexed without ever seeing the fork
        let fresh_node = Arc::new(MockNode::new(mock::constants()));
        let mut canonical = mock::chain("A", 0, 9);
        canonical.extend(mock::fork("B", "A9", 10, 12));
        fresh_node.push_chain(canonical);
        let fresh_store = Arc::new(MemoryStore::new());
        let mut fresh = sync_loop(config(), &fresh_node, &fresh_store);
        fresh.init().await.unwrap();
        fresh.poll_once().await.unwrap();
        assert_eq!(store.dump(), fresh_store.dump());
    }

    #[tokio::test]
    async fn fork_at_same_height_is_detected() {
        let node = Arc::new(MockNode::new(mock::constants()));
        let store = Arc::new(MemoryStore::new());
        node.push_chain(mock::chain("A", 0, 5));
        let mut sync = sync_loop(config(), &node, &store);
        sync.init().await.unwrap();
        sync.poll_once().await.unwrap();

        node.push_chain(mock::fork("B", "A4", 5, 5));
        let outcome = sync.poll_once().await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Reorged {
                ancestor: 4,
                steps: vec![Step::Rollback(5), Step::Apply(5)],
            }
        );
        let indexer = Indexer::new(Arc::clone(&store));
        assert_eq!(indexer.block_hash(5).await.unwrap().as_deref(), Some("B5"));
    }

    #[tokio::test]
    async fn reorg_deeper_than_limit_is_fatal() {
        let node = Arc::new(MockNode::new(mock::constants()));
        let store = Arc::new(MemoryStore::new());
        node.push_chain(mock::chain("A", 0, 11));
        let mut sync = sync_loop(
            CrawlerConfig {
                max_reorg_depth: 1,
                ..config()
            },
            &node,
            &store,
        );
        sync.init().await.unwrap();
        sync.poll_once().await.unwrap();

        node.push_chain(mock::fork("B", "A9", 10, 12));
        let err = sync.poll_once().await.unwrap_err();
        assert!(matches!(err, IndexerError::ReorgTooDeep { .. }));
        assert!(err.is_fatal());
        let head = Indexer::new(Arc::clone(&store)).head().await.unwrap().unwrap();
        assert_eq!(head.height, 11);
    }

    #[tokio::test]
    async fn resumes_from_committed_head() {
        let node = Arc::new(MockNode::new(mock::constants()));
        let store = Arc::new(MemoryStore::new());
        node.push_chain(mock::chain("A", 0, 3));
        let mut first = sync_loop(config(), &node, &store);
        first.init().await.unwrap();
        first.poll_once().await.unwrap();

        node.push_chain(mock::chain("A", 4, 6));
        let mut second = sync_loop(config(), &node, &store);
        second.init().await.unwrap();
        assert_eq!(second.poll_once().await.unwrap(), PollOutcome::Applied(vec![4, 5, 6]));
    }

    #[tokio::test]
    async fn stops_at_stop_height() {
        let node = Arc::new(MockNode::new(mock::constants()));
        node.push_chain(mock::chain("A", 0, 10));
        let store = Arc::new(MemoryStore::new());
        let mut crawler = Crawler::new(
            CrawlerConfig {
                stop_height: Some(3),
                ..config()
            },
            node,
            store,
        );
        crawler.init(SyncMode::Sync).await.unwrap();
        crawler.start().unwrap();
        crawler.wait().await.unwrap();
        let status = crawler.status();
        assert_eq!(status.state, CrawlerState::Stopped);
        assert_eq!(status.height, Some(3));
        assert_eq!(status.node_height, Some(10));
        assert!(crawler.indexer().block(4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fatal_error_fails_crawler() {
        let node = Arc::new(MockNode::new(mock::constants()));
        node.push_chain(mock::chain("A", 0, 3));
        node.drop_constants();
        let mut crawler = Crawler::new(config(), node, Arc::new(MemoryStore::new()));
        crawler.init(SyncMode::Sync).await.unwrap();
        crawler.start().unwrap();
        let err = crawler.wait().await.unwrap_err();
        assert!(matches!(err, IndexerError::MissingConstants { height: 0 }));
        let status = crawler.status();
        assert_eq!(status.state, CrawlerState::Failed);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn transient_errors_back_off_and_recover() {
        let node = Arc::new(MockNode::new(mock::constants()));
        node.push_chain(mock::chain("A", 0, 4));
        node.fail_next(3);
        let mut crawler = Crawler::new(
            CrawlerConfig {
                stop_height: Some(4),
                ..config()
            },
            node,
            Arc::new(MemoryStore::new()),
        );
        crawler.init(SyncMode::Sync).await.unwrap();
        crawler.start().unwrap();
        crawler.wait().await.unwrap();
        let status = crawler.status();
        assert_eq!(status.height, Some(4));
        assert_eq!(status.last_error, None);
    }

    #[tokio::test]
    async fn info_mode_never_ingests() {
        let node = Arc::new(MockNode::new(mock::constants()));
        node.push_chain(mock::chain("A", 0, 3));
        let store = Arc::new(MemoryStore::new());
        let mut crawler = Crawler::new(config(), node, Arc::clone(&store));
        crawler.init(SyncMode::Info).await.unwrap();
        crawler.start().unwrap();
        crawler.stop().await.unwrap();
        assert!(store.dump().is_empty());
        assert_eq!(crawler.status().mode, Some(SyncMode::Info));
    }

    #[tokio::test]
    async fn start_requires_init() {
        let node = Arc::new(MockNode::new(mock::constants()));
        let mut crawler = Crawler::new(config(), node, Arc::new(MemoryStore::new()));
        assert!(matches!(crawler.start(), Err(IndexerError::Config(_))));
        crawler.init(SyncMode::Sync).await.unwrap();
        assert!(crawler.init(SyncMode::Sync).await.is_err());
    }

    #[tokio::test]
    async fn follows_node_until_stopped() {
        let node = Arc::new(MockNode::new(mock::constants()));
        node.push_chain(mock::chain("A", 0, 2));
        let mut crawler = Crawler::new(config(), Arc::clone(&node), Arc::new(MemoryStore::new()));
        let mut rx = crawler.subscribe();
        crawler.init(SyncMode::Sync).await.unwrap();
        crawler.start().unwrap();

        while rx.borrow_and_update().height != Some(2) {
            rx.changed().await.unwrap();
        }
        node.push_chain(mock::chain("A", 3, 5));
        while rx.borrow_and_update().height != Some(5) {
            rx.changed().await.unwrap();
        }
        assert!(crawler.status().is_synced());

        crawler.stop().await.unwrap();
        assert_eq!(crawler.status().state, CrawlerState::Stopped);
        assert_eq!(crawler.indexer().head().await.unwrap().unwrap().height, 5);
    }
}
