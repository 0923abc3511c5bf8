//! Object pools for high-churn per-block entities.
//!
//! A [`Pool`] hands out [`Pooled`] guards. When a guard is dropped the value
//! is reset to its zero state and returned to the pool, so cleanup happens on
//! every exit path: commit, rollback, error or task cancellation.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

/// Types that can be cleared for reuse.
pub trait Reset {
    /// Restore every field to its zero value and release child references.
    fn reset(&mut self);
}

struct Shared<T> {
    free: Mutex<Vec<T>>,
    capacity: usize,
}

/// A bounded free list of reusable `T`.
pub struct Pool<T: Reset + Default> {
    shared: Arc<Shared<T>>,
}

impl<T: Reset + Default> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Reset + Default> Pool<T> {
    /// Create a pool retaining at most `capacity` idle values.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(Vec::with_capacity(capacity)),
                capacity,
            }),
        }
    }

    /// Take a value from the pool, or allocate a fresh one.
    pub fn get(&self) -> Pooled<T> {
        let value = self
            .shared
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default();
        Pooled {
            value,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of idle values waiting for reuse.
    pub fn idle(&self) -> usize {
        self.shared
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A value borrowed from a [`Pool`]; returned on drop.
pub struct Pooled<T: Reset + Default> {
    value: T,
    shared: Arc<Shared<T>>,
}

impl<T: Reset + Default> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T: Reset + Default> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: Reset + Default + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: Reset + Default> Drop for Pooled<T> {
    fn drop(&mut self) {
        let mut value = std::mem::take(&mut self.value);
        value.reset();
        let mut free = self
            .shared
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.shared.capacity {
            free.push(value);
        }
    }
}
