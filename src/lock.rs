//! # Flow Locks - Mutual Exclusion by Logical Key
//!
//! Barrier nodes serialize their check-and-advance through [`FlowLocks`], keyed by the
//! barrier's batch (`batch/{stream}/{position}/{batch}`). Claims and retries use the
//! same port, so any implementation that is exclusive across processes (a database
//! advisory lock, a Redis lease) makes the runtime safe across processes too.
//!
//! A [`FlowLock`] releases when dropped; [`FlowLock::release`] makes the release point
//! explicit.

use crate::error::{FlowError, FlowResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Backend-specific release hook held by a [`FlowLock`].
pub trait LockGuard: Send + Sync {
    fn release(self: Box<Self>);
}

/// A held lock.
pub struct FlowLock {
    key: String,
    guard: Option<Box<dyn LockGuard>>,
}

impl FlowLock {
    pub fn new(key: impl Into<String>, guard: Box<dyn LockGuard>) -> Self {
        Self {
            key: key.into(),
            guard: Some(guard),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn release(mut self) {
        if let Some(guard) = self.guard.take() {
            guard.release();
        }
    }
}

impl Drop for FlowLock {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.release();
        }
    }
}

impl std::fmt::Debug for FlowLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowLock").field("key", &self.key).finish()
    }
}

/// Lock port.
#[async_trait]
pub trait FlowLocks: Send + Sync {
    /// Take the lock if it is free.
    async fn try_lock(&self, key: &str) -> FlowResult<Option<FlowLock>>;

    /// Wait up to `timeout` for the lock.
    async fn lock(&self, key: &str, timeout: Duration) -> FlowResult<FlowLock>;
}

type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// In-process lock table built on tokio mutexes.
///
/// Keys are created on demand and pruned once nobody holds or waits for them. Clones
/// share the table.
#[derive(Default, Clone)]
pub struct MemoryLocks {
    table: LockTable,
}

struct MemoryGuard {
    key: String,
    table: LockTable,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LockGuard for MemoryGuard {
    fn release(mut self: Box<Self>) {
        drop(self.guard.take());
        if let Ok(mut table) = self.table.lock() {
            // Only the table's own reference left: no holder, no waiter.
            if table
                .get(&self.key)
                .is_some_and(|m| Arc::strong_count(m) == 1)
            {
                table.remove(&self.key);
            }
        }
    }
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> FlowResult<Arc<AsyncMutex<()>>> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| FlowError::lock("Failed to acquire lock table"))?;
        Ok(Arc::clone(
            table
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        ))
    }

    fn wrap(&self, key: &str, guard: OwnedMutexGuard<()>) -> FlowLock {
        FlowLock::new(
            key,
            Box::new(MemoryGuard {
                key: key.to_string(),
                table: Arc::clone(&self.table),
                guard: Some(guard),
            }),
        )
    }

    /// Number of keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        self.table.lock().map(|t| t.len()).unwrap_or(0)
    }
}

#[async_trait]
impl FlowLocks for MemoryLocks {
    async fn try_lock(&self, key: &str) -> FlowResult<Option<FlowLock>> {
        let mutex = self.entry(key)?;
        match mutex.try_lock_owned() {
            Ok(guard) => Ok(Some(self.wrap(key, guard))),
            Err(_) => Ok(None),
        }
    }

    async fn lock(&self, key: &str, timeout: Duration) -> FlowResult<FlowLock> {
        let mutex = self.entry(key)?;
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(self.wrap(key, guard)),
            Err(_) => Err(FlowError::lock(format!(
                "timed out after {timeout:?} waiting for '{key}'"
            ))),
        }
    }
}
