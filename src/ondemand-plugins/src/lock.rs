//! Per-resource async lock table.
//!
//! Locks are keyed by `(resource identity, sub key)`. The table never keeps a
//! resource alive: once the host drops a pane, its mutexes go away on the next
//! acquisition.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::host::{Pane, PaneRef};
use crate::weak_map::WeakKeyMap;

/// Sub key used when the caller does not specialise the lock.
pub const DEFAULT_SUB_KEY: &str = "default";

/// Sub key used by the file activator.
pub const PANE_GENERIC_SUB_KEY: &str = "pane-generic";

/// Proof of exclusive access; dropping it releases the lock.
#[must_use = "the lock is released as soon as the token is dropped"]
#[derive(Debug)]
pub struct LockRelease {
    guard: Option<OwnedMutexGuard<()>>,
}

impl LockRelease {
    fn held(guard: OwnedMutexGuard<()>) -> Self {
        Self { guard: Some(guard) }
    }

    /// A token that guards nothing.
    pub fn noop() -> Self {
        Self { guard: None }
    }

    /// Release explicitly. Consumes the token, so it runs once per acquisition.
    pub fn unlock(mut self) {
        self.guard.take();
    }

    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }
}

type SubKeyLocks = HashMap<String, Arc<AsyncMutex<()>>>;

/// Lazily created mutexes keyed by resource identity and sub key.
pub struct ResourceLockTable<R: ?Sized> {
    entries: Mutex<WeakKeyMap<R, SubKeyLocks>>,
}

impl<R: ?Sized> ResourceLockTable<R> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(WeakKeyMap::new()),
        }
    }

    /// Acquire the lock for `(resource, sub_key)`.
    ///
    /// Waiters on the same key are served in FIFO order. Different keys never
    /// block each other.
    pub async fn lock(&self, resource: &Arc<R>, sub_key: Option<&str>) -> LockRelease {
        let mutex = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.prune();
            entries
                .get_or_insert_with(resource, HashMap::new)
                .entry(sub_key.unwrap_or(DEFAULT_SUB_KEY).to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };

        LockRelease::held(mutex.lock_owned().await)
    }

    /// Number of live resources with at least one lock entry.
    pub fn tracked_resources(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.prune();
        entries.len()
    }
}

impl<R: ?Sized> Default for ResourceLockTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// How an activator serializes work on its target.
#[async_trait]
pub trait LockStrategy<T: ?Sized + Sync>: Send + Sync {
    async fn lock(&self, target: &T) -> LockRelease;
}

/// Locks a pane regardless of what it shows.
#[derive(Clone)]
pub struct PaneLockStrategy {
    table: Arc<ResourceLockTable<dyn Pane>>,
}

impl PaneLockStrategy {
    pub fn new(table: Arc<ResourceLockTable<dyn Pane>>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl LockStrategy<PaneRef> for PaneLockStrategy {
    async fn lock(&self, pane: &PaneRef) -> LockRelease {
        self.table.lock(pane, Some(PANE_GENERIC_SUB_KEY)).await
    }
}

/// Locks a pane for one view kind.
#[derive(Clone)]
pub struct PaneViewLockStrategy {
    table: Arc<ResourceLockTable<dyn Pane>>,
}

impl PaneViewLockStrategy {
    pub fn new(table: Arc<ResourceLockTable<dyn Pane>>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl LockStrategy<(PaneRef, String)> for PaneViewLockStrategy {
    async fn lock(&self, target: &(PaneRef, String)) -> LockRelease {
        let (pane, view_kind) = target;
        let sub_key = format!("view:{}", view_kind);
        self.table.lock(pane, Some(&sub_key)).await
    }
}

/// Never blocks. Used where serialization is handled elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLockStrategy;

#[async_trait]
impl<T: ?Sized + Sync> LockStrategy<T> for NoopLockStrategy {
    async fn lock(&self, _target: &T) -> LockRelease {
        LockRelease::noop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Resource;

    #[tokio::test(start_paused = true)]
    async fn test_same_key_is_exclusive() {
        let table = Arc::new(ResourceLockTable::<Resource>::new());
        let resource = Arc::new(Resource);
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let table = table.clone();
            let resource = resource.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let release = table.lock(&resource, None).await;
                order.lock().unwrap().push(format!("start-{}", i));
                tokio::time::sleep(Duration::from_millis(10)).await;
                order.lock().unwrap().push(format!("end-{}", i));
                release.unlock();
            }));
            tokio::task::yield_now().await;
        }
        futures::future::join_all(handles).await;

        let order = order.lock().unwrap().clone();
        assert_eq!(
            order,
            vec!["start-0", "end-0", "start-1", "end-1", "start-2", "end-2"]
        );
    }

    #[tokio::test]
    async fn test_different_keys_do_not_block() {
        let table = ResourceLockTable::<Resource>::new();
        let a = Arc::new(Resource);
        let b = Arc::new(Resource);

        let _held = table.lock(&a, Some("view:markdown")).await;
        let other_key = tokio::time::timeout(Duration::from_secs(1), table.lock(&a, None)).await;
        let other_resource =
            tokio::time::timeout(Duration::from_secs(1), table.lock(&b, Some("view:markdown"))).await;

        assert!(other_key.is_ok());
        assert!(other_resource.is_ok());
    }

    #[tokio::test]
    async fn test_release_on_drop() {
        let table = ResourceLockTable::<Resource>::new();
        let a = Arc::new(Resource);

        {
            let release = table.lock(&a, None).await;
            assert!(release.is_held());
        }
        let again = tokio::time::timeout(Duration::from_secs(1), table.lock(&a, None)).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_dropped_resource_is_forgotten() {
        let table = ResourceLockTable::<Resource>::new();
        let keep = Arc::new(Resource);
        {
            let gone = Arc::new(Resource);
            table.lock(&gone, None).await.unlock();
            assert_eq!(table.tracked_resources(), 1);
        }
        table.lock(&keep, None).await.unlock();
        assert_eq!(table.tracked_resources(), 1);
    }

    #[tokio::test]
    async fn test_noop_strategy() {
        let strategy = NoopLockStrategy;
        let first = LockStrategy::<str>::lock(&strategy, "x").await;
        let second = LockStrategy::<str>::lock(&strategy, "x").await;
        assert!(!first.is_held());
        assert!(!second.is_held());
    }
}
