//! Per-resource lock arena
//!
//! One async mutex per resource id, created on first use and removed when the
//! last holder releases it with nobody waiting. Holding a [`ResourceGuard`] is
//! the only way to mutate a resource's offset or stored bytes.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::types::ResourceId;

type LockMap = Arc<Mutex<HashMap<ResourceId, Arc<AsyncMutex<()>>>>>;

/// Exclusive hold on one resource id.
///
/// Dropping the guard releases the lock and, when uncontended, its arena
/// entry, so every exit path (errors and cancelled futures included) cleans up.
pub struct ResourceGuard {
    id: ResourceId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap,
}

impl ResourceGuard {
    pub fn id(&self) -> &ResourceId {
        &self.id
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };

        // Release under the arena mutex, the same mutex `acquire` clones under,
        // so a waiter can never be left holding an orphaned lock
        let mut locks = self.locks.lock();
        let held = Arc::downgrade(OwnedMutexGuard::mutex(&guard));
        // arena + this guard
        remove_unused(&mut locks, &self.id, &held, 2);
        drop(guard);
    }
}

/// Arena reference taken by a pending `acquire`.
///
/// Dropped after the wait itself, so a cancelled wait that outlived the last
/// holder still removes the entry.
struct Waiter {
    id: ResourceId,
    mutex: Weak<AsyncMutex<()>>,
    locks: LockMap,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        // arena only
        remove_unused(&mut locks, &self.id, &self.mutex, 1);
    }
}

fn remove_unused(
    locks: &mut HashMap<ResourceId, Arc<AsyncMutex<()>>>,
    id: &ResourceId,
    mutex: &Weak<AsyncMutex<()>>,
    expected_refs: usize,
) {
    if let Some(entry) = locks.get(id) {
        if std::ptr::eq(Arc::as_ptr(entry), mutex.as_ptr())
            && Arc::strong_count(entry) == expected_refs
        {
            locks.remove(id);
        }
    }
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard").field("id", &self.id).finish()
    }
}

#[derive(Default)]
pub struct LockArena {
    locks: LockMap,
}

impl LockArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`
    pub async fn acquire(&self, id: &ResourceId) -> ResourceGuard {
        let lock = {
            let mut locks = self.locks.lock();
            locks.entry(id.clone()).or_default().clone()
        };

        let _waiter = Waiter {
            id: id.clone(),
            mutex: Arc::downgrade(&lock),
            locks: self.locks.clone(),
        };

        let guard = lock.lock_owned().await;

        ResourceGuard {
            id: id.clone(),
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Number of live arena entries
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let arena = Arc::new(LockArena::new());
        let id = ResourceId::parse("shared").unwrap();

        let first = arena.acquire(&id).await;

        let waiter = {
            let arena = arena.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let _second = arena.acquire(&id).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_independent_ids_do_not_block() {
        let arena = LockArena::new();
        let _a = arena.acquire(&ResourceId::parse("a").unwrap()).await;
        let _b = tokio::time::timeout(
            Duration::from_millis(100),
            arena.acquire(&ResourceId::parse("b").unwrap()),
        )
        .await
        .unwrap();
        assert_eq!(arena.len(), 2);
    }

    #[tokio::test]
    async fn test_release_removes_uncontended_entry() {
        let arena = LockArena::new();
        let id = ResourceId::parse("gone").unwrap();

        let guard = arena.acquire(&id).await;
        assert_eq!(arena.len(), 1);

        drop(guard);
        assert!(arena.is_empty());
    }

    #[tokio::test]
    async fn test_release_keeps_entry_with_waiters() {
        let arena = Arc::new(LockArena::new());
        let id = ResourceId::parse("busy").unwrap();

        let guard = arena.acquire(&id).await;
        let waiter = {
            let arena = arena.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let _guard = arena.acquire(&id).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(guard);
        assert_eq!(arena.len(), 1);

        waiter.await.unwrap();
        assert!(arena.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_wait_removes_entry() {
        let arena = LockArena::new();
        let id = ResourceId::parse("abandoned").unwrap();

        let guard = arena.acquire(&id).await;
        let mut pending = Box::pin(arena.acquire(&id));
        assert!(futures::poll!(&mut pending).is_pending());

        // Released while someone waits, then the waiter gives up
        drop(guard);
        assert_eq!(arena.len(), 1);
        drop(pending);

        assert!(arena.is_empty());
    }
}
