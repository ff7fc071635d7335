use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as ScopeMutex, OwnedMutexGuard};

/// One advisory lock per database.
///
/// Passes over the same database are serialized; passes over different
/// databases never wait for each other. The map itself is only held long
/// enough to find or insert a scope, never across an engine call.
#[derive(Default)]
pub struct ScopeLocks {
    scopes: Mutex<HashMap<String, Arc<ScopeMutex<()>>>>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn scope(&self, db: &str) -> Arc<ScopeMutex<()>> {
        let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
        scopes.entry(db.to_string()).or_default().clone()
    }

    /// Wait for exclusive access to `db`.
    pub async fn lock(&self, db: &str) -> OwnedMutexGuard<()> {
        self.scope(db).lock_owned().await
    }

    /// Exclusive access to `db` if nobody holds it.
    pub fn try_lock(&self, db: &str) -> Option<OwnedMutexGuard<()>> {
        self.scope(db).try_lock_owned().ok()
    }

    /// Drop the scope of a database that no longer exists, unless someone
    /// holds or waits for it.
    pub fn forget(&self, db: &str) {
        let mut scopes = self.scopes.lock().unwrap_or_else(PoisonError::into_inner);
        if scopes.get(db).is_some_and(|scope| Arc::strong_count(scope) == 1) {
            scopes.remove(db);
        }
    }

    pub fn len(&self) -> usize {
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_database_is_exclusive() {
        let locks = ScopeLocks::new();
        let held = locks.lock("test").await;
        assert!(locks.try_lock("test").is_none());
        assert!(locks.try_lock("other").is_some());
        drop(held);
        assert!(locks.try_lock("test").is_some());
    }

    #[tokio::test]
    async fn forget_skips_held_scopes() {
        let locks = ScopeLocks::new();
        let held = locks.lock("test").await;
        locks.forget("test");
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.forget("test");
        assert!(locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn waiters_run_one_at_a_time() {
        let locks = Arc::new(ScopeLocks::new());
        let inside = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("test").await;
                let now = inside.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                assert_eq!(now, 0);
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                inside.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }
}
