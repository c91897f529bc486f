//! Per-entry serialization of namespace operations
//!
//! Operations that read or change a directory entry hold the lock of
//! `(parent, name)` while they run. Rename and link hold both entries,
//! taken in a fixed order.

use crate::types::Ino;

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::sync::Arc;

use async_lock::{Mutex as AsyncMutex, MutexGuardArc};
use parking_lot::Mutex;
use smallvec::SmallVec;

/// entry key
type EntryKey = (Ino, OsString);

/// entry lock map
type LockMap = Mutex<HashMap<EntryKey, Arc<AsyncMutex<()>>>>;

/// Locks of directory entries
#[derive(Debug, Default)]
pub struct EntryLocks {
    /// locks in use; idle locks are removed
    map: Arc<LockMap>,
}

/// Holds one or two entry locks
#[derive(Debug)]
pub struct EntryGuard {
    /// held guards
    guards: SmallVec<[MutexGuardArc<()>; 2]>,
    /// locked entries
    keys: SmallVec<[EntryKey; 2]>,
    /// lock map
    map: Arc<LockMap>,
}

impl EntryLocks {
    /// Creates an empty set of locks
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// returns the lock of an entry, creating it when needed
    fn get(&self, key: &EntryKey) -> Arc<AsyncMutex<()>> {
        let mut map = self.map.lock();
        Arc::clone(
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Locks one entry
    pub async fn lock(&self, parent: Ino, name: &OsStr) -> EntryGuard {
        let mut keys = SmallVec::new();
        keys.push((parent, name.to_owned()));
        self.lock_all(keys).await
    }

    /// Locks two entries in a deadlock-free order
    pub async fn lock_pair(&self, a: (Ino, &OsStr), b: (Ino, &OsStr)) -> EntryGuard {
        let mut keys: SmallVec<[EntryKey; 2]> = SmallVec::new();
        keys.push((a.0, a.1.to_owned()));
        keys.push((b.0, b.1.to_owned()));
        keys.sort();
        keys.dedup();
        self.lock_all(keys).await
    }

    /// locks `keys` in order
    async fn lock_all(&self, keys: SmallVec<[EntryKey; 2]>) -> EntryGuard {
        let mut guards = SmallVec::new();
        for key in &keys {
            let lock = self.get(key);
            guards.push(lock.lock_arc().await);
        }
        EntryGuard {
            guards,
            keys,
            map: Arc::clone(&self.map),
        }
    }

    /// Returns the number of entries with a live lock
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }
}

impl Drop for EntryGuard {
    fn drop(&mut self) {
        self.guards.clear();
        let mut map = self.map.lock();
        for key in &self.keys {
            // the map holds the only reference once nobody waits on it
            if map.get(key).map_or(false, |lock| Arc::strong_count(lock) == 1) {
                let _ = map.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use async_std::task;

    #[test]
    fn same_entry_is_serialized() {
        let locks = Arc::new(EntryLocks::new());
        task::block_on(async {
            let guard = locks.lock(Ino::ROOT, OsStr::new("a")).await;

            let other = Arc::clone(&locks);
            let waiter = task::spawn(async move {
                let _guard = other.lock(Ino::ROOT, OsStr::new("a")).await;
            });
            task::sleep(Duration::from_millis(20)).await;
            // a different name is not blocked
            drop(locks.lock(Ino::ROOT, OsStr::new("b")).await);

            drop(guard);
            waiter.await;
        });
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn pair_order_is_stable() {
        let locks = Arc::new(EntryLocks::new());
        task::block_on(async {
            let ab = {
                let locks = Arc::clone(&locks);
                task::spawn(async move {
                    for _ in 0..100 {
                        let _g = locks
                            .lock_pair((Ino::ROOT, OsStr::new("a")), (Ino::ROOT, OsStr::new("b")))
                            .await;
                        task::yield_now().await;
                    }
                })
            };
            let ba = {
                let locks = Arc::clone(&locks);
                task::spawn(async move {
                    for _ in 0..100 {
                        let _g = locks
                            .lock_pair((Ino::ROOT, OsStr::new("b")), (Ino::ROOT, OsStr::new("a")))
                            .await;
                        task::yield_now().await;
                    }
                })
            };
            ab.await;
            ba.await;

            // the same entry twice is locked once
            let g = locks
                .lock_pair((Ino::ROOT, OsStr::new("a")), (Ino::ROOT, OsStr::new("a")))
                .await;
            assert_eq!(locks.len(), 1);
            drop(g);
        });
        assert_eq!(locks.len(), 0);
    }
}
