//! Inode table
//!
//! Maps server-assigned inode numbers to reference-counted records. A record
//! lives while the kernel holds lookup references to it or while an open
//! handle pins it.

use crate::error::Error;
use crate::types::{FileKey, Ino};

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, error, trace};

/// The answer of a successful registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeRef {
    /// the assigned inode number
    pub ino: Ino,
    /// the generation stamp of the inode's slot
    pub generation: u64,
}

/// A record removed from the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evicted {
    /// the inode number, now invalid
    pub ino: Ino,
    /// the backing identity, if the record was still bound to it
    pub key: Option<FileKey>,
}

/// The outcome of forget and batch forget
#[derive(Debug, Default)]
pub struct Forgotten {
    /// records evicted by the forget
    pub evicted: Vec<Evicted>,
    /// protocol violations and stale references met on the way
    pub errors: Vec<Error>,
}

/// The answer of [`Resolution::remember`]
#[derive(Debug)]
pub enum Remembered {
    /// the lookup was counted
    Counted(InodeRef),
    /// the key was evicted after the resolution began; resolve the name again
    /// once the cleanup is done
    Evicted(Cleanup),
}

/// Resolves once the forget hook of an evicted key has returned
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Cleanup {
    /// completion of the hook
    done: Shared<oneshot::Receiver<()>>,
}

impl Future for Cleanup {
    type Output = ();

    #[inline]
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // a dropped sender ends the wait as well
        self.done.poll_unpin(cx).map(|_| ())
    }
}

/// A name resolution in flight.
///
/// Take one before asking the handler for an entry and count the entry
/// through it, so that an eviction racing the handler is noticed.
#[derive(Debug)]
pub struct Resolution<'a> {
    /// the table
    table: &'a InodeTable,
    /// eviction stamp when the resolution began
    since: u64,
}

impl Resolution<'_> {
    /// Counts a successful name resolution of `key`, unless `key` was evicted
    /// after this resolution began or its cleanup is still running.
    /// # Errors
    /// Returns [`Error::NoSpace`] when the table is full
    pub fn remember(&self, key: FileKey, backing_generation: u64) -> Result<Remembered, Error> {
        let mut arena = self.table.arena.lock();
        let raced = arena
            .evictions
            .iter()
            .find(|e| e.key == key && (e.cleanup.is_some() || e.stamp > self.since));
        if let Some(e) = raced {
            debug!(%key, stamp = e.stamp, "key evicted during resolution");
            return Ok(Remembered::Evicted(Cleanup {
                done: e.done.clone(),
            }));
        }
        arena.remember(key, backing_generation).map(Remembered::Counted)
    }
}

impl Drop for Resolution<'_> {
    fn drop(&mut self) {
        let mut arena = self.table.arena.lock();
        if let Some(n) = arena.resolving.get_mut(&self.since) {
            *n -= 1;
            if *n == 0 {
                let _ = arena.resolving.remove(&self.since);
            }
        }
        arena.prune_evictions();
    }
}

/// A snapshot of an inode record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeInfo {
    pub key: FileKey,
    pub generation: u64,
    pub lookups: u64,
    pub pins: u64,
}

/// inode record
#[derive(Debug)]
struct InodeRecord {
    /// backing identity
    key: FileKey,
    /// backing generation reported by the handler
    backing_generation: u64,
    /// outstanding lookup references
    lookups: u64,
    /// open handles against this inode
    pins: u64,
    /// false once a newer record took over `key`
    bound: bool,
}

/// arena slot
#[derive(Debug)]
struct Slot {
    /// bumped every time the slot is freed
    generation: u32,
    /// the record
    record: Option<InodeRecord>,
}

/// eviction of a bound key
#[derive(Debug)]
struct EvictionLog {
    /// eviction stamp
    stamp: u64,
    /// the evicted key
    key: FileKey,
    /// dropped once the forget hook has returned
    cleanup: Option<oneshot::Sender<()>>,
    /// resolves when `cleanup` is gone
    done: Shared<oneshot::Receiver<()>>,
}

/// arena
#[derive(Debug)]
struct Arena {
    /// slots, indexed by `ino - 1` (low half)
    slots: Vec<Slot>,
    /// free slot indices
    free: Vec<u32>,
    /// backing identity => inode
    keys: HashMap<FileKey, Ino>,
    /// stamp of the latest eviction of a bound key
    stamp: u64,
    /// resolutions in flight, by starting stamp
    resolving: BTreeMap<u64, usize>,
    /// evictions still running their cleanup or racing a resolution
    evictions: Vec<EvictionLog>,
}

/// index of the root slot
const ROOT_INDEX: u32 = 0;

/// composes an inode number
fn compose(index: u32, generation: u32) -> Ino {
    Ino::from_raw(u64::from(generation) << 32 | (u64::from(index) + 1))
}

/// splits an inode number into slot index and generation
fn decompose(ino: Ino) -> Option<(u32, u32)> {
    let raw = ino.as_raw();
    #[allow(clippy::cast_possible_truncation)]
    let low = raw as u32;
    let index = low.checked_sub(1)?;
    let generation = u32::try_from(raw >> 32).ok()?;
    Some((index, generation))
}

impl Arena {
    /// gets a live record
    fn record_mut(&mut self, ino: Ino) -> Result<&mut InodeRecord, Error> {
        let (index, generation) = decompose(ino).ok_or(Error::StaleInode(ino))?;
        let slot = self
            .slots
            .get_mut(index as usize)
            .filter(|slot| slot.generation == generation)
            .ok_or(Error::StaleInode(ino))?;
        slot.record.as_mut().ok_or(Error::StaleInode(ino))
    }

    /// allocates a slot for a new record
    fn insert(&mut self, record: InodeRecord) -> Result<Ino, Error> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len())
                    .ok()
                    .filter(|&n| n < u32::MAX)
                    .ok_or(Error::NoSpace)?;
                self.slots.push(Slot {
                    generation: 0,
                    record: None,
                });
                index
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.record = Some(record);
        Ok(compose(index, slot.generation))
    }

    /// counts a lookup of `key`
    fn remember(&mut self, key: FileKey, backing_generation: u64) -> Result<InodeRef, Error> {
        if let Some(&ino) = self.keys.get(&key) {
            let record = self.record_mut(ino)?;
            if record.backing_generation == backing_generation {
                record.lookups = record.lookups.saturating_add(1);
                let (_, generation) = decompose(ino).ok_or(Error::StaleInode(ino))?;
                return Ok(InodeRef {
                    ino,
                    generation: u64::from(generation),
                });
            }
            debug!(%ino, %key, "backing identity reused, detaching old inode");
            record.bound = false;
            let _ = self.keys.remove(&key);
        }

        let ino = self.insert(InodeRecord {
            key,
            backing_generation,
            lookups: 1,
            pins: 0,
            bound: true,
        })?;
        let _ = self.keys.insert(key, ino);
        let (_, generation) = decompose(ino).ok_or(Error::StaleInode(ino))?;
        trace!(%ino, %key, "inode created");
        Ok(InodeRef {
            ino,
            generation: u64::from(generation),
        })
    }

    /// drops finished evictions no resolution in flight can have raced
    fn prune_evictions(&mut self) {
        let oldest = self.resolving.keys().next().copied();
        self.evictions
            .retain(|e| e.cleanup.is_some() || oldest.map_or(false, |since| e.stamp > since));
    }

    /// evicts the record if nothing references it any more
    fn evict_if_unused(&mut self, ino: Ino) -> Option<Evicted> {
        let (index, _) = decompose(ino)?;
        if index == ROOT_INDEX {
            return None;
        }
        let slot = self.slots.get_mut(index as usize)?;
        match slot.record {
            Some(ref r) if r.lookups == 0 && r.pins == 0 => {}
            _ => return None,
        }
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);

        let key = if record.bound {
            let _ = self.keys.remove(&record.key);
            let (tx, rx) = oneshot::channel();
            self.stamp += 1;
            self.evictions.push(EvictionLog {
                stamp: self.stamp,
                key: record.key,
                cleanup: Some(tx),
                done: rx.shared(),
            });
            Some(record.key)
        } else {
            None
        };
        debug!(%ino, key = %record.key, "inode evicted");
        Some(Evicted { ino, key })
    }

    /// drops `count` lookup references
    fn forget_one(&mut self, ino: Ino, count: u64, out: &mut Forgotten) {
        let record = match self.record_mut(ino) {
            Ok(r) => r,
            Err(err) => {
                debug!(%ino, count, "forget on unknown inode");
                out.errors.push(err);
                return;
            }
        };
        if count > record.lookups {
            let err = Error::OverForget {
                ino,
                count,
                lookups: record.lookups,
            };
            error!(%err, "protocol violation");
            record.lookups = 0;
            out.errors.push(err);
        } else {
            record.lookups -= count;
        }
        trace!(%ino, lookups = record.lookups, "forget");
        if let Some(evicted) = self.evict_if_unused(ino) {
            out.evicted.push(evicted);
        }
    }
}

/// The inode table
#[derive(Debug)]
pub struct InodeTable {
    /// arena
    arena: Mutex<Arena>,
}

impl InodeTable {
    /// Creates an inode table whose root inode is bound to `root_key`
    #[must_use]
    pub fn new(root_key: FileKey) -> Self {
        let root = Slot {
            generation: 0,
            record: Some(InodeRecord {
                key: root_key,
                backing_generation: 0,
                lookups: 0,
                pins: 0,
                bound: true,
            }),
        };
        let mut keys = HashMap::new();
        let _ = keys.insert(root_key, Ino::ROOT);
        Self {
            arena: Mutex::new(Arena {
                slots: vec![root],
                free: Vec::new(),
                keys,
                stamp: 0,
                resolving: BTreeMap::new(),
                evictions: Vec::new(),
            }),
        }
    }

    /// Counts a successful name resolution of `key`.
    ///
    /// Reuses the record bound to `key` when its backing generation matches;
    /// otherwise the stale record is detached and a new one is created.
    /// Lookups racing a forget go through [`InodeTable::resolution`] instead.
    /// # Errors
    /// Returns [`Error::NoSpace`] when the table is full
    pub fn remember(&self, key: FileKey, backing_generation: u64) -> Result<InodeRef, Error> {
        self.arena.lock().remember(key, backing_generation)
    }

    /// Begins a name resolution
    #[must_use]
    pub fn resolution(&self) -> Resolution<'_> {
        let mut arena = self.arena.lock();
        let since = arena.stamp;
        *arena.resolving.entry(since).or_insert(0) += 1;
        Resolution { table: self, since }
    }

    /// Marks the forget hook of an evicted key as returned
    pub fn cleaned(&self, key: FileKey) {
        let mut arena = self.arena.lock();
        for e in arena.evictions.iter_mut().filter(|e| e.key == key) {
            if let Some(tx) = e.cleanup.take() {
                let _ = tx.send(());
            }
        }
        arena.prune_evictions();
    }

    /// Returns the backing identity of an inode
    /// # Errors
    /// Returns [`Error::StaleInode`] if the inode is unknown
    pub fn key(&self, ino: Ino) -> Result<FileKey, Error> {
        Ok(self.arena.lock().record_mut(ino)?.key)
    }

    /// Returns a snapshot of an inode record
    /// # Errors
    /// Returns [`Error::StaleInode`] if the inode is unknown
    pub fn info(&self, ino: Ino) -> Result<InodeInfo, Error> {
        let (_, generation) = decompose(ino).ok_or(Error::StaleInode(ino))?;
        let mut arena = self.arena.lock();
        let record = arena.record_mut(ino)?;
        Ok(InodeInfo {
            key: record.key,
            generation: u64::from(generation),
            lookups: record.lookups,
            pins: record.pins,
        })
    }

    /// Returns the inode currently bound to a backing identity
    #[must_use]
    pub fn find(&self, key: FileKey) -> Option<Ino> {
        self.arena.lock().keys.get(&key).copied()
    }

    /// Returns true if the inode is alive
    #[must_use]
    pub fn contains(&self, ino: Ino) -> bool {
        self.arena.lock().record_mut(ino).is_ok()
    }

    /// Returns the number of live records, root included
    #[must_use]
    pub fn len(&self) -> usize {
        let arena = self.arena.lock();
        arena.slots.iter().filter(|s| s.record.is_some()).count()
    }

    /// Returns true if only the root is alive
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Drops `count` lookup references of an inode
    pub fn forget(&self, ino: Ino, count: u64) -> Forgotten {
        let mut out = Forgotten::default();
        self.arena.lock().forget_one(ino, count, &mut out);
        out
    }

    /// Applies a batch of forgets under one critical section
    pub fn forget_multi(&self, batch: &[(Ino, u64)]) -> Forgotten {
        let mut out = Forgotten::default();
        let mut arena = self.arena.lock();
        for &(ino, count) in batch {
            arena.forget_one(ino, count, &mut out);
        }
        out
    }

    /// Pins an inode on behalf of an open handle
    /// # Errors
    /// Returns [`Error::StaleInode`] if the inode is unknown
    pub fn pin(&self, ino: Ino) -> Result<(), Error> {
        let mut arena = self.arena.lock();
        let record = arena.record_mut(ino)?;
        record.pins = record.pins.saturating_add(1);
        Ok(())
    }

    /// Drops a pin, evicting the inode if nothing else references it
    /// # Errors
    /// Returns [`Error::StaleInode`] or [`Error::UnbalancedUnpin`]
    pub fn unpin(&self, ino: Ino) -> Result<Option<Evicted>, Error> {
        let mut arena = self.arena.lock();
        let record = arena.record_mut(ino)?;
        if record.pins == 0 {
            return Err(Error::UnbalancedUnpin(ino));
        }
        record.pins -= 1;
        Ok(arena.evict_if_unused(ino))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;

    fn table() -> InodeTable {
        InodeTable::new(FileKey(1))
    }

    #[test]
    fn root() {
        let table = table();
        assert_eq!(table.key(Ino::ROOT), Ok(FileKey(1)));
        assert_eq!(table.find(FileKey(1)), Some(Ino::ROOT));

        let r = table.remember(FileKey(1), 0).unwrap();
        assert_eq!(r.ino, Ino::ROOT);
        let out = table.forget(Ino::ROOT, 1);
        assert!(out.evicted.is_empty() && out.errors.is_empty());
        assert!(table.contains(Ino::ROOT));
    }

    #[test]
    fn lookup_forget_accounting() {
        let table = table();
        let a = table.remember(FileKey(10), 0).unwrap();
        let b = table.remember(FileKey(10), 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(table.info(a.ino).unwrap().lookups, 2);

        let out = table.forget(a.ino, 1);
        assert!(out.evicted.is_empty());
        assert_eq!(table.info(a.ino).unwrap().lookups, 1);

        let out = table.forget(a.ino, 1);
        assert_eq!(
            out.evicted,
            vec![Evicted {
                ino: a.ino,
                key: Some(FileKey(10))
            }]
        );
        assert_eq!(table.key(a.ino), Err(Error::StaleInode(a.ino)));
        assert_eq!(table.find(FileKey(10)), None);
    }

    #[test]
    fn slot_reuse_changes_ino() {
        let table = table();
        let first = table.remember(FileKey(10), 0).unwrap();
        let _ = table.forget(first.ino, 1);

        let second = table.remember(FileKey(11), 0).unwrap();
        assert_ne!(first.ino, second.ino);
        assert_eq!(first.ino.as_raw() & 0xffff_ffff, second.ino.as_raw() & 0xffff_ffff);
        assert_eq!(second.generation, first.generation + 1);

        // the old number stays stale
        assert!(!table.contains(first.ino));
        let out = table.forget(first.ino, 1);
        assert_eq!(out.errors, vec![Error::StaleInode(first.ino)]);
    }

    #[test]
    fn over_forget_is_reported() {
        let table = table();
        let r = table.remember(FileKey(10), 0).unwrap();
        let out = table.forget(r.ino, 3);
        assert_eq!(
            out.errors,
            vec![Error::OverForget {
                ino: r.ino,
                count: 3,
                lookups: 1
            }]
        );
        assert_eq!(out.evicted.len(), 1);
    }

    #[test]
    fn eviction_during_resolution() {
        let table = table();
        let r = table.remember(FileKey(8), 0).unwrap();
        let raced = table.resolution();
        let out = table.forget(r.ino, 1);
        assert_eq!(out.evicted.len(), 1);

        // the forget hook has not returned yet
        let later = table.resolution();
        assert!(matches!(
            later.remember(FileKey(8), 0),
            Ok(Remembered::Evicted(_))
        ));
        table.cleaned(FileKey(8));
        let fresh = match later.remember(FileKey(8), 0) {
            Ok(Remembered::Counted(fresh)) => fresh,
            other => panic!("unexpected answer: {:?}", other),
        };
        assert_ne!(fresh.ino, r.ino);

        // began before the eviction, so its answer may be stale
        match raced.remember(FileKey(8), 0) {
            Ok(Remembered::Evicted(cleanup)) => async_std::task::block_on(cleanup),
            other => panic!("unexpected answer: {:?}", other),
        }
        assert_eq!(table.info(fresh.ino).unwrap().lookups, 1);

        drop(raced);
        drop(later);
        assert!(table.arena.lock().evictions.is_empty());
    }

    #[test]
    fn pins_keep_inode_alive() {
        let table = table();
        let r = table.remember(FileKey(5), 0).unwrap();
        table.pin(r.ino).unwrap();

        let out = table.forget(r.ino, 1);
        assert!(out.evicted.is_empty());
        let info = table.info(r.ino).unwrap();
        assert_eq!((info.lookups, info.pins), (0, 1));

        let evicted = table.unpin(r.ino).unwrap();
        assert_eq!(evicted.map(|e| e.ino), Some(r.ino));
        assert_eq!(table.unpin(r.ino), Err(Error::StaleInode(r.ino)));
    }

    #[test]
    fn unbalanced_unpin() {
        let table = table();
        let r = table.remember(FileKey(5), 0).unwrap();
        assert_eq!(table.unpin(r.ino), Err(Error::UnbalancedUnpin(r.ino)));
        assert!(table.contains(r.ino));
    }

    #[test]
    fn backing_generation_mismatch_detaches() {
        let table = table();
        let old = table.remember(FileKey(7), 1).unwrap();
        let new = table.remember(FileKey(7), 2).unwrap();
        assert_ne!(old.ino, new.ino);
        assert_eq!(table.find(FileKey(7)), Some(new.ino));

        // the detached record does not claim the key on eviction
        let out = table.forget(old.ino, 1);
        assert_eq!(out.evicted, vec![Evicted { ino: old.ino, key: None }]);
        assert_eq!(table.find(FileKey(7)), Some(new.ino));
    }

    #[test]
    fn forget_multi_is_atomic() {
        let table = table();
        let a = table.remember(FileKey(2), 0).unwrap();
        let b = table.remember(FileKey(3), 0).unwrap();
        let _ = table.remember(FileKey(3), 0).unwrap();

        let out = table.forget_multi(&[(a.ino, 1), (b.ino, 1), (Ino::from_raw(999), 1)]);
        assert_eq!(out.evicted.len(), 1);
        assert_eq!(out.errors, vec![Error::StaleInode(Ino::from_raw(999))]);
        assert_eq!(table.info(b.ino).unwrap().lookups, 1);
    }

    #[test]
    fn concurrent_lookups_and_forgets() {
        let table = Arc::new(table());
        let base = table.remember(FileKey(42), 0).unwrap();

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let r = table.remember(FileKey(42), 0).unwrap();
                        let out = table.forget(r.ino, 1);
                        assert!(out.errors.is_empty());
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        let info = table.info(base.ino).unwrap();
        assert_eq!(info.lookups, 1);
    }
}
