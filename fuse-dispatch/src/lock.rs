//! Advisory lock registry
//!
//! Tracks POSIX record locks and BSD whole-file locks per inode. Conflict
//! evaluation and grants happen under one mutex which is never held across
//! an await point. Blocked requests queue per inode and are granted first
//! come, first served.

use crate::error::Error;
use crate::types::Ino;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::channel::oneshot;
use futures::future::{self, Either};
use futures::pin_mut;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};

/// The type of an advisory lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    /// read lock
    Shared,
    /// write lock
    Exclusive,
    /// removes a lock
    Unlock,
}

impl LockType {
    /// Converts `F_RDLCK`, `F_WRLCK` or `F_UNLCK`
    #[must_use]
    #[inline]
    #[allow(clippy::unnecessary_cast)]
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            r if r == libc::F_RDLCK as i32 => Some(Self::Shared),
            r if r == libc::F_WRLCK as i32 => Some(Self::Exclusive),
            r if r == libc::F_UNLCK as i32 => Some(Self::Unlock),
            _ => None,
        }
    }

    /// Returns `F_RDLCK`, `F_WRLCK` or `F_UNLCK`
    #[must_use]
    #[inline]
    #[allow(clippy::unnecessary_cast)]
    pub fn as_raw(self) -> i32 {
        (match self {
            Self::Shared => libc::F_RDLCK,
            Self::Exclusive => libc::F_WRLCK,
            Self::Unlock => libc::F_UNLCK,
        }) as i32
    }

    /// two locks conflict only if at least one of them is exclusive
    const fn excludes(self, other: Self) -> bool {
        matches!(
            (self, other),
            (Self::Exclusive, Self::Shared | Self::Exclusive) | (Self::Shared, Self::Exclusive)
        )
    }
}

/// An inclusive byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRange {
    pub start: u64,
    /// inclusive; `u64::MAX` means end of file
    pub end: u64,
}

impl LockRange {
    /// Creates a range from an offset and a length; a zero length extends to end of file
    #[must_use]
    #[inline]
    pub const fn new(offset: u64, len: u64) -> Self {
        let end = if len == 0 {
            u64::MAX
        } else {
            offset.saturating_add(len - 1)
        };
        Self { start: offset, end }
    }

    /// Creates a range from inclusive bounds
    #[must_use]
    #[inline]
    pub const fn from_bounds(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// The whole file
    #[must_use]
    #[inline]
    pub const fn whole() -> Self {
        Self {
            start: 0,
            end: u64::MAX,
        }
    }

    /// Returns true if the ranges intersect
    #[must_use]
    #[inline]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Returns true if the ranges intersect or touch
    const fn touches(&self, other: &Self) -> bool {
        self.overlaps(other)
            || matches!(self.end.checked_add(1), Some(n) if n == other.start)
            || matches!(other.end.checked_add(1), Some(n) if n == self.start)
    }

    /// Removes `other` from `self`, leaving up to two pieces
    fn subtract(&self, other: &Self) -> SmallVec<[Self; 2]> {
        let mut pieces = SmallVec::new();
        if !self.overlaps(other) {
            pieces.push(*self);
            return pieces;
        }
        if self.start < other.start {
            pieces.push(Self::from_bounds(self.start, other.start - 1));
        }
        if self.end > other.end {
            pieces.push(Self::from_bounds(other.end + 1, self.end));
        }
        pieces
    }
}

/// A POSIX record lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosixLock {
    pub owner: u64,
    pub pid: u32,
    pub range: LockRange,
    pub typ: LockType,
}

/// A lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRequest {
    /// a POSIX record lock
    Posix(PosixLock),
    /// a BSD lock covering the whole file
    Flock {
        /// lock owner
        owner: u64,
        /// lock type
        typ: LockType,
    },
}

impl LockRequest {
    /// returns the requested type
    const fn typ(&self) -> LockType {
        match *self {
            Self::Posix(ref lock) => lock.typ,
            Self::Flock { typ, .. } => typ,
        }
    }

    /// returns true if two requests from different owners exclude each other
    fn conflicts_with(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Posix(a), Self::Posix(b)) => {
                a.owner != b.owner && a.range.overlaps(&b.range) && a.typ.excludes(b.typ)
            }
            (
                Self::Flock { owner: a, typ: ta },
                Self::Flock { owner: b, typ: tb },
            ) => a != b && ta.excludes(*tb),
            _ => false,
        }
    }
}

/// a blocked request
#[derive(Debug)]
struct Waiter {
    /// waiter id
    id: u64,
    /// the request
    request: LockRequest,
    /// fired when the lock has been granted
    granted: oneshot::Sender<()>,
}

/// lock state of one inode
#[derive(Debug, Default)]
struct InodeLocks {
    /// held POSIX locks
    posix: Vec<PosixLock>,
    /// held BSD locks, at most one per owner
    flocks: Vec<(u64, LockType)>,
    /// blocked requests in arrival order
    waiters: VecDeque<Waiter>,
}

impl InodeLocks {
    /// returns true if nothing is held or waiting
    fn is_idle(&self) -> bool {
        self.posix.is_empty() && self.flocks.is_empty() && self.waiters.is_empty()
    }

    /// finds a held lock excluding the request
    fn held_conflict(&self, request: &LockRequest) -> Option<LockRequest> {
        let posix = self.posix.iter().map(|l| LockRequest::Posix(*l));
        let flocks = self
            .flocks
            .iter()
            .map(|&(owner, typ)| LockRequest::Flock { owner, typ });
        posix.chain(flocks).find(|held| held.conflicts_with(request))
    }

    /// returns true if an earlier waiter excludes the request
    fn queued_conflict(&self, request: &LockRequest) -> bool {
        self.waiters.iter().any(|w| w.request.conflicts_with(request))
    }

    /// removes the owner's coverage of `range`, splitting records as needed
    fn carve(&mut self, owner: u64, range: &LockRange) {
        let mut kept = Vec::with_capacity(self.posix.len().saturating_add(1));
        for lock in self.posix.drain(..) {
            if lock.owner != owner || !lock.range.overlaps(range) {
                kept.push(lock);
                continue;
            }
            for piece in lock.range.subtract(range) {
                kept.push(PosixLock {
                    range: piece,
                    ..lock
                });
            }
        }
        self.posix = kept;
    }

    /// installs a granted request; the caller has checked for conflicts
    fn apply(&mut self, request: &LockRequest) {
        match *request {
            LockRequest::Posix(lock) => {
                self.carve(lock.owner, &lock.range);
                if lock.typ == LockType::Unlock {
                    return;
                }
                let mut merged = lock;
                self.posix.retain(|held| {
                    let mergeable = held.owner == merged.owner
                        && held.typ == merged.typ
                        && held.range.touches(&merged.range);
                    if mergeable {
                        merged.range = LockRange::from_bounds(
                            held.range.start.min(merged.range.start),
                            held.range.end.max(merged.range.end),
                        );
                    }
                    !mergeable
                });
                self.posix.push(merged);
            }
            LockRequest::Flock { owner, typ } => {
                self.flocks.retain(|&(o, _)| o != owner);
                if typ != LockType::Unlock {
                    self.flocks.push((owner, typ));
                }
            }
        }
    }

    /// undoes a grant whose waiter went away
    fn revert(&mut self, request: &LockRequest) {
        let unlock = match *request {
            LockRequest::Posix(lock) => LockRequest::Posix(PosixLock {
                typ: LockType::Unlock,
                ..lock
            }),
            LockRequest::Flock { owner, .. } => LockRequest::Flock {
                owner,
                typ: LockType::Unlock,
            },
        };
        self.apply(&unlock);
    }

    /// grants every waiter that no held lock and no earlier waiter blocks
    fn wake(&mut self) {
        let mut blocked: SmallVec<[LockRequest; 4]> = SmallVec::new();
        let mut i = 0;
        while i < self.waiters.len() {
            let request = self.waiters[i].request;
            let is_blocked = self.held_conflict(&request).is_some()
                || blocked.iter().any(|b| b.conflicts_with(&request));
            if is_blocked {
                blocked.push(request);
                i += 1;
                continue;
            }
            if let Some(waiter) = self.waiters.remove(i) {
                self.apply(&waiter.request);
                trace!(waiter = waiter.id, "lock granted");
                if waiter.granted.send(()).is_err() {
                    self.revert(&waiter.request);
                }
            }
        }
    }
}

/// The advisory lock registry
#[derive(Debug, Default)]
pub struct LockRegistry {
    /// per-inode state
    inodes: Mutex<HashMap<Ino, InodeLocks>>,
    /// waiter id allocator
    next_waiter: AtomicU64,
}

impl LockRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// runs `f` on the state of `ino`, dropping the state once it is idle
    fn with_inode<R>(&self, ino: Ino, f: impl FnOnce(&mut InodeLocks) -> R) -> R {
        let mut inodes = self.inodes.lock();
        let state = inodes.entry(ino).or_default();
        let ret = f(state);
        if state.is_idle() {
            let _ = inodes.remove(&ino);
        }
        ret
    }

    /// Returns the first held lock that would block `lock`
    #[must_use]
    pub fn test(&self, ino: Ino, lock: &PosixLock) -> Option<PosixLock> {
        let inodes = self.inodes.lock();
        let state = inodes.get(&ino)?;
        match state.held_conflict(&LockRequest::Posix(*lock))? {
            LockRequest::Posix(held) => Some(held),
            LockRequest::Flock { .. } => None,
        }
    }

    /// Acquires, changes or removes a lock without waiting
    /// # Errors
    /// Returns [`Error::LockConflict`] if another owner holds a conflicting lock
    pub fn try_lock(&self, ino: Ino, request: LockRequest) -> Result<(), Error> {
        self.with_inode(ino, |state| {
            if request.typ() != LockType::Unlock && state.held_conflict(&request).is_some() {
                debug!(%ino, ?request, "lock conflict");
                return Err(Error::LockConflict);
            }
            state.apply(&request);
            state.wake();
            Ok(())
        })
    }

    /// Acquires a lock, waiting until every conflicting lock is gone.
    ///
    /// The wait ends early when `interrupted` resolves; a grant that won the
    /// race against the interrupt is kept.
    /// # Errors
    /// Returns [`Error::Interrupted`] if the wait was cancelled
    pub async fn await_lock<I>(&self, ino: Ino, request: LockRequest, interrupted: I) -> Result<(), Error>
    where
        I: Future<Output = ()>,
    {
        let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let granted = self.with_inode(ino, |state| {
            let blocked = request.typ() != LockType::Unlock
                && (state.held_conflict(&request).is_some() || state.queued_conflict(&request));
            if !blocked {
                state.apply(&request);
                state.wake();
                return None;
            }
            if let LockRequest::Flock { owner, .. } = request {
                // a conversion gives up the old lock before it waits
                if state.flocks.iter().any(|&(o, _)| o == owner) {
                    state.flocks.retain(|&(o, _)| o != owner);
                    state.wake();
                }
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                id,
                request,
                granted: tx,
            });
            debug!(%ino, waiter = id, ?request, "lock request blocked");
            Some(rx)
        });

        let granted = match granted {
            None => return Ok(()),
            Some(rx) => rx,
        };

        let guard = WaitGuard {
            registry: self,
            ino,
            id,
        };
        pin_mut!(interrupted);
        let ret = match future::select(granted, interrupted).await {
            Either::Left((Ok(()), _)) => Ok(()),
            Either::Left((Err(oneshot::Canceled), _)) => Err(Error::Interrupted),
            Either::Right(((), _)) => {
                if self.cancel(ino, id) {
                    debug!(%ino, waiter = id, "lock wait interrupted");
                    Err(Error::Interrupted)
                } else {
                    Ok(())
                }
            }
        };
        drop(guard);
        ret
    }

    /// removes a waiter, returning false if it has already been granted
    fn cancel(&self, ino: Ino, id: u64) -> bool {
        let mut inodes = self.inodes.lock();
        let state = match inodes.get_mut(&ino) {
            Some(s) => s,
            None => return false,
        };
        let pos = state.waiters.iter().position(|w| w.id == id);
        let found = pos.and_then(|pos| state.waiters.remove(pos)).is_some();
        if found {
            state.wake();
        }
        if state.is_idle() {
            let _ = inodes.remove(&ino);
        }
        found
    }

    /// Removes the owner's POSIX locks within `range`
    pub fn unlock(&self, ino: Ino, owner: u64, range: LockRange) {
        self.with_inode(ino, |state| {
            state.carve(owner, &range);
            state.wake();
        });
    }

    /// Removes the owner's BSD lock
    pub fn unlock_flock(&self, ino: Ino, owner: u64) {
        self.with_inode(ino, |state| {
            state.flocks.retain(|&(o, _)| o != owner);
            state.wake();
        });
    }

    /// Removes every POSIX lock the owner holds on the inode
    pub fn release_owner(&self, ino: Ino, owner: u64) {
        self.unlock(ino, owner, LockRange::whole());
    }

    /// Drops all lock state of an evicted inode
    pub fn purge(&self, ino: Ino) {
        if self.inodes.lock().remove(&ino).is_some() {
            debug!(%ino, "lock state purged");
        }
    }

    /// Returns the POSIX locks held on an inode
    #[must_use]
    pub fn posix_locks(&self, ino: Ino) -> Vec<PosixLock> {
        self.inodes
            .lock()
            .get(&ino)
            .map(|s| s.posix.clone())
            .unwrap_or_default()
    }

    /// Returns the number of blocked requests on an inode
    #[must_use]
    pub fn waiting(&self, ino: Ino) -> usize {
        self.inodes.lock().get(&ino).map_or(0, |s| s.waiters.len())
    }
}

/// removes the waiter if the waiting future is dropped
struct WaitGuard<'a> {
    /// registry
    registry: &'a LockRegistry,
    /// inode
    ino: Ino,
    /// waiter id
    id: u64,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let _ = self.registry.cancel(self.ino, self.id);
    }
}
