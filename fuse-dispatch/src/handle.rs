//! Handle table
//!
//! Every open file or directory gets a server-assigned handle which pins its
//! inode until the matching release. Files and directories live in separate
//! tables, so a directory handle is rejected where a file handle is
//! expected and vice versa.

use crate::error::Error;
use crate::inode::{Evicted, InodeTable};
use crate::types::{FileKey, Ino, Opened};

use std::collections::hash_map::{Entry, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

/// The namespace of a handle table
pub trait HandleKind {
    /// kind name used in logs
    const NAME: &'static str;
}

/// Handles of open files
#[derive(Debug)]
pub enum FileKind {}

/// Handles of open directories
#[derive(Debug)]
pub enum DirKind {}

impl HandleKind for FileKind {
    const NAME: &'static str = "file";
}

impl HandleKind for DirKind {
    const NAME: &'static str = "dir";
}

/// The state of one open instance
#[derive(Debug)]
pub struct HandleRecord {
    /// the inode the handle is open against
    ino: Ino,
    /// backing identity of the inode at open time
    key: FileKey,
    /// open flags
    flags: i32,
    /// handler state returned by open
    opened: Opened,
    /// cached position: the end of the last read, write or readdir
    position: AtomicU64,
}

impl HandleRecord {
    /// Returns the inode of the handle
    #[must_use]
    #[inline]
    pub const fn ino(&self) -> Ino {
        self.ino
    }

    /// Returns the backing identity of the inode
    #[must_use]
    #[inline]
    pub const fn key(&self) -> FileKey {
        self.key
    }

    /// Returns the open flags
    #[must_use]
    #[inline]
    pub const fn flags(&self) -> i32 {
        self.flags
    }

    /// Returns the handler state
    #[must_use]
    #[inline]
    pub const fn fh(&self) -> u64 {
        self.opened.fh
    }

    /// Returns the cached position
    #[must_use]
    #[inline]
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    /// Updates the cached position
    #[inline]
    pub fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::Relaxed);
    }
}

/// A table of open handles of one kind
pub struct HandleTable<K> {
    /// open handles
    handles: Mutex<HashMap<u64, Arc<HandleRecord>>>,
    /// id allocator, shared by both kinds
    ids: Arc<AtomicU64>,
    /// the inode table
    inodes: Arc<InodeTable>,
    /// kind marker
    _kind: PhantomData<fn() -> K>,
}

/// The table of open files
pub type FileHandles = HandleTable<FileKind>;

/// The table of open directories
pub type DirHandles = HandleTable<DirKind>;

/// Creates the file and directory tables, sharing one id space
#[must_use]
pub fn tables(inodes: &Arc<InodeTable>) -> (FileHandles, DirHandles) {
    let ids = Arc::new(AtomicU64::new(1));
    let files = HandleTable::new(Arc::clone(inodes), Arc::clone(&ids));
    let dirs = HandleTable::new(Arc::clone(inodes), ids);
    (files, dirs)
}

impl<K> fmt::Debug for HandleTable<K>
where
    K: HandleKind,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("kind", &K::NAME)
            .field("len", &self.handles.lock().len())
            .finish()
    }
}

impl<K> HandleTable<K>
where
    K: HandleKind,
{
    /// Creates an empty table
    fn new(inodes: Arc<InodeTable>, ids: Arc<AtomicU64>) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            ids,
            inodes,
            _kind: PhantomData,
        }
    }

    /// Records an open instance and pins its inode
    /// # Errors
    /// Returns [`Error::StaleInode`] if the inode is gone
    pub fn open(&self, ino: Ino, flags: i32, opened: Opened) -> Result<u64, Error> {
        let key = self.inodes.key(ino)?;
        self.inodes.pin(ino)?;
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(HandleRecord {
            ino,
            key,
            flags,
            opened,
            position: AtomicU64::new(0),
        });
        let _ = self.handles.lock().insert(id, record);
        trace!(kind = K::NAME, fh = id, %ino, "handle opened");
        Ok(id)
    }

    /// Gets an open handle of `ino`
    /// # Errors
    /// Returns [`Error::InvalidHandle`] if the handle is unknown, released, or belongs to another inode
    pub fn get(&self, id: u64, ino: Ino) -> Result<Arc<HandleRecord>, Error> {
        self.handles
            .lock()
            .get(&id)
            .filter(|record| record.ino == ino)
            .cloned()
            .ok_or(Error::InvalidHandle(id))
    }

    /// Removes an open handle and unpins its inode
    /// # Errors
    /// Returns [`Error::InvalidHandle`] if the handle is unknown, released, or belongs to another inode
    pub fn release(
        &self,
        id: u64,
        ino: Ino,
    ) -> Result<(Arc<HandleRecord>, Option<Evicted>), Error> {
        let record = match self.handles.lock().entry(id) {
            Entry::Occupied(e) if e.get().ino == ino => e.remove(),
            _ => return Err(Error::InvalidHandle(id)),
        };
        trace!(kind = K::NAME, fh = id, %ino, "handle released");
        let evicted = self.inodes.unpin(ino)?;
        Ok((record, evicted))
    }

    /// Returns the number of open handles
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Returns true if no handle is open
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
