//! Data types shared by the dispatcher and the filesystem handlers

pub mod file;

use self::file::FileType;

use std::ffi::OsString;
use std::fmt;
use std::time::{Duration, SystemTime};

use bitflags::bitflags;

/// A server-assigned inode number
///
/// The low 32 bits select a slot of the inode table, the high 32 bits carry
/// the slot generation, so a recycled slot never produces a number the
/// kernel has seen before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ino(u64);

impl Ino {
    /// The root inode
    pub const ROOT: Self = Self(1);

    /// Wraps a raw inode number
    #[must_use]
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw inode number
    #[must_use]
    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Ino {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The identity of a file as known to the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileKey(pub u64);

impl fmt::Display for FileKey {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// File attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub kind: FileType,
    /// permission bits, without the file type
    pub perm: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

impl Default for Attr {
    #[inline]
    fn default() -> Self {
        Self {
            ino: 0,
            size: 0,
            blocks: 0,
            atime: SystemTime::UNIX_EPOCH,
            mtime: SystemTime::UNIX_EPOCH,
            ctime: SystemTime::UNIX_EPOCH,
            kind: FileType::Regular,
            perm: 0,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 4096,
        }
    }
}

impl Attr {
    setters!(
        ino: u64,
        size: u64,
        blocks: u64,
        atime: SystemTime,
        mtime: SystemTime,
        ctime: SystemTime,
        kind: FileType,
        perm: u32,
        nlink: u32,
        uid: u32,
        gid: u32,
        rdev: u32,
        blksize: u32,
    );

    /// Returns `st_mode`, combining the file type and the permission bits
    #[must_use]
    #[inline]
    pub fn mode(&self) -> u32 {
        self.kind.as_mode() | (self.perm & 0o7777)
    }
}

/// The answer of a name resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    /// backing identity; `None` for a negative entry
    pub key: Option<FileKey>,
    /// backing generation of `key`
    pub generation: u64,
    pub attr: Attr,
    pub attr_ttl: Duration,
    pub entry_ttl: Duration,
}

impl Entry {
    /// Creates an entry for an existing file
    #[must_use]
    #[inline]
    pub fn new(key: FileKey, attr: Attr, ttl: Duration) -> Self {
        Self {
            key: Some(key),
            generation: 0,
            attr,
            attr_ttl: ttl,
            entry_ttl: ttl,
        }
    }

    /// Creates an entry which tells the kernel to cache the absence of a name
    #[must_use]
    #[inline]
    pub fn negative(ttl: Duration) -> Self {
        Self {
            key: None,
            generation: 0,
            attr: Attr::default(),
            attr_ttl: Duration::from_secs(0),
            entry_ttl: ttl,
        }
    }

    /// Sets the backing generation
    #[inline]
    pub fn generation(&mut self, generation: u64) -> &mut Self {
        self.generation = generation;
        self
    }
}

/// Attributes with a cache timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttrOut {
    pub attr: Attr,
    pub ttl: Duration,
}

bitflags! {
    /// `FOPEN_*` flags returned by open
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        const DIRECT_IO = 1 << 0;
        const KEEP_CACHE = 1 << 1;
        const NONSEEKABLE = 1 << 2;
        const CACHE_DIR = 1 << 3;
        const STREAM = 1 << 4;
    }
}

/// The result of open, opendir and create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Opened {
    /// handler state, handed back on every call for this open instance
    pub fh: u64,
    pub flags: OpenFlags,
}

impl Opened {
    /// Creates an [`Opened`] with the given handler state
    #[must_use]
    #[inline]
    pub fn new(fh: u64) -> Self {
        Self {
            fh,
            flags: OpenFlags::empty(),
        }
    }
}

/// Filesystem statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// A directory entry produced by readdir
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// backing identity, if the handler knows it
    pub key: Option<FileKey>,
    /// the offset of the next entry
    pub offset: u64,
    pub kind: FileType,
    pub name: OsString,
}

/// A directory entry with the full answer of a lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryPlus {
    pub entry: Entry,
    pub offset: u64,
    pub name: OsString,
}

bitflags! {
    /// The attributes a setattr request changes
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SetAttrValid: u32 {
        const MODE = 1 << 0;
        const UID = 1 << 1;
        const GID = 1 << 2;
        const SIZE = 1 << 3;
        const ATIME = 1 << 4;
        const MTIME = 1 << 5;
        const FH = 1 << 6;
        const ATIME_NOW = 1 << 7;
        const MTIME_NOW = 1 << 8;
        const CTIME = 1 << 10;
    }
}

/// A timestamp carried by setattr
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOrNow {
    /// an explicit time
    At(SystemTime),
    /// the server's current time
    Now,
}

impl TimeOrNow {
    /// Resolves the timestamp against the current time
    #[must_use]
    #[inline]
    pub fn resolve(self) -> SystemTime {
        match self {
            Self::At(time) => time,
            Self::Now => SystemTime::now(),
        }
    }
}

/// The changes requested by setattr
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
    pub ctime: Option<SystemTime>,
    /// the handle the change was made through, as sent by the kernel
    pub fh: Option<u64>,
}

impl SetAttr {
    /// Returns the set of attributes this request changes
    #[must_use]
    #[inline]
    pub fn valid(&self) -> SetAttrValid {
        let mut valid = SetAttrValid::empty();
        valid.set(SetAttrValid::MODE, self.mode.is_some());
        valid.set(SetAttrValid::UID, self.uid.is_some());
        valid.set(SetAttrValid::GID, self.gid.is_some());
        valid.set(SetAttrValid::SIZE, self.size.is_some());
        valid.set(SetAttrValid::ATIME, self.atime.is_some());
        valid.set(SetAttrValid::MTIME, self.mtime.is_some());
        valid.set(SetAttrValid::ATIME_NOW, self.atime == Some(TimeOrNow::Now));
        valid.set(SetAttrValid::MTIME_NOW, self.mtime == Some(TimeOrNow::Now));
        valid.set(SetAttrValid::CTIME, self.ctime.is_some());
        valid.set(SetAttrValid::FH, self.fh.is_some());
        valid
    }
}

/// The answer of an ioctl
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IoctlOut {
    pub result: i32,
    pub data: Vec<u8>,
}

/// One inode of a batch forget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForgetOne {
    pub ino: Ino,
    pub nlookup: u64,
}
