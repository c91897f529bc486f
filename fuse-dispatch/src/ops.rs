//! FUSE operations and replies

use crate::lock::LockType;
use crate::types::file::FileType;
use crate::types::{Attr, ForgetOne, IoctlOut, OpenFlags, SetAttr, StatFs};

use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// The header of every request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestHeader {
    /// request id, unique among in-flight requests
    pub unique: u64,
    /// the target inode, or the parent for namespace operations
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

/// A decoded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub header: RequestHeader,
    pub op: Operation,
}

/// The arguments of init
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpInit {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
}

/// A POSIX lock as carried by getlk and setlk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLock {
    pub start: u64,
    /// inclusive; `u64::MAX` means end of file
    pub end: u64,
    pub typ: LockType,
    pub pid: u32,
}

/// FUSE operations
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Operation {
    Init(OpInit),
    Destroy,
    Interrupt {
        /// the request to interrupt
        unique: u64,
    },
    Lookup {
        name: OsString,
    },
    Forget {
        nlookup: u64,
    },
    BatchForget(Vec<ForgetOne>),
    GetAttr {
        fh: Option<u64>,
    },
    SetAttr(SetAttr),
    ReadLink,
    MkNod {
        name: OsString,
        mode: u32,
        rdev: u32,
        umask: u32,
    },
    MkDir {
        name: OsString,
        mode: u32,
        umask: u32,
    },
    Unlink {
        name: OsString,
    },
    RmDir {
        name: OsString,
    },
    SymLink {
        name: OsString,
        link: PathBuf,
    },
    Rename {
        name: OsString,
        newparent: u64,
        newname: OsString,
        flags: u32,
    },
    /// `nodeid` is the new parent
    Link {
        oldnodeid: u64,
        newname: OsString,
    },
    Open {
        flags: i32,
    },
    Read {
        fh: u64,
        offset: u64,
        size: u32,
    },
    Write {
        fh: u64,
        offset: u64,
        data: Vec<u8>,
        flags: u32,
    },
    Flush {
        fh: u64,
        lock_owner: u64,
    },
    Release {
        fh: u64,
        flags: i32,
        lock_owner: u64,
        flush: bool,
        /// drop the owner's BSD lock
        flock_release: bool,
    },
    FSync {
        fh: u64,
        datasync: bool,
    },
    OpenDir {
        flags: i32,
    },
    ReadDir {
        fh: u64,
        offset: u64,
        size: u32,
    },
    ReadDirPlus {
        fh: u64,
        offset: u64,
        size: u32,
    },
    ReleaseDir {
        fh: u64,
        flags: i32,
    },
    FSyncDir {
        fh: u64,
        datasync: bool,
    },
    StatFs,
    SetXAttr {
        name: OsString,
        value: Vec<u8>,
        flags: i32,
    },
    GetXAttr {
        name: OsString,
        size: u32,
    },
    ListXAttr {
        size: u32,
    },
    RemoveXAttr {
        name: OsString,
    },
    Access {
        mask: i32,
    },
    Create {
        name: OsString,
        mode: u32,
        umask: u32,
        flags: i32,
    },
    GetLk {
        fh: u64,
        owner: u64,
        lock: FileLock,
    },
    SetLk {
        fh: u64,
        owner: u64,
        lock: FileLock,
        /// wait for conflicting locks instead of failing
        sleep: bool,
    },
    Flock {
        fh: u64,
        owner: u64,
        typ: LockType,
        nonblock: bool,
    },
    BMap {
        blocksize: u32,
        idx: u64,
    },
    Ioctl {
        fh: u64,
        /// `fh` is a directory handle
        dir: bool,
        cmd: u32,
        arg: u64,
        data: Vec<u8>,
        out_size: u32,
    },
    Poll {
        fh: u64,
        /// kernel poll handle, present when the kernel wants a notification
        kh: Option<u64>,
        events: u32,
    },
    Fallocate {
        fh: u64,
        offset: u64,
        length: u64,
        mode: i32,
    },
    Lseek {
        fh: u64,
        offset: i64,
        whence: i32,
    },
}

impl Operation {
    /// Returns the operation name used in logs
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match *self {
            Self::Init(_) => "init",
            Self::Destroy => "destroy",
            Self::Interrupt { .. } => "interrupt",
            Self::Lookup { .. } => "lookup",
            Self::Forget { .. } => "forget",
            Self::BatchForget(_) => "batch_forget",
            Self::GetAttr { .. } => "getattr",
            Self::SetAttr(_) => "setattr",
            Self::ReadLink => "readlink",
            Self::MkNod { .. } => "mknod",
            Self::MkDir { .. } => "mkdir",
            Self::Unlink { .. } => "unlink",
            Self::RmDir { .. } => "rmdir",
            Self::SymLink { .. } => "symlink",
            Self::Rename { .. } => "rename",
            Self::Link { .. } => "link",
            Self::Open { .. } => "open",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Flush { .. } => "flush",
            Self::Release { .. } => "release",
            Self::FSync { .. } => "fsync",
            Self::OpenDir { .. } => "opendir",
            Self::ReadDir { .. } => "readdir",
            Self::ReadDirPlus { .. } => "readdirplus",
            Self::ReleaseDir { .. } => "releasedir",
            Self::FSyncDir { .. } => "fsyncdir",
            Self::StatFs => "statfs",
            Self::SetXAttr { .. } => "setxattr",
            Self::GetXAttr { .. } => "getxattr",
            Self::ListXAttr { .. } => "listxattr",
            Self::RemoveXAttr { .. } => "removexattr",
            Self::Access { .. } => "access",
            Self::Create { .. } => "create",
            Self::GetLk { .. } => "getlk",
            Self::SetLk { .. } => "setlk",
            Self::Flock { .. } => "flock",
            Self::BMap { .. } => "bmap",
            Self::Ioctl { .. } => "ioctl",
            Self::Poll { .. } => "poll",
            Self::Fallocate { .. } => "fallocate",
            Self::Lseek { .. } => "lseek",
        }
    }
}

/// Negotiated connection parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InitConfig {
    pub max_readahead: u32,
    pub flags: u32,
    pub max_background: u16,
    pub congestion_threshold: u16,
    pub max_write: u32,
    pub time_gran: u32,
}

impl InitConfig {
    setters!(
        max_readahead: u32,
        flags: u32,
        max_background: u16,
        congestion_threshold: u16,
        max_write: u32,
        time_gran: u32,
    );
}

/// The reply of init
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitOut {
    pub major: u32,
    pub minor: u32,
    pub config: InitConfig,
}

/// An entry as seen by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryOut {
    /// server inode number; 0 for a negative entry
    pub ino: u64,
    pub generation: u64,
    pub attr: Attr,
    pub attr_ttl: Duration,
    pub entry_ttl: Duration,
}

/// The reply of open, opendir and create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOut {
    /// server handle
    pub fh: u64,
    pub flags: OpenFlags,
}

/// The inode number of a directory entry the server has not looked up
pub const UNKNOWN_INO: u64 = 0xffff_ffff;

/// A directory entry as seen by the kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryOut {
    pub ino: u64,
    pub offset: u64,
    pub kind: FileType,
    pub name: OsString,
}

/// A successful reply
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Response {
    /// nothing is written back: forget, batch forget and interrupt
    None,
    Empty,
    Init(InitOut),
    Entry(EntryOut),
    Attr {
        attr: Attr,
        ttl: Duration,
    },
    /// read, readlink, getxattr and listxattr
    Data(Vec<u8>),
    Write {
        size: u32,
    },
    Open(OpenOut),
    Create(EntryOut, OpenOut),
    StatFs(StatFs),
    /// the size of an extended attribute value or name list
    XAttrSize(u32),
    Directory(Vec<DirEntryOut>),
    DirectoryPlus(Vec<(EntryOut, DirEntryOut)>),
    Lock(FileLock),
    BMap {
        block: u64,
    },
    Ioctl(IoctlOut),
    Poll {
        revents: u32,
    },
    Lseek {
        offset: u64,
    },
}
