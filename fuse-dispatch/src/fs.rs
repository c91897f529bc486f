//! FUSE filesystem

use crate::channel::PollHandle;
use crate::context::Context;
use crate::errno::Errno;
use crate::ops::InitConfig;
use crate::types::{
    AttrOut, DirEntry, DirEntryPlus, Entry, FileKey, IoctlOut, Opened, SetAttr, StatFs,
};

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// The handler set of an inode-keyed filesystem.
///
/// Every callback is optional and answers `ENOSYS` unless overridden.
/// Files are named by their backing identity; the server maps identities
/// to inode numbers. `fh` is always the value the handler returned from
/// `open`, `opendir` or `create`, never the handle the kernel sees.
#[allow(unused_variables, clippy::too_many_arguments)]
#[async_trait::async_trait]
pub trait FileSystem: Send + Sync {
    /// Starts the session. `config` holds the proposed connection parameters.
    async fn init(&self, cx: &Context, config: &mut InitConfig) -> Result<(), Errno> {
        Ok(())
    }

    /// Ends the session. Runs after every other request has finished.
    async fn destroy(&self) {}

    /// Resolves `name` in `parent`
    async fn lookup(&self, cx: &Context, parent: FileKey, name: &OsStr) -> Result<Entry, Errno> {
        Err(Errno::ENOSYS)
    }

    /// The kernel dropped its last reference to `key` and no handle is open
    async fn forget(&self, key: FileKey) {}

    async fn getattr(&self, cx: &Context, key: FileKey, fh: Option<u64>) -> Result<AttrOut, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn setattr(&self, cx: &Context, key: FileKey, attr: SetAttr) -> Result<AttrOut, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn readlink(&self, cx: &Context, key: FileKey) -> Result<PathBuf, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn mknod(
        &self,
        cx: &Context,
        parent: FileKey,
        name: &OsStr,
        mode: u32,
        rdev: u32,
        umask: u32,
    ) -> Result<Entry, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn mkdir(
        &self,
        cx: &Context,
        parent: FileKey,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> Result<Entry, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn unlink(&self, cx: &Context, parent: FileKey, name: &OsStr) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn rmdir(&self, cx: &Context, parent: FileKey, name: &OsStr) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn symlink(
        &self,
        cx: &Context,
        parent: FileKey,
        name: &OsStr,
        link: &Path,
    ) -> Result<Entry, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn rename(
        &self,
        cx: &Context,
        parent: FileKey,
        name: &OsStr,
        newparent: FileKey,
        newname: &OsStr,
        flags: u32,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Creates a hard link to `key` named `newname` in `newparent`
    async fn link(
        &self,
        cx: &Context,
        key: FileKey,
        newparent: FileKey,
        newname: &OsStr,
    ) -> Result<Entry, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn open(&self, cx: &Context, key: FileKey, flags: i32) -> Result<Opened, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Reads at most `size` bytes
    async fn read(
        &self,
        cx: &Context,
        key: FileKey,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Returns the number of bytes written
    async fn write(
        &self,
        cx: &Context,
        key: FileKey,
        fh: u64,
        offset: u64,
        data: &[u8],
        flags: u32,
    ) -> Result<u32, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn flush(&self, cx: &Context, key: FileKey, fh: u64, lock_owner: u64) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Called once per successful `open` or `create`. Its error is reported
    /// but the handle is gone either way.
    async fn release(
        &self,
        cx: &Context,
        key: FileKey,
        fh: u64,
        flags: i32,
        lock_owner: u64,
        flush: bool,
    ) -> Result<(), Errno> {
        Ok(())
    }

    async fn fsync(&self, cx: &Context, key: FileKey, fh: u64, datasync: bool) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn opendir(&self, cx: &Context, key: FileKey, flags: i32) -> Result<Opened, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Returns the entries after `offset`; the server keeps as many as fit
    async fn readdir(
        &self,
        cx: &Context,
        key: FileKey,
        fh: u64,
        offset: u64,
    ) -> Result<Vec<DirEntry>, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Like `readdir`, with a full lookup answer per entry
    async fn readdirplus(
        &self,
        cx: &Context,
        key: FileKey,
        fh: u64,
        offset: u64,
    ) -> Result<Vec<DirEntryPlus>, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn releasedir(&self, cx: &Context, key: FileKey, fh: u64, flags: i32) -> Result<(), Errno> {
        Ok(())
    }

    async fn fsyncdir(
        &self,
        cx: &Context,
        key: FileKey,
        fh: u64,
        datasync: bool,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn statfs(&self, cx: &Context, key: FileKey) -> Result<StatFs, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn setxattr(
        &self,
        cx: &Context,
        key: FileKey,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Returns the whole value; the server applies the size protocol
    async fn getxattr(&self, cx: &Context, key: FileKey, name: &OsStr) -> Result<Vec<u8>, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn listxattr(&self, cx: &Context, key: FileKey) -> Result<Vec<OsString>, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn removexattr(&self, cx: &Context, key: FileKey, name: &OsStr) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn access(&self, cx: &Context, key: FileKey, mask: i32) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn create(
        &self,
        cx: &Context,
        parent: FileKey,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
    ) -> Result<(Entry, Opened), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn bmap(&self, cx: &Context, key: FileKey, blocksize: u32, idx: u64) -> Result<u64, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn ioctl(
        &self,
        cx: &Context,
        key: FileKey,
        fh: u64,
        cmd: u32,
        arg: u64,
        data: &[u8],
        out_size: u32,
    ) -> Result<IoctlOut, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Returns the ready events. `ph` is present when the kernel wants to be
    /// notified of a later change.
    async fn poll(
        &self,
        cx: &Context,
        key: FileKey,
        fh: u64,
        ph: Option<PollHandle>,
        events: u32,
    ) -> Result<u32, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn fallocate(
        &self,
        cx: &Context,
        key: FileKey,
        fh: u64,
        offset: u64,
        length: u64,
        mode: i32,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Returns the new file offset
    async fn lseek(
        &self,
        cx: &Context,
        key: FileKey,
        fh: u64,
        offset: i64,
        whence: i32,
    ) -> Result<u64, Errno> {
        Err(Errno::ENOSYS)
    }
}
