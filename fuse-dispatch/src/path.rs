//! Path-based filesystems
//!
//! [`PathFileSystem`] names every file by its absolute path.
//! [`PathAdapter`] turns it into an inode-keyed [`FileSystem`] by handing out
//! a backing identity per path and keeping the two in sync across renames.

use crate::channel::PollHandle;
use crate::context::Context;
use crate::errno::Errno;
use crate::fs::FileSystem;
use crate::ops::InitConfig;
use crate::types::file::FileType;
use crate::types::{
    AttrOut, DirEntry, DirEntryPlus, Entry, FileKey, IoctlOut, Opened, SetAttr, SetAttrValid, StatFs,
    TimeOrNow,
};

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

/// A directory entry produced by a path-based readdir
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathDirEntry {
    pub name: OsString,
    pub kind: FileType,
    /// the offset of the next entry
    pub offset: u64,
}

/// The handler set of a path-based filesystem.
///
/// Every callback is optional and answers `ENOSYS` unless overridden.
#[allow(unused_variables, clippy::too_many_arguments)]
#[async_trait]
pub trait PathFileSystem: Send + Sync {
    async fn init(&self, cx: &Context, config: &mut InitConfig) -> Result<(), Errno> {
        Ok(())
    }

    async fn destroy(&self) {}

    async fn getattr(&self, cx: &Context, path: &Path, fh: Option<u64>) -> Result<AttrOut, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn readlink(&self, cx: &Context, path: &Path) -> Result<PathBuf, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn mknod(&self, cx: &Context, path: &Path, mode: u32, rdev: u32) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn mkdir(&self, cx: &Context, path: &Path, mode: u32) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn unlink(&self, cx: &Context, path: &Path) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn rmdir(&self, cx: &Context, path: &Path) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    /// Creates `path` as a symbolic link to `link`
    async fn symlink(&self, cx: &Context, link: &Path, path: &Path) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn rename(&self, cx: &Context, from: &Path, to: &Path, flags: u32) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn link(&self, cx: &Context, from: &Path, to: &Path) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn chmod(&self, cx: &Context, path: &Path, mode: u32, fh: Option<u64>) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn chown(
        &self,
        cx: &Context,
        path: &Path,
        uid: Option<u32>,
        gid: Option<u32>,
        fh: Option<u64>,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn truncate(&self, cx: &Context, path: &Path, size: u64, fh: Option<u64>) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn utimens(
        &self,
        cx: &Context,
        path: &Path,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn open(&self, cx: &Context, path: &Path, flags: i32) -> Result<Opened, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn read(
        &self,
        cx: &Context,
        path: &Path,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn write(
        &self,
        cx: &Context,
        path: &Path,
        fh: u64,
        offset: u64,
        data: &[u8],
        flags: u32,
    ) -> Result<u32, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn statfs(&self, cx: &Context, path: &Path) -> Result<StatFs, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn flush(&self, cx: &Context, path: &Path, fh: u64, lock_owner: u64) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn release(
        &self,
        cx: &Context,
        path: &Path,
        fh: u64,
        flags: i32,
        lock_owner: u64,
        flush: bool,
    ) -> Result<(), Errno> {
        Ok(())
    }

    async fn fsync(&self, cx: &Context, path: &Path, fh: u64, datasync: bool) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn setxattr(
        &self,
        cx: &Context,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn getxattr(&self, cx: &Context, path: &Path, name: &OsStr) -> Result<Vec<u8>, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn listxattr(&self, cx: &Context, path: &Path) -> Result<Vec<OsString>, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn removexattr(&self, cx: &Context, path: &Path, name: &OsStr) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn opendir(&self, cx: &Context, path: &Path, flags: i32) -> Result<Opened, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn readdir(
        &self,
        cx: &Context,
        path: &Path,
        fh: u64,
        offset: u64,
    ) -> Result<Vec<PathDirEntry>, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn releasedir(&self, cx: &Context, path: &Path, fh: u64, flags: i32) -> Result<(), Errno> {
        Ok(())
    }

    async fn fsyncdir(&self, cx: &Context, path: &Path, fh: u64, datasync: bool) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn access(&self, cx: &Context, path: &Path, mask: i32) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    async fn create(&self, cx: &Context, path: &Path, mode: u32, flags: i32) -> Result<Opened, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn bmap(&self, cx: &Context, path: &Path, blocksize: u32, idx: u64) -> Result<u64, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn ioctl(
        &self,
        cx: &Context,
        path: &Path,
        fh: u64,
        cmd: u32,
        arg: u64,
        data: &[u8],
        out_size: u32,
    ) -> Result<IoctlOut, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn poll(
        &self,
        cx: &Context,
        path: &Path,
        fh: u64,
        ph: Option<PollHandle>,
        events: u32,
    ) -> Result<u32, Errno> {
        Err(Errno::ENOSYS)
    }

    async fn fallocate(
        &self,
        cx: &Context,
        path: &Path,
        fh: u64,
        offset: u64,
        length: u64,
        mode: i32,
    ) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }
}

/// `renameat2` flag which swaps the two names
const RENAME_EXCHANGE: u32 = 2;

/// key <-> path map
#[derive(Debug)]
struct PathMap {
    /// path of every identity handed out
    paths: HashMap<FileKey, PathBuf>,
    /// identity of every path still reachable by name
    keys: HashMap<PathBuf, FileKey>,
    /// next identity
    next: u64,
}

impl PathMap {
    /// returns the identity of `path`, handing out a new one if needed
    fn key_for(&mut self, path: &Path) -> FileKey {
        if let Some(&key) = self.keys.get(path) {
            return key;
        }
        let key = FileKey(self.next);
        self.next = self.next.wrapping_add(1);
        let _ = self.paths.insert(key, path.to_owned());
        let _ = self.keys.insert(path.to_owned(), key);
        key
    }

    /// makes `path` and everything under it unreachable by name
    fn detach(&mut self, path: &Path) {
        self.keys.retain(|p, _| !p.starts_with(path));
    }

    /// the reachable paths under `root` with their identities, each paired
    /// with its place under `dest`
    fn subtree(&self, root: &Path, dest: &Path) -> Vec<(PathBuf, FileKey, PathBuf)> {
        self.keys
            .iter()
            .filter_map(|(p, &k)| {
                let rest = p.strip_prefix(root).ok()?;
                let new = if rest.as_os_str().is_empty() {
                    dest.to_owned()
                } else {
                    dest.join(rest)
                };
                Some((p.clone(), k, new))
            })
            .collect()
    }

    /// rebinds identities to new paths
    fn relocate(&mut self, moves: Vec<(PathBuf, FileKey, PathBuf)>) {
        for (old, _, _) in &moves {
            let _ = self.keys.remove(old);
        }
        for (old, key, new) in moves {
            trace!(?old, ?new, %key, "path moved");
            let _ = self.keys.insert(new.clone(), key);
            let _ = self.paths.insert(key, new);
        }
    }

    /// moves `from` and everything under it to `to`
    fn rename(&mut self, from: &Path, to: &Path) {
        self.detach(to);
        let moves = self.subtree(from, to);
        self.relocate(moves);
    }

    /// swaps the subtrees at `a` and `b`
    fn exchange(&mut self, a: &Path, b: &Path) {
        let mut moves = self.subtree(a, b);
        moves.extend(self.subtree(b, a));
        self.relocate(moves);
    }

    /// drops an identity
    fn forget(&mut self, key: FileKey) {
        if let Some(path) = self.paths.remove(&key) {
            if self.keys.get(&path) == Some(&key) {
                let _ = self.keys.remove(&path);
            }
        }
    }
}

/// Serves a [`PathFileSystem`] as a [`FileSystem`]
#[derive(Debug)]
pub struct PathAdapter<P> {
    /// path-based handlers
    inner: P,
    /// identity map
    map: Mutex<PathMap>,
}

impl<P> PathAdapter<P>
where
    P: PathFileSystem,
{
    /// The backing identity of `/`; use it as the server's root key
    pub const ROOT_KEY: FileKey = FileKey(1);

    /// Wraps a path-based filesystem
    pub fn new(inner: P) -> Self {
        let root = PathBuf::from("/");
        let mut map = PathMap {
            paths: HashMap::new(),
            keys: HashMap::new(),
            next: Self::ROOT_KEY.0 + 1,
        };
        let _ = map.paths.insert(Self::ROOT_KEY, root.clone());
        let _ = map.keys.insert(root, Self::ROOT_KEY);
        Self {
            inner,
            map: Mutex::new(map),
        }
    }

    /// Returns the wrapped filesystem
    pub const fn inner(&self) -> &P {
        &self.inner
    }

    /// Returns the current path of an identity
    /// # Errors
    /// Returns `ESTALE` if the identity has been forgotten
    pub fn path(&self, key: FileKey) -> Result<PathBuf, Errno> {
        self.map.lock().paths.get(&key).cloned().ok_or(Errno::ESTALE)
    }

    /// returns the path of `name` in `parent`
    fn child(&self, parent: FileKey, name: &OsStr) -> Result<PathBuf, Errno> {
        Ok(self.path(parent)?.join(name))
    }

    /// answers a name resolution of `path`
    async fn entry(&self, cx: &Context, path: &Path) -> Result<Entry, Errno> {
        let out = self.inner.getattr(cx, path, None).await?;
        let key = self.map.lock().key_for(path);
        Ok(Entry::new(key, out.attr, out.ttl))
    }
}

#[async_trait]
impl<P> FileSystem for PathAdapter<P>
where
    P: PathFileSystem,
{
    async fn init(&self, cx: &Context, config: &mut InitConfig) -> Result<(), Errno> {
        self.inner.init(cx, config).await
    }

    async fn destroy(&self) {
        self.inner.destroy().await;
    }

    async fn lookup(&self, cx: &Context, parent: FileKey, name: &OsStr) -> Result<Entry, Errno> {
        let path = self.child(parent, name)?;
        self.entry(cx, &path).await
    }

    async fn forget(&self, key: FileKey) {
        if key != Self::ROOT_KEY {
            self.map.lock().forget(key);
        }
    }

    async fn getattr(&self, cx: &Context, key: FileKey, fh: Option<u64>) -> Result<AttrOut, Errno> {
        let path = self.path(key)?;
        self.inner.getattr(cx, &path, fh).await
    }

    async fn setattr(&self, cx: &Context, key: FileKey, attr: SetAttr) -> Result<AttrOut, Errno> {
        let path = self.path(key)?;
        let valid = attr.valid();
        trace!(?path, ?valid, "setattr");
        if let Some(mode) = attr.mode {
            self.inner.chmod(cx, &path, mode, attr.fh).await?;
        }
        if valid.intersects(SetAttrValid::UID | SetAttrValid::GID) {
            self.inner
                .chown(cx, &path, attr.uid, attr.gid, attr.fh)
                .await?;
        }
        if let Some(size) = attr.size {
            self.inner.truncate(cx, &path, size, attr.fh).await?;
        }
        if valid.intersects(SetAttrValid::ATIME | SetAttrValid::MTIME) {
            self.inner
                .utimens(cx, &path, attr.atime, attr.mtime, attr.fh)
                .await?;
        }
        self.inner.getattr(cx, &path, attr.fh).await
    }

    async fn readlink(&self, cx: &Context, key: FileKey) -> Result<PathBuf, Errno> {
        let path = self.path(key)?;
        self.inner.readlink(cx, &path).await
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
        let path = self.child(parent, name)?;
        self.inner.mknod(cx, &path, mode & !umask, rdev).await?;
        self.entry(cx, &path).await
    }

    async fn mkdir(
        &self,
        cx: &Context,
        parent: FileKey,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> Result<Entry, Errno> {
        let path = self.child(parent, name)?;
        self.inner.mkdir(cx, &path, mode & !umask).await?;
        self.entry(cx, &path).await
    }

    async fn unlink(&self, cx: &Context, parent: FileKey, name: &OsStr) -> Result<(), Errno> {
        let path = self.child(parent, name)?;
        self.inner.unlink(cx, &path).await?;
        self.map.lock().detach(&path);
        Ok(())
    }

    async fn rmdir(&self, cx: &Context, parent: FileKey, name: &OsStr) -> Result<(), Errno> {
        let path = self.child(parent, name)?;
        self.inner.rmdir(cx, &path).await?;
        self.map.lock().detach(&path);
        Ok(())
    }

    async fn symlink(
        &self,
        cx: &Context,
        parent: FileKey,
        name: &OsStr,
        link: &Path,
    ) -> Result<Entry, Errno> {
        let path = self.child(parent, name)?;
        self.inner.symlink(cx, link, &path).await?;
        self.entry(cx, &path).await
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
        let from = self.child(parent, name)?;
        let to = self.child(newparent, newname)?;
        self.inner.rename(cx, &from, &to, flags).await?;
        if flags & RENAME_EXCHANGE == 0 {
            self.map.lock().rename(&from, &to);
        } else {
            self.map.lock().exchange(&from, &to);
        }
        Ok(())
    }

    async fn link(
        &self,
        cx: &Context,
        key: FileKey,
        newparent: FileKey,
        newname: &OsStr,
    ) -> Result<Entry, Errno> {
        let from = self.path(key)?;
        let to = self.child(newparent, newname)?;
        self.inner.link(cx, &from, &to).await?;
        self.entry(cx, &to).await
    }

    async fn open(&self, cx: &Context, key: FileKey, flags: i32) -> Result<Opened, Errno> {
        let path = self.path(key)?;
        self.inner.open(cx, &path, flags).await
    }

    async fn read(
        &self,
        cx: &Context,
        key: FileKey,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, Errno> {
        let path = self.path(key)?;
        self.inner.read(cx, &path, fh, offset, size).await
    }

    async fn write(
        &self,
        cx: &Context,
        key: FileKey,
        fh: u64,
        offset: u64,
        data: &[u8],
        flags: u32,
    ) -> Result<u32, Errno> {
        let path = self.path(key)?;
        self.inner.write(cx, &path, fh, offset, data, flags).await
    }

    async fn flush(&self, cx: &Context, key: FileKey, fh: u64, lock_owner: u64) -> Result<(), Errno> {
        let path = self.path(key)?;
        self.inner.flush(cx, &path, fh, lock_owner).await
    }

    async fn release(
        &self,
        cx: &Context,
        key: FileKey,
        fh: u64,
        flags: i32,
        lock_owner: u64,
        flush: bool,
    ) -> Result<(), Errno> {
        let path = self.path(key)?;
        self.inner
            .release(cx, &path, fh, flags, lock_owner, flush)
            .await
    }

    async fn fsync(&self, cx: &Context, key: FileKey, fh: u64, datasync: bool) -> Result<(), Errno> {
        let path = self.path(key)?;
        self.inner.fsync(cx, &path, fh, datasync).await
    }

    async fn opendir(&self, cx: &Context, key: FileKey, flags: i32) -> Result<Opened, Errno> {
        let path = self.path(key)?;
        self.inner.opendir(cx, &path, flags).await
    }

    async fn readdir(
        &self,
        cx: &Context,
        key: FileKey,
        fh: u64,
        offset: u64,
    ) -> Result<Vec<DirEntry>, Errno> {
        let path = self.path(key)?;
        let entries = self.inner.readdir(cx, &path, fh, offset).await?;
        let map = self.map.lock();
        Ok(entries
            .into_iter()
            .map(|e| {
                let key = match e.name.to_str() {
                    Some(".") => Some(key),
                    Some("..") => path.parent().and_then(|p| map.keys.get(p).copied()),
                    _ => map.keys.get(&path.join(&e.name)).copied(),
                };
                DirEntry {
                    key,
                    offset: e.offset,
                    kind: e.kind,
                    name: e.name,
                }
            })
            .collect())
    }

    async fn readdirplus(
        &self,
        cx: &Context,
        key: FileKey,
        fh: u64,
        offset: u64,
    ) -> Result<Vec<DirEntryPlus>, Errno> {
        let path = self.path(key)?;
        let entries = self.inner.readdir(cx, &path, fh, offset).await?;
        let mut out = Vec::with_capacity(entries.len());
        for e in entries {
            let target = match e.name.to_str() {
                Some(".") => path.clone(),
                Some("..") => path.parent().unwrap_or(&path).to_owned(),
                _ => path.join(&e.name),
            };
            let entry = self.entry(cx, &target).await?;
            out.push(DirEntryPlus {
                entry,
                offset: e.offset,
                name: e.name,
            });
        }
        Ok(out)
    }

    async fn releasedir(&self, cx: &Context, key: FileKey, fh: u64, flags: i32) -> Result<(), Errno> {
        let path = self.path(key)?;
        self.inner.releasedir(cx, &path, fh, flags).await
    }

    async fn fsyncdir(
        &self,
        cx: &Context,
        key: FileKey,
        fh: u64,
        datasync: bool,
    ) -> Result<(), Errno> {
        let path = self.path(key)?;
        self.inner.fsyncdir(cx, &path, fh, datasync).await
    }

    async fn statfs(&self, cx: &Context, key: FileKey) -> Result<StatFs, Errno> {
        let path = self.path(key)?;
        self.inner.statfs(cx, &path).await
    }

    async fn setxattr(
        &self,
        cx: &Context,
        key: FileKey,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<(), Errno> {
        let path = self.path(key)?;
        self.inner.setxattr(cx, &path, name, value, flags).await
    }

    async fn getxattr(&self, cx: &Context, key: FileKey, name: &OsStr) -> Result<Vec<u8>, Errno> {
        let path = self.path(key)?;
        self.inner.getxattr(cx, &path, name).await
    }

    async fn listxattr(&self, cx: &Context, key: FileKey) -> Result<Vec<OsString>, Errno> {
        let path = self.path(key)?;
        self.inner.listxattr(cx, &path).await
    }

    async fn removexattr(&self, cx: &Context, key: FileKey, name: &OsStr) -> Result<(), Errno> {
        let path = self.path(key)?;
        self.inner.removexattr(cx, &path, name).await
    }

    async fn access(&self, cx: &Context, key: FileKey, mask: i32) -> Result<(), Errno> {
        let path = self.path(key)?;
        self.inner.access(cx, &path, mask).await
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
        let path = self.child(parent, name)?;
        let opened = self.inner.create(cx, &path, mode & !umask, flags).await?;
        match self.entry(cx, &path).await {
            Ok(entry) => Ok((entry, opened)),
            Err(errno) => {
                let _ = self.inner.release(cx, &path, opened.fh, flags, 0, false).await;
                Err(errno)
            }
        }
    }

    async fn bmap(&self, cx: &Context, key: FileKey, blocksize: u32, idx: u64) -> Result<u64, Errno> {
        let path = self.path(key)?;
        self.inner.bmap(cx, &path, blocksize, idx).await
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
        let path = self.path(key)?;
        self.inner
            .ioctl(cx, &path, fh, cmd, arg, data, out_size)
            .await
    }

    async fn poll(
        &self,
        cx: &Context,
        key: FileKey,
        fh: u64,
        ph: Option<PollHandle>,
        events: u32,
    ) -> Result<u32, Errno> {
        let path = self.path(key)?;
        self.inner.poll(cx, &path, fh, ph, events).await
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
        let path = self.path(key)?;
        self.inner
            .fallocate(cx, &path, fh, offset, length, mode)
            .await
    }
}
