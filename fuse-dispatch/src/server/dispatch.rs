//! Per-request dispatch

use super::entry_lock::EntryLocks;
use super::pending::{Completion, PendingTable};

use crate::channel::{PollHandle, ReplyWriter};
use crate::context::{Context, ProtocolVersion};
use crate::errno::Errno;
use crate::error::Error;
use crate::fs::FileSystem;
use crate::handle::{DirHandles, FileHandles};
use crate::inode::{Cleanup, Evicted, Forgotten, InodeTable, Remembered, Resolution};
use crate::lock::{LockRange, LockRegistry, LockRequest, LockType, PosixLock};
use crate::ops::{
    DirEntryOut, EntryOut, FileLock, OpenOut, Operation, Response, UNKNOWN_INO,
};
use crate::types::{AttrOut, Entry, FileKey, Ino, Opened};

use std::ffi::OsStr;
use std::fmt::{self, Debug};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::sync::Arc;

use tracing::{debug, error, trace};

/// size of `fuse_dirent` without the name
const DIRENT_HEADER_SIZE: usize = 24;

/// size of `fuse_entry_out`
const ENTRY_OUT_SIZE: usize = 128;

/// rounds up to the alignment of dirent records
const fn align8(len: usize) -> usize {
    (len + 7) & !7
}

/// size of one `fuse_dirent` record
fn dirent_size(name: &OsStr) -> usize {
    align8(DIRENT_HEADER_SIZE + name.len())
}

/// returns true for `.` and `..`
fn is_dot(name: &OsStr) -> bool {
    matches!(name.as_bytes(), b"." | b"..")
}

/// rejects names the kernel never sends for a directory entry
fn check_name(name: &OsStr) -> Result<(), Error> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || memchr::memchr2(b'/', b'\0', bytes).is_some() {
        return Err(Error::InvalidName);
    }
    Ok(())
}

/// rejects empty extended attribute names and names with a NUL byte
fn check_xattr_name(name: &OsStr) -> Result<(), Error> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || memchr::memchr(b'\0', bytes).is_some() {
        return Err(Error::InvalidName);
    }
    Ok(())
}

/// applies the size protocol of getxattr and listxattr
fn xattr_reply(value: Vec<u8>, size: u32) -> Result<Response, Error> {
    let len = u32::try_from(value.len()).map_err(|_| Error::Fs(Errno::ERANGE))?;
    if size == 0 {
        Ok(Response::XAttrSize(len))
    } else if len > size {
        Err(Error::Fs(Errno::ERANGE))
    } else {
        Ok(Response::Data(value))
    }
}

/// converts a lock from the wire
fn posix_lock(owner: u64, lock: FileLock) -> Result<PosixLock, Error> {
    if lock.start > lock.end {
        return Err(Error::Fs(Errno::EINVAL));
    }
    Ok(PosixLock {
        owner,
        pid: lock.pid,
        range: LockRange::from_bounds(lock.start, lock.end),
        typ: lock.typ,
    })
}

/// State shared by every request of a session
pub(super) struct Session<F> {
    pub(super) fs: F,
    pub(super) proto: ProtocolVersion,
    pub(super) max_write: u32,
    pub(super) inodes: Arc<InodeTable>,
    pub(super) files: FileHandles,
    pub(super) dirs: DirHandles,
    pub(super) locks: Arc<LockRegistry>,
    pub(super) entries: EntryLocks,
    pub(super) pending: PendingTable,
    pub(super) writer: Arc<dyn ReplyWriter>,
}

impl<F> Debug for Session<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("proto", &self.proto)
            .field("inodes", &self.inodes.len())
            .field("files", &self.files)
            .field("dirs", &self.dirs)
            .field("in_flight", &self.pending.len())
            .finish()
    }
}

impl<F> Session<F>
where
    F: FileSystem,
{
    /// Writes a reply, logging a failed write
    pub(super) async fn send(&self, unique: u64, reply: Result<Response, Errno>) {
        if let Err(err) = self.writer.reply(unique, reply).await {
            error!(unique, %err, "failed to send reply");
        }
    }

    /// Turns the outcome of a request into its single reply
    pub(super) async fn finish(&self, unique: u64, ret: Result<Response, Error>) {
        let reply = ret.map_err(|err| {
            if err.is_internal() {
                error!(unique, %err, "internal fault");
            } else {
                debug!(unique, %err, "request failed");
            }
            err.errno()
        });

        match self.pending.complete(unique) {
            Ok(Completion::Normal) => {}
            Ok(Completion::Interrupted) => {
                debug!(unique, ok = reply.is_ok(), "interrupted request completed");
            }
            Err(err) => {
                error!(unique, %err, "reply suppressed");
                return;
            }
        }
        self.send(unique, reply).await;
    }

    /// returns the backing identity of the target inode
    fn key(&self, ino: Ino) -> Result<FileKey, Error> {
        self.inodes.key(ino)
    }

    /// counts a lookup of `entry` and converts it for the kernel, or returns
    /// the cleanup to wait for when the entry was evicted meanwhile
    fn count_entry(
        resolution: &Resolution<'_>,
        entry: Entry,
    ) -> Result<Result<EntryOut, Cleanup>, Error> {
        let key = match entry.key {
            Some(key) => key,
            None => {
                return Ok(Ok(EntryOut {
                    ino: 0,
                    generation: 0,
                    attr: entry.attr,
                    attr_ttl: entry.attr_ttl,
                    entry_ttl: entry.entry_ttl,
                }))
            }
        };
        let r = match resolution.remember(key, entry.generation)? {
            Remembered::Counted(r) => r,
            Remembered::Evicted(cleanup) => return Ok(Err(cleanup)),
        };
        let mut attr = entry.attr;
        attr.ino = r.ino.as_raw();
        Ok(Ok(EntryOut {
            ino: r.ino.as_raw(),
            generation: r.generation,
            attr,
            attr_ttl: entry.attr_ttl,
            entry_ttl: entry.entry_ttl,
        }))
    }

    /// Counts the handler's answer for `name` in `parent`.
    ///
    /// When the backing identity was evicted while the handler answered, the
    /// handler may have dropped its state for it already, so the name is
    /// looked up again after the cleanup.
    async fn register_entry(
        &self,
        cx: &Context,
        parent: FileKey,
        name: &OsStr,
        resolution: &Resolution<'_>,
        entry: Entry,
    ) -> Result<EntryOut, Error> {
        let mut counted = Self::count_entry(resolution, entry)?;
        loop {
            let cleanup = match counted {
                Ok(out) => return Ok(out),
                Err(cleanup) => cleanup,
            };
            debug!(?name, "entry evicted while resolving, looking up again");
            cleanup.await;
            let again = self.inodes.resolution();
            let entry = self.fs.lookup(cx, parent, name).await?;
            counted = Self::count_entry(&again, entry)?;
        }
    }

    /// an entry for `.` and `..`, which the kernel does not count
    fn dot_entry(&self, entry: &Entry) -> EntryOut {
        let ino = entry
            .key
            .and_then(|key| self.inodes.find(key))
            .map_or(UNKNOWN_INO, Ino::as_raw);
        let mut attr = entry.attr;
        attr.ino = ino;
        EntryOut {
            ino,
            generation: 0,
            attr,
            attr_ttl: entry.attr_ttl,
            entry_ttl: entry.entry_ttl,
        }
    }

    /// drops the state of an evicted inode
    async fn evict(&self, evicted: Evicted) {
        trace!(ino = %evicted.ino, "inode evicted");
        self.locks.purge(evicted.ino);
        if let Some(key) = evicted.key {
            self.fs.forget(key).await;
            self.inodes.cleaned(key);
        }
    }

    /// reports and cleans up after a forget
    async fn settle(&self, forgotten: Forgotten) {
        for err in forgotten.errors {
            if err.is_internal() {
                error!(%err, "forget");
            } else {
                debug!(%err, "forget");
            }
        }
        for evicted in forgotten.evicted {
            self.evict(evicted).await;
        }
    }

    /// converts attributes for the kernel
    fn attr_reply(ino: Ino, out: AttrOut) -> Response {
        let mut attr = out.attr;
        attr.ino = ino.as_raw();
        Response::Attr { attr, ttl: out.ttl }
    }

    /// records an open file, undoing the handler's open on failure
    async fn open_handle(
        &self,
        cx: &Context,
        ino: Ino,
        key: FileKey,
        flags: i32,
        opened: Opened,
    ) -> Result<OpenOut, Error> {
        match self.files.open(ino, flags, opened) {
            Ok(fh) => Ok(OpenOut {
                fh,
                flags: opened.flags,
            }),
            Err(err) => {
                let _ = self.fs.release(cx, key, opened.fh, flags, 0, false).await;
                Err(err)
            }
        }
    }

    /// Runs one request to completion
    #[allow(clippy::too_many_lines)]
    pub(super) async fn dispatch(&self, cx: &Context, op: Operation) -> Result<Response, Error> {
        let ino = Ino::from_raw(cx.header().nodeid);

        match op {
            Operation::Init(_) | Operation::Destroy | Operation::Interrupt { .. } => {
                Err(Error::Protocol("session request reached a worker"))
            }

            Operation::Lookup { name } => {
                check_name(&name)?;
                let parent = self.key(ino)?;
                let _guard = self.entries.lock(ino, &name).await;
                let resolution = self.inodes.resolution();
                let entry = self.fs.lookup(cx, parent, &name).await?;
                let out = self
                    .register_entry(cx, parent, &name, &resolution, entry)
                    .await?;
                Ok(Response::Entry(out))
            }

            Operation::Forget { nlookup } => {
                self.settle(self.inodes.forget(ino, nlookup)).await;
                Ok(Response::None)
            }

            Operation::BatchForget(forgets) => {
                let batch: Vec<_> = forgets.iter().map(|f| (f.ino, f.nlookup)).collect();
                self.settle(self.inodes.forget_multi(&batch)).await;
                Ok(Response::None)
            }

            Operation::GetAttr { fh } => {
                let key = self.key(ino)?;
                let fh = match fh {
                    Some(id) => Some(self.files.get(id, ino)?.fh()),
                    None => None,
                };
                let out = self.fs.getattr(cx, key, fh).await?;
                Ok(Self::attr_reply(ino, out))
            }

            Operation::SetAttr(mut attr) => {
                let key = self.key(ino)?;
                if let Some(id) = attr.fh {
                    attr.fh = Some(self.files.get(id, ino)?.fh());
                }
                let out = self.fs.setattr(cx, key, attr).await?;
                Ok(Self::attr_reply(ino, out))
            }

            Operation::ReadLink => {
                let key = self.key(ino)?;
                let link = self.fs.readlink(cx, key).await?;
                Ok(Response::Data(link.into_os_string().into_vec()))
            }

            Operation::MkNod {
                name,
                mode,
                rdev,
                umask,
            } => {
                check_name(&name)?;
                let parent = self.key(ino)?;
                let _guard = self.entries.lock(ino, &name).await;
                let resolution = self.inodes.resolution();
                let entry = self.fs.mknod(cx, parent, &name, mode, rdev, umask).await?;
                let out = self
                    .register_entry(cx, parent, &name, &resolution, entry)
                    .await?;
                Ok(Response::Entry(out))
            }

            Operation::MkDir { name, mode, umask } => {
                check_name(&name)?;
                let parent = self.key(ino)?;
                let _guard = self.entries.lock(ino, &name).await;
                let resolution = self.inodes.resolution();
                let entry = self.fs.mkdir(cx, parent, &name, mode, umask).await?;
                let out = self
                    .register_entry(cx, parent, &name, &resolution, entry)
                    .await?;
                Ok(Response::Entry(out))
            }

            Operation::SymLink { name, link } => {
                check_name(&name)?;
                let parent = self.key(ino)?;
                let _guard = self.entries.lock(ino, &name).await;
                let resolution = self.inodes.resolution();
                let entry = self.fs.symlink(cx, parent, &name, &link).await?;
                let out = self
                    .register_entry(cx, parent, &name, &resolution, entry)
                    .await?;
                Ok(Response::Entry(out))
            }

            Operation::Unlink { name } => {
                check_name(&name)?;
                let parent = self.key(ino)?;
                let _guard = self.entries.lock(ino, &name).await;
                self.fs.unlink(cx, parent, &name).await?;
                Ok(Response::Empty)
            }

            Operation::RmDir { name } => {
                check_name(&name)?;
                let parent = self.key(ino)?;
                let _guard = self.entries.lock(ino, &name).await;
                self.fs.rmdir(cx, parent, &name).await?;
                Ok(Response::Empty)
            }

            Operation::Rename {
                name,
                newparent,
                newname,
                flags,
            } => {
                check_name(&name)?;
                check_name(&newname)?;
                let newparent = Ino::from_raw(newparent);
                let parent_key = self.key(ino)?;
                let newparent_key = self.key(newparent)?;
                let _guard = self
                    .entries
                    .lock_pair((ino, &name), (newparent, &newname))
                    .await;
                self.fs
                    .rename(cx, parent_key, &name, newparent_key, &newname, flags)
                    .await?;
                Ok(Response::Empty)
            }

            Operation::Link { oldnodeid, newname } => {
                check_name(&newname)?;
                let key = self.key(Ino::from_raw(oldnodeid))?;
                let newparent = self.key(ino)?;
                let _guard = self.entries.lock(ino, &newname).await;
                let resolution = self.inodes.resolution();
                let entry = self.fs.link(cx, key, newparent, &newname).await?;
                let out = self
                    .register_entry(cx, newparent, &newname, &resolution, entry)
                    .await?;
                Ok(Response::Entry(out))
            }

            Operation::Open { flags } => {
                let key = self.key(ino)?;
                let opened = self.fs.open(cx, key, flags).await?;
                let out = self.open_handle(cx, ino, key, flags, opened).await?;
                Ok(Response::Open(out))
            }

            Operation::Read { fh, offset, size } => {
                let h = self.files.get(fh, ino)?;
                let mut data = self.fs.read(cx, h.key(), h.fh(), offset, size).await?;
                data.truncate(usize::try_from(size).unwrap_or(usize::MAX));
                h.set_position(offset.saturating_add(data.len() as u64));
                Ok(Response::Data(data))
            }

            Operation::Write {
                fh,
                offset,
                data,
                flags,
            } => {
                if data.len() > usize::try_from(self.max_write).unwrap_or(usize::MAX) {
                    return Err(Error::Protocol("write larger than max_write"));
                }
                let h = self.files.get(fh, ino)?;
                let size = self.fs.write(cx, h.key(), h.fh(), offset, &data, flags).await?;
                if size as usize > data.len() {
                    return Err(Error::Protocol("write reported more bytes than it was given"));
                }
                h.set_position(offset.saturating_add(u64::from(size)));
                Ok(Response::Write { size })
            }

            Operation::Flush { fh, lock_owner } => {
                let h = self.files.get(fh, ino)?;
                self.locks.release_owner(ino, lock_owner);
                self.fs.flush(cx, h.key(), h.fh(), lock_owner).await?;
                Ok(Response::Empty)
            }

            Operation::Release {
                fh,
                flags,
                lock_owner,
                flush,
                flock_release,
            } => {
                let (record, evicted) = self.files.release(fh, ino)?;
                if flock_release {
                    self.locks.unlock_flock(ino, lock_owner);
                }
                if flush {
                    self.locks.release_owner(ino, lock_owner);
                }
                let ret = self
                    .fs
                    .release(cx, record.key(), record.fh(), flags, lock_owner, flush)
                    .await;
                if let Some(evicted) = evicted {
                    self.evict(evicted).await;
                }
                ret?;
                Ok(Response::Empty)
            }

            Operation::FSync { fh, datasync } => {
                let h = self.files.get(fh, ino)?;
                self.fs.fsync(cx, h.key(), h.fh(), datasync).await?;
                Ok(Response::Empty)
            }

            Operation::OpenDir { flags } => {
                let key = self.key(ino)?;
                let opened = self.fs.opendir(cx, key, flags).await?;
                match self.dirs.open(ino, flags, opened) {
                    Ok(fh) => Ok(Response::Open(OpenOut {
                        fh,
                        flags: opened.flags,
                    })),
                    Err(err) => {
                        let _ = self.fs.releasedir(cx, key, opened.fh, flags).await;
                        Err(err)
                    }
                }
            }

            Operation::ReadDir { fh, offset, size } => {
                let h = self.dirs.get(fh, ino)?;
                let entries = self.fs.readdir(cx, h.key(), h.fh(), offset).await?;

                let limit = usize::try_from(size).unwrap_or(usize::MAX);
                let mut used = 0;
                let mut out = Vec::new();
                for e in entries {
                    used += dirent_size(&e.name);
                    if used > limit {
                        break;
                    }
                    let ino = e
                        .key
                        .and_then(|key| self.inodes.find(key))
                        .map_or(UNKNOWN_INO, Ino::as_raw);
                    out.push(DirEntryOut {
                        ino,
                        offset: e.offset,
                        kind: e.kind,
                        name: e.name,
                    });
                }
                if let Some(last) = out.last() {
                    h.set_position(last.offset);
                }
                Ok(Response::Directory(out))
            }

            Operation::ReadDirPlus { fh, offset, size } => {
                let h = self.dirs.get(fh, ino)?;
                let resolution = self.inodes.resolution();
                let entries = self.fs.readdirplus(cx, h.key(), h.fh(), offset).await?;

                let limit = usize::try_from(size).unwrap_or(usize::MAX);
                let mut used = 0;
                let mut out = Vec::new();
                let mut counted = Vec::new();
                for e in entries {
                    used += ENTRY_OUT_SIZE + dirent_size(&e.name);
                    if used > limit {
                        break;
                    }
                    // only entries handed to the kernel are counted
                    let entry = if is_dot(&e.name) {
                        self.dot_entry(&e.entry)
                    } else {
                        let registered = self
                            .register_entry(cx, h.key(), &e.name, &resolution, e.entry)
                            .await;
                        match registered {
                            Ok(entry) => {
                                if entry.ino != 0 {
                                    counted.push((Ino::from_raw(entry.ino), 1));
                                }
                                entry
                            }
                            Err(err) => {
                                // the kernel never sees this reply
                                self.settle(self.inodes.forget_multi(&counted)).await;
                                return Err(err);
                            }
                        }
                    };
                    let dirent = DirEntryOut {
                        ino: if entry.ino == 0 { UNKNOWN_INO } else { entry.ino },
                        offset: e.offset,
                        kind: entry.attr.kind,
                        name: e.name,
                    };
                    out.push((entry, dirent));
                }
                if let Some((_, last)) = out.last() {
                    h.set_position(last.offset);
                }
                Ok(Response::DirectoryPlus(out))
            }

            Operation::ReleaseDir { fh, flags } => {
                let (record, evicted) = self.dirs.release(fh, ino)?;
                let ret = self.fs.releasedir(cx, record.key(), record.fh(), flags).await;
                if let Some(evicted) = evicted {
                    self.evict(evicted).await;
                }
                ret?;
                Ok(Response::Empty)
            }

            Operation::FSyncDir { fh, datasync } => {
                let h = self.dirs.get(fh, ino)?;
                self.fs.fsyncdir(cx, h.key(), h.fh(), datasync).await?;
                Ok(Response::Empty)
            }

            Operation::StatFs => {
                let key = self.key(ino)?;
                Ok(Response::StatFs(self.fs.statfs(cx, key).await?))
            }

            Operation::SetXAttr { name, value, flags } => {
                check_xattr_name(&name)?;
                let key = self.key(ino)?;
                self.fs.setxattr(cx, key, &name, &value, flags).await?;
                Ok(Response::Empty)
            }

            Operation::GetXAttr { name, size } => {
                check_xattr_name(&name)?;
                let key = self.key(ino)?;
                let value = self.fs.getxattr(cx, key, &name).await?;
                xattr_reply(value, size)
            }

            Operation::ListXAttr { size } => {
                let key = self.key(ino)?;
                let names = self.fs.listxattr(cx, key).await?;
                let mut list = Vec::new();
                for name in names {
                    list.extend_from_slice(name.as_bytes());
                    list.push(b'\0');
                }
                xattr_reply(list, size)
            }

            Operation::RemoveXAttr { name } => {
                check_xattr_name(&name)?;
                let key = self.key(ino)?;
                self.fs.removexattr(cx, key, &name).await?;
                Ok(Response::Empty)
            }

            Operation::Access { mask } => {
                let key = self.key(ino)?;
                self.fs.access(cx, key, mask).await?;
                Ok(Response::Empty)
            }

            Operation::Create {
                name,
                mode,
                umask,
                flags,
            } => {
                check_name(&name)?;
                let parent = self.key(ino)?;
                let _guard = self.entries.lock(ino, &name).await;
                let resolution = self.inodes.resolution();
                let (entry, opened) = self.fs.create(cx, parent, &name, mode, umask, flags).await?;
                let key = entry
                    .key
                    .ok_or(Error::Protocol("create returned a negative entry"))?;
                let out = self
                    .register_entry(cx, parent, &name, &resolution, entry)
                    .await?;
                let created = Ino::from_raw(out.ino);
                let key = self.inodes.key(created).unwrap_or(key);
                let handle = self.open_handle(cx, created, key, flags, opened).await?;
                Ok(Response::Create(out, handle))
            }

            Operation::GetLk { fh, owner, lock } => {
                let _ = self.files.get(fh, ino)?;
                let query = posix_lock(owner, lock)?;
                let answer = match self.locks.test(ino, &query) {
                    Some(held) => FileLock {
                        start: held.range.start,
                        end: held.range.end,
                        typ: held.typ,
                        pid: held.pid,
                    },
                    None => FileLock {
                        typ: LockType::Unlock,
                        ..lock
                    },
                };
                Ok(Response::Lock(answer))
            }

            Operation::SetLk {
                fh,
                owner,
                lock,
                sleep,
            } => {
                let _ = self.files.get(fh, ino)?;
                let request = LockRequest::Posix(posix_lock(owner, lock)?);
                if sleep && lock.typ != LockType::Unlock {
                    self.locks
                        .await_lock(ino, request, cx.interrupted())
                        .await?;
                } else {
                    self.locks.try_lock(ino, request)?;
                }
                Ok(Response::Empty)
            }

            Operation::Flock {
                fh,
                owner,
                typ,
                nonblock,
            } => {
                let _ = self.files.get(fh, ino)?;
                let request = LockRequest::Flock { owner, typ };
                if nonblock || typ == LockType::Unlock {
                    self.locks.try_lock(ino, request)?;
                } else {
                    self.locks
                        .await_lock(ino, request, cx.interrupted())
                        .await?;
                }
                Ok(Response::Empty)
            }

            Operation::BMap { blocksize, idx } => {
                let key = self.key(ino)?;
                let block = self.fs.bmap(cx, key, blocksize, idx).await?;
                Ok(Response::BMap { block })
            }

            Operation::Ioctl {
                fh,
                dir,
                cmd,
                arg,
                data,
                out_size,
            } => {
                let h = if dir {
                    self.dirs.get(fh, ino)?
                } else {
                    self.files.get(fh, ino)?
                };
                let out = self
                    .fs
                    .ioctl(cx, h.key(), h.fh(), cmd, arg, &data, out_size)
                    .await?;
                if out.data.len() > usize::try_from(out_size).unwrap_or(usize::MAX) {
                    return Err(Error::Protocol("ioctl output exceeds out_size"));
                }
                Ok(Response::Ioctl(out))
            }

            Operation::Poll { fh, kh, events } => {
                let h = self.files.get(fh, ino)?;
                let ph = kh.map(|kh| PollHandle::new(kh, Arc::clone(&self.writer)));
                let revents = self.fs.poll(cx, h.key(), h.fh(), ph, events).await?;
                Ok(Response::Poll { revents })
            }

            Operation::Fallocate {
                fh,
                offset,
                length,
                mode,
            } => {
                let h = self.files.get(fh, ino)?;
                self.fs
                    .fallocate(cx, h.key(), h.fh(), offset, length, mode)
                    .await?;
                Ok(Response::Empty)
            }

            Operation::Lseek { fh, offset, whence } => {
                let h = self.files.get(fh, ino)?;
                let offset = self.fs.lseek(cx, h.key(), h.fh(), offset, whence).await?;
                h.set_position(offset);
                Ok(Response::Lseek { offset })
            }
        }
    }
}
