use crate::node::{Node, NodeData};

use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use fuse_dispatch::ops::InitConfig;
use fuse_dispatch::types::file::{AccessMode, FileType};
use fuse_dispatch::types::{
    AttrOut, DirEntry, DirEntryPlus, Entry, FileKey, Opened, SetAttr, StatFs,
};
use fuse_dispatch::{Context, Errno, FileSystem, PollHandle};

use parking_lot::RwLock;
use tracing::debug;

/// rename flag: fail if the target exists
const RENAME_NOREPLACE: u32 = 1;

/// rename flag: swap source and target
const RENAME_EXCHANGE: u32 = 2;

/// largest file the filesystem holds
const MAX_FILE_SIZE: u64 = 1 << 30;

/// checks a file length against [`MAX_FILE_SIZE`]
fn file_len(len: u64) -> Result<usize, Errno> {
    if len > MAX_FILE_SIZE {
        return Err(Errno::from_raw(libc::EFBIG));
    }
    usize::try_from(len).map_err(|_| Errno::from_raw(libc::EFBIG))
}

/// An in-memory filesystem
#[derive(Debug)]
pub struct MemFs {
    /// nodes by backing identity
    nodes: RwLock<HashMap<FileKey, Node>>,
    /// identity allocator; identities are never reused
    next: AtomicU64,
    /// attribute and entry timeout
    ttl: Duration,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    /// The backing identity of the root directory
    pub const ROOT_KEY: FileKey = FileKey(1);

    /// Creates an empty filesystem
    #[must_use]
    pub fn new() -> Self {
        let root = Node::new(
            FileType::Directory,
            0o755,
            NodeData::Directory {
                parent: Self::ROOT_KEY,
                entries: BTreeMap::new(),
            },
        );
        let mut nodes = HashMap::new();
        let _ = nodes.insert(Self::ROOT_KEY, root);
        Self {
            nodes: RwLock::new(nodes),
            next: AtomicU64::new(Self::ROOT_KEY.0 + 1),
            ttl: Duration::from_secs(1),
        }
    }

    /// Returns the number of live nodes, root included
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// entry of an existing node
    fn entry_of(&self, nodes: &HashMap<FileKey, Node>, key: FileKey) -> Result<Entry, Errno> {
        let node = nodes.get(&key).ok_or(Errno::ENOENT)?;
        Ok(Entry::new(key, node.attr, self.ttl))
    }

    /// links a new node into `parent`
    fn insert_child(&self, parent: FileKey, name: &OsStr, mut node: Node) -> Result<Entry, Errno> {
        let mut nodes = self.nodes.write();
        let dir = nodes.get_mut(&parent).ok_or(Errno::ENOENT)?;
        if dir.entries()?.contains_key(name) {
            return Err(Errno::EEXIST);
        }

        let key = FileKey(self.next.fetch_add(1, Ordering::Relaxed));
        let is_dir = matches!(node.data, NodeData::Directory { .. });
        if let NodeData::Directory {
            parent: ref mut p, ..
        } = node.data
        {
            *p = parent;
        }
        let _ = dir.entries_mut()?.insert(name.to_owned(), key);
        if is_dir {
            dir.attr.nlink += 1;
        }
        dir.touch();

        node.sync_size();
        let entry = Entry::new(key, node.attr, self.ttl);
        let _ = nodes.insert(key, node);
        debug!(%parent, ?name, %key, "node created");
        Ok(entry)
    }

    /// removes `name` from `parent`, returning the unlinked identity
    fn remove_child(&self, parent: FileKey, name: &OsStr, want_dir: bool) -> Result<FileKey, Errno> {
        let mut nodes = self.nodes.write();
        let key = nodes.get(&parent).ok_or(Errno::ENOENT)?.child(name)?;
        let node = nodes.get(&key).ok_or(Errno::ENOENT)?;
        let is_dir = matches!(node.data, NodeData::Directory { .. });
        match (want_dir, is_dir) {
            (true, false) => return Err(Errno::ENOTDIR),
            (false, true) => return Err(Errno::EISDIR),
            (true, true) if !node.entries()?.is_empty() => return Err(Errno::ENOTEMPTY),
            _ => {}
        }

        let dir = nodes.get_mut(&parent).ok_or(Errno::ENOENT)?;
        let _ = dir.entries_mut()?.remove(name);
        if is_dir {
            dir.attr.nlink -= 1;
        }
        dir.touch();

        let node = nodes.get_mut(&key).ok_or(Errno::ENOENT)?;
        node.attr.nlink = if is_dir { 0 } else { node.attr.nlink.saturating_sub(1) };
        node.attr.ctime = SystemTime::now();
        Ok(key)
    }

    /// returns true if `ancestor` is `key` or one of its parents
    fn is_ancestor(nodes: &HashMap<FileKey, Node>, ancestor: FileKey, mut key: FileKey) -> bool {
        loop {
            if key == ancestor {
                return true;
            }
            match nodes.get(&key).map(|n| &n.data) {
                Some(&NodeData::Directory { parent, .. }) if parent != key => key = parent,
                _ => return false,
            }
        }
    }

    /// size of a regular file
    fn file_size(&self, key: FileKey) -> Result<u64, Errno> {
        let nodes = self.nodes.read();
        match nodes.get(&key).ok_or(Errno::ENOENT)?.data {
            NodeData::Regular(ref bytes) => Ok(bytes.len() as u64),
            NodeData::Directory { .. } => Err(Errno::EISDIR),
            _ => Err(Errno::EINVAL),
        }
    }

    /// runs `f` on a node
    fn with_node<R>(&self, key: FileKey, f: impl FnOnce(&mut Node) -> Result<R, Errno>) -> Result<R, Errno> {
        let mut nodes = self.nodes.write();
        let node = nodes.get_mut(&key).ok_or(Errno::ENOENT)?;
        f(node)
    }

    /// attributes reply
    fn attr_out(&self, node: &Node) -> AttrOut {
        AttrOut {
            attr: node.attr,
            ttl: self.ttl,
        }
    }

    /// entries of a directory with their offsets, starting after `offset`
    fn list(&self, key: FileKey, offset: u64) -> Result<Vec<(u64, OsString, FileKey)>, Errno> {
        let nodes = self.nodes.read();
        let node = nodes.get(&key).ok_or(Errno::ENOENT)?;
        let parent = match node.data {
            NodeData::Directory { parent, .. } => parent,
            _ => return Err(Errno::ENOTDIR),
        };
        let dots = [(OsString::from("."), key), (OsString::from(".."), parent)];
        let children = node.entries()?.iter().map(|(n, &k)| (n.clone(), k));
        Ok(dots
            .into_iter()
            .chain(children)
            .zip(1_u64..)
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .map(|((name, key), next)| (next, name, key))
            .collect())
    }
}

#[async_trait::async_trait]
impl FileSystem for MemFs {
    async fn init(&self, _: &Context, config: &mut InitConfig) -> Result<(), Errno> {
        debug!(?config, "memfs init");
        Ok(())
    }

    async fn destroy(&self) {
        debug!(nodes = self.node_count(), "memfs destroy");
    }

    async fn lookup(&self, _: &Context, parent: FileKey, name: &OsStr) -> Result<Entry, Errno> {
        let nodes = self.nodes.read();
        let key = nodes.get(&parent).ok_or(Errno::ENOENT)?.child(name)?;
        self.entry_of(&nodes, key)
    }

    async fn forget(&self, key: FileKey) {
        let mut nodes = self.nodes.write();
        let unlinked = nodes.get(&key).map_or(false, |n| n.attr.nlink == 0);
        if unlinked && key != Self::ROOT_KEY {
            let _ = nodes.remove(&key);
            debug!(%key, "node dropped");
        }
    }

    async fn getattr(&self, _: &Context, key: FileKey, _: Option<u64>) -> Result<AttrOut, Errno> {
        let nodes = self.nodes.read();
        let node = nodes.get(&key).ok_or(Errno::ENOENT)?;
        Ok(self.attr_out(node))
    }

    async fn setattr(&self, _: &Context, key: FileKey, attr: SetAttr) -> Result<AttrOut, Errno> {
        self.with_node(key, |node| {
            if let Some(size) = attr.size {
                let bytes = node.bytes_mut()?;
                bytes.resize(file_len(size)?, 0);
                node.touch();
            }
            if let Some(mode) = attr.mode {
                node.attr.perm = mode & 0o7777;
            }
            if let Some(uid) = attr.uid {
                node.attr.uid = uid;
            }
            if let Some(gid) = attr.gid {
                node.attr.gid = gid;
            }
            if let Some(atime) = attr.atime {
                node.attr.atime = atime.resolve();
            }
            if let Some(mtime) = attr.mtime {
                node.attr.mtime = mtime.resolve();
            }
            node.attr.ctime = attr.ctime.unwrap_or_else(SystemTime::now);
            Ok(self.attr_out(node))
        })
    }

    async fn readlink(&self, _: &Context, key: FileKey) -> Result<PathBuf, Errno> {
        let nodes = self.nodes.read();
        match nodes.get(&key).ok_or(Errno::ENOENT)?.data {
            NodeData::SymLink(ref path) => Ok(path.clone()),
            _ => Err(Errno::EINVAL),
        }
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
        let kind = FileType::from_mode(mode).ok_or(Errno::EINVAL)?;
        let data = match kind {
            FileType::Regular => NodeData::Regular(Vec::new()),
            FileType::Directory | FileType::SymbolicLink => return Err(Errno::EINVAL),
            _ => NodeData::Special,
        };
        let mut node = Node::new(kind, mode & !umask, data);
        let _ = node.attr.rdev(rdev).uid(cx.uid()).gid(cx.gid());
        self.insert_child(parent, name, node)
    }

    async fn mkdir(
        &self,
        cx: &Context,
        parent: FileKey,
        name: &OsStr,
        mode: u32,
        umask: u32,
    ) -> Result<Entry, Errno> {
        let data = NodeData::Directory {
            parent,
            entries: BTreeMap::new(),
        };
        let mut node = Node::new(FileType::Directory, mode & !umask, data);
        let _ = node.attr.uid(cx.uid()).gid(cx.gid());
        self.insert_child(parent, name, node)
    }

    async fn unlink(&self, _: &Context, parent: FileKey, name: &OsStr) -> Result<(), Errno> {
        let _ = self.remove_child(parent, name, false)?;
        Ok(())
    }

    async fn rmdir(&self, _: &Context, parent: FileKey, name: &OsStr) -> Result<(), Errno> {
        let _ = self.remove_child(parent, name, true)?;
        Ok(())
    }

    async fn symlink(
        &self,
        cx: &Context,
        parent: FileKey,
        name: &OsStr,
        link: &Path,
    ) -> Result<Entry, Errno> {
        let mut node = Node::new(FileType::SymbolicLink, 0o777, NodeData::SymLink(link.to_owned()));
        let _ = node.attr.uid(cx.uid()).gid(cx.gid());
        self.insert_child(parent, name, node)
    }

    async fn rename(
        &self,
        _: &Context,
        parent: FileKey,
        name: &OsStr,
        newparent: FileKey,
        newname: &OsStr,
        flags: u32,
    ) -> Result<(), Errno> {
        if flags & RENAME_EXCHANGE != 0 {
            return Err(Errno::EINVAL);
        }
        let mut nodes = self.nodes.write();
        let key = nodes.get(&parent).ok_or(Errno::ENOENT)?.child(name)?;
        let is_dir = matches!(nodes.get(&key).map(|n| &n.data), Some(NodeData::Directory { .. }));
        if is_dir && Self::is_ancestor(&nodes, key, newparent) {
            return Err(Errno::EINVAL);
        }

        let target = match nodes.get(&newparent).ok_or(Errno::ENOENT)?.child(newname) {
            Ok(target) => Some(target),
            Err(errno) if errno == Errno::ENOENT => None,
            Err(errno) => return Err(errno),
        };
        if let Some(target) = target {
            if flags & RENAME_NOREPLACE != 0 {
                return Err(Errno::EEXIST);
            }
            if target == key {
                return Ok(());
            }
            let node = nodes.get_mut(&target).ok_or(Errno::ENOENT)?;
            match (is_dir, &node.data) {
                (true, NodeData::Directory { entries, .. }) if !entries.is_empty() => {
                    return Err(Errno::ENOTEMPTY)
                }
                (true, NodeData::Directory { .. }) => node.attr.nlink = 0,
                (true, _) => return Err(Errno::ENOTDIR),
                (false, NodeData::Directory { .. }) => return Err(Errno::EISDIR),
                (false, _) => node.attr.nlink = node.attr.nlink.saturating_sub(1),
            }
            if is_dir {
                // the replaced directory no longer links its parent
                let dir = nodes.get_mut(&newparent).ok_or(Errno::ENOENT)?;
                dir.attr.nlink -= 1;
            }
        }

        let _ = nodes
            .get_mut(&parent)
            .ok_or(Errno::ENOENT)?
            .entries_mut()?
            .remove(name);
        let _ = nodes
            .get_mut(&newparent)
            .ok_or(Errno::ENOENT)?
            .entries_mut()?
            .insert(newname.to_owned(), key);

        if is_dir && parent != newparent {
            if let Some(NodeData::Directory { parent: p, .. }) =
                nodes.get_mut(&key).map(|n| &mut n.data)
            {
                *p = newparent;
            }
            if let Some(old) = nodes.get_mut(&parent) {
                old.attr.nlink -= 1;
            }
            if let Some(new) = nodes.get_mut(&newparent) {
                new.attr.nlink += 1;
            }
        }
        for dir in [parent, newparent] {
            if let Some(dir) = nodes.get_mut(&dir) {
                dir.touch();
            }
        }
        if let Some(node) = nodes.get_mut(&key) {
            node.attr.ctime = SystemTime::now();
        }
        Ok(())
    }

    async fn link(
        &self,
        _: &Context,
        key: FileKey,
        newparent: FileKey,
        newname: &OsStr,
    ) -> Result<Entry, Errno> {
        let mut nodes = self.nodes.write();
        if matches!(nodes.get(&key).ok_or(Errno::ENOENT)?.data, NodeData::Directory { .. }) {
            return Err(Errno::EPERM);
        }
        let dir = nodes.get_mut(&newparent).ok_or(Errno::ENOENT)?;
        if dir.entries()?.contains_key(newname) {
            return Err(Errno::EEXIST);
        }
        let _ = dir.entries_mut()?.insert(newname.to_owned(), key);
        dir.touch();

        let node = nodes.get_mut(&key).ok_or(Errno::ENOENT)?;
        node.attr.nlink += 1;
        node.attr.ctime = SystemTime::now();
        Ok(Entry::new(key, node.attr, self.ttl))
    }

    async fn open(&self, _: &Context, key: FileKey, flags: i32) -> Result<Opened, Errno> {
        let mode = AccessMode::from_flags(flags).ok_or(Errno::EINVAL)?;
        self.with_node(key, |node| {
            if matches!(node.data, NodeData::Directory { .. }) {
                return Err(Errno::EISDIR);
            }
            if flags & libc::O_TRUNC != 0 && mode.writable() {
                node.bytes_mut()?.clear();
                node.touch();
            }
            Ok(Opened::new(0))
        })
    }

    async fn read(
        &self,
        _: &Context,
        key: FileKey,
        _: u64,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, Errno> {
        let nodes = self.nodes.read();
        let bytes = match nodes.get(&key).ok_or(Errno::ENOENT)?.data {
            NodeData::Regular(ref bytes) => bytes,
            NodeData::Directory { .. } => return Err(Errno::EISDIR),
            _ => return Err(Errno::EINVAL),
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(bytes.len());
        let end = start.saturating_add(size as usize).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    async fn write(
        &self,
        _: &Context,
        key: FileKey,
        _: u64,
        offset: u64,
        data: &[u8],
        _: u32,
    ) -> Result<u32, Errno> {
        let len = u32::try_from(data.len()).map_err(|_| Errno::EINVAL)?;
        let end = offset.checked_add(u64::from(len)).ok_or(Errno::EINVAL)?;
        let end = file_len(end)?;
        let start = end - data.len();
        self.with_node(key, |node| {
            let bytes = node.bytes_mut()?;
            if bytes.len() < end {
                bytes.resize(end, 0);
            }
            bytes[start..end].copy_from_slice(data);
            node.touch();
            Ok(len)
        })
    }

    async fn flush(&self, _: &Context, _: FileKey, _: u64, _: u64) -> Result<(), Errno> {
        Ok(())
    }

    async fn fsync(&self, _: &Context, _: FileKey, _: u64, _: bool) -> Result<(), Errno> {
        Ok(())
    }

    async fn opendir(&self, _: &Context, key: FileKey, _: i32) -> Result<Opened, Errno> {
        let nodes = self.nodes.read();
        let _ = nodes.get(&key).ok_or(Errno::ENOENT)?.entries()?;
        Ok(Opened::new(0))
    }

    async fn readdir(
        &self,
        _: &Context,
        key: FileKey,
        _: u64,
        offset: u64,
    ) -> Result<Vec<DirEntry>, Errno> {
        let listed = self.list(key, offset)?;
        let nodes = self.nodes.read();
        Ok(listed
            .into_iter()
            .filter_map(|(next, name, key)| {
                let node = nodes.get(&key)?;
                Some(DirEntry {
                    key: Some(key),
                    offset: next,
                    kind: node.attr.kind,
                    name,
                })
            })
            .collect())
    }

    async fn readdirplus(
        &self,
        _: &Context,
        key: FileKey,
        _: u64,
        offset: u64,
    ) -> Result<Vec<DirEntryPlus>, Errno> {
        let listed = self.list(key, offset)?;
        let nodes = self.nodes.read();
        Ok(listed
            .into_iter()
            .filter_map(|(next, name, key)| {
                let entry = self.entry_of(&nodes, key).ok()?;
                Some(DirEntryPlus {
                    entry,
                    offset: next,
                    name,
                })
            })
            .collect())
    }

    async fn fsyncdir(&self, _: &Context, _: FileKey, _: u64, _: bool) -> Result<(), Errno> {
        Ok(())
    }

    async fn statfs(&self, _: &Context, _: FileKey) -> Result<StatFs, Errno> {
        let nodes = self.nodes.read();
        let blocks = nodes.values().map(|n| n.attr.blocks).sum();
        Ok(StatFs {
            blocks,
            bfree: 0,
            bavail: 0,
            files: nodes.len() as u64,
            ffree: u64::from(u32::MAX),
            bsize: 512,
            namelen: 255,
            frsize: 512,
        })
    }

    async fn setxattr(
        &self,
        _: &Context,
        key: FileKey,
        name: &OsStr,
        value: &[u8],
        flags: i32,
    ) -> Result<(), Errno> {
        self.with_node(key, |node| {
            let exists = node.xattrs.contains_key(name);
            if flags & libc::XATTR_CREATE != 0 && exists {
                return Err(Errno::EEXIST);
            }
            if flags & libc::XATTR_REPLACE != 0 && !exists {
                return Err(Errno::ENODATA);
            }
            let _ = node.xattrs.insert(name.to_owned(), value.to_vec());
            node.attr.ctime = SystemTime::now();
            Ok(())
        })
    }

    async fn getxattr(&self, _: &Context, key: FileKey, name: &OsStr) -> Result<Vec<u8>, Errno> {
        let nodes = self.nodes.read();
        let node = nodes.get(&key).ok_or(Errno::ENOENT)?;
        node.xattrs.get(name).cloned().ok_or(Errno::ENODATA)
    }

    async fn listxattr(&self, _: &Context, key: FileKey) -> Result<Vec<OsString>, Errno> {
        let nodes = self.nodes.read();
        let node = nodes.get(&key).ok_or(Errno::ENOENT)?;
        Ok(node.xattrs.keys().cloned().collect())
    }

    async fn removexattr(&self, _: &Context, key: FileKey, name: &OsStr) -> Result<(), Errno> {
        self.with_node(key, |node| {
            let _ = node.xattrs.remove(name).ok_or(Errno::ENODATA)?;
            node.attr.ctime = SystemTime::now();
            Ok(())
        })
    }

    async fn access(&self, _: &Context, key: FileKey, _: i32) -> Result<(), Errno> {
        let nodes = self.nodes.read();
        let _ = nodes.get(&key).ok_or(Errno::ENOENT)?;
        Ok(())
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
        let _ = AccessMode::from_flags(flags).ok_or(Errno::EINVAL)?;
        let mut node = Node::new(FileType::Regular, mode & !umask, NodeData::Regular(Vec::new()));
        let _ = node.attr.uid(cx.uid()).gid(cx.gid());
        let entry = self.insert_child(parent, name, node)?;
        Ok((entry, Opened::new(0)))
    }

    async fn poll(
        &self,
        _: &Context,
        key: FileKey,
        _: u64,
        ph: Option<PollHandle>,
        events: u32,
    ) -> Result<u32, Errno> {
        let _ = self.file_size(key)?;
        let ready = (libc::POLLIN | libc::POLLOUT) as u32;
        if let Some(ph) = ph {
            // memory is always ready, wake the waiter right away
            if let Err(err) = ph.notify().await {
                debug!(%err, "poll notification failed");
            }
        }
        Ok(events & ready)
    }

    async fn fallocate(
        &self,
        _: &Context,
        key: FileKey,
        _: u64,
        offset: u64,
        length: u64,
        mode: i32,
    ) -> Result<(), Errno> {
        if mode != 0 {
            return Err(Errno::from_raw(libc::EOPNOTSUPP));
        }
        let end = offset.checked_add(length).ok_or(Errno::EINVAL)?;
        let end = file_len(end)?;
        self.with_node(key, |node| {
            let bytes = node.bytes_mut()?;
            if bytes.len() < end {
                bytes.resize(end, 0);
                node.touch();
            }
            Ok(())
        })
    }

    async fn lseek(
        &self,
        _: &Context,
        key: FileKey,
        _: u64,
        offset: i64,
        whence: i32,
    ) -> Result<u64, Errno> {
        let size = self.file_size(key)?;
        let offset = u64::try_from(offset).map_err(|_| Errno::EINVAL)?;
        match whence {
            libc::SEEK_SET => Ok(offset),
            libc::SEEK_END => Ok(size.saturating_add(offset)),
            // the whole file is data
            libc::SEEK_DATA if offset < size => Ok(offset),
            libc::SEEK_HOLE if offset < size => Ok(size),
            libc::SEEK_DATA | libc::SEEK_HOLE => Err(Errno::from_raw(libc::ENXIO)),
            _ => Err(Errno::EINVAL),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    use fuse_dispatch::channel::{self, MemKernel};
    use fuse_dispatch::ops::{EntryOut, OpInit, OpenOut, Operation, Response};
    use fuse_dispatch::ServerBuilder;

    use std::io;

    use async_std::task::{self, JoinHandle};

    const ROOT: u64 = 1;

    async fn mount() -> (MemKernel, JoinHandle<io::Result<()>>) {
        crate::setup_tracing();
        let (reader, writer, kernel) = channel::memory();
        let init = kernel.submit(
            0,
            Operation::Init(OpInit {
                major: 7,
                minor: 31,
                max_readahead: 4096,
                flags: 0,
            }),
        );
        let server = ServerBuilder::new(MemFs::new())
            .initialize(reader, writer)
            .await
            .unwrap();
        assert!(matches!(kernel.reply(init).await, Some(Ok(Response::Init(_)))));
        (kernel, task::spawn(server.run()))
    }

    async fn entry(kernel: &MemKernel, parent: u64, op: Operation) -> EntryOut {
        match kernel.call(parent, op).await {
            Some(Ok(Response::Entry(e))) => e,
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    async fn create(kernel: &MemKernel, name: &str) -> (EntryOut, OpenOut) {
        let op = Operation::Create {
            name: name.into(),
            mode: libc::S_IFREG | 0o644,
            umask: 0o022,
            flags: libc::O_RDWR,
        };
        match kernel.call(ROOT, op).await {
            Some(Ok(Response::Create(e, o))) => (e, o),
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    async fn mkdir(kernel: &MemKernel, parent: u64, name: &str) -> EntryOut {
        let op = Operation::MkDir {
            name: name.into(),
            mode: 0o755,
            umask: 0,
        };
        entry(kernel, parent, op).await
    }

    async fn files(kernel: &MemKernel) -> u64 {
        match kernel.call(ROOT, Operation::StatFs).await {
            Some(Ok(Response::StatFs(st))) => st.files,
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    fn release(fh: u64) -> Operation {
        Operation::Release {
            fh,
            flags: libc::O_RDWR,
            lock_owner: 0,
            flush: false,
            flock_release: false,
        }
    }

    #[test]
    fn file_size_is_capped() {
        task::block_on(async {
            let (kernel, _server) = mount().await;
            let (e, o) = create(&kernel, "big").await;
            let efbig = Some(Err(Errno::from_raw(libc::EFBIG)));

            let write = Operation::Write {
                fh: o.fh,
                offset: 1 << 40,
                data: b"x".to_vec(),
                flags: 0,
            };
            assert_eq!(kernel.call(e.ino, write).await, efbig);

            let truncate = Operation::SetAttr(SetAttr {
                size: Some(u64::MAX),
                ..SetAttr::default()
            });
            assert_eq!(kernel.call(e.ino, truncate).await, efbig);

            let fallocate = Operation::Fallocate {
                fh: o.fh,
                offset: MAX_FILE_SIZE,
                length: 1,
                mode: 0,
            };
            assert_eq!(kernel.call(e.ino, fallocate).await, efbig);

            // the file is untouched and still usable
            let write = Operation::Write {
                fh: o.fh,
                offset: 3,
                data: b"x".to_vec(),
                flags: 0,
            };
            assert_eq!(
                kernel.call(e.ino, write).await,
                Some(Ok(Response::Write { size: 1 }))
            );
            match kernel.call(e.ino, Operation::GetAttr { fh: None }).await {
                Some(Ok(Response::Attr { attr, .. })) => assert_eq!(attr.size, 4),
                other => panic!("unexpected reply: {:?}", other),
            }
        });
    }

    #[test]
    fn create_write_read() {
        task::block_on(async {
            let (kernel, _server) = mount().await;
            let (e, o) = create(&kernel, "f").await;
            assert_eq!(e.attr.perm, 0o644);

            let write = Operation::Write {
                fh: o.fh,
                offset: 0,
                data: b"hello".to_vec(),
                flags: 0,
            };
            assert_eq!(
                kernel.call(e.ino, write).await,
                Some(Ok(Response::Write { size: 5 }))
            );

            let read = Operation::Read {
                fh: o.fh,
                offset: 1,
                size: 10,
            };
            assert_eq!(
                kernel.call(e.ino, read).await,
                Some(Ok(Response::Data(b"ello".to_vec())))
            );

            let truncate = Operation::SetAttr(SetAttr {
                size: Some(2),
                ..SetAttr::default()
            });
            match kernel.call(e.ino, truncate).await {
                Some(Ok(Response::Attr { attr, .. })) => {
                    assert_eq!(attr.size, 2);
                    assert_eq!(attr.ino, e.ino);
                }
                other => panic!("unexpected reply: {:?}", other),
            }

            let lseek = Operation::Lseek {
                fh: o.fh,
                offset: 2,
                whence: libc::SEEK_DATA,
            };
            assert_eq!(
                kernel.call(e.ino, lseek).await,
                Some(Err(Errno::from_raw(libc::ENXIO)))
            );
        });
    }

    #[test]
    fn directory_tree() {
        task::block_on(async {
            let (kernel, _server) = mount().await;
            let d = mkdir(&kernel, ROOT, "d").await;
            let e = mkdir(&kernel, d.ino, "e").await;
            let _ = mkdir(&kernel, ROOT, "x").await;

            let rmdir = Operation::RmDir { name: "d".into() };
            assert_eq!(kernel.call(ROOT, rmdir).await, Some(Err(Errno::ENOTEMPTY)));

            let into_self = Operation::Rename {
                name: "d".into(),
                newparent: e.ino,
                newname: "d".into(),
                flags: 0,
            };
            assert_eq!(kernel.call(ROOT, into_self).await, Some(Err(Errno::EINVAL)));

            let noreplace = Operation::Rename {
                name: "d".into(),
                newparent: ROOT,
                newname: "x".into(),
                flags: RENAME_NOREPLACE,
            };
            assert_eq!(kernel.call(ROOT, noreplace).await, Some(Err(Errno::EEXIST)));

            let link = Operation::Link {
                oldnodeid: d.ino,
                newname: "y".into(),
            };
            assert_eq!(kernel.call(ROOT, link).await, Some(Err(Errno::EPERM)));

            let fh = match kernel.call(ROOT, Operation::OpenDir { flags: 0 }).await {
                Some(Ok(Response::Open(o))) => o.fh,
                other => panic!("unexpected reply: {:?}", other),
            };
            let readdir = Operation::ReadDir {
                fh,
                offset: 0,
                size: 4096,
            };
            let names: Vec<OsString> = match kernel.call(ROOT, readdir).await {
                Some(Ok(Response::Directory(entries))) => {
                    assert_eq!(entries[2].ino, d.ino);
                    entries.into_iter().map(|e| e.name).collect()
                }
                other => panic!("unexpected reply: {:?}", other),
            };
            assert_eq!(names, [".", "..", "d", "x"]);

            let releasedir = Operation::ReleaseDir { fh, flags: 0 };
            assert_eq!(kernel.call(ROOT, releasedir).await, Some(Ok(Response::Empty)));
        });
    }

    #[test]
    fn unlinked_file_lives_until_forget() {
        task::block_on(async {
            let (kernel, _server) = mount().await;
            let (e, o) = create(&kernel, "f").await;
            assert_eq!(files(&kernel).await, 2);

            let unlink = Operation::Unlink { name: "f".into() };
            assert_eq!(kernel.call(ROOT, unlink).await, Some(Ok(Response::Empty)));
            let lookup = Operation::Lookup { name: "f".into() };
            assert_eq!(kernel.call(ROOT, lookup).await, Some(Err(Errno::ENOENT)));

            let write = Operation::Write {
                fh: o.fh,
                offset: 3,
                data: b"x".to_vec(),
                flags: 0,
            };
            assert_eq!(
                kernel.call(e.ino, write).await,
                Some(Ok(Response::Write { size: 1 }))
            );
            let read = Operation::Read {
                fh: o.fh,
                offset: 0,
                size: 8,
            };
            assert_eq!(
                kernel.call(e.ino, read).await,
                Some(Ok(Response::Data(vec![0, 0, 0, b'x'])))
            );

            assert_eq!(kernel.call(e.ino, release(o.fh)).await, Some(Ok(Response::Empty)));
            assert_eq!(files(&kernel).await, 2);

            let forget = Operation::Forget { nlookup: 1 };
            assert_eq!(kernel.call(e.ino, forget).await, Some(Ok(Response::None)));
            assert_eq!(files(&kernel).await, 1);
        });
    }

    #[test]
    fn xattrs() {
        task::block_on(async {
            let (kernel, _server) = mount().await;
            let set = |flags| Operation::SetXAttr {
                name: "user.k".into(),
                value: b"value".to_vec(),
                flags,
            };
            assert_eq!(kernel.call(ROOT, set(libc::XATTR_REPLACE)).await, Some(Err(Errno::ENODATA)));
            assert_eq!(kernel.call(ROOT, set(libc::XATTR_CREATE)).await, Some(Ok(Response::Empty)));
            assert_eq!(kernel.call(ROOT, set(libc::XATTR_CREATE)).await, Some(Err(Errno::EEXIST)));

            let get = |size| Operation::GetXAttr {
                name: "user.k".into(),
                size,
            };
            assert_eq!(kernel.call(ROOT, get(0)).await, Some(Ok(Response::XAttrSize(5))));
            assert_eq!(kernel.call(ROOT, get(1)).await, Some(Err(Errno::ERANGE)));
            assert_eq!(
                kernel.call(ROOT, get(16)).await,
                Some(Ok(Response::Data(b"value".to_vec())))
            );

            let remove = || Operation::RemoveXAttr {
                name: "user.k".into(),
            };
            assert_eq!(kernel.call(ROOT, remove()).await, Some(Ok(Response::Empty)));
            assert_eq!(kernel.call(ROOT, remove()).await, Some(Err(Errno::ENODATA)));
        });
    }

    #[test]
    fn symlinks() {
        task::block_on(async {
            let (kernel, _server) = mount().await;
            let op = Operation::SymLink {
                name: "l".into(),
                link: PathBuf::from("target"),
            };
            let l = entry(&kernel, ROOT, op).await;
            assert_eq!(l.attr.kind, FileType::SymbolicLink);
            assert_eq!(l.attr.size, 6);
            assert_eq!(
                kernel.call(l.ino, Operation::ReadLink).await,
                Some(Ok(Response::Data(b"target".to_vec())))
            );
            assert_eq!(
                kernel.call(ROOT, Operation::ReadLink).await,
                Some(Err(Errno::EINVAL))
            );
        });
    }

    #[test]
    fn destroy_ends_the_session() {
        task::block_on(async {
            let (kernel, server) = mount().await;
            assert_eq!(kernel.call(0, Operation::Destroy).await, Some(Ok(Response::Empty)));
            server.await.unwrap();
        });
    }
}
