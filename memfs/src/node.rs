//! File system node

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

use fuse_dispatch::types::file::FileType;
use fuse_dispatch::types::{Attr, FileKey};
use fuse_dispatch::Errno;

/// File node
#[derive(Debug)]
pub struct Node {
    /// attributes; `attr.ino` is unused, the server fills it in
    pub attr: Attr,

    /// contents
    pub data: NodeData,

    /// extended attributes
    pub xattrs: BTreeMap<OsString, Vec<u8>>,
}

/// Node data
#[derive(Debug)]
pub enum NodeData {
    /// Directory
    Directory {
        /// parent directory; the root is its own parent
        parent: FileKey,
        /// entries by name
        entries: BTreeMap<OsString, FileKey>,
    },
    /// Regular file
    Regular(Vec<u8>),
    /// Symbolic link
    SymLink(PathBuf),
    /// Device, fifo or socket
    Special,
}

impl Node {
    /// Creates a node with fresh timestamps
    pub fn new(kind: FileType, perm: u32, data: NodeData) -> Self {
        let mut attr = Attr::default();
        let now = std::time::SystemTime::now();
        let nlink = if kind == FileType::Directory { 2 } else { 1 };
        let _ = attr
            .kind(kind)
            .perm(perm & 0o7777)
            .nlink(nlink)
            .atime(now)
            .mtime(now)
            .ctime(now);
        Self {
            attr,
            data,
            xattrs: BTreeMap::new(),
        }
    }

    /// Returns the entries of a directory
    pub fn entries(&self) -> Result<&BTreeMap<OsString, FileKey>, Errno> {
        match self.data {
            NodeData::Directory { ref entries, .. } => Ok(entries),
            _ => Err(Errno::ENOTDIR),
        }
    }

    /// Returns the entries of a directory
    pub fn entries_mut(&mut self) -> Result<&mut BTreeMap<OsString, FileKey>, Errno> {
        match self.data {
            NodeData::Directory {
                ref mut entries, ..
            } => Ok(entries),
            _ => Err(Errno::ENOTDIR),
        }
    }

    /// Looks up a child
    pub fn child(&self, name: &OsStr) -> Result<FileKey, Errno> {
        self.entries()?.get(name).copied().ok_or(Errno::ENOENT)
    }

    /// Returns the contents of a regular file
    pub fn bytes_mut(&mut self) -> Result<&mut Vec<u8>, Errno> {
        match self.data {
            NodeData::Regular(ref mut bytes) => Ok(bytes),
            NodeData::Directory { .. } => Err(Errno::EISDIR),
            _ => Err(Errno::EINVAL),
        }
    }

    /// Keeps `size` and `blocks` in sync with the contents
    pub fn sync_size(&mut self) {
        let size = match self.data {
            NodeData::Regular(ref bytes) => bytes.len() as u64,
            NodeData::SymLink(ref path) => path.as_os_str().len() as u64,
            NodeData::Directory { ref entries, .. } => entries.len() as u64,
            NodeData::Special => 0,
        };
        self.attr.size = size;
        self.attr.blocks = (size + 511) / 512;
    }

    /// Marks a change of the contents
    pub fn touch(&mut self) {
        let now = std::time::SystemTime::now();
        self.attr.mtime = now;
        self.attr.ctime = now;
        self.sync_size();
    }
}
