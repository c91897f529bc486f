//! A read-only filesystem with a single file

use std::path::Path;
use std::time::{Duration, SystemTime};

use fuse_dispatch::path::PathDirEntry;
use fuse_dispatch::types::file::{AccessMode, FileType};
use fuse_dispatch::types::{Attr, AttrOut, Opened, StatFs};
use fuse_dispatch::{Context, Errno, PathFileSystem};

use once_cell::sync::Lazy;
use tracing::debug;

/// the contents of `/hello`
const HELLO: &[u8] = b"Hello World!\n";

/// attribute timeout
const TTL: Duration = Duration::from_secs(1);

/// every timestamp of the filesystem
static MOUNTED_AT: Lazy<SystemTime> = Lazy::new(SystemTime::now);

/// Serves `/` and `/hello`
#[derive(Debug, Default, Clone, Copy)]
pub struct HelloFs;

/// which of the two files a path names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Root,
    Hello,
}

impl Node {
    /// resolves a path
    fn find(path: &Path) -> Result<Self, Errno> {
        if path == Path::new("/") {
            Ok(Self::Root)
        } else if path == Path::new("/hello") {
            Ok(Self::Hello)
        } else {
            Err(Errno::ENOENT)
        }
    }

    /// attributes
    fn attr(self) -> Attr {
        let mut attr = Attr::default();
        let _ = attr
            .atime(*MOUNTED_AT)
            .mtime(*MOUNTED_AT)
            .ctime(*MOUNTED_AT);
        match self {
            Self::Root => {
                let _ = attr.kind(FileType::Directory).perm(0o755).nlink(2);
            }
            Self::Hello => {
                let _ = attr
                    .kind(FileType::Regular)
                    .perm(0o444)
                    .size(HELLO.len() as u64)
                    .blocks(1);
            }
        }
        attr
    }
}

#[async_trait::async_trait]
impl PathFileSystem for HelloFs {
    async fn getattr(&self, _: &Context, path: &Path, _: Option<u64>) -> Result<AttrOut, Errno> {
        let attr = Node::find(path)?.attr();
        Ok(AttrOut { attr, ttl: TTL })
    }

    async fn open(&self, _: &Context, path: &Path, flags: i32) -> Result<Opened, Errno> {
        match Node::find(path)? {
            Node::Root => Err(Errno::EISDIR),
            Node::Hello if AccessMode::from_flags(flags) == Some(AccessMode::ReadOnly) => {
                Ok(Opened::new(0))
            }
            Node::Hello => Err(Errno::EACCES),
        }
    }

    async fn read(
        &self,
        _: &Context,
        path: &Path,
        _: u64,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, Errno> {
        if Node::find(path)? != Node::Hello {
            return Err(Errno::EISDIR);
        }
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(HELLO.len());
        let end = start.saturating_add(size as usize).min(HELLO.len());
        debug!(offset, size, "hello read");
        Ok(HELLO[start..end].to_vec())
    }

    async fn opendir(&self, _: &Context, path: &Path, _: i32) -> Result<Opened, Errno> {
        match Node::find(path)? {
            Node::Root => Ok(Opened::new(0)),
            Node::Hello => Err(Errno::ENOTDIR),
        }
    }

    async fn readdir(
        &self,
        _: &Context,
        path: &Path,
        _: u64,
        offset: u64,
    ) -> Result<Vec<PathDirEntry>, Errno> {
        if Node::find(path)? != Node::Root {
            return Err(Errno::ENOTDIR);
        }
        let entries = [
            (".", FileType::Directory),
            ("..", FileType::Directory),
            ("hello", FileType::Regular),
        ];
        Ok(entries
            .iter()
            .zip(1_u64..)
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .map(|(&(name, kind), next)| PathDirEntry {
                name: name.into(),
                kind,
                offset: next,
            })
            .collect())
    }

    async fn statfs(&self, _: &Context, _: &Path) -> Result<StatFs, Errno> {
        Ok(StatFs {
            blocks: 1,
            files: 2,
            bsize: 512,
            namelen: 255,
            frsize: 512,
            ..StatFs::default()
        })
    }
}
