//! Bookkeeping errors raised by the dispatch core

use crate::errno::Errno;
use crate::types::Ino;

/// The error type of the inode, handle and lock tables
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An error reported by the filesystem handler, passed through verbatim
    #[error("filesystem error: {0}")]
    Fs(Errno),

    /// The inode is unknown or has been evicted
    #[error("stale inode: {0}")]
    StaleInode(Ino),

    /// The handle is unknown, already released, or of the wrong kind
    #[error("invalid handle: {0}")]
    InvalidHandle(u64),

    /// The request names an entry the kernel should never send
    #[error("invalid name")]
    InvalidName,

    /// The inode table has no free slot left
    #[error("inode table is full")]
    NoSpace,

    /// A conflicting lock is held
    #[error("lock conflict")]
    LockConflict,

    /// The request was interrupted before it could complete
    #[error("interrupted")]
    Interrupted,

    /// A forget tried to drop more references than were handed out
    #[error("over-forget on inode {ino}: count = {count}, lookups = {lookups}")]
    OverForget {
        /// the inode
        ino: Ino,
        /// forget count sent by the kernel
        count: u64,
        /// outstanding lookups before the forget
        lookups: u64,
    },

    /// An inode was unpinned more times than it was pinned
    #[error("unbalanced unpin on inode {0}")]
    UnbalancedUnpin(Ino),

    /// A request was completed twice
    #[error("request {0} replied twice")]
    AlreadyReplied(u64),

    /// A request id arrived while a request with the same id was in flight
    #[error("duplicate request {0}")]
    DuplicateRequest(u64),

    /// A message that breaks the protocol or the handler contract
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}

impl Error {
    /// Returns true if the error signals a broken invariant rather than a bad request
    #[must_use]
    #[inline]
    pub const fn is_internal(&self) -> bool {
        matches!(
            *self,
            Self::OverForget { .. }
                | Self::UnbalancedUnpin(_)
                | Self::AlreadyReplied(_)
                | Self::DuplicateRequest(_)
                | Self::Protocol(_)
        )
    }

    /// Converts the error to the number sent in the reply
    #[must_use]
    #[inline]
    pub const fn errno(&self) -> Errno {
        match *self {
            Self::Fs(errno) => errno,
            // the kernel may reference an inode whose forget raced with this request
            Self::StaleInode(_) => Errno::ENOENT,
            Self::InvalidHandle(_) => Errno::EBADF,
            Self::InvalidName => Errno::EINVAL,
            Self::NoSpace => Errno::ENOSPC,
            Self::LockConflict => Errno::EAGAIN,
            Self::Interrupted => Errno::EINTR,
            Self::OverForget { .. }
            | Self::UnbalancedUnpin(_)
            | Self::AlreadyReplied(_)
            | Self::DuplicateRequest(_)
            | Self::Protocol(_) => Errno::EIO,
        }
    }
}

impl From<Errno> for Error {
    #[inline]
    fn from(errno: Errno) -> Self {
        Self::Fs(errno)
    }
}
