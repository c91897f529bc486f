//! Error numbers sent back to the kernel

use std::fmt;
use std::io;

/// A raw OS error number carried by an error reply
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(i32);

impl Errno {
    /// Wraps a raw error number
    #[must_use]
    #[inline]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// Returns the raw error number
    #[must_use]
    #[inline]
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

macro_rules! define_errno {
    ($($name:ident,)+) => {
        impl Errno {
            $(
                #[allow(missing_docs)]
                pub const $name: Self = Self(libc::$name);
            )+
        }

        /// the name of a known error number
        const fn errno_name(raw: i32) -> Option<&'static str> {
            match raw {
                $(libc::$name => Some(stringify!($name)),)+
                _ => None,
            }
        }
    };
}

define_errno!(
    ENOENT, EEXIST, ENOTDIR, EISDIR, ENOTEMPTY, EACCES, EPERM, EBADF, ESTALE, EAGAIN, EINTR,
    ENOSPC, ENOSYS, EIO, EINVAL, ERANGE, EPROTO, ENODATA, ENAMETOOLONG, EXDEV, EROFS,
);

impl Errno {
    /// no-such-entry
    pub const NO_ENTRY: Self = Self::ENOENT;
    /// invalid-handle
    pub const INVALID_HANDLE: Self = Self::EBADF;
    /// lock-conflict
    pub const LOCK_CONFLICT: Self = Self::EAGAIN;
    /// interrupted
    pub const INTERRUPTED: Self = Self::EINTR;
    /// not-supported
    pub const NOT_SUPPORTED: Self = Self::ENOSYS;
    /// internal-fault
    pub const INTERNAL_FAULT: Self = Self::EIO;
}

impl fmt::Debug for Errno {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match errno_name(self.0) {
            Some(name) => write!(f, "Errno({})", name),
            None => write!(f, "Errno({})", self.0),
        }
    }
}

impl fmt::Display for Errno {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let err = io::Error::from_raw_os_error(self.0);
        write!(f, "{}", err)
    }
}

impl std::error::Error for Errno {}

impl From<io::Error> for Errno {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(raw) => Self(raw),
            None => match err.kind() {
                io::ErrorKind::NotFound => Self::ENOENT,
                io::ErrorKind::PermissionDenied => Self::EACCES,
                io::ErrorKind::AlreadyExists => Self::EEXIST,
                io::ErrorKind::InvalidInput => Self::EINVAL,
                io::ErrorKind::Interrupted => Self::EINTR,
                io::ErrorKind::WouldBlock => Self::EAGAIN,
                _ => Self::EIO,
            },
        }
    }
}

impl From<Errno> for io::Error {
    #[inline]
    fn from(errno: Errno) -> Self {
        Self::from_raw_os_error(errno.0)
    }
}
