//! File types and access modes

/// The access mode of an open call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    /// Extracts the access mode from open flags
    #[must_use]
    #[inline]
    pub const fn from_flags(flags: i32) -> Option<Self> {
        match flags & libc::O_ACCMODE {
            libc::O_RDONLY => Some(Self::ReadOnly),
            libc::O_WRONLY => Some(Self::WriteOnly),
            libc::O_RDWR => Some(Self::ReadWrite),
            _ => None,
        }
    }

    /// Returns true if the mode allows reading
    #[must_use]
    #[inline]
    pub const fn readable(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    /// Returns true if the mode allows writing
    #[must_use]
    #[inline]
    pub const fn writable(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

/// The type of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    NamedPipe,
    CharacterDevice,
    Directory,
    BlockDevice,
    Regular,
    SymbolicLink,
    Socket,
}

impl FileType {
    /// Extracts the file type from `st_mode`
    #[must_use]
    #[inline]
    #[allow(clippy::unnecessary_cast)]
    pub fn from_mode(mode: u32) -> Option<Self> {
        let ty = match mode & (libc::S_IFMT as u32) {
            m if m == libc::S_IFIFO as u32 => Self::NamedPipe,
            m if m == libc::S_IFCHR as u32 => Self::CharacterDevice,
            m if m == libc::S_IFDIR as u32 => Self::Directory,
            m if m == libc::S_IFBLK as u32 => Self::BlockDevice,
            m if m == libc::S_IFREG as u32 => Self::Regular,
            m if m == libc::S_IFLNK as u32 => Self::SymbolicLink,
            m if m == libc::S_IFSOCK as u32 => Self::Socket,
            _ => return None,
        };
        Some(ty)
    }

    /// Returns the file type bits of `st_mode`
    #[must_use]
    #[inline]
    #[allow(clippy::unnecessary_cast)]
    pub const fn as_mode(self) -> u32 {
        (match self {
            Self::NamedPipe => libc::S_IFIFO,
            Self::CharacterDevice => libc::S_IFCHR,
            Self::Directory => libc::S_IFDIR,
            Self::BlockDevice => libc::S_IFBLK,
            Self::Regular => libc::S_IFREG,
            Self::SymbolicLink => libc::S_IFLNK,
            Self::Socket => libc::S_IFSOCK,
        }) as u32
    }

    /// Returns the `d_type` of a directory entry
    #[must_use]
    #[inline]
    pub const fn as_dirent_type(self) -> u8 {
        match self {
            Self::NamedPipe => libc::DT_FIFO,
            Self::CharacterDevice => libc::DT_CHR,
            Self::Directory => libc::DT_DIR,
            Self::BlockDevice => libc::DT_BLK,
            Self::Regular => libc::DT_REG,
            Self::SymbolicLink => libc::DT_LNK,
            Self::Socket => libc::DT_SOCK,
        }
    }
}
