//! A FUSE request dispatch core.
//!
//! [`Server`] reads requests from a [`RequestReader`], resolves inode numbers
//! and handles, and runs each request on its own task against a
//! [`FileSystem`]. Every request gets exactly one reply through the
//! [`ReplyWriter`]. Advisory locks are kept by the server itself.

#![deny(
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
    clippy::all
)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(
    missing_copy_implementations,
    missing_docs,
    clippy::missing_docs_in_private_items,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation
)]

#[macro_use]
mod macros;

mod errno;
mod error;

pub mod channel;
pub mod context;
pub mod fs;
pub mod handle;
pub mod inode;
pub mod lock;
pub mod ops;
pub mod path;
pub mod server;
pub mod types;

pub use self::channel::{PollHandle, ReplyWriter, RequestReader};
pub use self::context::Context;
pub use self::errno::Errno;
pub use self::error::Error;
pub use self::fs::FileSystem;
pub use self::ops::{Operation, Request, Response};
pub use self::path::{PathAdapter, PathFileSystem};
pub use self::server::{Server, ServerBuilder, ServerConfig};
