//! Example filesystems served by `fuse-dispatch`
//!
//! [`MemFs`] keeps a whole tree in memory and implements the inode-keyed
//! handler set. [`HelloFs`] is a read-only path-based filesystem meant to be
//! wrapped in a [`PathAdapter`](fuse_dispatch::PathAdapter).

#![deny(
    single_use_lifetimes,
    trivial_casts,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    clippy::all,
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

mod hello;
mod memfs;
mod node;

pub use self::hello::HelloFs;
pub use self::memfs::MemFs;

/// installs a subscriber filtered by `RUST_LOG`
#[cfg(test)]
fn setup_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
