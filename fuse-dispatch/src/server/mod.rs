//! FUSE file system server

mod dispatch;
mod entry_lock;
mod pending;

#[cfg(test)]
mod tests;

use self::dispatch::Session;
use self::entry_lock::EntryLocks;
use self::pending::PendingTable;

use crate::channel::{ReplyWriter, RequestReader};
use crate::context::{Context, ProtocolVersion};
use crate::errno::Errno;
use crate::fs::FileSystem;
use crate::handle;
use crate::inode::InodeTable;
use crate::lock::LockRegistry;
use crate::ops::{InitConfig, InitOut, OpInit, Operation, Request, RequestHeader, Response};
use crate::types::FileKey;

use std::io;
use std::sync::Arc;

use async_lock::RwLock;
use async_std::task;
use tracing::{debug, error, warn};
use tracing_futures::Instrument;

/// major version of the supported protocol
pub const FUSE_KERNEL_VERSION: u32 = 7;

/// minor version of the supported protocol
pub const FUSE_KERNEL_MINOR_VERSION: u32 = 31;

/// default max background
const MAX_BACKGROUND: u16 = 10;

/// default congestion threshold
const CONGESTION_THRESHOLD: u16 = 10;

/// default max write size
const MAX_WRITE_SIZE: u32 = 128 * 1024;

/// Server configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    /// upper bound of the readahead proposed by the kernel
    pub max_readahead: u32,
    pub max_write: u32,
    pub max_background: u16,
    pub congestion_threshold: u16,
    /// timestamp granularity in nanoseconds
    pub time_gran: u32,
    /// backing identity of the root directory
    pub root_key: FileKey,
}

impl Default for ServerConfig {
    #[inline]
    fn default() -> Self {
        Self {
            max_readahead: u32::MAX,
            max_write: MAX_WRITE_SIZE,
            max_background: MAX_BACKGROUND,
            congestion_threshold: CONGESTION_THRESHOLD,
            time_gran: 1,
            root_key: FileKey(1),
        }
    }
}

impl ServerConfig {
    setters!(
        max_readahead: u32,
        max_write: u32,
        max_background: u16,
        congestion_threshold: u16,
        time_gran: u32,
        root_key: FileKey,
    );
}

/// The builder of [`Server`]
#[derive(Debug)]
pub struct ServerBuilder<F> {
    /// file system
    fs: F,
    /// configuration
    config: ServerConfig,
}

impl<F> ServerBuilder<F>
where
    F: FileSystem + 'static,
{
    /// Starts to build a [`Server`]
    #[inline]
    pub fn new(fs: F) -> Self {
        Self {
            fs,
            config: ServerConfig::default(),
        }
    }

    /// Replaces the configuration
    #[inline]
    #[must_use]
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Waits for `FUSE_INIT`, negotiates the connection and returns a [`Server`]
    ///
    /// Requests arriving before init are answered with `EIO`.
    /// # Errors
    /// Returns [`io::Error`] if the channel fails or closes, or if the
    /// kernel speaks an unsupported protocol
    pub async fn initialize<R, W>(self, mut reader: R, writer: W) -> io::Result<Server<F, R>>
    where
        R: RequestReader,
        W: ReplyWriter + 'static,
    {
        let writer: Arc<dyn ReplyWriter> = Arc::new(writer);
        debug!("initializing");

        let proto = loop {
            let req = match reader.read().await {
                Ok(Some(req)) => req,
                Ok(None) => return Err(io::Error::from_raw_os_error(libc::ENODEV)),
                Err(err) if is_transient(&err) => continue,
                Err(err) => return Err(err),
            };
            let Request { header, op } = req;
            let unique = header.unique;
            let op = match op {
                Operation::Init(op) => op,
                op => {
                    warn!(unique, opcode = op.name(), "request before init");
                    writer.reply(unique, Err(Errno::EIO)).await?;
                    continue;
                }
            };
            match self.negotiate(header, op).await {
                Ok((proto, out)) => {
                    debug!(?op, ?out, "got init");
                    writer.reply(unique, Ok(Response::Init(out))).await?;
                    break proto;
                }
                Err(errno) if op.major > FUSE_KERNEL_VERSION => {
                    // the kernel retries with our major version
                    debug!(major = op.major, ?errno, "proposing an older protocol");
                    let out = InitOut {
                        major: FUSE_KERNEL_VERSION,
                        minor: FUSE_KERNEL_MINOR_VERSION,
                        config: InitConfig::default(),
                    };
                    writer.reply(unique, Ok(Response::Init(out))).await?;
                }
                Err(errno) => {
                    error!(major = op.major, minor = op.minor, %errno, "init failed");
                    writer.reply(unique, Err(errno)).await?;
                    return Err(errno.into());
                }
            }
        };

        debug!(?proto, "initialized");

        let inodes = Arc::new(InodeTable::new(self.config.root_key));
        let (files, dirs) = handle::tables(&inodes);
        let session = Session {
            fs: self.fs,
            proto,
            max_write: self.config.max_write,
            inodes,
            files,
            dirs,
            locks: Arc::new(LockRegistry::new()),
            entries: EntryLocks::new(),
            pending: PendingTable::new(),
            writer,
        };
        Ok(Server {
            reader,
            session: Arc::new(session),
            in_flight: Arc::new(RwLock::new(())),
        })
    }

    /// checks the kernel version and runs the handler's init
    async fn negotiate(
        &self,
        header: RequestHeader,
        op: OpInit,
    ) -> Result<(ProtocolVersion, InitOut), Errno> {
        if op.major != FUSE_KERNEL_VERSION {
            return Err(Errno::EPROTO);
        }
        let proto = ProtocolVersion {
            major: FUSE_KERNEL_VERSION,
            minor: op.minor.min(FUSE_KERNEL_MINOR_VERSION),
        };

        let mut config = InitConfig::default();
        let _ = config
            .max_readahead(op.max_readahead.min(self.config.max_readahead))
            .flags(0)
            .max_background(self.config.max_background)
            .congestion_threshold(self.config.congestion_threshold)
            .max_write(self.config.max_write)
            .time_gran(self.config.time_gran);

        let (cx, _interrupter) = Context::new(header, proto);
        self.fs.init(&cx, &mut config).await?;

        let out = InitOut {
            major: proto.major,
            minor: proto.minor,
            config,
        };
        Ok((proto, out))
    }
}

/// FUSE file system server
#[derive(Debug)]
pub struct Server<F, R> {
    /// request reader
    reader: R,
    /// state shared by request tasks
    session: Arc<Session<F>>,
    /// held shared by every request task, exclusively on shutdown
    in_flight: Arc<RwLock<()>>,
}

/// returns true if a read error is worth a retry
fn is_transient(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EINTR | libc::EAGAIN))
}

impl<F, R> Server<F, R>
where
    F: FileSystem + 'static,
    R: RequestReader,
{
    /// Returns the inode table
    #[must_use]
    #[inline]
    pub fn inode_table(&self) -> Arc<InodeTable> {
        Arc::clone(&self.session.inodes)
    }

    /// Returns the lock registry
    #[must_use]
    #[inline]
    pub fn lock_registry(&self) -> Arc<LockRegistry> {
        Arc::clone(&self.session.locks)
    }

    /// Serves requests until `FUSE_DESTROY` or until the channel closes
    /// # Errors
    /// Returns [`io::Error`] if reading the channel fails
    pub async fn run(mut self) -> io::Result<()> {
        let destroy = loop {
            debug!("waiting for fuse request");

            let req = match self.reader.read().await {
                Ok(Some(req)) => req,
                Ok(None) => break None,
                Err(err) if is_transient(&err) => continue,
                Err(err) if err.raw_os_error() == Some(libc::ENODEV) => break None,
                Err(err) => {
                    error!(%err, "failed to read fuse request");
                    self.shutdown().await;
                    return Err(err);
                }
            };

            let unique = req.header.unique;
            match req.op {
                Operation::Destroy => break Some(unique),
                Operation::Interrupt { unique: target } => {
                    self.session.pending.interrupt(target);
                    self.session.send(unique, Ok(Response::None)).await;
                }
                Operation::Init(_) => {
                    error!(unique, "init after the session started");
                    self.session.send(unique, Err(Errno::EIO)).await;
                }
                _ => self.spawn(req).await,
            }
        };

        self.shutdown().await;
        if let Some(unique) = destroy {
            self.session.send(unique, Ok(Response::Empty)).await;
        }
        debug!("shutdown");
        Ok(())
    }

    /// runs a request on its own task
    async fn spawn(&self, req: Request) {
        let Request { header, op } = req;
        let unique = header.unique;

        let cx = match self.session.pending.register(header, self.session.proto) {
            Ok(cx) => cx,
            Err(err) => {
                error!(%err, "request dropped");
                self.session.send(unique, Err(err.errno())).await;
                return;
            }
        };

        let permit = self.in_flight.read_arc().await;
        let session = Arc::clone(&self.session);
        let span = tracing::debug_span!("request", unique, opcode = op.name());

        debug!(unique, opcode = op.name(), nodeid = header.nodeid, "got request");

        let _ = task::spawn(
            async move {
                let ret = session.dispatch(&cx, op).await;
                session.finish(unique, ret).await;
                drop(permit);
            }
            .instrument(span),
        ); // task is detached here
    }

    /// waits for every request task, then ends the session once
    async fn shutdown(&self) {
        debug!(in_flight = self.session.pending.len(), "draining");
        self.session.pending.interrupt_all();
        let _all = self.in_flight.write().await;
        self.session.fs.destroy().await;
    }
}
