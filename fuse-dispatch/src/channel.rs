//! Request channel
//!
//! The transport between the kernel and the dispatcher. A real transport
//! decodes `/dev/fuse` messages; [`memory`] builds an in-process pair used to
//! drive a session directly.

use crate::errno::Errno;
use crate::ops::{Operation, Request, RequestHeader, Response};

use std::fmt::{self, Debug};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_std::channel::{self, Receiver, Sender};
use async_trait::async_trait;
use parking_lot::Mutex;

/// The reading half of a request channel
#[async_trait]
pub trait RequestReader: Send {
    /// Reads the next request. `Ok(None)` means the kernel closed the channel.
    async fn read(&mut self) -> io::Result<Option<Request>>;
}

/// The writing half of a request channel
#[async_trait]
pub trait ReplyWriter: Send + Sync {
    /// Sends the terminal reply of a request
    async fn reply(&self, unique: u64, reply: Result<Response, Errno>) -> io::Result<()>;

    /// Sends an unsolicited notification
    async fn notify(&self, notification: Notification) -> io::Result<()>;
}

/// A message sent to the kernel without a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Notification {
    /// wakes the waiters of a poll handle
    Poll {
        /// kernel poll handle
        kh: u64,
    },
}

/// A kernel poll handle
#[derive(Clone)]
pub struct PollHandle {
    /// kernel poll handle
    kh: u64,
    /// notification sink
    writer: Arc<dyn ReplyWriter>,
}

impl Debug for PollHandle {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollHandle").field("kh", &self.kh).finish()
    }
}

impl PollHandle {
    /// Wraps a kernel poll handle
    #[must_use]
    #[inline]
    pub fn new(kh: u64, writer: Arc<dyn ReplyWriter>) -> Self {
        Self { kh, writer }
    }

    /// Returns the kernel poll handle
    #[must_use]
    #[inline]
    pub const fn kh(&self) -> u64 {
        self.kh
    }

    /// Tells the kernel that the polled file is ready
    /// # Errors
    /// Returns [`io::Error`] if the channel is gone
    #[inline]
    pub async fn notify(&self) -> io::Result<()> {
        self.writer.notify(Notification::Poll { kh: self.kh }).await
    }
}

/// A message written by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// a terminal reply
    Reply {
        /// request id
        unique: u64,
        /// reply body
        reply: Result<Response, Errno>,
    },
    /// a notification
    Notify(Notification),
}

/// Creates an in-process request channel.
///
/// The reader and the writer go to the server; the [`MemKernel`] plays the
/// kernel side.
#[must_use]
pub fn memory() -> (MemReader, MemWriter, MemKernel) {
    let (req_tx, req_rx) = channel::unbounded();
    let (out_tx, out_rx) = channel::unbounded();
    let reader = MemReader { requests: req_rx };
    let writer = MemWriter { outgoing: out_tx };
    let kernel = MemKernel {
        requests: req_tx,
        outgoing: out_rx,
        seen: Mutex::new(Vec::new()),
        unique: AtomicU64::new(1),
    };
    (reader, writer, kernel)
}

/// The reading half of an in-process channel
#[derive(Debug)]
pub struct MemReader {
    /// requests and injected read errors
    requests: Receiver<io::Result<Request>>,
}

#[async_trait]
impl RequestReader for MemReader {
    async fn read(&mut self) -> io::Result<Option<Request>> {
        match self.requests.recv().await {
            Ok(Ok(req)) => Ok(Some(req)),
            Ok(Err(err)) => Err(err),
            Err(channel::RecvError) => Ok(None),
        }
    }
}

/// The writing half of an in-process channel
#[derive(Debug, Clone)]
pub struct MemWriter {
    /// outgoing messages
    outgoing: Sender<Outgoing>,
}

impl MemWriter {
    /// send
    async fn send(&self, msg: Outgoing) -> io::Result<()> {
        self.outgoing
            .send(msg)
            .await
            .map_err(|_| io::Error::from_raw_os_error(libc::ENODEV))
    }
}

#[async_trait]
impl ReplyWriter for MemWriter {
    async fn reply(&self, unique: u64, reply: Result<Response, Errno>) -> io::Result<()> {
        self.send(Outgoing::Reply { unique, reply }).await
    }

    async fn notify(&self, notification: Notification) -> io::Result<()> {
        self.send(Outgoing::Notify(notification)).await
    }
}

/// The kernel side of an in-process channel
#[derive(Debug)]
pub struct MemKernel {
    /// requests to the server
    requests: Sender<io::Result<Request>>,
    /// messages from the server
    outgoing: Receiver<Outgoing>,
    /// every message received so far
    seen: Mutex<Vec<Outgoing>>,
    /// request id allocator
    unique: AtomicU64,
}

impl MemKernel {
    /// Builds a request with a fresh id
    #[must_use]
    pub fn request(&self, nodeid: u64, op: Operation) -> Request {
        let header = RequestHeader {
            unique: self.unique.fetch_add(1, Ordering::Relaxed),
            nodeid,
            uid: 0,
            gid: 0,
            pid: 1,
        };
        Request { header, op }
    }

    /// Sends a request with a fresh id and returns the id
    pub fn submit(&self, nodeid: u64, op: Operation) -> u64 {
        let req = self.request(nodeid, op);
        let unique = req.header.unique;
        self.send(req);
        unique
    }

    /// Sends a request and waits for its reply
    pub async fn call(&self, nodeid: u64, op: Operation) -> Option<Result<Response, Errno>> {
        let unique = self.submit(nodeid, op);
        self.reply(unique).await
    }

    /// Sends a request to the server
    #[inline]
    pub fn send(&self, req: Request) {
        let _ = self.requests.try_send(Ok(req));
    }

    /// Makes the next read of the server fail with `err`
    #[inline]
    pub fn fail(&self, err: io::Error) {
        let _ = self.requests.try_send(Err(err));
    }

    /// Closes the request stream, as an unmount does
    #[inline]
    pub fn close(&self) {
        let _ = self.requests.close();
    }

    /// the first reply to `unique` among the received messages
    fn find(&self, unique: u64) -> Option<Result<Response, Errno>> {
        self.seen.lock().iter().find_map(|msg| match *msg {
            Outgoing::Reply { unique: u, ref reply } if u == unique => Some(reply.clone()),
            _ => None,
        })
    }

    /// Waits for the reply to `unique`.
    ///
    /// Returns `None` if the server dropped its writer first.
    pub async fn reply(&self, unique: u64) -> Option<Result<Response, Errno>> {
        loop {
            if let Some(reply) = self.find(unique) {
                return Some(reply);
            }
            let msg = self.outgoing.recv().await.ok()?;
            self.seen.lock().push(msg);
        }
    }

    /// moves every queued message into `seen`
    fn collect(&self) {
        while let Ok(msg) = self.outgoing.try_recv() {
            self.seen.lock().push(msg);
        }
    }

    /// Returns the number of replies received for `unique`
    #[must_use]
    pub fn reply_count(&self, unique: u64) -> usize {
        self.collect();
        self.seen
            .lock()
            .iter()
            .filter(|msg| matches!(**msg, Outgoing::Reply { unique: u, .. } if u == unique))
            .count()
    }

    /// Returns the notifications received so far
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.collect();
        self.seen
            .lock()
            .iter()
            .filter_map(|msg| match *msg {
                Outgoing::Notify(n) => Some(n),
                Outgoing::Reply { .. } => None,
            })
            .collect()
    }
}
