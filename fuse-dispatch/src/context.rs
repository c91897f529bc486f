//! The context of a FUSE request

use crate::ops::RequestHeader;

use std::fmt::{self, Debug};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};

/// protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    /// major version number
    pub major: u32,
    /// minor version number
    pub minor: u32,
}

/// The context of a FUSE request
#[derive(Clone)]
pub struct Context {
    /// request header
    header: RequestHeader,
    /// negotiated protocol version
    proto: ProtocolVersion,
    /// resolves when the kernel interrupts the request
    interrupt: Shared<oneshot::Receiver<()>>,
    /// set once the handler asks for interrupt notifications
    registered: Arc<AtomicBool>,
    /// set once an interrupt has been delivered
    delivered: Arc<AtomicBool>,
}

impl Debug for Context {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("header", &self.header)
            .field("proto", &self.proto)
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

impl Context {
    /// Creates a [`Context`] together with the [`Interrupter`] which interrupts it
    pub(crate) fn new(header: RequestHeader, proto: ProtocolVersion) -> (Self, Interrupter) {
        let (tx, rx) = oneshot::channel();
        let registered = Arc::new(AtomicBool::new(false));
        let delivered = Arc::new(AtomicBool::new(false));
        let cx = Self {
            header,
            proto,
            interrupt: rx.shared(),
            registered: Arc::clone(&registered),
            delivered: Arc::clone(&delivered),
        };
        let interrupter = Interrupter {
            tx,
            registered,
            delivered,
        };
        (cx, interrupter)
    }

    /// Returns the request header
    #[must_use]
    #[inline]
    pub const fn header(&self) -> &RequestHeader {
        &self.header
    }

    /// Returns the request id
    #[must_use]
    #[inline]
    pub const fn unique(&self) -> u64 {
        self.header.unique
    }

    /// Returns the uid of the calling process
    #[must_use]
    #[inline]
    pub const fn uid(&self) -> u32 {
        self.header.uid
    }

    /// Returns the gid of the calling process
    #[must_use]
    #[inline]
    pub const fn gid(&self) -> u32 {
        self.header.gid
    }

    /// Returns the pid of the calling process
    #[must_use]
    #[inline]
    pub const fn pid(&self) -> u32 {
        self.header.pid
    }

    /// Returns the negotiated protocol version
    #[must_use]
    #[inline]
    pub const fn proto(&self) -> ProtocolVersion {
        self.proto
    }

    /// Returns a future which resolves when the request is interrupted.
    ///
    /// Calling this registers interest in interrupts. A handler that waits
    /// on something slow should race its work against this future and
    /// answer `EINTR` when it wins.
    #[must_use]
    #[inline]
    pub fn interrupted(&self) -> Interrupted {
        self.registered.store(true, Ordering::Release);
        Interrupted {
            inner: self.interrupt.clone(),
        }
    }

    /// Returns true if an interrupt has been delivered
    #[must_use]
    #[inline]
    pub fn is_interrupted(&self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }
}

/// The server side of a request's interrupt signal
#[derive(Debug)]
pub(crate) struct Interrupter {
    /// wakes [`Interrupted`] futures
    tx: oneshot::Sender<()>,
    /// whether the handler listens for interrupts
    registered: Arc<AtomicBool>,
    /// read by [`Context::is_interrupted`]
    delivered: Arc<AtomicBool>,
}

impl Interrupter {
    /// Delivers the interrupt. Returns whether the handler was listening.
    pub(crate) fn fire(self) -> bool {
        self.delivered.store(true, Ordering::Release);
        let _ = self.tx.send(());
        self.registered.load(Ordering::Acquire)
    }

    /// Returns whether the handler listens for interrupts
    #[cfg(test)]
    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }
}

/// A future which resolves when a request is interrupted
///
/// It never resolves if the request completes without an interrupt.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Interrupted {
    /// interrupt signal
    inner: Shared<oneshot::Receiver<()>>,
}

impl Future for Interrupted {
    type Output = ();

    #[inline]
    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match self.inner.poll_unpin(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(()),
            // the sender is gone: the request finished or the session ended
            Poll::Ready(Err(oneshot::Canceled)) | Poll::Pending => Poll::Pending,
        }
    }
}
