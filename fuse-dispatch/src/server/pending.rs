//! In-flight requests

use crate::context::{Context, Interrupter, ProtocolVersion};
use crate::error::Error;
use crate::ops::RequestHeader;

use std::collections::hash_map::{Entry, HashMap};
use parking_lot::Mutex;
use tracing::{debug, trace};

/// completion state of an in-flight request
#[derive(Debug)]
enum State {
    /// the handler is running
    Pending(Interrupter),
    /// an interrupt has been delivered
    Interrupted,
}

/// How a request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// no interrupt arrived
    Normal,
    /// an interrupt arrived before the reply
    Interrupted,
}

/// Requests which have been received but not replied
#[derive(Debug, Default)]
pub struct PendingTable {
    /// request id -> state
    requests: Mutex<HashMap<u64, State>>,
}

impl PendingTable {
    /// Creates an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a new request and builds its context
    /// # Errors
    /// Returns [`Error::DuplicateRequest`] if the id is in flight
    pub fn register(&self, header: RequestHeader, proto: ProtocolVersion) -> Result<Context, Error> {
        let unique = header.unique;
        match self.requests.lock().entry(unique) {
            Entry::Occupied(_) => Err(Error::DuplicateRequest(unique)),
            Entry::Vacant(e) => {
                let (cx, interrupter) = Context::new(header, proto);
                let _ = e.insert(State::Pending(interrupter));
                Ok(cx)
            }
        }
    }

    /// Delivers an interrupt. Unknown, completed or already interrupted
    /// requests are left alone.
    pub fn interrupt(&self, unique: u64) {
        let mut requests = self.requests.lock();
        let state = match requests.get_mut(&unique) {
            Some(s) => s,
            None => {
                debug!(unique, "interrupt for a request not in flight");
                return;
            }
        };
        if let State::Pending(interrupter) = std::mem::replace(state, State::Interrupted) {
            let listening = interrupter.fire();
            debug!(unique, listening, "interrupt delivered");
        }
    }

    /// Interrupts every request in flight
    pub fn interrupt_all(&self) {
        let mut requests = self.requests.lock();
        for (&unique, state) in requests.iter_mut() {
            if let State::Pending(interrupter) = std::mem::replace(state, State::Interrupted) {
                let _ = interrupter.fire();
                trace!(unique, "interrupted on shutdown");
            }
        }
    }

    /// Marks a request replied and drops its record
    /// # Errors
    /// Returns [`Error::AlreadyReplied`] if the request has no record
    pub fn complete(&self, unique: u64) -> Result<Completion, Error> {
        match self.requests.lock().remove(&unique) {
            Some(State::Pending(_)) => Ok(Completion::Normal),
            Some(State::Interrupted) => {
                trace!(unique, "interrupted request completed");
                Ok(Completion::Interrupted)
            }
            None => Err(Error::AlreadyReplied(unique)),
        }
    }

    /// Returns the number of requests in flight
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }
}
