//! Per-module tracking of in-flight requests.
//!
//! A request leaves the tracker exactly once: through [`PendingRequestTracker::claim`]
//! when its completion is dispatched, or through [`PendingRequestTracker::release`]
//! when its module is released. A request whose completion was already queued
//! when it got cancelled leaves a tombstone so the late completion is
//! discarded instead of dispatched.

use std::collections::HashSet;
use std::fmt;

use tracing::trace;

use crate::error::{ResourceError, protocol_violation};
use crate::instance::RuntimeInstance;
use crate::reactor::{CancelOutcome, CompletionValue, RequestHandle, RequestId};
use crate::script::ScriptException;

pub(crate) type CompletionCallback = Box<
    dyn FnOnce(&mut RuntimeInstance, Result<CompletionValue, ResourceError>) -> Result<(), ScriptException>,
>;

/// An in-flight asynchronous operation issued by a module.
pub struct PendingRequest {
    handle: RequestHandle,
    label: &'static str,
    callback: CompletionCallback,
}

impl PendingRequest {
    pub(crate) fn new(handle: RequestHandle, label: &'static str, callback: CompletionCallback) -> Self {
        Self {
            handle,
            label,
            callback,
        }
    }

    pub fn id(&self) -> RequestId {
        self.handle.key().request
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Run the completion callback. The request stops counting as active
    /// once the callback returns.
    pub(crate) fn complete(
        self,
        instance: &mut RuntimeInstance,
        outcome: Result<CompletionValue, ResourceError>,
    ) -> Result<(), ScriptException> {
        let Self {
            handle, callback, ..
        } = self;
        let result = callback(instance, outcome);
        drop(handle);
        result
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id())
            .field("label", &self.label)
            .finish()
    }
}

/// What a completion found when it looked for its request.
#[derive(Debug)]
pub enum Claim {
    /// Still tracked; dispatch it.
    Tracked(PendingRequest),
    /// Cancelled after its completion was queued; discard.
    Cancelled,
    /// Never tracked here.
    Unknown,
}

#[derive(Debug, Default)]
pub struct PendingRequestTracker {
    requests: Vec<PendingRequest>,
    tombstones: HashSet<RequestId>,
}

impl PendingRequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, request: PendingRequest) {
        if self.contains(request.id()) {
            protocol_violation(format_args!("request {} tracked twice", request.id()));
            return;
        }
        self.requests.push(request);
    }

    /// Remove a tracked request. Removing an untracked request is a
    /// protocol violation.
    pub fn remove(&mut self, id: RequestId) -> Option<PendingRequest> {
        match self.requests.iter().position(|r| r.id() == id) {
            Some(index) => Some(self.requests.remove(index)),
            None => {
                protocol_violation(format_args!("remove of untracked request {id}"));
                None
            }
        }
    }

    /// Look up the request a completion belongs to.
    pub fn claim(&mut self, id: RequestId) -> Claim {
        if self.contains(id) {
            match self.remove(id) {
                Some(request) => Claim::Tracked(request),
                None => Claim::Unknown,
            }
        } else if self.tombstones.remove(&id) {
            Claim::Cancelled
        } else {
            Claim::Unknown
        }
    }

    /// Cancel and drop every tracked request. Returns how many were
    /// cancelled; a drained tracker returns 0.
    pub fn release(&mut self) -> usize {
        let cancelled = self.requests.len();
        for request in self.requests.drain(..) {
            if request.handle.cancel() == CancelOutcome::AlreadyCompleted {
                self.tombstones.insert(request.id());
            }
            trace!(request = %request.id(), label = request.label, "request cancelled");
        }
        cancelled
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.requests.iter().any(|r| r.id() == id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = RequestId> + '_ {
        self.requests.iter().map(PendingRequest::id)
    }
}
