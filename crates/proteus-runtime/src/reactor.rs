//! Reactor for native asynchronous work.
//!
//! Modules submit futures; each runs on an owned tokio runtime and its
//! outcome is queued on a completion channel that only the background
//! thread reads. Every submitted request holds a [`WatcherGuard`] until it
//! leaves its module's tracker, so the active count drops exactly once per
//! request on completion, cancellation and error paths alike.

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::error::{ResourceError, RuntimeError, RuntimeResult};
use crate::instance::InstanceId;
use crate::module::ModuleId;

/// Identifier of one asynchronous request. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RequestId(u64);

impl RequestId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Validated address of a request: owning instance, module, and request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestKey {
    pub instance: InstanceId,
    pub module: ModuleId,
    pub request: RequestId,
}

pub(crate) type CompletionValue = Box<dyn Any + Send>;

/// Outcome of native work, on its way to the main thread.
pub(crate) struct Completion {
    pub key: RequestKey,
    pub outcome: Result<CompletionValue, ResourceError>,
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("key", &self.key)
            .field("ok", &self.outcome.is_ok())
            .finish()
    }
}

const REQ_PENDING: u8 = 0;
const REQ_COMPLETED: u8 = 1;
const REQ_CANCELLED: u8 = 2;

/// Result of cancelling a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The work was stopped before it produced a completion.
    Cancelled,
    /// A completion was already produced and is still queued.
    AlreadyCompleted,
}

/// Counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReactorStats {
    /// Requests submitted and not yet completed or cancelled.
    pub active: usize,
    /// Keep-alive references held by content.
    pub keep_alive: usize,
    pub submitted: u64,
    pub completed: u64,
    pub cancelled: u64,
}

struct ReactorShared {
    handle: tokio::runtime::Handle,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
    completions_tx: Sender<Completion>,
    completions_rx: Receiver<Completion>,
    active: AtomicUsize,
    keep_alive: AtomicUsize,
    next_request: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicU64,
    shutdown: AtomicBool,
}

/// Shared handle to the reactor. Cloning is cheap.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<ReactorShared>,
}

impl Reactor {
    /// Start the reactor with `threads` I/O workers.
    pub fn new(threads: usize) -> RuntimeResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("proteus-io")
            .enable_all()
            .build()?;
        let (completions_tx, completions_rx) = crossbeam_channel::unbounded();
        debug!(threads, "reactor started");
        Ok(Self {
            shared: Arc::new(ReactorShared {
                handle: runtime.handle().clone(),
                runtime: Mutex::new(Some(runtime)),
                completions_tx,
                completions_rx,
                active: AtomicUsize::new(0),
                keep_alive: AtomicUsize::new(0),
                next_request: AtomicU64::new(1),
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                cancelled: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// Run `work` on the reactor. The returned handle keeps the request
    /// counted as active until it is dropped.
    pub(crate) fn submit<T, F>(
        &self,
        instance: InstanceId,
        module: ModuleId,
        local: &Rc<Cell<usize>>,
        work: F,
    ) -> RuntimeResult<RequestHandle>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, ResourceError>> + Send + 'static,
    {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(RuntimeError::ReactorUnavailable);
        }
        let request = RequestId(self.shared.next_request.fetch_add(1, Ordering::Relaxed));
        let key = RequestKey {
            instance,
            module,
            request,
        };

        // Count before spawning so the background thread never sees a
        // completion with no active watcher behind it.
        let watcher = WatcherGuard::acquire(self.shared.clone(), local.clone());
        let state = Arc::new(AtomicU8::new(REQ_PENDING));

        let task_state = state.clone();
        let shared = self.shared.clone();
        let task = self.shared.handle.spawn(async move {
            let outcome = work.await.map(|value| Box::new(value) as CompletionValue);
            if task_state
                .compare_exchange(REQ_PENDING, REQ_COMPLETED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                shared.completed.fetch_add(1, Ordering::Relaxed);
                let _ = shared.completions_tx.send(Completion { key, outcome });
            }
        });

        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        trace!(instance = %instance, module = %module, request = %request, "request submitted");
        Ok(RequestHandle {
            key,
            abort: task.abort_handle(),
            state,
            watcher,
        })
    }

    /// Completion queue, read only by the background thread.
    pub(crate) fn completions(&self) -> &Receiver<Completion> {
        &self.shared.completions_rx
    }

    /// Anything in flight or any keep-alive reference held.
    pub fn has_active_watchers(&self) -> bool {
        self.active_count() > 0
    }

    pub fn active_count(&self) -> usize {
        self.shared.active.load(Ordering::Acquire) + self.shared.keep_alive.load(Ordering::Acquire)
    }

    /// Take a keep-alive reference.
    pub fn ref_loop(&self) {
        self.shared.keep_alive.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a keep-alive reference. Extra calls are ignored.
    pub fn unref_loop(&self) {
        let released = self
            .shared
            .keep_alive
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if !released {
            warn!("unref without a matching ref");
        }
    }

    pub fn stats(&self) -> ReactorStats {
        ReactorStats {
            active: self.shared.active.load(Ordering::Acquire),
            keep_alive: self.shared.keep_alive.load(Ordering::Acquire),
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            completed: self.shared.completed.load(Ordering::Relaxed),
            cancelled: self.shared.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work and tear down the I/O runtime.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(runtime) = self.shared.runtime.lock().take() {
            runtime.shutdown_background();
        }
        debug!("reactor shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

/// Counts one in-flight request, process-wide and per instance.
pub(crate) struct WatcherGuard {
    shared: Arc<ReactorShared>,
    local: Rc<Cell<usize>>,
}

impl WatcherGuard {
    fn acquire(shared: Arc<ReactorShared>, local: Rc<Cell<usize>>) -> Self {
        shared.active.fetch_add(1, Ordering::AcqRel);
        local.set(local.get() + 1);
        Self { shared, local }
    }
}

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        self.shared.active.fetch_sub(1, Ordering::AcqRel);
        self.local.set(self.local.get().saturating_sub(1));
    }
}

/// Main-thread handle to a submitted request.
pub(crate) struct RequestHandle {
    key: RequestKey,
    abort: AbortHandle,
    state: Arc<AtomicU8>,
    watcher: WatcherGuard,
}

impl RequestHandle {
    pub fn key(&self) -> RequestKey {
        self.key
    }

    /// Stop the work if it has not produced a completion yet.
    pub fn cancel(&self) -> CancelOutcome {
        match self.state.compare_exchange(
            REQ_PENDING,
            REQ_CANCELLED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.abort.abort();
                self.watcher.shared.cancelled.fetch_add(1, Ordering::Relaxed);
                CancelOutcome::Cancelled
            }
            Err(_) => CancelOutcome::AlreadyCompleted,
        }
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle").field("key", &self.key).finish()
    }
}
