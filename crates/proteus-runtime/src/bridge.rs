//! Background reactor thread and its hand-off to the main thread.
//!
//! The thread owns the [`WorkSignal`] lock for its lifetime and only looks
//! at reactor progress: it moves completions into the signal's queue, posts
//! `Pending`, and waits for the main thread to dispatch them. It never
//! touches instance or module state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info_span, trace};

use crate::error::{RuntimeError, RuntimeResult};
use crate::host::{HostWaker, NodeEvent};
use crate::reactor::{Completion, Reactor};
use crate::signal::{HandoffCode, Slot, WorkSignal};

pub(crate) type CompletionQueue = VecDeque<Completion>;

/// Settings the background thread runs with.
#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    pub idle_poll_interval: Duration,
    pub handoff_capacity: usize,
}

pub struct EventThreadBridge {
    signal: Arc<WorkSignal<CompletionQueue>>,
    thread: Option<JoinHandle<()>>,
}

impl EventThreadBridge {
    /// Spawn the background thread. Returns the bridge and the receiving
    /// end of the hand-off channel for the main thread.
    pub(crate) fn start(
        reactor: Reactor,
        settings: BridgeSettings,
        waker: Option<HostWaker>,
    ) -> RuntimeResult<(Self, Receiver<HandoffCode>)> {
        let (signal, codes) = WorkSignal::new(CompletionQueue::new(), settings.handoff_capacity);
        let thread = {
            let signal = signal.clone();
            thread::Builder::new()
                .name("proteus-event".to_string())
                .spawn(move || run_event_thread(&signal, &reactor, settings, waker.as_ref()))
                .map_err(RuntimeError::Io)?
        };
        debug!("event thread started");
        Ok((
            Self {
                signal,
                thread: Some(thread),
            },
            codes,
        ))
    }

    /// Dispatch queued completions and release the background thread.
    /// Only valid in response to a `Pending` code.
    pub(crate) fn invoke_pending<R>(&self, drain: impl FnOnce(&mut CompletionQueue) -> R) -> R {
        self.signal.acknowledge(drain)
    }

    pub(crate) fn sender(&self) -> crossbeam_channel::Sender<HandoffCode> {
        self.signal.sender()
    }

    /// `Pending` rounds posted and acknowledged so far.
    pub fn rounds(&self) -> (u64, u64) {
        (self.signal.posted(), self.signal.acknowledged())
    }

    /// Stop and join the background thread.
    pub fn shutdown(&mut self) {
        self.signal.shutdown();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("event thread panicked");
            }
            debug!("event thread stopped");
        }
    }
}

impl Drop for EventThreadBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_event_thread(
    signal: &WorkSignal<CompletionQueue>,
    reactor: &Reactor,
    settings: BridgeSettings,
    waker: Option<&HostWaker>,
) {
    let _span = info_span!("event_thread").entered();
    let mut guard = signal.lock();

    while !signal.is_shutdown() {
        if !reactor.has_active_watchers() {
            thread::sleep(settings.idle_poll_interval);
            continue;
        }

        trace!("event loop started");
        let finished = drive_until_idle(signal, reactor, settings, waker, &mut guard);
        trace!("event loop ended");
        if !finished || signal.is_shutdown() {
            break;
        }

        if signal.post_done() {
            wake(waker, NodeEvent::Done);
        }
    }
    debug!("event thread exiting");
}

/// Feed completions to the main thread until no watcher is active.
/// Returns `false` when the thread must stop.
fn drive_until_idle(
    signal: &WorkSignal<CompletionQueue>,
    reactor: &Reactor,
    settings: BridgeSettings,
    waker: Option<&HostWaker>,
    guard: &mut parking_lot::MutexGuard<'_, Slot<CompletionQueue>>,
) -> bool {
    while reactor.has_active_watchers() {
        if signal.is_shutdown() {
            return false;
        }
        match reactor.completions().recv_timeout(settings.idle_poll_interval) {
            Ok(completion) => {
                guard.payload.push_back(completion);
                while let Ok(more) = reactor.completions().try_recv() {
                    guard.payload.push_back(more);
                }
                while !guard.payload.is_empty() {
                    trace!(queued = guard.payload.len(), "handing completions to main thread");
                    if !signal.post_and_wait(guard, || wake(waker, NodeEvent::Pending)) {
                        return false;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return false,
        }
    }
    true
}

fn wake(waker: Option<&HostWaker>, event: NodeEvent) {
    if let Some(waker) = waker {
        waker(event);
    }
}
