//! Cross-thread wake/ack primitive.
//!
//! The background thread holds the signal's mutex for as long as it runs.
//! When it has work for the main thread it publishes a [`HandoffCode`] on
//! the side channel and parks on the condition variable, which releases the
//! mutex. The main thread locks, processes the payload, flips the state to
//! signaled and notifies before unlocking. Exactly one round is outstanding
//! at any time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{trace, warn};

use crate::error::protocol_violation;

/// Code carried on the hand-off channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HandoffCode {
    /// Completions are waiting; the background thread is parked.
    Pending = b'0',
    /// The reactor ran out of watchers.
    Done = b'1',
    /// One instance finished while others may still be live.
    InstanceDone = b'2',
}

impl HandoffCode {
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'0' => Some(Self::Pending),
            b'1' => Some(Self::Done),
            b'2' => Some(Self::InstanceDone),
            _ => None,
        }
    }

    /// Two-byte wire message: the code followed by NUL.
    pub fn encode(self) -> [u8; 2] {
        [self.as_byte(), 0]
    }

    /// Decode a wire message. Only the first byte is significant.
    pub fn decode(message: &[u8]) -> Option<Self> {
        message.first().copied().and_then(Self::from_byte)
    }
}

/// Hand-off state guarded by the signal's mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    Idle,
    /// Background thread is parked waiting for the main thread.
    Waiting,
    /// Main thread acknowledged the current round.
    Signaled,
}

/// Mutex-guarded slot shared by both threads.
pub struct Slot<T> {
    state: SignalState,
    pub payload: T,
}

impl<T> Slot<T> {
    pub fn state(&self) -> SignalState {
        self.state
    }
}

/// Round counters, for diagnostics and tests.
#[derive(Debug, Default)]
struct Rounds {
    posted: AtomicU64,
    acknowledged: AtomicU64,
}

/// Wake/ack primitive shared by the background and main threads.
pub struct WorkSignal<T> {
    slot: Mutex<Slot<T>>,
    cond: Condvar,
    codes: Sender<HandoffCode>,
    shutdown: AtomicBool,
    rounds: Rounds,
}

/// How long a blocked send waits before rechecking for shutdown.
const SEND_RETRY: Duration = Duration::from_millis(50);

impl<T> WorkSignal<T> {
    /// Create a signal and the receiving end of its hand-off channel.
    pub fn new(payload: T, capacity: usize) -> (Arc<Self>, Receiver<HandoffCode>) {
        let (codes, rx) = crossbeam_channel::bounded(capacity.max(1));
        let signal = Arc::new(Self {
            slot: Mutex::new(Slot {
                state: SignalState::Idle,
                payload,
            }),
            cond: Condvar::new(),
            codes,
            shutdown: AtomicBool::new(false),
            rounds: Rounds::default(),
        });
        (signal, rx)
    }

    /// Lock the slot. The background thread keeps this guard for its lifetime.
    pub fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock()
    }

    /// Publish `Pending` and park until the main thread acknowledges.
    ///
    /// Must be called with the slot locked. `on_posted` runs once the code
    /// is queued. Returns `false` when the signal was shut down instead of
    /// acknowledged.
    pub fn post_and_wait(
        &self,
        guard: &mut MutexGuard<'_, Slot<T>>,
        on_posted: impl FnOnce(),
    ) -> bool {
        if guard.state == SignalState::Waiting {
            protocol_violation("pending posted while a previous round is unacknowledged");
        }
        guard.state = SignalState::Waiting;
        self.rounds.posted.fetch_add(1, Ordering::AcqRel);
        if !self.send_blocking(HandoffCode::Pending) {
            guard.state = SignalState::Idle;
            return false;
        }
        on_posted();
        trace!("pending posted, waiting for acknowledgement");
        while guard.state == SignalState::Waiting && !self.is_shutdown() {
            self.cond.wait(guard);
        }
        let acknowledged = guard.state == SignalState::Signaled;
        guard.state = SignalState::Idle;
        acknowledged
    }

    /// Publish `Done`. Does not wait.
    pub fn post_done(&self) -> bool {
        self.send_blocking(HandoffCode::Done)
    }

    /// Main thread side of a round: process the payload, then release the
    /// background thread. The mutex stays held until after the notify.
    pub fn acknowledge<R>(&self, drain: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.slot.lock();
        if guard.state != SignalState::Waiting {
            protocol_violation("acknowledge without an outstanding pending round");
        }
        let result = drain(&mut guard.payload);
        guard.state = SignalState::Signaled;
        self.rounds.acknowledged.fetch_add(1, Ordering::AcqRel);
        self.cond.notify_one();
        drop(guard);
        result
    }

    /// Queue a code without blocking. Used by the main thread to wake itself.
    pub fn try_post(&self, code: HandoffCode) -> bool {
        match self.codes.try_send(code) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!(?code, "hand-off channel full, code dropped");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn sender(&self) -> Sender<HandoffCode> {
        self.codes.clone()
    }

    /// Wake a parked background thread and make every later round fail.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _guard = self.slot.lock();
        self.cond.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Rounds posted so far.
    pub fn posted(&self) -> u64 {
        self.rounds.posted.load(Ordering::Acquire)
    }

    /// Rounds acknowledged so far.
    pub fn acknowledged(&self) -> u64 {
        self.rounds.acknowledged.load(Ordering::Acquire)
    }

    fn send_blocking(&self, code: HandoffCode) -> bool {
        loop {
            match self.codes.send_timeout(code, SEND_RETRY) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(_)) if !self.is_shutdown() => continue,
                Err(SendTimeoutError::Timeout(_)) => return false,
                Err(SendTimeoutError::Disconnected(_)) => {
                    warn!(?code, "hand-off receiver is gone");
                    return false;
                }
            }
        }
    }
}
