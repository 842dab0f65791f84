//! Process-wide load lock handed out to content in FIFO order.

use std::collections::VecDeque;

use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::InstanceId;
use crate::script::FunctionRef;

/// Callback waiting for (or granted) the lock.
pub type LockWaiter = (InstanceId, FunctionRef);

#[derive(Debug, Default)]
pub struct LoadLock {
    holder: Option<InstanceId>,
    waiters: VecDeque<LockWaiter>,
}

impl LoadLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.holder.is_some()
    }

    pub fn holder(&self) -> Option<InstanceId> {
        self.holder
    }

    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    /// Queue `callback`. Returns it back when the lock was free and is now
    /// granted to it; the caller runs it.
    pub fn acquire(&mut self, instance: InstanceId, callback: FunctionRef) -> Option<LockWaiter> {
        if self.holder.is_none() {
            self.holder = Some(instance);
            Some((instance, callback))
        } else {
            self.waiters.push_back((instance, callback));
            None
        }
    }

    /// Release the lock; returns the next waiter, which now holds it.
    pub fn release(&mut self) -> RuntimeResult<Option<LockWaiter>> {
        if self.holder.is_none() {
            return Err(RuntimeError::LockNotHeld);
        }
        let next = self.waiters.pop_front();
        self.holder = next.map(|(instance, _)| instance);
        Ok(next)
    }

    /// Drop everything `instance` queued. If it held the lock, the lock
    /// passes to the next waiter, which is returned.
    pub fn forget(&mut self, instance: InstanceId) -> Option<LockWaiter> {
        self.waiters.retain(|(owner, _)| *owner != instance);
        if self.holder == Some(instance) {
            self.release().ok().flatten()
        } else {
            None
        }
    }
}
