//! Native module contract and the per-instance module registry.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::InstanceId;
use crate::pending::PendingRequestTracker;

/// Index of a module within its instance's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ModuleId(u32);

impl ModuleId {
    pub(crate) fn new(index: u32) -> Self {
        Self(index)
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mod#{}", self.0)
    }
}

/// Stable module-kind identifier. Several modules of one kind may be
/// registered with the same instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ModuleKind(&'static str);

impl ModuleKind {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(self) -> &'static str {
        self.0
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Host-originated event broadcast to modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Pause,
    Resume,
}

/// Event delivered to every registered module, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Cancel and unwind everything the module owns. `cancelled` is the
    /// number of tracked requests the core already cancelled for it.
    Release { cancelled: usize },
    Host(HostEvent),
}

/// Script events a module asks to emit after a broadcast.
#[derive(Debug, Default)]
pub struct ModuleNotices {
    events: Vec<&'static str>,
}

impl ModuleNotices {
    pub fn emit(&mut self, event: &'static str) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub(crate) fn into_events(self) -> Vec<&'static str> {
        self.events
    }
}

/// A native module attached to one runtime instance.
///
/// `handle_lifecycle_event` must tolerate `Release` more than once.
pub trait NativeModule: 'static {
    fn kind(&self) -> ModuleKind;

    fn handle_lifecycle_event(
        &mut self,
        event: LifecycleEvent,
        notices: &mut ModuleNotices,
    ) -> RuntimeResult<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

struct ModuleSlot {
    id: ModuleId,
    module: Box<dyn NativeModule>,
    tracker: PendingRequestTracker,
    releases: usize,
}

/// Outcome of a release broadcast.
#[derive(Debug, Default)]
pub struct ReleaseSummary {
    /// Modules the release was delivered to.
    pub modules: usize,
    /// Requests cancelled across all modules.
    pub cancelled: usize,
    /// Script events the modules asked for.
    pub notices: Vec<&'static str>,
}

/// Modules registered with one instance.
pub struct ModuleRegistry {
    owner: InstanceId,
    slots: Vec<ModuleSlot>,
}

impl ModuleRegistry {
    pub fn new(owner: InstanceId) -> Self {
        Self {
            owner,
            slots: Vec::new(),
        }
    }

    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    /// Append a module; registration order is broadcast order.
    pub fn register(&mut self, module: Box<dyn NativeModule>) -> ModuleId {
        let id = ModuleId::new(self.slots.len() as u32);
        debug!(instance = %self.owner, module = %id, kind = %module.kind(), "module registered");
        self.slots.push(ModuleSlot {
            id,
            module,
            tracker: PendingRequestTracker::new(),
            releases: 0,
        });
        id
    }

    /// Drop every module registered after the first `len`, cancelling
    /// whatever they track. No release event is delivered to them.
    pub(crate) fn truncate(&mut self, len: usize) {
        let start = len.min(self.slots.len());
        for mut slot in self.slots.drain(start..) {
            let cancelled = slot.tracker.release();
            debug!(instance = %self.owner, module = %slot.id, cancelled, "module registration rolled back");
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ModuleId> + '_ {
        self.slots.iter().map(|slot| slot.id)
    }

    pub fn kind(&self, id: ModuleId) -> Option<ModuleKind> {
        self.slots.get(id.index()).map(|slot| slot.module.kind())
    }

    /// Release events delivered to `id` so far.
    pub fn release_count(&self, id: ModuleId) -> Option<usize> {
        self.slots.get(id.index()).map(|slot| slot.releases)
    }

    pub fn get<T: NativeModule>(&self, id: ModuleId) -> Option<&T> {
        self.slots
            .get(id.index())
            .and_then(|slot| slot.module.as_any().downcast_ref::<T>())
    }

    pub fn get_mut<T: NativeModule>(&mut self, id: ModuleId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index())
            .and_then(|slot| slot.module.as_any_mut().downcast_mut::<T>())
    }

    pub fn tracker(&self, id: ModuleId) -> RuntimeResult<&PendingRequestTracker> {
        self.slots
            .get(id.index())
            .map(|slot| &slot.tracker)
            .ok_or(RuntimeError::ModuleNotRegistered(id))
    }

    pub fn tracker_mut(&mut self, id: ModuleId) -> RuntimeResult<&mut PendingRequestTracker> {
        self.slots
            .get_mut(id.index())
            .map(|slot| &mut slot.tracker)
            .ok_or(RuntimeError::ModuleNotRegistered(id))
    }

    /// Requests tracked across every module.
    pub fn pending_count(&self) -> usize {
        self.slots.iter().map(|slot| slot.tracker.len()).sum()
    }

    /// Deliver a host event to every module.
    pub fn broadcast(&mut self, event: HostEvent) -> ReleaseSummary {
        let mut notices = ModuleNotices::default();
        let mut modules = 0;
        for slot in &mut self.slots {
            deliver(self.owner, slot, LifecycleEvent::Host(event), &mut notices);
            modules += 1;
        }
        ReleaseSummary {
            modules,
            cancelled: 0,
            notices: notices.into_events(),
        }
    }

    /// Release one module: cancel its tracked requests, then tell it.
    pub fn release(&mut self, id: ModuleId) -> RuntimeResult<ReleaseSummary> {
        let owner = self.owner;
        let slot = self
            .slots
            .get_mut(id.index())
            .ok_or(RuntimeError::ModuleNotRegistered(id))?;
        let mut notices = ModuleNotices::default();
        let cancelled = release_slot(owner, slot, &mut notices);
        Ok(ReleaseSummary {
            modules: 1,
            cancelled,
            notices: notices.into_events(),
        })
    }

    /// Release every module in registration order. A module that fails
    /// does not stop delivery to the rest.
    pub fn release_all(&mut self) -> ReleaseSummary {
        let mut notices = ModuleNotices::default();
        let mut summary = ReleaseSummary::default();
        for slot in &mut self.slots {
            summary.cancelled += release_slot(self.owner, slot, &mut notices);
            summary.modules += 1;
        }
        summary.notices = notices.into_events();
        if summary.modules > 0 {
            debug!(
                instance = %self.owner,
                modules = summary.modules,
                cancelled = summary.cancelled,
                "modules released"
            );
        }
        summary
    }
}

fn release_slot(owner: InstanceId, slot: &mut ModuleSlot, notices: &mut ModuleNotices) -> usize {
    let cancelled = slot.tracker.release();
    slot.releases += 1;
    deliver(owner, slot, LifecycleEvent::Release { cancelled }, notices);
    cancelled
}

fn deliver(owner: InstanceId, slot: &mut ModuleSlot, event: LifecycleEvent, notices: &mut ModuleNotices) {
    let kind = slot.module.kind();
    let module = &mut slot.module;
    match catch_unwind(AssertUnwindSafe(|| module.handle_lifecycle_event(event, notices))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(instance = %owner, module = %slot.id, kind = %kind, ?event, error = %e, "module failed to handle lifecycle event");
        }
        Err(_) => {
            error!(instance = %owner, module = %slot.id, kind = %kind, ?event, "module panicked handling lifecycle event");
        }
    }
}
