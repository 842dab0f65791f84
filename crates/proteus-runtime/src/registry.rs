//! Process-wide registry of live runtime instances.
//!
//! Owns every [`RuntimeInstance`] and routes main-thread work to them:
//! completions handed over by the event thread, fatal exceptions and the
//! end-of-work status pass.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::{debug, error, trace};

use crate::error::protocol_violation;
use crate::instance::{InstanceId, RuntimeInstance};
use crate::pending::Claim;
use crate::reactor::{Completion, RequestKey};
use crate::script::{ContextHandle, ScriptException};
use crate::test_status::{TestReport, TestState, TestStatus};

pub struct GlobalRegistry {
    instances: BTreeMap<InstanceId, RuntimeInstance>,
    next_id: u64,
    any_done: Rc<Cell<bool>>,
    uncaught_depth: u32,
}

impl GlobalRegistry {
    pub(crate) fn new() -> Self {
        Self {
            instances: BTreeMap::new(),
            next_id: 1,
            any_done: Rc::new(Cell::new(false)),
            uncaught_depth: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn contains(&self, id: InstanceId) -> bool {
        self.instances.contains_key(&id)
    }

    /// Live instances, oldest first.
    pub fn ids(&self) -> Vec<InstanceId> {
        self.instances.keys().copied().collect()
    }

    pub fn get(&self, id: InstanceId) -> Option<&RuntimeInstance> {
        self.instances.get(&id)
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut RuntimeInstance> {
        self.instances.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuntimeInstance> {
        self.instances.values()
    }

    /// Some instance reached `Done` since the last status pass.
    pub fn any_done(&self) -> bool {
        self.any_done.get()
    }

    pub(crate) fn any_done_flag(&self) -> Rc<Cell<bool>> {
        self.any_done.clone()
    }

    pub(crate) fn clear_any_done(&self) {
        self.any_done.set(false);
    }

    pub(crate) fn allocate_id(&mut self) -> InstanceId {
        let id = InstanceId::new(self.next_id);
        self.next_id += 1;
        id
    }

    pub(crate) fn insert(&mut self, instance: RuntimeInstance) {
        let id = instance.id();
        if self.instances.insert(id, instance).is_some() {
            protocol_violation(format_args!("{id} registered twice"));
        }
    }

    pub(crate) fn remove(&mut self, id: InstanceId) -> Option<RuntimeInstance> {
        self.instances.remove(&id)
    }

    /// Instance attached to a host context.
    pub fn find_by_host(&self, context: ContextHandle) -> Option<InstanceId> {
        self.instances
            .values()
            .find(|instance| instance.host_context() == Some(context))
            .map(RuntimeInstance::id)
    }

    pub(crate) fn instances_mut(&mut self) -> impl Iterator<Item = &mut RuntimeInstance> {
        self.instances.values_mut()
    }

    /// Route one completion to the request it belongs to. Returns whether
    /// a callback ran.
    pub(crate) fn dispatch(&mut self, completion: Completion) -> bool {
        let RequestKey {
            instance: id,
            module,
            request,
        } = completion.key;
        let Some(instance) = self.instances.get_mut(&id) else {
            trace!(instance = %id, request = %request, "completion for destroyed instance dropped");
            return false;
        };
        let claim = match instance.modules_mut().tracker_mut(module) {
            Ok(tracker) => tracker.claim(request),
            Err(err) => {
                protocol_violation(format_args!("completion {request} for {id}: {err}"));
                return false;
            }
        };
        let pending = match claim {
            Claim::Tracked(pending) => pending,
            Claim::Cancelled => {
                trace!(instance = %id, request = %request, "completion of cancelled request discarded");
                return false;
            }
            Claim::Unknown => {
                protocol_violation(format_args!("completion for untracked request {request} of {id}"));
                return false;
            }
        };
        trace!(instance = %id, request = %request, label = pending.label(), "dispatching completion");
        if let Err(exception) = pending.complete(instance, completion.outcome) {
            self.fatal_exception(id, exception);
        }
        true
    }

    /// Handle an exception nobody caught.
    ///
    /// Re-emitted as `uncaughtException` when content listens for it;
    /// otherwise the instance fails. An exception thrown while handling
    /// `uncaughtException` is a protocol violation.
    pub fn fatal_exception(&mut self, id: InstanceId, exception: ScriptException) {
        let Some(instance) = self.instances.get_mut(&id) else {
            error!(instance = %id, "{}", exception.report());
            return;
        };
        if self.uncaught_depth > 0 {
            error!(instance = %id, "{}", exception.report());
            instance.test_fail();
            protocol_violation("exception thrown from an uncaughtException handler");
            return;
        }
        if instance.status().state() == TestState::Done {
            debug!(instance = %id, error = %exception, "exception after the work finished ignored");
            return;
        }

        let listeners = instance
            .context()
            .map_or(0, |context| context.listener_count("uncaughtException"));
        if listeners == 0 {
            error!(instance = %id, "{}", exception.report());
            instance.test_fail();
            return;
        }

        debug!(instance = %id, listeners, "re-emitting as uncaughtException");
        self.uncaught_depth += 1;
        let nested = instance.emit("uncaughtException", &[exception.to_value()]);
        if let Err(nested) = nested {
            self.fatal_exception(id, nested);
        }
        self.uncaught_depth -= 1;
    }

    /// Report every client-attached instance that reached `Done`.
    ///
    /// With `all_done`, instances still `Started` are forced to `Done`
    /// first: the event loop ran out of work, so nothing can finish them.
    pub(crate) fn check_all(&mut self, all_done: bool) -> Vec<TestReport> {
        let ids: Vec<InstanceId> = self
            .instances
            .values()
            .filter(|instance| instance.has_client())
            .map(RuntimeInstance::id)
            .collect();

        if all_done {
            for id in &ids {
                if let Some(instance) = self.instances.get_mut(id) {
                    if instance.status_mut().force_done().applied() {
                        debug!(instance = %id, "finished with the event loop");
                    }
                }
            }
        }

        let mut reports = Vec::new();
        for id in ids {
            let done = self
                .instances
                .get(&id)
                .is_some_and(|instance| instance.status().state() == TestState::Done);
            if done {
                reports.extend(self.report(id, true));
            }
        }
        self.clear_any_done();
        reports
    }

    /// Take, log and deliver the report of a `Done` instance.
    pub(crate) fn report(&mut self, id: InstanceId, emit_exit: bool) -> Option<TestReport> {
        let instance = self.instances.get_mut(&id)?;
        if emit_exit && instance.status().status() != TestStatus::Failed {
            instance.emit_event("exit");
        }
        let report = instance.status_mut().take_report()?;
        report.log();
        if let Some(client) = instance.client() {
            client.on_work_done(&report);
        }
        Some(report)
    }
}

impl std::fmt::Debug for GlobalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalRegistry")
            .field("instances", &self.instances.len())
            .field("next_id", &self.next_id)
            .field("any_done", &self.any_done.get())
            .finish()
    }
}
