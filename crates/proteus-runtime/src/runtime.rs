//! The main-thread runtime.
//!
//! [`Runtime`] owns the instance registry, the reactor and the event
//! thread. Everything that touches instances runs on the thread that owns
//! the runtime; the host drives it by forwarding hand-off codes to
//! [`Runtime::process_events`] (or by calling [`Runtime::run_until_idle`]).

use std::rc::Rc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;
use tracing::{debug, info, info_span, trace, warn};

use crate::bridge::{BridgeSettings, EventThreadBridge};
use crate::builtins::{BuiltinModule, BuiltinTable};
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::host::{HostClient, HostWaker, PermissionTicket};
use crate::instance::{Exports, InstanceEnv, InstanceId, RuntimeInstance, guarded_step};
use crate::lock::LoadLock;
use crate::module::{HostEvent, ReleaseSummary};
use crate::modules::permission;
use crate::reactor::{Reactor, ReactorStats};
use crate::registry::GlobalRegistry;
use crate::script::{ScriptEngine, ScriptException, ScriptValue};
use crate::signal::HandoffCode;
use crate::test_status::TestReport;

/// Passes over the deferred queues per flush.
const MAX_DEFERRED_PASSES: usize = 16;

/// What one pump of the hand-off channel did.
#[derive(Debug, Default)]
pub struct PumpReport {
    /// Codes handled.
    pub codes: usize,
    /// `Pending` rounds acknowledged.
    pub rounds: usize,
    /// Completions whose callback ran.
    pub dispatched: usize,
    /// Unrecognized wire messages.
    pub discarded: usize,
    /// The event loop went idle (`Done` was handled).
    pub loop_done: bool,
    /// `run_until_idle` gave up before the loop went idle.
    pub timed_out: bool,
    pub reports: Vec<TestReport>,
}

/// Per-instance watcher counts.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceWatchers {
    pub instance: InstanceId,
    /// Requests in flight.
    pub active: usize,
    /// Requests tracked by the instance's modules.
    pub tracked: usize,
    pub loop_refs: usize,
}

/// Snapshot returned by `process.test.watcherStats`.
#[derive(Debug, Clone, Serialize)]
pub struct WatcherStatsSnapshot {
    pub reactor: ReactorStats,
    pub instances: Vec<InstanceWatchers>,
    pub rounds_posted: u64,
    pub rounds_acknowledged: u64,
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    builtins: BuiltinTable,
    waker: Option<HostWaker>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            builtins: BuiltinTable::with_defaults(),
            waker: None,
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Add (or replace) a built-in module.
    pub fn builtin(mut self, builtin: BuiltinModule) -> Self {
        self.builtins.insert(builtin);
        self
    }

    /// Start from an empty built-in table.
    pub fn without_default_builtins(mut self) -> Self {
        self.builtins = BuiltinTable::empty();
        self
    }

    /// Called on the event thread whenever a code is queued for the main
    /// thread.
    pub fn waker(mut self, waker: HostWaker) -> Self {
        self.waker = Some(waker);
        self
    }

    pub fn build(self, engine: Box<dyn ScriptEngine>) -> RuntimeResult<Runtime> {
        let config = self.config.normalized();
        let reactor = Reactor::new(config.io_threads)?;
        let settings = BridgeSettings {
            idle_poll_interval: config.idle_poll_interval,
            handoff_capacity: config.handoff_capacity,
        };
        let (bridge, codes) = EventThreadBridge::start(reactor.clone(), settings, self.waker)?;
        let registry = GlobalRegistry::new();
        let env = InstanceEnv {
            builtins: Rc::new(self.builtins),
            reactor: reactor.clone(),
            handoff: bridge.sender(),
            any_done: registry.any_done_flag(),
        };
        info!(
            builtins = env.builtins.len(),
            io_threads = config.io_threads,
            browser = config.is_browser,
            "runtime started"
        );
        Ok(Runtime {
            config,
            engine,
            registry,
            env,
            reactor,
            bridge,
            codes,
            load_lock: LoadLock::new(),
            update_check: -1,
            service: None,
            shut_down: false,
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Runtime core. Not `Send`: it lives on the host's main thread.
pub struct Runtime {
    pub(crate) config: RuntimeConfig,
    pub(crate) engine: Box<dyn ScriptEngine>,
    pub(crate) registry: GlobalRegistry,
    env: InstanceEnv,
    reactor: Reactor,
    bridge: EventThreadBridge,
    codes: Receiver<HandoffCode>,
    pub(crate) load_lock: LoadLock,
    update_check: i32,
    pub(crate) service: Option<InstanceId>,
    shut_down: bool,
}

impl Runtime {
    pub fn new(engine: Box<dyn ScriptEngine>, config: RuntimeConfig) -> RuntimeResult<Self> {
        RuntimeBuilder::new().config(config).build(engine)
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &GlobalRegistry {
        &self.registry
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    pub fn instance(&self, id: InstanceId) -> Option<&RuntimeInstance> {
        self.registry.get(id)
    }

    pub fn instance_mut(&mut self, id: InstanceId) -> Option<&mut RuntimeInstance> {
        self.registry.get_mut(id)
    }

    pub(crate) fn require(&mut self, id: InstanceId) -> RuntimeResult<&mut RuntimeInstance> {
        self.registry
            .get_mut(id)
            .ok_or(RuntimeError::InstanceNotFound(id))
    }

    pub fn load_lock(&self) -> &LoadLock {
        &self.load_lock
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    // --- lifecycle ---

    /// Create an instance, optionally attached to a host client.
    ///
    /// Installs the native entry points and runs the bootstrap program.
    /// On failure nothing is registered.
    pub fn create(&mut self, client: Option<Rc<dyn HostClient>>) -> RuntimeResult<InstanceId> {
        if self.shut_down {
            return Err(RuntimeError::ReactorUnavailable);
        }
        let host_context = client.as_ref().and_then(|client| client.host_context());
        if let Some(context) = host_context {
            if let Some(existing) = self.registry.find_by_host(context) {
                warn!(%context, instance = %existing, "host context already has an instance");
                return Err(RuntimeError::DuplicateInstance(existing));
            }
        }

        let id = self.registry.allocate_id();
        let _span = info_span!("create", instance = %id).entered();
        let context = self
            .engine
            .create_context(host_context)
            .map_err(|e| RuntimeError::engine(format!("cannot create context: {e}")))?;
        let mut instance = RuntimeInstance::new(id, client, host_context, context, self.env.clone());

        let setup = instance.install_entry_points(&self.config).and_then(|()| {
            instance.load(&self.config.bootstrap_source, &self.config.bootstrap_filename)
        });
        if let Err(err) = setup {
            warn!(error = %err, "instance setup failed");
            instance.teardown();
            return Err(err);
        }

        self.registry.insert(instance);
        info!(instances = self.registry.len(), "instance created");
        Ok(id)
    }

    /// Destroy an instance: emit `exit`, report its unit of work if a
    /// client is attached, then release modules and context.
    pub fn destroy(&mut self, id: InstanceId) -> RuntimeResult<()> {
        let _span = info_span!("destroy", instance = %id).entered();
        let instance = self.require(id)?;
        instance.emit_event("exit");
        if instance.has_client() {
            instance.status_mut().mark_done();
            self.registry.report(id, false);
        }

        let instance = self
            .registry
            .remove(id)
            .ok_or(RuntimeError::InstanceNotFound(id))?;
        let client = instance.client().cloned();
        let _teardown = scopeguard::guard(instance, move |mut instance| {
            let summary = instance.teardown();
            debug!(
                modules = summary.modules,
                cancelled = summary.cancelled,
                "instance released"
            );
            if let Some(client) = client {
                guarded_step(id, "destroy notification", || client.on_instance_destroyed(id));
            }
        });

        if self.service == Some(id) {
            self.service = None;
        }
        if let Some((owner, callback)) = self.load_lock.forget(id) {
            self.run_lock_callback(owner, callback);
        }
        info!(instances = self.registry.len(), "instance destroyed");
        Ok(())
    }

    /// Exports for `name` in instance `id`; cached per instance.
    pub fn resolve_binding(&mut self, id: InstanceId, name: &str) -> RuntimeResult<Rc<Exports>> {
        self.require(id)?.resolve_binding(name)
    }

    pub fn has_binding(&self, id: InstanceId, name: &str) -> RuntimeResult<bool> {
        self.registry
            .get(id)
            .map(|instance| instance.has_binding(name))
            .ok_or(RuntimeError::InstanceNotFound(id))
    }

    /// Load a module through the instance's bootstrap loader. A thrown
    /// exception is handled as fatal and returned.
    pub fn load_module(&mut self, id: InstanceId, name: &str) -> RuntimeResult<ScriptValue> {
        let result = self.require(id)?.load_module(name)?;
        let outcome = match result {
            Ok(value) => Ok(value),
            Err(exception) => {
                self.registry.fatal_exception(id, exception.clone());
                Err(RuntimeError::Script(exception))
            }
        };
        self.flush_deferred();
        outcome
    }

    /// Cancel every request of the instance and release its modules; the
    /// instance stays alive.
    pub fn cancel_activity(&mut self, id: InstanceId) -> RuntimeResult<ReleaseSummary> {
        let summary = self.require(id)?.cancel_activity();
        debug!(instance = %id, cancelled = summary.cancelled, "activity cancelled");
        Ok(summary)
    }

    /// Deliver a host event (pause, resume) to every module of every instance.
    pub fn broadcast(&mut self, event: HostEvent) {
        debug!(?event, "host event");
        for instance in self.registry.instances_mut() {
            instance.broadcast_host_event(event);
        }
    }

    /// Deliver a host event to one instance.
    pub fn broadcast_to(&mut self, id: InstanceId, event: HostEvent) -> RuntimeResult<ReleaseSummary> {
        Ok(self.require(id)?.broadcast_host_event(event))
    }

    /// Forward an uncaught exception raised outside a runtime call.
    pub fn fatal_exception(&mut self, id: InstanceId, exception: ScriptException) {
        self.registry.fatal_exception(id, exception);
        self.flush_deferred();
    }

    /// The host saw the engine die under the current unit of work; the next
    /// status pass reports it crashed.
    pub fn mark_crashed(&mut self, id: InstanceId) -> RuntimeResult<()> {
        warn!(instance = %id, "instance crashed");
        self.require(id)?.test_crashed();
        Ok(())
    }

    /// Deliver the host's answer to a permission request. Returns whether
    /// a waiting callback received it.
    pub fn resolve_permission(&mut self, ticket: PermissionTicket, granted: bool) -> RuntimeResult<bool> {
        let instance = self.require(ticket.instance)?;
        let delivered = match permission::deliver(instance, ticket, granted)? {
            Ok(delivered) => delivered,
            Err(exception) => {
                self.registry.fatal_exception(ticket.instance, exception);
                true
            }
        };
        self.flush_deferred();
        Ok(delivered)
    }

    // --- hand-off pump ---

    /// Handle every code queued on the hand-off channel without blocking.
    pub fn process_events(&mut self) -> PumpReport {
        let mut report = PumpReport::default();
        while let Ok(code) = self.codes.try_recv() {
            self.handle_code(code, &mut report);
        }
        report
    }

    /// Handle one wire message forwarded by the host. Unknown codes are
    /// logged and discarded.
    pub fn process_wire_message(&mut self, message: &[u8]) -> PumpReport {
        let mut report = PumpReport::default();
        match HandoffCode::decode(message) {
            Some(code) => self.handle_code(code, &mut report),
            None => {
                warn!(code = ?message.first(), "unknown hand-off code discarded");
                report.discarded += 1;
            }
        }
        report
    }

    /// Block on the hand-off channel until the event loop goes idle or
    /// `timeout` passes.
    pub fn run_until_idle(&mut self, timeout: Duration) -> PumpReport {
        let deadline = Instant::now() + timeout;
        let mut report = PumpReport::default();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                report.timed_out = true;
                break;
            }
            match self.codes.recv_timeout(remaining) {
                Ok(code) => {
                    self.handle_code(code, &mut report);
                    if report.loop_done {
                        while let Ok(code) = self.codes.try_recv() {
                            self.handle_code(code, &mut report);
                        }
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    report.timed_out = true;
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if report.timed_out {
            debug!(?timeout, "event loop still busy");
        }
        report
    }

    /// Status pass over every client-attached instance.
    pub fn check_all(&mut self, all_done: bool) -> Vec<TestReport> {
        self.registry.check_all(all_done)
    }

    fn handle_code(&mut self, code: HandoffCode, report: &mut PumpReport) {
        report.codes += 1;
        match code {
            HandoffCode::Pending => {
                report.rounds += 1;
                report.dispatched += self.invoke_pending();
                self.flush_deferred();
                if self.registry.any_done() {
                    report.reports.extend(self.registry.check_all(false));
                }
            }
            HandoffCode::Done => {
                trace!("event loop idle");
                report.loop_done = true;
                report.reports.extend(self.registry.check_all(true));
            }
            HandoffCode::InstanceDone => {
                report.reports.extend(self.registry.check_all(false));
            }
        }
    }

    /// Dispatch up to `max_completions_per_round` completions and release
    /// the event thread.
    fn invoke_pending(&mut self) -> usize {
        self.registry.clear_any_done();
        let max = self.config.max_completions_per_round;
        let registry = &mut self.registry;
        self.bridge.invoke_pending(|queue| {
            let mut dispatched = 0;
            for _ in 0..max {
                let Some(completion) = queue.pop_front() else {
                    break;
                };
                if registry.dispatch(completion) {
                    dispatched += 1;
                }
            }
            if !queue.is_empty() {
                trace!(left = queue.len(), "completions left for the next round");
            }
            dispatched
        })
    }

    /// Run entry points content queued during a dispatch.
    pub(crate) fn flush_deferred(&mut self) {
        for _ in 0..MAX_DEFERRED_PASSES {
            let mut work = Vec::new();
            for instance in self.registry.instances_mut() {
                while let Some(call) = instance.take_deferred() {
                    work.push((instance.id(), call));
                }
            }
            if work.is_empty() {
                return;
            }
            for (id, (entry, args)) in work {
                if !self.registry.contains(id) {
                    trace!(instance = %id, %entry, "deferred call for destroyed instance dropped");
                    continue;
                }
                if let Err(err) = self.dispatch_entry_point(id, entry, args) {
                    warn!(instance = %id, %entry, error = %err, "deferred entry point failed");
                }
            }
        }
        warn!(passes = MAX_DEFERRED_PASSES, "deferred entry points still queued");
    }

    // --- diagnostics ---

    pub fn watcher_stats(&self) -> WatcherStatsSnapshot {
        let (rounds_posted, rounds_acknowledged) = self.bridge.rounds();
        WatcherStatsSnapshot {
            reactor: self.reactor.stats(),
            instances: self
                .registry
                .iter()
                .map(|instance| InstanceWatchers {
                    instance: instance.id(),
                    active: instance.watcher_count(),
                    tracked: instance.modules().pending_count(),
                    loop_refs: instance.loop_refs(),
                })
                .collect(),
            rounds_posted,
            rounds_acknowledged,
        }
    }

    /// Module update flag shared by every instance. Unset reads as 1.
    pub fn update_check(&self) -> i32 {
        if self.update_check == -1 { 1 } else { self.update_check }
    }

    pub fn set_update_check(&mut self, value: i32) {
        self.update_check = value;
    }

    /// Destroy every instance and stop the event thread and reactor.
    /// Idempotent; also runs on drop.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        let _span = info_span!("shutdown").entered();
        for id in self.registry.ids() {
            if let Err(err) = self.destroy(id) {
                warn!(instance = %id, error = %err, "destroy during shutdown failed");
            }
        }
        self.shut_down = true;
        self.bridge.shutdown();
        self.reactor.shutdown();
        info!("runtime shut down");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("registry", &self.registry)
            .field("load_lock", &self.load_lock)
            .field("shut_down", &self.shut_down)
            .finish()
    }
}
