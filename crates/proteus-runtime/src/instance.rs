//! Runtime instances: one isolated execution context per host page.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;

use crossbeam_channel::{Sender, TrySendError};
use serde::Serialize;
use tracing::{debug, error, trace, warn};

use crate::builtins::{BuiltinTable, Registration};
use crate::config::RuntimeConfig;
use crate::entry::EntryPoint;
use crate::error::{ResourceError, RuntimeError, RuntimeResult};
use crate::host::HostClient;
use crate::module::{HostEvent, ModuleId, ModuleRegistry, ReleaseSummary};
use crate::pending::{CompletionCallback, PendingRequest};
use crate::reactor::{Reactor, RequestId};
use crate::script::{
    ContextHandle, FunctionRef, ProcessInfo, ScriptContext, ScriptException, ScriptValue,
};
use crate::signal::HandoffCode;
use crate::test_status::{TestStatus, TestStatusTracker};

/// Identity of a runtime instance. Monotonic, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct InstanceId(u64);

impl InstanceId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Native function behind an export. Receives the calling instance, the
/// module the exports object is tagged with, and the call's arguments.
pub type NativeFn = fn(&mut RuntimeInstance, ModuleId, &[ScriptValue]) -> RuntimeResult<ScriptValue>;

/// Native function exported to content.
#[derive(Clone, Copy)]
pub struct NativeFunction {
    /// Qualified name, `fs.readFile`.
    pub name: &'static str,
    pub call: NativeFn,
}

impl PartialEq for NativeFunction {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFunction({})", self.name)
    }
}

/// Entry of an exports object.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportValue {
    Function(NativeFunction),
    Value(serde_json::Value),
}

impl ExportValue {
    pub fn as_function(&self) -> Option<NativeFunction> {
        match self {
            Self::Function(function) => Some(*function),
            Self::Value(_) => None,
        }
    }
}

/// Exports container handed to content for a resolved binding.
///
/// Tagged with the owning instance and, once a module registers against
/// it, with that module.
#[derive(Debug)]
pub struct Exports {
    owner: InstanceId,
    name: String,
    module: Cell<Option<ModuleId>>,
    entries: RefCell<BTreeMap<String, ExportValue>>,
}

impl Exports {
    pub(crate) fn new(owner: InstanceId, name: impl Into<String>) -> Self {
        Self {
            owner,
            name: name.into(),
            module: Cell::new(None),
            entries: RefCell::new(BTreeMap::new()),
        }
    }

    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Module registered against this container, if any.
    pub fn module(&self) -> Option<ModuleId> {
        self.module.get()
    }

    pub(crate) fn set_module(&self, module: ModuleId) {
        self.module.set(Some(module));
    }

    pub fn set(&self, key: impl Into<String>, value: ExportValue) {
        self.entries.borrow_mut().insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<ExportValue> {
        self.entries.borrow().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.borrow().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

/// Process-wide pieces every instance needs.
#[derive(Clone)]
pub(crate) struct InstanceEnv {
    pub builtins: Rc<BuiltinTable>,
    pub reactor: Reactor,
    pub handoff: Sender<HandoffCode>,
    /// Set whenever any instance reaches `Done`.
    pub any_done: Rc<Cell<bool>>,
}

/// One isolated execution environment.
pub struct RuntimeInstance {
    id: InstanceId,
    client: Option<Rc<dyn HostClient>>,
    host_context: Option<ContextHandle>,
    context: Option<Box<dyn ScriptContext>>,
    process: Option<ScriptValue>,
    loader: Option<FunctionRef>,
    bindings: HashMap<String, Rc<Exports>>,
    modules: ModuleRegistry,
    status: TestStatusTracker,
    watchers: Rc<Cell<usize>>,
    loop_refs: usize,
    deferred: VecDeque<(EntryPoint, Vec<ScriptValue>)>,
    env: InstanceEnv,
}

impl RuntimeInstance {
    pub(crate) fn new(
        id: InstanceId,
        client: Option<Rc<dyn HostClient>>,
        host_context: Option<ContextHandle>,
        context: Box<dyn ScriptContext>,
        env: InstanceEnv,
    ) -> Self {
        let mut status = TestStatusTracker::new(id);
        if let Some(client) = &client {
            status.set_label(client.url());
        }
        Self {
            id,
            client,
            host_context,
            context: Some(context),
            process: None,
            loader: None,
            bindings: HashMap::new(),
            modules: ModuleRegistry::new(id),
            status,
            watchers: Rc::new(Cell::new(0)),
            loop_refs: 0,
            deferred: VecDeque::new(),
            env,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn client(&self) -> Option<&Rc<dyn HostClient>> {
        self.client.as_ref()
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    pub fn host_context(&self) -> Option<ContextHandle> {
        self.host_context
    }

    /// The context is alive until teardown.
    pub fn is_alive(&self) -> bool {
        self.context.is_some()
    }

    pub fn context(&self) -> Option<&dyn ScriptContext> {
        self.context.as_deref()
    }

    pub fn context_mut(&mut self) -> RuntimeResult<&mut dyn ScriptContext> {
        match self.context.as_deref_mut() {
            Some(context) => Ok(context),
            None => Err(RuntimeError::InstanceNotFound(self.id)),
        }
    }

    pub fn process(&self) -> Option<&ScriptValue> {
        self.process.as_ref()
    }

    pub fn loader(&self) -> Option<FunctionRef> {
        self.loader
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn modules_mut(&mut self) -> &mut ModuleRegistry {
        &mut self.modules
    }

    pub fn status(&self) -> &TestStatusTracker {
        &self.status
    }

    pub(crate) fn status_mut(&mut self) -> &mut TestStatusTracker {
        &mut self.status
    }

    pub fn reactor(&self) -> &Reactor {
        &self.env.reactor
    }

    /// Requests of this instance still in flight.
    pub fn watcher_count(&self) -> usize {
        self.watchers.get()
    }

    pub fn loop_refs(&self) -> usize {
        self.loop_refs
    }

    // --- bootstrap ---

    pub(crate) fn install_entry_points(&mut self, config: &RuntimeConfig) -> RuntimeResult<()> {
        let info = ProcessInfo {
            instance: self.id,
            url: self.client.as_ref().map(|client| client.url()),
            app_path: config.app_path.clone(),
            download_path: config.download_path.clone(),
            is_browser: config.is_browser,
            entry_points: EntryPoint::ALL,
        };
        let process = self
            .context_mut()?
            .create_process_object(&info)
            .map_err(RuntimeError::engine)?;
        self.process = Some(process);
        Ok(())
    }

    /// Run the bootstrap program and keep the module loader it returns.
    pub(crate) fn load(&mut self, source: &str, filename: &str) -> RuntimeResult<()> {
        let id = self.id;
        let process = self
            .process
            .clone()
            .ok_or_else(|| RuntimeError::bootstrap("process object was not created"))?;
        let context = self.context_mut()?;

        let main = context.evaluate(source, filename).map_err(|e| {
            error!(instance = %id, "{}", e.report());
            RuntimeError::bootstrap(format!("{filename} threw: {e}"))
        })?;
        let Some(main) = main.as_function() else {
            return Err(RuntimeError::bootstrap(format!(
                "{filename} did not evaluate to a function"
            )));
        };
        let loader = context.call(main, &[process]).map_err(|e| {
            error!(instance = %id, "{}", e.report());
            RuntimeError::bootstrap(format!("{filename} threw during setup: {e}"))
        })?;
        let Some(loader) = loader.as_function() else {
            return Err(RuntimeError::bootstrap(format!(
                "{filename} did not return the module loader"
            )));
        };
        self.loader = Some(loader);
        debug!(instance = %id, "bootstrap loaded");
        Ok(())
    }

    /// Load a module through the bootstrap's loader.
    pub(crate) fn load_module(&mut self, name: &str) -> RuntimeResult<Result<ScriptValue, ScriptException>> {
        let loader = self
            .loader
            .ok_or_else(|| RuntimeError::bootstrap("instance has no module loader"))?;
        let context = self.context_mut()?;
        Ok(context.call(loader, &[ScriptValue::str(name)]))
    }

    // --- bindings ---

    /// Cached exports for `name`, or a fresh container populated by the
    /// matching built-in. The built-in's registration runs at most once.
    pub fn resolve_binding(&mut self, name: &str) -> RuntimeResult<Rc<Exports>> {
        if let Some(exports) = self.bindings.get(name) {
            trace!(instance = %self.id, name, "binding from cache");
            return Ok(exports.clone());
        }
        let Some(builtin) = self.env.builtins.lookup(name).copied() else {
            debug!(instance = %self.id, name, "no such module");
            return Err(RuntimeError::ModuleNotFound(name.to_string()));
        };
        let exports = Rc::new(Exports::new(self.id, name));
        let registered = self.modules.len();
        if let Err(e) = (builtin.register)(&mut Registration::new(self, &exports)) {
            self.modules.truncate(registered);
            warn!(instance = %self.id, name, error = %e, "binding registration failed");
            return Err(e);
        }
        self.bindings.insert(name.to_string(), exports.clone());
        debug!(instance = %self.id, name, "binding registered");
        Ok(exports)
    }

    pub fn has_binding(&self, name: &str) -> bool {
        self.bindings.contains_key(name) || self.env.builtins.lookup(name).is_some()
    }

    pub fn cached_binding(&self, name: &str) -> Option<Rc<Exports>> {
        self.bindings.get(name).cloned()
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    /// Uncached exports container tagged with this instance.
    pub fn create_exports(&self, name: &str) -> Rc<Exports> {
        Rc::new(Exports::new(self.id, name))
    }

    // --- script access ---

    pub fn call(&mut self, function: FunctionRef, args: &[ScriptValue]) -> Result<ScriptValue, ScriptException> {
        match self.context.as_deref_mut() {
            Some(context) => context.call(function, args),
            None => Err(ScriptException::error(format!("{} was destroyed", self.id))),
        }
    }

    pub fn emit(&mut self, event: &str, args: &[ScriptValue]) -> Result<(), ScriptException> {
        match self.context.as_deref_mut() {
            Some(context) => context.emit(event, args),
            None => Err(ScriptException::error(format!("{} was destroyed", self.id))),
        }
    }

    /// Emit `event`; an exception is reported and fails the instance.
    pub fn emit_event(&mut self, event: &str) {
        if !self.is_alive() {
            trace!(instance = %self.id, event, "event after teardown dropped");
            return;
        }
        if let Err(e) = self.emit(event, &[]) {
            error!(instance = %self.id, event, "{}", e.report());
            self.status.set_status(TestStatus::Failed);
        }
    }

    /// Queue a runtime-level entry point call; it runs after the current
    /// dispatch round.
    pub fn defer(&mut self, entry: EntryPoint, args: Vec<ScriptValue>) {
        self.deferred.push_back((entry, args));
    }

    pub(crate) fn take_deferred(&mut self) -> Option<(EntryPoint, Vec<ScriptValue>)> {
        self.deferred.pop_front()
    }

    pub fn has_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }

    // --- async work ---

    /// Run `work` on the reactor for `module` and track it until
    /// `callback` runs on the main thread or the module is released.
    pub fn submit<T, F, C>(
        &mut self,
        module: ModuleId,
        label: &'static str,
        work: F,
        callback: C,
    ) -> RuntimeResult<RequestId>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, ResourceError>> + Send + 'static,
        C: FnOnce(&mut RuntimeInstance, Result<T, ResourceError>) -> Result<(), ScriptException> + 'static,
    {
        if !self.is_alive() {
            return Err(RuntimeError::InstanceNotFound(self.id));
        }
        self.modules.tracker(module)?;
        let handle = self.env.reactor.submit(self.id, module, &self.watchers, work)?;
        let request = handle.key().request;
        let callback: CompletionCallback = Box::new(move |instance, outcome| {
            let outcome = outcome.and_then(|value| {
                value
                    .downcast::<T>()
                    .map(|value| *value)
                    .map_err(|_| ResourceError::io("completion carried an unexpected value"))
            });
            callback(instance, outcome)
        });
        self.modules
            .tracker_mut(module)?
            .add(PendingRequest::new(handle, label, callback));
        Ok(request)
    }

    /// Release every module without destroying the instance; notices the
    /// modules raise are emitted into the context.
    pub fn cancel_activity(&mut self) -> ReleaseSummary {
        let summary = self.modules.release_all();
        for event in &summary.notices {
            self.emit_event(event);
        }
        summary
    }

    /// Deliver a host event to every module.
    pub fn broadcast_host_event(&mut self, event: HostEvent) -> ReleaseSummary {
        let summary = self.modules.broadcast(event);
        for notice in &summary.notices {
            self.emit_event(notice);
        }
        summary
    }

    // --- test status ---

    /// Begin a unit of work; drops the listeners of the previous one.
    pub fn test_start(&mut self, label: Option<&str>) {
        self.status.start(label);
        if let Some(context) = self.context.as_deref_mut() {
            context.remove_all_listeners();
        }
    }

    /// Content finished its unit of work.
    pub fn test_done(&mut self) {
        if self.status.mark_done().applied() {
            self.note_done();
        }
    }

    pub fn test_fail(&mut self) {
        if self.status.fail().applied() {
            self.note_done();
        }
    }

    pub fn test_crashed(&mut self) {
        if self.status.crash().applied() {
            self.note_done();
        }
    }

    /// Done once nothing is in flight anywhere.
    pub fn test_check(&mut self) -> bool {
        if self.env.reactor.has_active_watchers() {
            return false;
        }
        self.test_done();
        true
    }

    fn note_done(&mut self) {
        self.env.any_done.set(true);
        match self.env.handoff.try_send(HandoffCode::InstanceDone) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                trace!(instance = %self.id, "hand-off channel full, status pass already queued");
            }
        }
    }

    // --- keep-alive ---

    pub fn ref_loop(&mut self) {
        self.loop_refs += 1;
        self.env.reactor.ref_loop();
    }

    pub fn unref_loop(&mut self) {
        if self.loop_refs == 0 {
            warn!(instance = %self.id, "unref without a matching ref");
            return;
        }
        self.loop_refs -= 1;
        self.env.reactor.unref_loop();
    }

    // --- teardown ---

    /// Release the binding cache and context handles, broadcast release to
    /// every module, and drop the instance's keep-alive references. Every
    /// step runs even if an earlier one panicked.
    pub(crate) fn teardown(&mut self) -> ReleaseSummary {
        let id = self.id;
        let bindings = std::mem::take(&mut self.bindings);
        let process = self.process.take();
        self.loader = None;
        if let Some(mut context) = self.context.take() {
            guarded_step(id, "context release", move || {
                for exports in bindings.into_values() {
                    context.release(&ScriptValue::Exports(exports));
                }
                if let Some(process) = process {
                    context.release(&process);
                }
                context.dispose();
            });
        }

        let summary = self.modules.release_all();
        if !summary.notices.is_empty() {
            trace!(instance = %id, dropped = summary.notices.len(), "module notices after context release dropped");
        }

        let refs = std::mem::take(&mut self.loop_refs);
        for _ in 0..refs {
            self.env.reactor.unref_loop();
        }
        self.deferred.clear();
        summary
    }
}

impl fmt::Debug for RuntimeInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeInstance")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .field("modules", &self.modules.len())
            .field("state", &self.status.state())
            .finish()
    }
}

/// Run one teardown step, containing a panic to that step.
pub(crate) fn guarded_step(instance: InstanceId, step: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(instance = %instance, step, "teardown step panicked");
    }
}
