//! Scriptable engine and host doubles shared by the integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use proteus_runtime::{
    ContextHandle, FunctionRef, HostClient, InstanceId, NodeEvent, ObjectRef, ProcessInfo,
    Runtime, RuntimeConfig, ScriptContext, ScriptEngine, ScriptException, ScriptValue, TestReport,
};

pub type Behavior = Box<dyn FnMut(&[ScriptValue]) -> Result<ScriptValue, ScriptException>>;

/// How the bootstrap program behaves in new contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootstrapMode {
    #[default]
    Normal,
    Throws,
    NotAFunction,
}

#[derive(Default)]
pub struct EngineState {
    next_context: u64,
    next_function: u64,
    functions: HashMap<u64, Behavior>,
    listeners: HashMap<(ContextHandle, String), Vec<FunctionRef>>,
    pub bootstrap: BootstrapMode,
    pub emitted: Vec<(ContextHandle, String)>,
    pub evaluated: Vec<(ContextHandle, String)>,
    pub disposed: Vec<ContextHandle>,
    pub released_values: usize,
    pub entry_points: usize,
    pub process: Option<ProcessInfo>,
}

/// Engine double. Clones share state, so a test can keep one clone while
/// the runtime owns another.
#[derive(Clone, Default)]
pub struct FakeEngine {
    state: Rc<RefCell<EngineState>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bootstrap(mode: BootstrapMode) -> Self {
        let engine = Self::new();
        engine.state.borrow_mut().bootstrap = mode;
        engine
    }

    pub fn state(&self) -> std::cell::Ref<'_, EngineState> {
        self.state.borrow()
    }

    pub fn set_bootstrap(&self, mode: BootstrapMode) {
        self.state.borrow_mut().bootstrap = mode;
    }

    /// Register a native-backed script function.
    pub fn function(
        &self,
        behavior: impl FnMut(&[ScriptValue]) -> Result<ScriptValue, ScriptException> + 'static,
    ) -> FunctionRef {
        register_function(&self.state, Box::new(behavior))
    }

    /// Function that records each call's arguments.
    pub fn recorder(&self) -> (FunctionRef, Rc<RefCell<Vec<Vec<ScriptValue>>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let log = calls.clone();
        let function = self.function(move |args| {
            log.borrow_mut().push(args.to_vec());
            Ok(ScriptValue::Undefined)
        });
        (function, calls)
    }

    pub fn add_listener(&self, context: ContextHandle, event: &str, function: FunctionRef) {
        self.state
            .borrow_mut()
            .listeners
            .entry((context, event.to_string()))
            .or_default()
            .push(function);
    }

    /// Events emitted into `context`, in order.
    pub fn emitted(&self, context: ContextHandle) -> Vec<String> {
        self.state
            .borrow()
            .emitted
            .iter()
            .filter(|(handle, _)| *handle == context)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn count_emitted(&self, context: ContextHandle, event: &str) -> usize {
        self.emitted(context).iter().filter(|e| *e == event).count()
    }

    pub fn is_disposed(&self, context: ContextHandle) -> bool {
        self.state.borrow().disposed.contains(&context)
    }
}

fn register_function(state: &Rc<RefCell<EngineState>>, behavior: Behavior) -> FunctionRef {
    let mut state = state.borrow_mut();
    state.next_function += 1;
    let id = state.next_function;
    state.functions.insert(id, behavior);
    FunctionRef(id)
}

/// Call a registered function without holding the state borrow, so the
/// function may itself use the engine.
fn invoke(
    state: &Rc<RefCell<EngineState>>,
    function: FunctionRef,
    args: &[ScriptValue],
) -> Result<ScriptValue, ScriptException> {
    let behavior = state.borrow_mut().functions.remove(&function.0);
    let Some(mut behavior) = behavior else {
        return Err(ScriptException::type_error(format!("{} is not a function", function.0)));
    };
    let result = behavior(args);
    state.borrow_mut().functions.insert(function.0, behavior);
    result
}

impl ScriptEngine for FakeEngine {
    fn create_context(
        &mut self,
        _host: Option<ContextHandle>,
    ) -> Result<Box<dyn ScriptContext>, ScriptException> {
        let handle = {
            let mut state = self.state.borrow_mut();
            state.next_context += 1;
            ContextHandle(state.next_context)
        };
        Ok(Box::new(FakeContext {
            handle,
            state: self.state.clone(),
        }))
    }
}

pub struct FakeContext {
    handle: ContextHandle,
    state: Rc<RefCell<EngineState>>,
}

impl ScriptContext for FakeContext {
    fn handle(&self) -> ContextHandle {
        self.handle
    }

    fn create_process_object(&mut self, process: &ProcessInfo) -> Result<ScriptValue, ScriptException> {
        let mut state = self.state.borrow_mut();
        state.entry_points = process.entry_points.len();
        state.process = Some(process.clone());
        Ok(ScriptValue::Object(ObjectRef(self.handle.0)))
    }

    fn evaluate(&mut self, source: &str, filename: &str) -> Result<ScriptValue, ScriptException> {
        self.state
            .borrow_mut()
            .evaluated
            .push((self.handle, source.to_string()));

        if !filename.ends_with(".js") {
            return match source.strip_prefix("throw ") {
                Some(message) => Err(ScriptException::error(message)),
                None => Ok(ScriptValue::str(source)),
            };
        }

        let mode = self.state.borrow().bootstrap;
        match mode {
            BootstrapMode::Throws => {
                Err(ScriptException::error("bootstrap exploded").with_stack("Error: bootstrap exploded\n    at proteus.js:1"))
            }
            BootstrapMode::NotAFunction => Ok(ScriptValue::from(1_i64)),
            BootstrapMode::Normal => {
                let loader = register_function(
                    &self.state,
                    Box::new(|args: &[ScriptValue]| match args.first().and_then(ScriptValue::as_str) {
                        Some("throws") => Err(ScriptException::error("module threw on load")),
                        Some(name) => Ok(ScriptValue::str(&format!("module:{name}"))),
                        None => Err(ScriptException::type_error("module name required")),
                    }),
                );
                let main = register_function(
                    &self.state,
                    Box::new(move |_args: &[ScriptValue]| Ok(ScriptValue::Function(loader))),
                );
                Ok(ScriptValue::Function(main))
            }
        }
    }

    fn call(&mut self, function: FunctionRef, args: &[ScriptValue]) -> Result<ScriptValue, ScriptException> {
        invoke(&self.state, function, args)
    }

    fn emit(&mut self, event: &str, args: &[ScriptValue]) -> Result<(), ScriptException> {
        let listeners = {
            let mut state = self.state.borrow_mut();
            state.emitted.push((self.handle, event.to_string()));
            state
                .listeners
                .get(&(self.handle, event.to_string()))
                .cloned()
                .unwrap_or_default()
        };
        for listener in listeners {
            invoke(&self.state, listener, args)?;
        }
        Ok(())
    }

    fn listener_count(&self, event: &str) -> usize {
        self.state
            .borrow()
            .listeners
            .get(&(self.handle, event.to_string()))
            .map_or(0, Vec::len)
    }

    fn remove_all_listeners(&mut self) {
        let handle = self.handle;
        self.state
            .borrow_mut()
            .listeners
            .retain(|(context, _), _| *context != handle);
    }

    fn release(&mut self, _value: &ScriptValue) {
        self.state.borrow_mut().released_values += 1;
    }

    fn dispose(&mut self) {
        self.state.borrow_mut().disposed.push(self.handle);
    }
}

/// Host client that records everything the runtime tells it.
#[derive(Default)]
pub struct RecordingHost {
    pub url: String,
    pub context: Option<ContextHandle>,
    pub events: RefCell<Vec<(InstanceId, NodeEvent)>>,
    pub reports: RefCell<Vec<TestReport>>,
    pub destroyed: RefCell<Vec<InstanceId>>,
}

impl RecordingHost {
    pub fn new(url: &str) -> Rc<Self> {
        Rc::new(Self {
            url: url.to_string(),
            ..Self::default()
        })
    }

    pub fn attached(url: &str, context: ContextHandle) -> Rc<Self> {
        Rc::new(Self {
            url: url.to_string(),
            context: Some(context),
            ..Self::default()
        })
    }

    pub fn report_count(&self) -> usize {
        self.reports.borrow().len()
    }
}

impl HostClient for RecordingHost {
    fn handle_node_event(&self, instance: InstanceId, event: NodeEvent) {
        self.events.borrow_mut().push((instance, event));
    }

    fn on_instance_destroyed(&self, instance: InstanceId) {
        self.destroyed.borrow_mut().push(instance);
    }

    fn on_work_done(&self, report: &TestReport) {
        self.reports.borrow_mut().push(report.clone());
    }

    fn url(&self) -> String {
        self.url.clone()
    }

    fn host_context(&self) -> Option<ContextHandle> {
        self.context
    }
}

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn test_config() -> RuntimeConfig {
    RuntimeConfig::default()
        .io_threads(2)
        .idle_poll_interval(Duration::from_millis(2))
}

pub fn runtime_with(engine: &FakeEngine) -> Runtime {
    Runtime::new(Box::new(engine.clone()), test_config()).unwrap()
}

/// Context handle of a live instance.
pub fn context_of(runtime: &Runtime, id: InstanceId) -> ContextHandle {
    runtime
        .instance(id)
        .and_then(|instance| instance.context())
        .map(|context| context.handle())
        .unwrap()
}
