//! Contract with the scripting engine.
//!
//! The runtime treats the engine as opaque: it creates isolated contexts,
//! evaluates source, calls functions, and emits events on the process
//! object. Engine values cross the boundary as [`ScriptValue`]; functions
//! and objects stay inside the engine and are referred to by handle.

use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;

use thiserror::Error;

use crate::entry::EntryPoint;
use crate::instance::{Exports, InstanceId};

/// Handle to an engine context (an instance's own, or the host page's).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextHandle(pub u64);

/// Handle to a function living in an engine context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionRef(pub u64);

/// Handle to an object living in an engine context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(pub u64);

impl fmt::Display for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// What the process object exposes to content.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub instance: InstanceId,
    /// URL of the host page; `None` for client-less instances.
    pub url: Option<String>,
    pub app_path: Option<PathBuf>,
    pub download_path: Option<PathBuf>,
    pub is_browser: bool,
    /// Native functions bound to `instance`.
    pub entry_points: &'static [EntryPoint],
}

/// Value passed between the runtime and the engine.
#[derive(Debug, Clone)]
pub enum ScriptValue {
    Undefined,
    Json(serde_json::Value),
    Function(FunctionRef),
    Object(ObjectRef),
    Exports(Rc<Exports>),
}

impl ScriptValue {
    pub fn str(value: &str) -> Self {
        Self::Json(serde_json::Value::from(value))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Json(value) => value.as_str(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Json(value) => value.as_i64(),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<FunctionRef> {
        match self {
            Self::Function(function) => Some(*function),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_exports(&self) -> Option<&Rc<Exports>> {
        match self {
            Self::Exports(exports) => Some(exports),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }
}

impl From<serde_json::Value> for ScriptValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl From<bool> for ScriptValue {
    fn from(value: bool) -> Self {
        Self::Json(value.into())
    }
}

impl From<i64> for ScriptValue {
    fn from(value: i64) -> Self {
        Self::Json(value.into())
    }
}

/// Exception thrown inside an engine context.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{name}: {message}")]
pub struct ScriptException {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    /// The thrown value, when it is an engine object.
    pub thrown: Option<ObjectRef>,
}

impl ScriptException {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            thrown: None,
        }
    }

    /// Create a plain `Error`
    pub fn error(message: impl Into<String>) -> Self {
        Self::new("Error", message)
    }

    /// Create a `TypeError`
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Value handed to `uncaughtException` listeners.
    pub fn to_value(&self) -> ScriptValue {
        match self.thrown {
            Some(object) => ScriptValue::Object(object),
            None => ScriptValue::Json(serde_json::json!({
                "name": self.name,
                "message": self.message,
                "stack": self.stack,
            })),
        }
    }

    /// Text printed when the exception is reported.
    pub fn report(&self) -> String {
        match &self.stack {
            Some(stack) => stack.clone(),
            None => self.to_string(),
        }
    }
}

/// Creates isolated execution contexts.
pub trait ScriptEngine {
    /// Create a fresh context, optionally attached to a host page context.
    fn create_context(
        &mut self,
        host: Option<ContextHandle>,
    ) -> Result<Box<dyn ScriptContext>, ScriptException>;
}

/// One isolated execution context. Only ever entered on the main thread.
pub trait ScriptContext {
    fn handle(&self) -> ContextHandle;

    /// Create the process object described by `process`, with its entry
    /// points installed as native functions, and return it.
    fn create_process_object(&mut self, process: &ProcessInfo) -> Result<ScriptValue, ScriptException>;

    fn evaluate(&mut self, source: &str, filename: &str) -> Result<ScriptValue, ScriptException>;

    fn call(&mut self, function: FunctionRef, args: &[ScriptValue])
    -> Result<ScriptValue, ScriptException>;

    /// Emit `event` on the process object.
    fn emit(&mut self, event: &str, args: &[ScriptValue]) -> Result<(), ScriptException>;

    /// Listeners registered for `event` on the process object.
    fn listener_count(&self, event: &str) -> usize;

    fn remove_all_listeners(&mut self);

    /// Drop the persistent handle the engine keeps for `value`.
    fn release(&mut self, _value: &ScriptValue) {}

    /// Release the context and the host context handle it holds.
    fn dispose(&mut self);
}
