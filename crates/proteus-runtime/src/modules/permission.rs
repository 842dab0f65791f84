//! `permission` binding: feature registration and permission prompts.
//!
//! Requests are forwarded to the host client as node events; the host's
//! answer comes back through [`Runtime::resolve_permission`](crate::Runtime::resolve_permission)
//! and is delivered on the main thread.

use std::any::Any;
use std::collections::HashMap;

use tracing::debug;

use crate::builtins::Registration;
use crate::dispatch::{function_arg, string_list_arg};
use crate::error::{RuntimeError, RuntimeResult};
use crate::host::{NodeEvent, PermissionTicket};
use crate::instance::RuntimeInstance;
use crate::module::{LifecycleEvent, ModuleId, ModuleKind, ModuleNotices, NativeModule};
use crate::script::{FunctionRef, ScriptException, ScriptValue};

pub const KIND: ModuleKind = ModuleKind::new("permission");

pub type PermissionCallback =
    Box<dyn FnOnce(&mut RuntimeInstance, bool) -> Result<(), ScriptException>>;

#[derive(Default)]
pub struct PermissionModule {
    next_ticket: u64,
    waiting: HashMap<u64, PermissionCallback>,
}

impl PermissionModule {
    /// Requests still waiting for the host's answer.
    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    fn take(&mut self, ticket: u64) -> Option<PermissionCallback> {
        self.waiting.remove(&ticket)
    }
}

impl NativeModule for PermissionModule {
    fn kind(&self) -> ModuleKind {
        KIND
    }

    fn handle_lifecycle_event(
        &mut self,
        event: LifecycleEvent,
        _notices: &mut ModuleNotices,
    ) -> RuntimeResult<()> {
        if let LifecycleEvent::Release { .. } = event {
            if !self.waiting.is_empty() {
                debug!(dropped = self.waiting.len(), "unanswered permission requests dropped");
            }
            self.waiting.clear();
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub(crate) fn register(reg: &mut Registration<'_>) -> RuntimeResult<()> {
    reg.register_module(Box::new(PermissionModule::default()));
    reg.function("requestPermission", "permission.requestPermission", export_request_permission)
        .function("registerFeatures", "permission.registerFeatures", export_register_features);
    Ok(())
}

/// Answer delivery that calls the content function `callback` with the
/// granted flag.
pub(crate) fn script_callback(callback: FunctionRef) -> PermissionCallback {
    Box::new(move |instance, granted| instance.call(callback, &[granted.into()]).map(|_| ()))
}

/// `requestPermission(features, callback)`; returns the ticket id.
fn export_request_permission(
    instance: &mut RuntimeInstance,
    module: ModuleId,
    args: &[ScriptValue],
) -> RuntimeResult<ScriptValue> {
    let features = string_list_arg(args, 0, "permission.requestPermission")?;
    let callback = function_arg(args, 1, "permission.requestPermission")?;
    let ticket = request_permission(instance, module, features, script_callback(callback))?;
    Ok(ScriptValue::from(serde_json::Value::from(ticket.id)))
}

fn export_register_features(
    instance: &mut RuntimeInstance,
    _module: ModuleId,
    args: &[ScriptValue],
) -> RuntimeResult<ScriptValue> {
    let features = string_list_arg(args, 0, "permission.registerFeatures")?;
    register_features(instance, features)?;
    Ok(ScriptValue::Undefined)
}

fn validate_features(features: &[String]) -> RuntimeResult<()> {
    if features.is_empty() {
        return Err(RuntimeError::invalid_argument(
            "requestPermission takes a non-empty list of features",
        ));
    }
    if features.iter().any(|feature| feature.trim().is_empty()) {
        return Err(RuntimeError::invalid_argument("feature names must not be empty"));
    }
    Ok(())
}

/// Ask the host to prompt for `features`. `callback` receives the answer.
pub fn request_permission(
    instance: &mut RuntimeInstance,
    module: ModuleId,
    features: Vec<String>,
    callback: PermissionCallback,
) -> RuntimeResult<PermissionTicket> {
    validate_features(&features)?;
    let client = instance
        .client()
        .cloned()
        .ok_or_else(|| RuntimeError::invalid_argument("instance has no host client to ask"))?;
    let owner = instance.id();
    let state = instance
        .modules_mut()
        .get_mut::<PermissionModule>(module)
        .ok_or(RuntimeError::ModuleNotRegistered(module))?;

    state.next_ticket += 1;
    let ticket = PermissionTicket {
        instance: owner,
        module,
        id: state.next_ticket,
    };
    state.waiting.insert(ticket.id, callback);
    debug!(instance = %owner, ticket = ticket.id, ?features, "permission requested");
    client.handle_node_event(owner, NodeEvent::RequestPermission { features, ticket });
    Ok(ticket)
}

/// Tell the host which privileged features the page uses.
pub fn register_features(instance: &RuntimeInstance, features: Vec<String>) -> RuntimeResult<()> {
    validate_features(&features)?;
    let client = instance
        .client()
        .ok_or_else(|| RuntimeError::invalid_argument("instance has no host client"))?;
    client.handle_node_event(instance.id(), NodeEvent::RegisterPrivilegedFeatures { features });
    Ok(())
}

/// Deliver the host's answer. Returns `Ok(false)` when the request is no
/// longer waiting (already answered or dropped by a release).
pub(crate) fn deliver(
    instance: &mut RuntimeInstance,
    ticket: PermissionTicket,
    granted: bool,
) -> RuntimeResult<Result<bool, ScriptException>> {
    let callback = instance
        .modules_mut()
        .get_mut::<PermissionModule>(ticket.module)
        .ok_or(RuntimeError::ModuleNotRegistered(ticket.module))?
        .take(ticket.id);
    let Some(callback) = callback else {
        debug!(instance = %ticket.instance, ticket = ticket.id, "stale permission answer ignored");
        return Ok(Ok(false));
    };
    Ok(callback(instance, granted).map(|()| true))
}
