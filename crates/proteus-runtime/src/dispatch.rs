//! Native entry point dispatch.
//!
//! The engine glue forwards calls of `process.*` and `process.test.*`
//! functions to [`Runtime::invoke_entry_point`], and calls of binding
//! exports (`fs.readFile`) to [`Runtime::invoke_export`]. Calls made while the
//! runtime is already dispatching (from inside a completion callback, for
//! instance) go through [`RuntimeInstance::defer`](crate::RuntimeInstance::defer)
//! and run once the current round is over.

use std::fmt;

use tracing::{debug, error, info, trace, warn};

use crate::entry::EntryPoint;
use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::InstanceId;
use crate::modules::permission;
use crate::runtime::Runtime;
use crate::script::{FunctionRef, ScriptValue};
use crate::test_status::TestStatus;

/// Target content log lines are emitted under.
pub const SCRIPT_LOG_TARGET: &str = "proteus::script";

/// Filename the service instance evaluates `runScript` sources under.
const RUN_SCRIPT_FILENAME: &str = "runScript";

impl Runtime {
    /// Call a native entry point on behalf of instance `id`, then run
    /// whatever content deferred during the call.
    pub fn invoke_entry_point(
        &mut self,
        id: InstanceId,
        entry: EntryPoint,
        args: Vec<ScriptValue>,
    ) -> RuntimeResult<ScriptValue> {
        let result = self.dispatch_entry_point(id, entry, args);
        self.flush_deferred();
        result
    }

    /// Call the native function exported as `name` by binding `binding`
    /// of instance `id`, then run whatever content deferred during the call.
    pub fn invoke_export(
        &mut self,
        id: InstanceId,
        binding: &str,
        name: &str,
        args: Vec<ScriptValue>,
    ) -> RuntimeResult<ScriptValue> {
        let exports = self.resolve_binding(id, binding)?;
        let Some(function) = exports.get(name).and_then(|value| value.as_function()) else {
            return Err(RuntimeError::invalid_argument(format!("{binding}.{name} is not a function")));
        };
        let module = exports
            .module()
            .ok_or_else(|| RuntimeError::engine(format!("{binding} has no native module")))?;
        trace!(instance = %id, function = function.name, args = args.len(), "native call");
        let result = (function.call)(self.require(id)?, module, &args);
        self.flush_deferred();
        result
    }

    pub(crate) fn dispatch_entry_point(
        &mut self,
        id: InstanceId,
        entry: EntryPoint,
        args: Vec<ScriptValue>,
    ) -> RuntimeResult<ScriptValue> {
        trace!(instance = %id, %entry, args = args.len(), "entry point");
        self.require(id)?;
        match entry {
            EntryPoint::Binding => {
                let name = str_arg(&args, 0, entry)?;
                Ok(ScriptValue::Exports(self.resolve_binding(id, name)?))
            }
            EntryPoint::HasBinding => {
                let name = str_arg(&args, 0, entry)?;
                Ok(self.has_binding(id, name)?.into())
            }
            EntryPoint::CreateExportsObject => {
                let name = args.first().and_then(ScriptValue::as_str).unwrap_or_default();
                Ok(ScriptValue::Exports(self.require(id)?.create_exports(name)))
            }
            EntryPoint::Log => {
                let priority = int_arg(&args, 0, entry)?;
                let message = str_arg(&args, 1, entry)?;
                log_script(id, priority, message);
                Ok(ScriptValue::Undefined)
            }
            EntryPoint::ReallyExit => {
                let code = args.first().and_then(ScriptValue::as_i64).unwrap_or(0);
                let instance = self.require(id)?;
                debug!(instance = %id, code, "content exited");
                if code != 0 {
                    instance.status_mut().set_status(TestStatus::Failed);
                }
                instance.test_done();
                Ok(ScriptValue::Undefined)
            }
            EntryPoint::AcquireLock => {
                let callback = function_arg(&args, 0, entry)?;
                match self.load_lock.acquire(id, callback) {
                    Some((owner, callback)) => self.run_lock_callback(owner, callback),
                    None => trace!(instance = %id, waiting = self.load_lock.waiting(), "lock busy, queued"),
                }
                Ok(ScriptValue::Undefined)
            }
            EntryPoint::ReleaseLock => {
                if let Some((owner, callback)) = self.load_lock.release()? {
                    self.run_lock_callback(owner, callback);
                }
                Ok(ScriptValue::Undefined)
            }
            EntryPoint::GetModuleUpdates => Ok(i64::from(self.update_check()).into()),
            EntryPoint::SetModuleUpdates => {
                let value = int_arg(&args, 0, entry)?;
                let value = i32::try_from(value).map_err(|_| {
                    RuntimeError::invalid_argument(format!("{entry}: {value} is out of range"))
                })?;
                self.set_update_check(value);
                Ok(ScriptValue::Undefined)
            }
            EntryPoint::RegisterPermissionFeatures => {
                let features = string_list_arg(&args, 0, entry)?;
                permission::register_features(self.require(id)?, features)?;
                Ok(ScriptValue::Undefined)
            }
            EntryPoint::RequestPermission => {
                let features = string_list_arg(&args, 0, entry)?;
                let callback = function_arg(&args, 1, entry)?;
                let module = self
                    .resolve_binding(id, permission::KIND.as_str())?
                    .module()
                    .ok_or_else(|| RuntimeError::engine("permission binding has no module"))?;
                let ticket = permission::request_permission(
                    self.require(id)?,
                    module,
                    features,
                    permission::script_callback(callback),
                )?;
                Ok(serde_json::Value::from(ticket.id).into())
            }
            EntryPoint::TestStart => {
                let label = args.first().and_then(ScriptValue::as_str);
                self.require(id)?.test_start(label);
                Ok(ScriptValue::Undefined)
            }
            EntryPoint::TestCheck => Ok(self.require(id)?.test_check().into()),
            EntryPoint::TestFail => {
                self.require(id)?.test_fail();
                Ok(ScriptValue::Undefined)
            }
            EntryPoint::TestDeleteNode => {
                self.destroy(id)?;
                Ok(ScriptValue::Undefined)
            }
            EntryPoint::TestCancelActivity => {
                let summary = self.cancel_activity(id)?;
                Ok(serde_json::Value::from(summary.cancelled).into())
            }
            EntryPoint::TestRef => {
                self.require(id)?.ref_loop();
                Ok(ScriptValue::Undefined)
            }
            EntryPoint::TestUnref => {
                self.require(id)?.unref_loop();
                Ok(ScriptValue::Undefined)
            }
            EntryPoint::TestWatcherStats => {
                let stats = self.watcher_stats();
                info!(
                    active = stats.reactor.active,
                    keep_alive = stats.reactor.keep_alive,
                    instances = stats.instances.len(),
                    "watcher stats"
                );
                Ok(serde_json::to_value(&stats)?.into())
            }
            EntryPoint::TestRunScript => {
                let source = str_arg(&args, 0, entry)?;
                self.run_script(source)
            }
        }
    }

    /// Evaluate `source` in the service instance, creating it on first use.
    /// The service instance has no host client and is never reported.
    pub fn run_script(&mut self, source: &str) -> RuntimeResult<ScriptValue> {
        let id = match self.service {
            Some(id) if self.registry.contains(id) => id,
            _ => {
                let id = self.create(None)?;
                debug!(instance = %id, "service instance created");
                self.service = Some(id);
                id
            }
        };
        let result = self.require(id)?.context_mut()?.evaluate(source, RUN_SCRIPT_FILENAME);
        result.map_err(|exception| {
            warn!(instance = %id, "{}", exception.report());
            RuntimeError::Script(exception)
        })
    }

    /// Instance that owns the service context, if one was created.
    pub fn service_instance(&self) -> Option<InstanceId> {
        self.service
    }

    pub(crate) fn run_lock_callback(&mut self, owner: InstanceId, callback: FunctionRef) {
        let Some(instance) = self.registry.get_mut(owner) else {
            warn!(instance = %owner, "lock granted to a destroyed instance");
            return;
        };
        trace!(instance = %owner, "lock granted");
        if let Err(exception) = instance.call(callback, &[]) {
            self.registry.fatal_exception(owner, exception);
        }
    }
}

/// Forward a content log line at its priority: 2 verbose through 7 fatal.
fn log_script(instance: InstanceId, priority: i64, message: &str) {
    match priority {
        i64::MIN..=2 => trace!(target: SCRIPT_LOG_TARGET, %instance, "{message}"),
        3 => debug!(target: SCRIPT_LOG_TARGET, %instance, "{message}"),
        4 => info!(target: SCRIPT_LOG_TARGET, %instance, "{message}"),
        5 => warn!(target: SCRIPT_LOG_TARGET, %instance, "{message}"),
        6 => error!(target: SCRIPT_LOG_TARGET, %instance, "{message}"),
        _ => error!(target: SCRIPT_LOG_TARGET, %instance, fatal = true, "{message}"),
    }
}

pub(crate) fn arg(args: &[ScriptValue], index: usize, what: impl fmt::Display) -> RuntimeResult<&ScriptValue> {
    args.get(index)
        .ok_or_else(|| RuntimeError::invalid_argument(format!("{what}: missing argument {index}")))
}

pub(crate) fn str_arg(args: &[ScriptValue], index: usize, what: impl fmt::Display) -> RuntimeResult<&str> {
    let value = arg(args, index, &what)?;
    value
        .as_str()
        .ok_or_else(|| RuntimeError::invalid_argument(format!("{what}: argument {index} must be a string")))
}

pub(crate) fn int_arg(args: &[ScriptValue], index: usize, what: impl fmt::Display) -> RuntimeResult<i64> {
    let value = arg(args, index, &what)?;
    value
        .as_i64()
        .ok_or_else(|| RuntimeError::invalid_argument(format!("{what}: argument {index} must be an integer")))
}

/// Missing or non-boolean arguments read as `false`.
pub(crate) fn bool_arg(args: &[ScriptValue], index: usize) -> bool {
    args.get(index)
        .and_then(ScriptValue::as_json)
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
}

pub(crate) fn function_arg(args: &[ScriptValue], index: usize, what: impl fmt::Display) -> RuntimeResult<FunctionRef> {
    let value = arg(args, index, &what)?;
    value
        .as_function()
        .ok_or_else(|| RuntimeError::invalid_argument(format!("{what}: argument {index} must be a function")))
}

pub(crate) fn string_list_arg(
    args: &[ScriptValue],
    index: usize,
    what: impl fmt::Display,
) -> RuntimeResult<Vec<String>> {
    let invalid = || RuntimeError::invalid_argument(format!("{what}: argument {index} must be a list of strings"));
    let list = arg(args, index, &what)?
        .as_json()
        .and_then(serde_json::Value::as_array)
        .ok_or_else(invalid)?;
    list.iter()
        .map(|item| item.as_str().map(str::to_string).ok_or_else(invalid))
        .collect()
}
