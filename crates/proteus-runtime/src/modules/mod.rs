//! Built-in native modules.

pub mod constants;
pub mod fs;
pub mod permission;
pub mod unzip;

use crate::error::ResourceError;
use crate::instance::RuntimeInstance;
use crate::script::{FunctionRef, ScriptException, ScriptValue};

/// Completion callback that calls the content function `callback` node
/// style: `callback(error)` on failure, `callback(null, value)` on success.
pub(crate) fn node_callback<T>(
    callback: FunctionRef,
    to_value: impl FnOnce(&mut RuntimeInstance, T) -> ScriptValue + 'static,
) -> impl FnOnce(&mut RuntimeInstance, Result<T, ResourceError>) -> Result<(), ScriptException> + 'static
where
    T: 'static,
{
    move |instance, result| {
        let args = match result {
            Ok(value) => vec![ScriptValue::Json(serde_json::Value::Null), to_value(instance, value)],
            Err(error) => vec![error.to_value()],
        };
        instance.call(callback, &args).map(|_| ())
    }
}
