//! Error types for proteus-runtime
//!
//! Script-level failures, resource failures from native module work, and
//! core errors share one enum. Broken core invariants are not errors: they
//! go through [`protocol_violation`].

use std::fmt;
use std::io;
use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::instance::InstanceId;
use crate::module::ModuleId;
use crate::script::{ScriptException, ScriptValue};

/// Errors that can occur during runtime operations
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Name did not match any cached binding or built-in module
    #[error("No such module: {0}")]
    ModuleNotFound(String),

    /// Bootstrap program threw or did not yield the module loader
    #[error("Bootstrap failed: {reason}")]
    BootstrapFailure { reason: String },

    /// Uncaught exception raised by the script engine
    #[error(transparent)]
    Script(#[from] ScriptException),

    /// Native work failed
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// Handle refers to an instance that was destroyed (or never existed)
    #[error("Runtime instance {0} does not exist")]
    InstanceNotFound(InstanceId),

    /// Module handle is not registered with the instance
    #[error("Module {0} is not registered with this instance")]
    ModuleNotRegistered(ModuleId),

    /// Host context already has a runtime instance attached
    #[error("Host context already has runtime instance {0}")]
    DuplicateInstance(InstanceId),

    /// Content passed arguments the entry point cannot use
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// `releaseLock` without a matching `acquireLock`
    #[error("Called without calling Acquire")]
    LockNotHeld,

    /// Engine refused to create or set up a context
    #[error("Engine error: {0}")]
    Engine(String),

    /// Reactor was shut down and cannot accept work
    #[error("Reactor is shut down")]
    ReactorUnavailable,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl RuntimeError {
    /// Create a bootstrap failure
    pub fn bootstrap(reason: impl Into<String>) -> Self {
        Self::BootstrapFailure {
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create an engine error
    pub fn engine(message: impl fmt::Display) -> Self {
        Self::Engine(message.to_string())
    }
}

/// Result type alias for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Structured failure delivered to a module callback.
///
/// Mirrors the errno exception shape content already understands:
/// `code` is the errno name, `syscall` and `path` are filled in when known.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{code}, {message}")]
pub struct ResourceError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub syscall: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl ResourceError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            syscall: None,
            path: None,
        }
    }

    /// Build from an I/O error raised by `syscall` on `path`.
    pub fn from_io(err: &io::Error, syscall: &str, path: &Path) -> Self {
        let path = path.display().to_string();
        Self {
            code: errno_code(err),
            message: format!("{} '{}'", describe(err), path),
            syscall: Some(syscall.to_string()),
            path: Some(path),
        }
    }

    /// The request was cancelled before it completed.
    pub fn cancelled() -> Self {
        Self::new("ECANCELED", "operation canceled")
    }

    /// Catch-all for failures that have no errno.
    pub fn io(message: impl Into<String>) -> Self {
        Self::new("EIO", message)
    }

    pub fn is_not_found(&self) -> bool {
        self.code == "ENOENT"
    }

    /// The error object handed to content callbacks.
    pub fn to_value(&self) -> ScriptValue {
        ScriptValue::Json(serde_json::json!({
            "code": self.code,
            "message": self.to_string(),
            "syscall": self.syscall,
            "path": self.path,
        }))
    }
}

fn errno_code(err: &io::Error) -> &'static str {
    match err.kind() {
        io::ErrorKind::NotFound => "ENOENT",
        io::ErrorKind::AlreadyExists => "EEXIST",
        io::ErrorKind::PermissionDenied => "EACCES",
        io::ErrorKind::NotADirectory => "ENOTDIR",
        io::ErrorKind::IsADirectory => "EISDIR",
        io::ErrorKind::DirectoryNotEmpty => "ENOTEMPTY",
        _ => "EIO",
    }
}

fn describe(err: &io::Error) -> &'static str {
    match err.kind() {
        io::ErrorKind::NotFound => "no such file or directory",
        io::ErrorKind::AlreadyExists => "file already exists",
        io::ErrorKind::PermissionDenied => "permission denied",
        io::ErrorKind::NotADirectory => "not a directory",
        io::ErrorKind::IsADirectory => "illegal operation on a directory",
        io::ErrorKind::DirectoryNotEmpty => "directory not empty",
        _ => "i/o error",
    }
}

/// Report a broken core invariant.
///
/// Aborts (panics) in debug builds, logs and continues in release builds.
#[track_caller]
pub(crate) fn protocol_violation(what: impl fmt::Display) {
    tracing::error!(violation = %what, "*** protocol violation ***");
    if cfg!(debug_assertions) {
        panic!("protocol violation: {what}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_error_from_io() {
        let err = io::Error::from(io::ErrorKind::NotFound);
        let resource = ResourceError::from_io(&err, "open", Path::new("/missing"));
        assert_eq!(resource.code, "ENOENT");
        assert!(resource.is_not_found());
        assert_eq!(resource.syscall.as_deref(), Some("open"));
        assert_eq!(resource.to_string(), "ENOENT, no such file or directory '/missing'");
    }

    #[test]
    fn test_resource_error_serializes_without_empty_fields() {
        let value = serde_json::to_value(ResourceError::cancelled()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"code": "ECANCELED", "message": "operation canceled"})
        );
    }

    #[test]
    fn test_runtime_error_display() {
        assert_eq!(
            RuntimeError::ModuleNotFound("nope".into()).to_string(),
            "No such module: nope"
        );
        assert_eq!(
            RuntimeError::bootstrap("threw").to_string(),
            "Bootstrap failed: threw"
        );
    }
}
