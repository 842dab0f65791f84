//! `fs` binding: asynchronous file operations on the reactor.
//!
//! Every operation is tracked by the module's request tracker. Releasing
//! the module cancels whatever is still in flight and emits one
//! `fsWatcherCancelled` event per cancelled request.

use std::any::Any;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use serde::Serialize;
use serde_json::json;

use crate::builtins::Registration;
use crate::dispatch::{bool_arg, function_arg, str_arg};
use crate::error::{ResourceError, RuntimeError, RuntimeResult};
use crate::instance::RuntimeInstance;
use crate::module::{LifecycleEvent, ModuleId, ModuleKind, ModuleNotices, NativeModule};
use crate::reactor::RequestId;
use crate::modules::node_callback;
use crate::script::{ScriptException, ScriptValue};

pub const KIND: ModuleKind = ModuleKind::new("fs");

/// Emitted into the instance for each request cancelled by a release.
pub const WATCHER_CANCELLED: &str = "fsWatcherCancelled";

#[derive(Debug, Default)]
pub struct FsModule {
    releases: usize,
    cancelled: usize,
}

impl FsModule {
    pub fn releases(&self) -> usize {
        self.releases
    }

    /// Requests cancelled across all releases.
    pub fn cancelled(&self) -> usize {
        self.cancelled
    }
}

impl NativeModule for FsModule {
    fn kind(&self) -> ModuleKind {
        KIND
    }

    fn handle_lifecycle_event(
        &mut self,
        event: LifecycleEvent,
        notices: &mut ModuleNotices,
    ) -> RuntimeResult<()> {
        if let LifecycleEvent::Release { cancelled } = event {
            self.releases += 1;
            self.cancelled += cancelled;
            for _ in 0..cancelled {
                notices.emit(WATCHER_CANCELLED);
            }
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
    reg.register_module(Box::new(FsModule::default()));
    reg.function("readFile", "fs.readFile", export_read_file)
        .function("writeFile", "fs.writeFile", export_write_file)
        .function("stat", "fs.stat", export_stat)
        .function("mkdir", "fs.mkdir", export_mkdir)
        .function("rmdir", "fs.rmdir", export_rmdir)
        .function("readdir", "fs.readdir", export_readdir)
        .function("unlink", "fs.unlink", export_unlink)
        .function("rename", "fs.rename", export_rename)
        .function("release", "fs.release", export_release);
    Ok(())
}

fn request_value(request: RequestId) -> RuntimeResult<ScriptValue> {
    Ok(ScriptValue::from(json!(request.as_u64())))
}

fn done(_: &mut RuntimeInstance, (): ()) -> ScriptValue {
    ScriptValue::Undefined
}

/// `readFile(path, callback)`; the contents arrive as UTF-8 text.
fn export_read_file(instance: &mut RuntimeInstance, module: ModuleId, args: &[ScriptValue]) -> RuntimeResult<ScriptValue> {
    let path = str_arg(args, 0, "fs.readFile")?;
    let callback = function_arg(args, 1, "fs.readFile")?;
    let request = read_file(
        instance,
        module,
        path,
        node_callback(callback, |_, data: Vec<u8>| {
            ScriptValue::str(&String::from_utf8_lossy(&data))
        }),
    )?;
    request_value(request)
}

/// `writeFile(path, text, callback)`
fn export_write_file(instance: &mut RuntimeInstance, module: ModuleId, args: &[ScriptValue]) -> RuntimeResult<ScriptValue> {
    let path = str_arg(args, 0, "fs.writeFile")?;
    let data = str_arg(args, 1, "fs.writeFile")?.as_bytes().to_vec();
    let callback = function_arg(args, 2, "fs.writeFile")?;
    let request = write_file(instance, module, path, data, node_callback(callback, done))?;
    request_value(request)
}

fn export_stat(instance: &mut RuntimeInstance, module: ModuleId, args: &[ScriptValue]) -> RuntimeResult<ScriptValue> {
    let path = str_arg(args, 0, "fs.stat")?;
    let callback = function_arg(args, 1, "fs.stat")?;
    let request = stat(
        instance,
        module,
        path,
        node_callback(callback, |_, stat: FileStat| {
            serde_json::to_value(&stat).map_or(ScriptValue::Undefined, ScriptValue::Json)
        }),
    )?;
    request_value(request)
}

/// `mkdir(path, recursive, callback)`
fn export_mkdir(instance: &mut RuntimeInstance, module: ModuleId, args: &[ScriptValue]) -> RuntimeResult<ScriptValue> {
    let path = str_arg(args, 0, "fs.mkdir")?;
    let recursive = bool_arg(args, 1);
    let callback = function_arg(args, 2, "fs.mkdir")?;
    let request = mkdir(instance, module, path, recursive, node_callback(callback, done))?;
    request_value(request)
}

fn export_rmdir(instance: &mut RuntimeInstance, module: ModuleId, args: &[ScriptValue]) -> RuntimeResult<ScriptValue> {
    let path = str_arg(args, 0, "fs.rmdir")?;
    let callback = function_arg(args, 1, "fs.rmdir")?;
    let request = rmdir(instance, module, path, node_callback(callback, done))?;
    request_value(request)
}

fn export_readdir(instance: &mut RuntimeInstance, module: ModuleId, args: &[ScriptValue]) -> RuntimeResult<ScriptValue> {
    let path = str_arg(args, 0, "fs.readdir")?;
    let callback = function_arg(args, 1, "fs.readdir")?;
    let request = readdir(
        instance,
        module,
        path,
        node_callback(callback, |_, names: Vec<String>| ScriptValue::from(json!(names))),
    )?;
    request_value(request)
}

fn export_unlink(instance: &mut RuntimeInstance, module: ModuleId, args: &[ScriptValue]) -> RuntimeResult<ScriptValue> {
    let path = str_arg(args, 0, "fs.unlink")?;
    let callback = function_arg(args, 1, "fs.unlink")?;
    let request = unlink(instance, module, path, node_callback(callback, done))?;
    request_value(request)
}

/// `rename(from, to, callback)`
fn export_rename(instance: &mut RuntimeInstance, module: ModuleId, args: &[ScriptValue]) -> RuntimeResult<ScriptValue> {
    let from = str_arg(args, 0, "fs.rename")?;
    let to = str_arg(args, 1, "fs.rename")?;
    let callback = function_arg(args, 2, "fs.rename")?;
    let request = rename(instance, module, from, to, node_callback(callback, done))?;
    request_value(request)
}

/// `release()`; returns the number of cancelled requests.
fn export_release(instance: &mut RuntimeInstance, module: ModuleId, _args: &[ScriptValue]) -> RuntimeResult<ScriptValue> {
    Ok(ScriptValue::from(json!(release(instance, module)?)))
}

/// Result of [`stat`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStat {
    pub size: u64,
    pub is_file: bool,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub mode: u32,
    pub mtime_ms: Option<u64>,
}

impl FileStat {
    fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            metadata.permissions().mode()
        };
        #[cfg(not(unix))]
        let mode = if metadata.permissions().readonly() { 0o444 } else { 0o666 };

        Self {
            size: metadata.len(),
            is_file: metadata.is_file(),
            is_dir: metadata.is_dir(),
            is_symlink: metadata.file_type().is_symlink(),
            mode,
            mtime_ms: metadata
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|elapsed| elapsed.as_millis() as u64),
        }
    }
}

fn expect_fs(instance: &RuntimeInstance, module: ModuleId) -> RuntimeResult<()> {
    match instance.modules().kind(module) {
        Some(KIND) => Ok(()),
        Some(other) => Err(RuntimeError::invalid_argument(format!(
            "{module} is a {other} module, not fs"
        ))),
        None => Err(RuntimeError::ModuleNotRegistered(module)),
    }
}

pub fn read_file<C>(
    instance: &mut RuntimeInstance,
    module: ModuleId,
    path: impl Into<PathBuf>,
    callback: C,
) -> RuntimeResult<RequestId>
where
    C: FnOnce(&mut RuntimeInstance, Result<Vec<u8>, ResourceError>) -> Result<(), ScriptException> + 'static,
{
    expect_fs(instance, module)?;
    let path = path.into();
    let work = async move {
        tokio::fs::read(&path)
            .await
            .map_err(|e| ResourceError::from_io(&e, "open", &path))
    };
    instance.submit(module, "readFile", work, callback)
}

pub fn write_file<C>(
    instance: &mut RuntimeInstance,
    module: ModuleId,
    path: impl Into<PathBuf>,
    data: Vec<u8>,
    callback: C,
) -> RuntimeResult<RequestId>
where
    C: FnOnce(&mut RuntimeInstance, Result<(), ResourceError>) -> Result<(), ScriptException> + 'static,
{
    expect_fs(instance, module)?;
    let path = path.into();
    let work = async move {
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| ResourceError::from_io(&e, "write", &path))
    };
    instance.submit(module, "writeFile", work, callback)
}

pub fn stat<C>(
    instance: &mut RuntimeInstance,
    module: ModuleId,
    path: impl Into<PathBuf>,
    callback: C,
) -> RuntimeResult<RequestId>
where
    C: FnOnce(&mut RuntimeInstance, Result<FileStat, ResourceError>) -> Result<(), ScriptException> + 'static,
{
    expect_fs(instance, module)?;
    let path = path.into();
    let work = async move {
        tokio::fs::symlink_metadata(&path)
            .await
            .map(|metadata| FileStat::from_metadata(&metadata))
            .map_err(|e| ResourceError::from_io(&e, "stat", &path))
    };
    instance.submit(module, "stat", work, callback)
}

pub fn mkdir<C>(
    instance: &mut RuntimeInstance,
    module: ModuleId,
    path: impl Into<PathBuf>,
    recursive: bool,
    callback: C,
) -> RuntimeResult<RequestId>
where
    C: FnOnce(&mut RuntimeInstance, Result<(), ResourceError>) -> Result<(), ScriptException> + 'static,
{
    expect_fs(instance, module)?;
    let path = path.into();
    let work = async move {
        let result = if recursive {
            tokio::fs::create_dir_all(&path).await
        } else {
            tokio::fs::create_dir(&path).await
        };
        result.map_err(|e| ResourceError::from_io(&e, "mkdir", &path))
    };
    instance.submit(module, "mkdir", work, callback)
}

pub fn rmdir<C>(
    instance: &mut RuntimeInstance,
    module: ModuleId,
    path: impl Into<PathBuf>,
    callback: C,
) -> RuntimeResult<RequestId>
where
    C: FnOnce(&mut RuntimeInstance, Result<(), ResourceError>) -> Result<(), ScriptException> + 'static,
{
    expect_fs(instance, module)?;
    let path = path.into();
    let work = async move {
        tokio::fs::remove_dir(&path)
            .await
            .map_err(|e| ResourceError::from_io(&e, "rmdir", &path))
    };
    instance.submit(module, "rmdir", work, callback)
}

/// Entry names of a directory, sorted.
pub fn readdir<C>(
    instance: &mut RuntimeInstance,
    module: ModuleId,
    path: impl Into<PathBuf>,
    callback: C,
) -> RuntimeResult<RequestId>
where
    C: FnOnce(&mut RuntimeInstance, Result<Vec<String>, ResourceError>) -> Result<(), ScriptException> + 'static,
{
    expect_fs(instance, module)?;
    let path = path.into();
    let work = async move {
        let mut dir = tokio::fs::read_dir(&path)
            .await
            .map_err(|e| ResourceError::from_io(&e, "scandir", &path))?;
        let mut names = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| ResourceError::from_io(&e, "scandir", &path))?
        {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    };
    instance.submit(module, "readdir", work, callback)
}

pub fn unlink<C>(
    instance: &mut RuntimeInstance,
    module: ModuleId,
    path: impl Into<PathBuf>,
    callback: C,
) -> RuntimeResult<RequestId>
where
    C: FnOnce(&mut RuntimeInstance, Result<(), ResourceError>) -> Result<(), ScriptException> + 'static,
{
    expect_fs(instance, module)?;
    let path = path.into();
    let work = async move {
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| ResourceError::from_io(&e, "unlink", &path))
    };
    instance.submit(module, "unlink", work, callback)
}

pub fn rename<C>(
    instance: &mut RuntimeInstance,
    module: ModuleId,
    from: impl Into<PathBuf>,
    to: impl Into<PathBuf>,
    callback: C,
) -> RuntimeResult<RequestId>
where
    C: FnOnce(&mut RuntimeInstance, Result<(), ResourceError>) -> Result<(), ScriptException> + 'static,
{
    expect_fs(instance, module)?;
    let from = from.into();
    let to = to.into();
    let work = async move {
        tokio::fs::rename(&from, &to)
            .await
            .map_err(|e| ResourceError::from_io(&e, "rename", &from))
    };
    instance.submit(module, "rename", work, callback)
}

/// Cancel everything the module has in flight. Returns the number of
/// cancelled requests; a second call returns 0.
pub fn release(instance: &mut RuntimeInstance, module: ModuleId) -> RuntimeResult<usize> {
    expect_fs(instance, module)?;
    let summary = instance.modules_mut().release(module)?;
    for event in &summary.notices {
        instance.emit_event(event);
    }
    Ok(summary.cancelled)
}
