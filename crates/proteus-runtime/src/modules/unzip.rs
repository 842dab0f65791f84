//! `unzip` binding: read entries out of zip archives.
//!
//! Opening an archive from disk is tracked async work; listing and
//! decompressing entries of an opened archive are synchronous.

use std::any::Any;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;

use crate::builtins::Registration;
use crate::dispatch::{function_arg, int_arg, str_arg};
use crate::error::{ResourceError, RuntimeError, RuntimeResult};
use crate::instance::RuntimeInstance;
use crate::module::{LifecycleEvent, ModuleId, ModuleKind, ModuleNotices, NativeModule};
use crate::reactor::RequestId;
use crate::modules::node_callback;
use crate::script::{ScriptException, ScriptValue};

pub const KIND: ModuleKind = ModuleKind::new("unzip");

/// An archive held in memory.
#[derive(Debug, Clone)]
pub struct Archive {
    bytes: Arc<[u8]>,
    names: Vec<String>,
}

impl Archive {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ResourceError> {
        let bytes: Arc<[u8]> = bytes.into();
        let names = {
            let archive = zip::ZipArchive::new(Cursor::new(&bytes[..]))
                .map_err(|e| ResourceError::io(format!("invalid zip archive: {e}")))?;
            archive.file_names().map(str::to_string).collect()
        };
        Ok(Self { bytes, names })
    }

    pub fn open(path: &Path) -> Result<Self, ResourceError> {
        let bytes = std::fs::read(path).map_err(|e| ResourceError::from_io(&e, "open", path))?;
        Self::from_bytes(bytes).map_err(|e| ResourceError {
            path: Some(path.display().to_string()),
            ..e
        })
    }

    /// Entry names, in archive order.
    pub fn list_files(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|entry| entry == name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Decompress one entry.
    pub fn read_entry(&self, name: &str) -> Result<Vec<u8>, ResourceError> {
        if !self.contains(name) {
            return Err(ResourceError {
                path: Some(name.to_string()),
                ..ResourceError::new("ENOENT", format!("no such entry '{name}'"))
            });
        }
        let mut archive = zip::ZipArchive::new(Cursor::new(&self.bytes[..]))
            .map_err(|e| ResourceError::io(format!("invalid zip archive: {e}")))?;
        let mut entry = archive
            .by_name(name)
            .map_err(|e| ResourceError::io(format!("cannot read entry '{name}': {e}")))?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| ResourceError::io(format!("cannot decompress entry '{name}': {e}")))?;
        Ok(data)
    }
}

#[derive(Debug, Default)]
pub struct UnzipModule {
    releases: usize,
    next_handle: u64,
    open: HashMap<u64, Archive>,
}

impl UnzipModule {
    pub fn releases(&self) -> usize {
        self.releases
    }

    /// Archives content still holds a handle to.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    fn insert(&mut self, archive: Archive) -> u64 {
        self.next_handle += 1;
        self.open.insert(self.next_handle, archive);
        self.next_handle
    }

    pub fn archive(&self, handle: u64) -> Option<&Archive> {
        self.open.get(&handle)
    }
}

impl NativeModule for UnzipModule {
    fn kind(&self) -> ModuleKind {
        KIND
    }

    fn handle_lifecycle_event(
        &mut self,
        event: LifecycleEvent,
        _notices: &mut ModuleNotices,
    ) -> RuntimeResult<()> {
        if let LifecycleEvent::Release { .. } = event {
            self.releases += 1;
            self.open.clear();
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
    reg.register_module(Box::new(UnzipModule::default()));
    reg.function("open", "unzip.open", export_open)
        .function("listFiles", "unzip.listFiles", export_list_files)
        .function("getRawFile", "unzip.getRawFile", export_get_raw_file)
        .function("close", "unzip.close", export_close);
    Ok(())
}

fn state(instance: &mut RuntimeInstance, module: ModuleId) -> RuntimeResult<&mut UnzipModule> {
    instance
        .modules_mut()
        .get_mut::<UnzipModule>(module)
        .ok_or(RuntimeError::ModuleNotRegistered(module))
}

fn archive_handle(args: &[ScriptValue], what: &str) -> RuntimeResult<u64> {
    let handle = int_arg(args, 0, what)?;
    u64::try_from(handle).map_err(|_| RuntimeError::invalid_argument(format!("{what}: bad archive handle {handle}")))
}

/// `open(path, callback)`; the callback receives an archive handle.
fn export_open(instance: &mut RuntimeInstance, module: ModuleId, args: &[ScriptValue]) -> RuntimeResult<ScriptValue> {
    let path = str_arg(args, 0, "unzip.open")?;
    let callback = function_arg(args, 1, "unzip.open")?;
    let request = open_archive(
        instance,
        module,
        path,
        node_callback(callback, move |instance, archive: Archive| {
            match instance.modules_mut().get_mut::<UnzipModule>(module) {
                Some(state) => ScriptValue::from(json!(state.insert(archive))),
                None => ScriptValue::Undefined,
            }
        }),
    )?;
    Ok(ScriptValue::from(json!(request.as_u64())))
}

/// `listFiles(handle)`
fn export_list_files(instance: &mut RuntimeInstance, module: ModuleId, args: &[ScriptValue]) -> RuntimeResult<ScriptValue> {
    let handle = archive_handle(args, "unzip.listFiles")?;
    let archive = state(instance, module)?
        .archive(handle)
        .ok_or_else(|| RuntimeError::invalid_argument(format!("unzip.listFiles: no open archive {handle}")))?;
    Ok(ScriptValue::from(json!(archive.list_files())))
}

/// `getRawFile(handle, name)`; the entry's bytes as an array of numbers.
fn export_get_raw_file(instance: &mut RuntimeInstance, module: ModuleId, args: &[ScriptValue]) -> RuntimeResult<ScriptValue> {
    let handle = archive_handle(args, "unzip.getRawFile")?;
    let name = str_arg(args, 1, "unzip.getRawFile")?;
    let archive = state(instance, module)?
        .archive(handle)
        .ok_or_else(|| RuntimeError::invalid_argument(format!("unzip.getRawFile: no open archive {handle}")))?;
    let data = archive.read_entry(name)?;
    Ok(ScriptValue::from(json!(data)))
}

/// `close(handle)`; returns whether the handle was open.
fn export_close(instance: &mut RuntimeInstance, module: ModuleId, args: &[ScriptValue]) -> RuntimeResult<ScriptValue> {
    let handle = archive_handle(args, "unzip.close")?;
    Ok(state(instance, module)?.open.remove(&handle).is_some().into())
}

/// Read and index an archive off the main thread.
pub fn open_archive<C>(
    instance: &mut RuntimeInstance,
    module: ModuleId,
    path: impl Into<PathBuf>,
    callback: C,
) -> RuntimeResult<RequestId>
where
    C: FnOnce(&mut RuntimeInstance, Result<Archive, ResourceError>) -> Result<(), ScriptException> + 'static,
{
    match instance.modules().kind(module) {
        Some(KIND) => {}
        Some(other) => {
            return Err(RuntimeError::invalid_argument(format!(
                "{module} is a {other} module, not unzip"
            )));
        }
        None => return Err(RuntimeError::ModuleNotRegistered(module)),
    }
    let path = path.into();
    let work = async move {
        tokio::task::spawn_blocking(move || Archive::open(&path))
            .await
            .map_err(|e| ResourceError::io(format!("archive task failed: {e}")))?
    };
    instance.submit(module, "open", work, callback)
}
