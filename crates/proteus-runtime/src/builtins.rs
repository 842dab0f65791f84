//! Static table of built-in native modules.
//!
//! Built once when the runtime starts and consulted through
//! [`BuiltinTable::lookup`]. Embedders add their own entries through
//! [`RuntimeBuilder::builtin`](crate::RuntimeBuilder::builtin).

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::error::RuntimeResult;
use crate::instance::{ExportValue, Exports, InstanceId, NativeFn, NativeFunction, RuntimeInstance};
use crate::module::{ModuleId, NativeModule};
use crate::modules;

/// Registration function of a built-in module.
pub type RegisterFn = fn(&mut Registration<'_>) -> RuntimeResult<()>;

/// One entry of the built-in table.
#[derive(Clone, Copy)]
pub struct BuiltinModule {
    pub name: &'static str,
    pub register: RegisterFn,
}

impl fmt::Debug for BuiltinModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuiltinModule").field("name", &self.name).finish()
    }
}

/// Built-ins every runtime starts with.
pub const DEFAULT_BUILTINS: &[BuiltinModule] = &[
    BuiltinModule {
        name: "constants",
        register: modules::constants::register,
    },
    BuiltinModule {
        name: "fs",
        register: modules::fs::register,
    },
    BuiltinModule {
        name: "permission",
        register: modules::permission::register,
    },
    BuiltinModule {
        name: "unzip",
        register: modules::unzip::register,
    },
];

#[derive(Debug, Clone)]
pub struct BuiltinTable {
    entries: BTreeMap<&'static str, BuiltinModule>,
}

impl BuiltinTable {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut table = Self::empty();
        for builtin in DEFAULT_BUILTINS {
            table.insert(*builtin);
        }
        table
    }

    /// Add or replace an entry.
    pub fn insert(&mut self, builtin: BuiltinModule) {
        self.entries.insert(builtin.name, builtin);
    }

    pub fn lookup(&self, name: &str) -> Option<&BuiltinModule> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for BuiltinTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// What a registration function gets to work with.
pub struct Registration<'a> {
    instance: &'a mut RuntimeInstance,
    exports: &'a Rc<Exports>,
}

impl<'a> Registration<'a> {
    pub(crate) fn new(instance: &'a mut RuntimeInstance, exports: &'a Rc<Exports>) -> Self {
        Self { instance, exports }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance.id()
    }

    pub fn instance(&mut self) -> &mut RuntimeInstance {
        &mut *self.instance
    }

    pub fn exports(&self) -> &Rc<Exports> {
        self.exports
    }

    /// Register a native module with the instance and tag the exports
    /// with it.
    pub fn register_module(&mut self, module: Box<dyn NativeModule>) -> ModuleId {
        let id = self.instance.modules_mut().register(module);
        self.exports.set_module(id);
        id
    }

    /// Export `call` as `name`; `qualified` names it in diagnostics.
    pub fn function(&mut self, name: &'static str, qualified: &'static str, call: NativeFn) -> &mut Self {
        self.exports.set(
            name,
            ExportValue::Function(NativeFunction {
                name: qualified,
                call,
            }),
        );
        self
    }

    pub fn value(&mut self, name: &str, value: serde_json::Value) -> &mut Self {
        self.exports.set(name, ExportValue::Value(value));
        self
    }
}
