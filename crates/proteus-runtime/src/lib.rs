//! proteus-runtime - embedded scripting runtime core for the proteus browser shell.
//!
//! Each page that enables scripting gets its own runtime instance: an
//! isolated engine context with native modules (`fs`, `unzip`,
//! `permission`, `constants`) resolved on demand. Native module work runs
//! on a background reactor; completions are handed to the host's main
//! thread one round at a time and dispatched there.
//!
//! # Features
//!
//! - **Instance lifecycle**: create, bootstrap, destroy with full release
//!   of in-flight work
//! - **Binding cache**: each built-in registers at most once per instance
//! - **Cancellation**: requests cancelled by a release never call back
//! - **Test status**: per-instance unit-of-work tracking and reporting
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use proteus_runtime::{Runtime, RuntimeConfig};
//!
//! let mut runtime = Runtime::new(Box::new(MyEngine::new()), RuntimeConfig::default())?;
//! let page = runtime.create(Some(client))?;
//! let fs = runtime.resolve_binding(page, "fs")?;
//! // ... content submits work ...
//! let pump = runtime.run_until_idle(Duration::from_secs(5));
//! for report in pump.reports {
//!     println!("{report}");
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────── main thread ────────────────────────┐
//! │  Runtime                                                    │
//! │  ┌───────────────┐  ┌──────────┐  ┌──────────────────────┐  │
//! │  │GlobalRegistry │  │ LoadLock │  │ entry point dispatch │  │
//! │  │ node#1 node#2 │  └──────────┘  └──────────────────────┘  │
//! │  └───────────────┘                                          │
//! │   each RuntimeInstance: context, binding cache,             │
//! │   ModuleRegistry (module + PendingRequestTracker), status   │
//! └──────────────↑──────────────────────────────┬───────────────┘
//!                │ HandoffCode '0' '1' '2'      │ submit
//!                │ + WorkSignal ack             ↓
//! ┌──────────────┴─────── proteus-event ───┐  ┌──────────────────┐
//! │  EventThreadBridge                     │←─│ Reactor          │
//! │  holds the signal lock, parks per round│  │ tokio proteus-io │
//! └────────────────────────────────────────┘  └──────────────────┘
//! ```

pub mod bridge;
pub mod builtins;
pub mod config;
mod dispatch;
pub mod entry;
pub mod error;
pub mod host;
pub mod instance;
pub mod lock;
pub mod module;
pub mod modules;
pub mod pending;
pub mod reactor;
pub mod registry;
pub mod runtime;
pub mod script;
pub mod signal;
pub mod test_status;

pub use builtins::{BuiltinModule, BuiltinTable, DEFAULT_BUILTINS, RegisterFn, Registration};
pub use config::RuntimeConfig;
pub use dispatch::SCRIPT_LOG_TARGET;
pub use entry::EntryPoint;
pub use error::{ResourceError, RuntimeError, RuntimeResult};
pub use host::{HostClient, HostWaker, NodeEvent, PermissionTicket};
pub use instance::{ExportValue, Exports, InstanceId, NativeFn, NativeFunction, RuntimeInstance};
pub use lock::LoadLock;
pub use module::{
    HostEvent, LifecycleEvent, ModuleId, ModuleKind, ModuleNotices, ModuleRegistry, NativeModule,
    ReleaseSummary,
};
pub use pending::{Claim, PendingRequestTracker};
pub use reactor::{CancelOutcome, Reactor, ReactorStats, RequestId, RequestKey};
pub use registry::GlobalRegistry;
pub use runtime::{
    InstanceWatchers, PumpReport, Runtime, RuntimeBuilder, WatcherStatsSnapshot,
};
pub use script::{
    ContextHandle, FunctionRef, ObjectRef, ProcessInfo, ScriptContext, ScriptEngine,
    ScriptException, ScriptValue,
};
pub use signal::{HandoffCode, SignalState, WorkSignal};
pub use test_status::{TestReport, TestState, TestStatus, TestStatusTracker};

pub mod prelude {
    pub use crate::config::RuntimeConfig;
    pub use crate::entry::EntryPoint;
    pub use crate::error::{ResourceError, RuntimeError, RuntimeResult};
    pub use crate::host::{HostClient, NodeEvent};
    pub use crate::instance::{InstanceId, RuntimeInstance};
    pub use crate::runtime::{PumpReport, Runtime, RuntimeBuilder};
    pub use crate::script::{ScriptContext, ScriptEngine, ScriptException, ScriptValue};
    pub use crate::test_status::{TestReport, TestStatus};
}
