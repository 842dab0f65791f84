//! Integration tests for instance lifecycle and binding resolution

mod common;

use std::any::Any;
use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use common::{BootstrapMode, FakeEngine, RecordingHost, context_of, runtime_with, test_config};
use proteus_runtime::{
    BuiltinModule, ContextHandle, HostEvent, LifecycleEvent, ModuleId, ModuleKind, ModuleNotices,
    NativeModule, Registration, ResourceError, Runtime, RuntimeError, RuntimeInstance,
    RuntimeResult, ScriptValue, TestState, TestStatus,
};

thread_local! {
    static REGISTRATIONS: Cell<usize> = const { Cell::new(0) };
    static RELEASES: Cell<usize> = const { Cell::new(0) };
    static CANCELLED: Cell<usize> = const { Cell::new(0) };
    static HOST_EVENTS: Cell<usize> = const { Cell::new(0) };
}

/// Module whose work never finishes on its own.
struct SlowModule;

impl NativeModule for SlowModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::new("slow")
    }

    fn handle_lifecycle_event(
        &mut self,
        event: LifecycleEvent,
        _notices: &mut ModuleNotices,
    ) -> RuntimeResult<()> {
        match event {
            LifecycleEvent::Release { cancelled } => {
                RELEASES.with(|r| r.set(r.get() + 1));
                CANCELLED.with(|c| c.set(c.get() + cancelled));
            }
            LifecycleEvent::Host(_) => HOST_EVENTS.with(|h| h.set(h.get() + 1)),
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

fn register_slow(reg: &mut Registration<'_>) -> RuntimeResult<()> {
    REGISTRATIONS.with(|r| r.set(r.get() + 1));
    reg.register_module(Box::new(SlowModule));
    reg.function("wait", "slow.wait", slow_wait);
    Ok(())
}

fn slow_wait(_: &mut RuntimeInstance, _: ModuleId, _: &[ScriptValue]) -> RuntimeResult<ScriptValue> {
    Ok(ScriptValue::Undefined)
}

/// Registers its module, then fails.
fn register_broken(reg: &mut Registration<'_>) -> RuntimeResult<()> {
    reg.register_module(Box::new(SlowModule));
    Err(RuntimeError::invalid_argument("broken builtin"))
}

fn runtime_with_slow(engine: &FakeEngine) -> Runtime {
    Runtime::builder()
        .config(test_config())
        .builtin(BuiltinModule { name: "slow_a", register: register_slow })
        .builtin(BuiltinModule { name: "slow_b", register: register_slow })
        .build(Box::new(engine.clone()))
        .unwrap()
}

#[test]
fn test_create_and_destroy() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with(&engine);
    let host = RecordingHost::new("file:///page.html");

    let id = runtime.create(Some(host.clone())).unwrap();
    assert!(runtime.registry().contains(id));
    assert_eq!(engine.state().entry_points, proteus_runtime::EntryPoint::ALL.len());
    let context = context_of(&runtime, id);

    runtime.destroy(id).unwrap();
    assert!(!runtime.registry().contains(id));
    assert!(engine.is_disposed(context));
    assert_eq!(engine.count_emitted(context, "exit"), 1);
    assert_eq!(*host.destroyed.borrow(), vec![id]);

    let reports = host.reports.borrow();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].label, "file:///page.html");
    assert_eq!(reports[0].status, TestStatus::Passed);
}

#[test]
fn test_process_object_carries_config() {
    let engine = FakeEngine::new();
    let config = test_config()
        .is_browser(false)
        .app_path("/opt/app")
        .download_path("/tmp/downloads");
    let mut runtime = Runtime::new(Box::new(engine.clone()), config).unwrap();

    let id = runtime.create(Some(RecordingHost::new("file:///page.html"))).unwrap();
    let process = engine.state().process.clone().unwrap();
    assert_eq!(process.instance, id);
    assert_eq!(process.url.as_deref(), Some("file:///page.html"));
    assert_eq!(process.app_path, Some(PathBuf::from("/opt/app")));
    assert_eq!(process.download_path, Some(PathBuf::from("/tmp/downloads")));
    assert!(!process.is_browser);

    let bare = runtime.create(None).unwrap();
    let process = engine.state().process.clone().unwrap();
    assert_eq!(process.instance, bare);
    assert_eq!(process.url, None);
}

#[test]
fn test_ids_are_never_reused() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with(&engine);

    let first = runtime.create(None).unwrap();
    runtime.destroy(first).unwrap();
    let second = runtime.create(None).unwrap();
    assert!(second > first);
    assert!(matches!(runtime.destroy(first), Err(RuntimeError::InstanceNotFound(_))));
}

#[test]
fn test_bootstrap_failure_registers_nothing() {
    let engine = FakeEngine::with_bootstrap(BootstrapMode::Throws);
    let mut runtime = runtime_with(&engine);

    let err = runtime.create(Some(RecordingHost::new("about:blank"))).unwrap_err();
    assert!(matches!(err, RuntimeError::BootstrapFailure { .. }));
    assert!(runtime.registry().is_empty());
    assert_eq!(engine.state().disposed.len(), 1);

    engine.set_bootstrap(BootstrapMode::NotAFunction);
    let err = runtime.create(None).unwrap_err();
    assert!(matches!(err, RuntimeError::BootstrapFailure { .. }));
    assert!(runtime.registry().is_empty());

    engine.set_bootstrap(BootstrapMode::Normal);
    assert!(runtime.create(None).is_ok());
}

#[test]
fn test_one_instance_per_host_context() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with(&engine);

    let first = runtime
        .create(Some(RecordingHost::attached("a", ContextHandle(100))))
        .unwrap();
    let err = runtime
        .create(Some(RecordingHost::attached("b", ContextHandle(100))))
        .unwrap_err();
    assert!(matches!(err, RuntimeError::DuplicateInstance(existing) if existing == first));

    runtime.destroy(first).unwrap();
    assert!(
        runtime
            .create(Some(RecordingHost::attached("c", ContextHandle(100))))
            .is_ok()
    );
}

#[test]
fn test_binding_is_cached_per_instance() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with_slow(&engine);
    let id = runtime.create(None).unwrap();
    let before = REGISTRATIONS.with(Cell::get);

    let first = runtime.resolve_binding(id, "slow_a").unwrap();
    let again = runtime.resolve_binding(id, "slow_a").unwrap();
    assert!(Rc::ptr_eq(&first, &again));
    assert_eq!(REGISTRATIONS.with(Cell::get), before + 1);
    assert_eq!(first.owner(), id);
    assert!(first.module().is_some());
    assert!(first.get("wait").is_some());

    let other = runtime.create(None).unwrap();
    let theirs = runtime.resolve_binding(other, "slow_a").unwrap();
    assert!(!Rc::ptr_eq(&first, &theirs));
    assert_eq!(REGISTRATIONS.with(Cell::get), before + 2);
}

#[test]
fn test_failed_registration_leaves_no_module_behind() {
    let engine = FakeEngine::new();
    let mut runtime = Runtime::builder()
        .config(test_config())
        .builtin(BuiltinModule { name: "broken", register: register_broken })
        .build(Box::new(engine.clone()))
        .unwrap();
    let id = runtime.create(None).unwrap();

    for _ in 0..2 {
        let err = runtime.resolve_binding(id, "broken").unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidArgument(_)));
    }
    let instance = runtime.instance(id).unwrap();
    assert_eq!(instance.modules().len(), 0);
    assert_eq!(instance.binding_count(), 0);

    // nothing is left to receive a release
    let releases_before = RELEASES.with(Cell::get);
    runtime.destroy(id).unwrap();
    assert_eq!(RELEASES.with(Cell::get), releases_before);
}

#[test]
fn test_unknown_binding() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with(&engine);
    let id = runtime.create(None).unwrap();

    assert!(runtime.has_binding(id, "fs").unwrap());
    assert!(!runtime.has_binding(id, "nope").unwrap());
    let err = runtime.resolve_binding(id, "nope").unwrap_err();
    assert!(matches!(err, RuntimeError::ModuleNotFound(name) if name == "nope"));
    assert_eq!(runtime.instance(id).unwrap().binding_count(), 0);
}

#[test]
fn test_default_builtins_register() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with(&engine);
    let id = runtime.create(None).unwrap();

    for name in ["constants", "fs", "permission", "unzip"] {
        let exports = runtime.resolve_binding(id, name).unwrap();
        assert_eq!(exports.name(), name);
        assert!(!exports.is_empty(), "{name} exports nothing");
    }
    // constants is a plain value table with no module behind it
    assert!(runtime.resolve_binding(id, "constants").unwrap().module().is_none());
    assert!(runtime.resolve_binding(id, "fs").unwrap().module().is_some());
}

#[test]
fn test_destroy_cancels_every_request() {
    const PER_MODULE: usize = 3;
    let engine = FakeEngine::new();
    let mut runtime = runtime_with_slow(&engine);
    let id = runtime.create(None).unwrap();
    let fired = Rc::new(Cell::new(0));

    let releases_before = RELEASES.with(Cell::get);
    let cancelled_before = CANCELLED.with(Cell::get);

    for name in ["slow_a", "slow_b"] {
        let module = runtime.resolve_binding(id, name).unwrap().module().unwrap();
        let instance = runtime.instance_mut(id).unwrap();
        for _ in 0..PER_MODULE {
            let fired = fired.clone();
            instance
                .submit(
                    module,
                    "wait",
                    std::future::pending::<Result<(), ResourceError>>(),
                    move |_, _| {
                        fired.set(fired.get() + 1);
                        Ok(())
                    },
                )
                .unwrap();
        }
    }
    assert_eq!(runtime.instance(id).unwrap().watcher_count(), 2 * PER_MODULE);
    assert_eq!(runtime.reactor().stats().active, 2 * PER_MODULE);

    runtime.destroy(id).unwrap();

    assert!(!runtime.registry().contains(id));
    assert_eq!(RELEASES.with(Cell::get) - releases_before, 2);
    assert_eq!(CANCELLED.with(Cell::get) - cancelled_before, 2 * PER_MODULE);
    assert_eq!(runtime.reactor().stats().active, 0);
    assert_eq!(runtime.reactor().stats().cancelled, (2 * PER_MODULE) as u64);

    runtime.run_until_idle(Duration::from_millis(100));
    assert_eq!(fired.get(), 0);
}

#[test]
fn test_cancel_activity_keeps_instance() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with_slow(&engine);
    let id = runtime.create(None).unwrap();
    let module = runtime.resolve_binding(id, "slow_a").unwrap().module().unwrap();

    runtime
        .instance_mut(id)
        .unwrap()
        .submit(
            module,
            "wait",
            std::future::pending::<Result<(), ResourceError>>(),
            |_, _| Ok(()),
        )
        .unwrap();

    let summary = runtime.cancel_activity(id).unwrap();
    assert_eq!(summary.cancelled, 1);
    assert!(runtime.instance(id).unwrap().is_alive());
    assert_eq!(runtime.instance(id).unwrap().watcher_count(), 0);

    // a drained instance cancels nothing the second time
    assert_eq!(runtime.cancel_activity(id).unwrap().cancelled, 0);
}

#[test]
fn test_host_events_reach_every_module() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with_slow(&engine);
    let a = runtime.create(None).unwrap();
    let b = runtime.create(None).unwrap();
    runtime.resolve_binding(a, "slow_a").unwrap();
    runtime.resolve_binding(a, "slow_b").unwrap();
    runtime.resolve_binding(b, "slow_a").unwrap();
    let before = HOST_EVENTS.with(Cell::get);

    runtime.broadcast(HostEvent::Pause);
    assert_eq!(HOST_EVENTS.with(Cell::get) - before, 3);

    let summary = runtime.broadcast_to(a, HostEvent::Resume).unwrap();
    assert_eq!(summary.modules, 2);
    assert_eq!(summary.cancelled, 0);
    assert_eq!(HOST_EVENTS.with(Cell::get) - before, 5);
    assert!(runtime.instance(a).unwrap().is_alive());
}

#[test]
fn test_load_module() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with(&engine);
    let host = RecordingHost::new("page");
    let id = runtime.create(Some(host.clone())).unwrap();

    let value = runtime.load_module(id, "fs").unwrap();
    assert_eq!(value.as_str(), Some("module:fs"));

    let err = runtime.load_module(id, "throws").unwrap_err();
    assert!(matches!(err, RuntimeError::Script(_)));
    let status = runtime.instance(id).unwrap().status();
    assert_eq!(status.state(), TestState::Done);
    assert_eq!(status.status(), TestStatus::Failed);
}

#[test]
fn test_shutdown_destroys_everything() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with(&engine);
    let hosts: Vec<_> = (0..3).map(|n| RecordingHost::new(&format!("page{n}"))).collect();
    for host in &hosts {
        runtime.create(Some(host.clone())).unwrap();
    }

    runtime.shutdown();
    assert!(runtime.registry().is_empty());
    assert!(runtime.is_shut_down());
    for host in &hosts {
        assert_eq!(host.destroyed.borrow().len(), 1);
    }
    assert!(matches!(runtime.create(None), Err(RuntimeError::ReactorUnavailable)));

    // idempotent
    runtime.shutdown();
}

#[test]
fn test_destroy_releases_context_handles() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with(&engine);
    let id = runtime.create(None).unwrap();
    runtime.resolve_binding(id, "fs").unwrap();
    runtime.resolve_binding(id, "unzip").unwrap();

    let before = engine.state().released_values;
    runtime.destroy(id).unwrap();
    // two cached bindings plus the process object
    assert_eq!(engine.state().released_values - before, 3);
}
