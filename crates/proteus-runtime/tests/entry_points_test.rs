//! Integration tests for the native entry points

mod common;

use common::{FakeEngine, RecordingHost, runtime_with};
use proteus_runtime::{EntryPoint, NodeEvent, RuntimeError, ScriptValue};
use serde_json::json;

#[test]
fn test_binding_entry_points() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with(&engine);
    let id = runtime.create(None).unwrap();

    let fs = runtime
        .invoke_entry_point(id, EntryPoint::Binding, vec![ScriptValue::str("fs")])
        .unwrap();
    let cached = runtime.resolve_binding(id, "fs").unwrap();
    assert!(std::rc::Rc::ptr_eq(fs.as_exports().unwrap(), &cached));

    let has = runtime
        .invoke_entry_point(id, EntryPoint::HasBinding, vec![ScriptValue::str("nope")])
        .unwrap();
    assert_eq!(has.as_json(), Some(&json!(false)));

    let fresh = runtime
        .invoke_entry_point(id, EntryPoint::CreateExportsObject, vec![ScriptValue::str("mine")])
        .unwrap();
    let fresh = fresh.as_exports().unwrap();
    assert_eq!(fresh.owner(), id);
    assert!(fresh.is_empty());
    assert!(runtime.instance(id).unwrap().cached_binding("mine").is_none());

    let err = runtime
        .invoke_entry_point(id, EntryPoint::Binding, vec![])
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidArgument(_)));
}

#[test]
fn test_load_lock_is_fifo() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with(&engine);
    let a = runtime.create(None).unwrap();
    let b = runtime.create(None).unwrap();
    let (first, first_calls) = engine.recorder();
    let (second, second_calls) = engine.recorder();

    runtime
        .invoke_entry_point(a, EntryPoint::AcquireLock, vec![ScriptValue::Function(first)])
        .unwrap();
    assert_eq!(first_calls.borrow().len(), 1);

    runtime
        .invoke_entry_point(b, EntryPoint::AcquireLock, vec![ScriptValue::Function(second)])
        .unwrap();
    assert_eq!(second_calls.borrow().len(), 0);
    assert_eq!(runtime.load_lock().waiting(), 1);

    runtime.invoke_entry_point(a, EntryPoint::ReleaseLock, vec![]).unwrap();
    assert_eq!(second_calls.borrow().len(), 1);
    assert_eq!(runtime.load_lock().holder(), Some(b));

    runtime.invoke_entry_point(b, EntryPoint::ReleaseLock, vec![]).unwrap();
    assert!(!runtime.load_lock().is_held());

    let err = runtime.invoke_entry_point(a, EntryPoint::ReleaseLock, vec![]).unwrap_err();
    assert!(matches!(err, RuntimeError::LockNotHeld));
    assert_eq!(err.to_string(), "Called without calling Acquire");
}

#[test]
fn test_destroying_the_holder_passes_the_lock() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with(&engine);
    let a = runtime.create(None).unwrap();
    let b = runtime.create(None).unwrap();
    let (first, _) = engine.recorder();
    let (second, second_calls) = engine.recorder();

    runtime
        .invoke_entry_point(a, EntryPoint::AcquireLock, vec![ScriptValue::Function(first)])
        .unwrap();
    runtime
        .invoke_entry_point(b, EntryPoint::AcquireLock, vec![ScriptValue::Function(second)])
        .unwrap();
    runtime.invoke_entry_point(a, EntryPoint::TestDeleteNode, vec![]).unwrap();

    assert!(!runtime.registry().contains(a));
    assert_eq!(second_calls.borrow().len(), 1);
    assert_eq!(runtime.load_lock().holder(), Some(b));
}

#[test]
fn test_module_update_flag() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with(&engine);
    let id = runtime.create(None).unwrap();

    let get = |runtime: &mut proteus_runtime::Runtime| {
        runtime
            .invoke_entry_point(id, EntryPoint::GetModuleUpdates, vec![])
            .unwrap()
            .as_i64()
    };
    assert_eq!(get(&mut runtime), Some(1));
    runtime
        .invoke_entry_point(id, EntryPoint::SetModuleUpdates, vec![ScriptValue::from(0_i64)])
        .unwrap();
    assert_eq!(get(&mut runtime), Some(0));

    // shared by every instance
    let other = runtime.create(None).unwrap();
    let value = runtime
        .invoke_entry_point(other, EntryPoint::GetModuleUpdates, vec![])
        .unwrap();
    assert_eq!(value.as_i64(), Some(0));
}

#[test]
fn test_permission_round_trip() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with(&engine);
    let host = RecordingHost::new("page");
    let id = runtime.create(Some(host.clone())).unwrap();
    let (callback, calls) = engine.recorder();

    runtime
        .invoke_entry_point(
            id,
            EntryPoint::RegisterPermissionFeatures,
            vec![ScriptValue::from(json!(["camera"]))],
        )
        .unwrap();
    runtime
        .invoke_entry_point(
            id,
            EntryPoint::RequestPermission,
            vec![ScriptValue::from(json!(["camera"])), ScriptValue::Function(callback)],
        )
        .unwrap();

    let ticket = {
        let events = host.events.borrow();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].1,
            NodeEvent::RegisterPrivilegedFeatures { features: vec!["camera".to_string()] }
        );
        match &events[1].1 {
            NodeEvent::RequestPermission { features, ticket } => {
                assert_eq!(features, &["camera"]);
                *ticket
            }
            other => panic!("unexpected event {other:?}"),
        }
    };

    assert!(runtime.resolve_permission(ticket, true).unwrap());
    assert_eq!(calls.borrow().len(), 1);
    assert_eq!(calls.borrow()[0][0].as_json(), Some(&json!(true)));

    // answered once
    assert!(!runtime.resolve_permission(ticket, false).unwrap());
    assert_eq!(calls.borrow().len(), 1);
}

#[test]
fn test_permission_requires_features() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with(&engine);
    let id = runtime.create(Some(RecordingHost::new("page"))).unwrap();
    let (callback, _) = engine.recorder();

    let err = runtime
        .invoke_entry_point(
            id,
            EntryPoint::RequestPermission,
            vec![ScriptValue::from(json!([])), ScriptValue::Function(callback)],
        )
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidArgument(_)));
}

#[test]
fn test_run_script_uses_one_service_instance() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with(&engine);
    let id = runtime.create(Some(RecordingHost::new("page"))).unwrap();

    let value = runtime
        .invoke_entry_point(id, EntryPoint::TestRunScript, vec![ScriptValue::str("1 + 1")])
        .unwrap();
    assert_eq!(value.as_str(), Some("1 + 1"));
    assert_eq!(runtime.registry().len(), 2);
    let service = runtime.service_instance().unwrap();
    assert!(!runtime.instance(service).unwrap().has_client());

    runtime
        .invoke_entry_point(id, EntryPoint::TestRunScript, vec![ScriptValue::str("2")])
        .unwrap();
    assert_eq!(runtime.registry().len(), 2);
    assert_eq!(runtime.service_instance(), Some(service));

    let err = runtime
        .invoke_entry_point(id, EntryPoint::TestRunScript, vec![ScriptValue::str("throw boom")])
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Script(e) if e.message == "boom"));

    // the service instance is never part of a status pass
    runtime.invoke_entry_point(id, EntryPoint::TestStart, vec![]).unwrap();
    let reports = runtime.check_all(true);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].instance, id);
}

#[test]
fn test_watcher_stats_and_keep_alive() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with(&engine);
    let id = runtime.create(None).unwrap();

    runtime.invoke_entry_point(id, EntryPoint::TestRef, vec![]).unwrap();
    runtime.invoke_entry_point(id, EntryPoint::TestRef, vec![]).unwrap();
    runtime.invoke_entry_point(id, EntryPoint::TestUnref, vec![]).unwrap();

    let stats = runtime
        .invoke_entry_point(id, EntryPoint::TestWatcherStats, vec![])
        .unwrap();
    let stats = stats.as_json().unwrap();
    assert_eq!(stats["reactor"]["keep_alive"], 1);
    assert_eq!(stats["instances"][0]["loop_refs"], 1);
    assert!(!runtime.instance_mut(id).unwrap().test_check());

    // destroying the instance drops its keep-alive references
    runtime.destroy(id).unwrap();
    assert_eq!(runtime.reactor().stats().keep_alive, 0);
}

#[test]
fn test_log_and_unknown_instance() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with(&engine);
    let id = runtime.create(None).unwrap();

    for priority in 2..=7_i64 {
        let result = runtime
            .invoke_entry_point(
                id,
                EntryPoint::Log,
                vec![ScriptValue::from(priority), ScriptValue::str("hello")],
            )
            .unwrap();
        assert!(result.is_undefined());
    }

    runtime.destroy(id).unwrap();
    let err = runtime
        .invoke_entry_point(id, EntryPoint::TestCheck, vec![])
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InstanceNotFound(gone) if gone == id));
}

#[test]
fn test_deferred_calls_run_after_dispatch() {
    let engine = FakeEngine::new();
    let mut runtime = runtime_with(&engine);
    let a = runtime.create(None).unwrap();
    let b = runtime.create(None).unwrap();

    runtime
        .instance_mut(a)
        .unwrap()
        .defer(EntryPoint::SetModuleUpdates, vec![ScriptValue::from(5_i64)]);
    runtime.instance_mut(b).unwrap().defer(EntryPoint::TestDeleteNode, vec![]);
    assert!(runtime.instance(a).unwrap().has_deferred());

    runtime.invoke_entry_point(a, EntryPoint::HasBinding, vec![ScriptValue::str("fs")]).unwrap();

    assert_eq!(runtime.update_check(), 5);
    assert!(!runtime.registry().contains(b));
    assert!(!runtime.instance(a).unwrap().has_deferred());
}
