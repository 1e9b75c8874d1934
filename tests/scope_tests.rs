//! Handle scope tests

use std::sync::{Arc, Mutex};

use natmem::prelude::*;
use natmem::Error;

type ReleaseLog = Arc<Mutex<Vec<&'static str>>>;

/// Adopt a fake region whose release appends `name` to `log`.
fn tagged(rt: &Runtime, kind: HandleKind, name: &'static str, log: &ReleaseLog) -> NativeHandle {
    let log = Arc::clone(log);
    // Any non-zero address will do; the routine never touches it.
    unsafe {
        rt.adopt(kind, 0x1000, 1, move |_| {
            log.lock().expect("lock").push(name);
            Ok(())
        })
    }
    .expect("adopt failed")
}

fn released(log: &ReleaseLog) -> Vec<&'static str> {
    log.lock().expect("lock").clone()
}

#[test]
fn test_close_releases_in_reverse_order() {
    let rt = Runtime::new(RuntimeConfig::default());
    let log = ReleaseLog::default();

    let scope = HandleScope::open();
    let a = tagged(&rt, HandleKind::BYTE, "a", &log);
    let b = tagged(&rt, HandleKind::BYTE, "b", &log);
    let c = tagged(&rt, HandleKind::BYTE, "c", &log);
    assert_eq!(scope.len(), 3);
    assert_eq!(a.reference_count(), 1);

    // Still referenced by the scope.
    drop(b);
    assert!(released(&log).is_empty());

    scope.close();
    assert_eq!(released(&log), vec!["c", "b", "a"]);
    assert!(a.is_null() && c.is_null());
    assert!(scope.is_empty());
    assert_eq!(rt.total_tracked_bytes(), 0);
}

#[test]
fn test_retained_member_survives_close() {
    let rt = Runtime::new(RuntimeConfig::default());
    let log = ReleaseLog::default();

    let scope = HandleScope::open();
    let kept = tagged(&rt, HandleKind::BYTE, "kept", &log);
    kept.retain_reference();
    scope.close();

    assert!(released(&log).is_empty());
    assert_eq!(kept.reference_count(), 1);
    assert!(kept.release_reference());
    assert_eq!(released(&log), vec!["kept"]);
}

#[test]
fn test_extend_keeps_members_once() {
    let rt = Runtime::new(RuntimeConfig::default());
    let log = ReleaseLog::default();

    let scope = HandleScope::open();
    let h = tagged(&rt, HandleKind::BYTE, "h", &log);
    scope.extend();
    scope.close();

    assert!(!scope.is_open());
    assert_eq!(HandleScope::depth(), 0);
    assert!(released(&log).is_empty());
    assert!(!h.is_null());
    assert_eq!(h.reference_count(), 1);

    // Back to ordinary ownership once the scope is gone.
    drop(scope);
    assert!(released(&log).is_empty());
    assert!(h.release_reference());
    assert_eq!(released(&log), vec!["h"]);
}

#[test]
fn test_nested_scopes_attach_to_innermost() {
    let rt = Runtime::new(RuntimeConfig::default());
    let log = ReleaseLog::default();

    let outer = HandleScope::open();
    let _o = tagged(&rt, HandleKind::BYTE, "outer", &log);
    {
        let inner = HandleScope::open();
        assert_eq!(HandleScope::depth(), 2);
        let _i = tagged(&rt, HandleKind::BYTE, "inner", &log);
        assert_eq!(inner.len(), 1);
        assert_eq!(outer.len(), 1);
    }
    assert_eq!(released(&log), vec!["inner"]);
    assert_eq!(HandleScope::depth(), 1);

    drop(outer);
    assert_eq!(released(&log), vec!["inner", "outer"]);
}

#[test]
fn test_kind_filter_routes_to_accepting_scope() {
    let rt = Runtime::new(RuntimeConfig::default());
    let log = ReleaseLog::default();

    let any = HandleScope::open();
    let ints = HandleScope::for_kinds(&[HandleKind::INT]);
    let _i = tagged(&rt, HandleKind::INT, "int", &log);
    let _f = tagged(&rt, HandleKind::FLOAT, "float", &log);

    assert_eq!(ints.len(), 1);
    assert_eq!(any.len(), 1);
    assert_eq!(ints.kinds(), &[HandleKind::INT]);

    ints.close();
    assert_eq!(released(&log), vec!["int"]);
    any.close();
    assert_eq!(released(&log), vec!["int", "float"]);
}

#[test]
fn test_attach_mismatch_has_no_side_effects() {
    let rt = Runtime::new(RuntimeConfig::default());
    let log = ReleaseLog::default();
    let h = tagged(&rt, HandleKind::FLOAT, "f", &log);

    let scope = HandleScope::for_kinds(&[HandleKind::INT, HandleKind::LONG]);
    match scope.attach(&h) {
        Err(Error::CapabilityMismatch {
            kind,
            scope: id,
            allowed,
        }) => {
            assert_eq!(kind, "float");
            assert_eq!(id, scope.id());
            assert_eq!(allowed, vec!["int", "long"]);
        }
        other => panic!("expected CapabilityMismatch, got {other:?}"),
    }
    assert!(scope.is_empty());
    assert_eq!(h.reference_count(), 0);

    scope.close();
    assert!(released(&log).is_empty());
    assert!(!h.is_null());
}

#[test]
fn test_explicit_attach_and_detach() {
    let rt = Runtime::new(RuntimeConfig::default());
    let log = ReleaseLog::default();
    let h = tagged(&rt, HandleKind::BYTE, "h", &log);
    h.retain_reference();

    let scope = HandleScope::open();
    scope.attach(&h).expect("attach failed");
    assert_eq!(h.reference_count(), 2);

    scope.detach(&h);
    assert!(scope.is_empty());
    assert_eq!(h.reference_count(), 1);

    scope.close();
    assert!(released(&log).is_empty());
    assert!(h.release_reference());
    assert_eq!(released(&log), vec!["h"]);
}

#[test]
fn test_deallocate_ignores_counts() {
    let rt = Runtime::new(RuntimeConfig::default());
    let log = ReleaseLog::default();

    let scope = HandleScope::open();
    let a = tagged(&rt, HandleKind::BYTE, "a", &log);
    let b = tagged(&rt, HandleKind::BYTE, "b", &log);
    a.retain_reference().retain_reference();

    scope.deallocate();
    assert_eq!(released(&log), vec!["b", "a"]);
    assert!(a.is_null() && b.is_null());
    assert!(scope.is_empty());
    assert!(scope.is_open());
}

#[test]
fn test_out_of_order_close_keeps_stack_consistent() {
    let rt = Runtime::new(RuntimeConfig::default());
    let log = ReleaseLog::default();

    let first = HandleScope::open();
    let second = HandleScope::open();
    first.close();
    assert_eq!(HandleScope::depth(), 1);

    let _h = tagged(&rt, HandleKind::BYTE, "h", &log);
    assert_eq!(second.len(), 1);
    assert!(first.is_empty());

    drop(second);
    assert_eq!(released(&log), vec!["h"]);
    assert_eq!(HandleScope::depth(), 0);
}

#[test]
fn test_no_scope_no_attachment() {
    let rt = Runtime::new(RuntimeConfig::default());
    let log = ReleaseLog::default();
    assert_eq!(HandleScope::depth(), 0);

    let h = tagged(&rt, HandleKind::BYTE, "h", &log);
    assert_eq!(h.reference_count(), 0);
    drop(h);
    assert_eq!(released(&log), vec!["h"]);
}

#[test]
fn test_scopes_are_per_thread() {
    let _scope = HandleScope::open();
    let depth = std::thread::spawn(HandleScope::depth)
        .join()
        .expect("thread panicked");
    assert_eq!(depth, 0);
    assert_eq!(HandleScope::depth(), 1);
}
