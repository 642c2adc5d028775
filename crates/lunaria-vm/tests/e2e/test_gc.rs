use super::helpers::*;
use lunaria_vm::{GcCommand, LuaError, RuntimeConfig, TValue, Vm};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Give the table on top a metatable whose `__gc` is `fin`.
fn set_finalizer(vm: &mut Vm, fin: lunaria_vm::NativeFn) {
    let f = vm.register_native(fin);
    vm.create_table(0, 1).unwrap();
    vm.push_native(f, "fin", 0).unwrap();
    vm.raw_set_field(-2, "__gc").unwrap();
    vm.set_metatable(-2).unwrap();
}

/// Push a table whose metatable has the given `__mode`.
fn weak_table(vm: &mut Vm, mode: &str) {
    vm.create_table(0, 0).unwrap();
    vm.create_table(0, 1).unwrap();
    vm.push_string(mode).unwrap();
    vm.raw_set_field(-2, "__mode").unwrap();
    vm.set_metatable(-2).unwrap();
}

fn count_entries(vm: &mut Vm, idx: i32) -> usize {
    let idx = vm.abs_index(idx);
    let mut n = 0;
    vm.push_nil();
    while vm.next(idx).unwrap() {
        n += 1;
        vm.pop(1);
    }
    n
}

// ---- finalizers ----

#[test]
fn test_finalizer_runs_once() {
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    let mut vm = new_vm();
    vm.create_table(0, 0).unwrap();
    set_finalizer(&mut vm, |_| {
        CALLS.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    });
    vm.pop(1);
    vm.gc(GcCommand::Collect).unwrap();
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    vm.gc(GcCommand::Collect).unwrap();
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
}

#[test]
fn test_reachable_object_is_not_finalized() {
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    let mut vm = new_vm();
    vm.create_table(0, 0).unwrap();
    set_finalizer(&mut vm, |_| {
        CALLS.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    });
    vm.set_global("keep").unwrap();
    vm.gc(GcCommand::Collect).unwrap();
    assert_eq!(CALLS.load(Ordering::SeqCst), 0);
    drop(vm);
    // pending finalizers run when the runtime shuts down
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
}

#[test]
fn test_finalizer_receives_the_object() {
    static SEEN: AtomicUsize = AtomicUsize::new(0);
    let mut vm = new_vm();
    vm.create_table(0, 1).unwrap();
    vm.push_integer(77);
    vm.raw_set_field(-2, "tag").unwrap();
    set_finalizer(&mut vm, |vm| {
        let tag = vm.raw_get_field(1, "tag")?;
        SEEN.store(tag.as_integer().unwrap_or(0) as usize, Ordering::SeqCst);
        Ok(0)
    });
    vm.pop(1);
    vm.gc(GcCommand::Collect).unwrap();
    assert_eq!(SEEN.load(Ordering::SeqCst), 77);
}

#[test]
fn test_resurrected_object_stays_usable() {
    let mut vm = new_vm();
    vm.create_table(0, 1).unwrap();
    vm.push_integer(5);
    vm.raw_set_field(-2, "v").unwrap();
    set_finalizer(&mut vm, |vm| {
        vm.push_value(1);
        vm.set_global("revived")?;
        Ok(0)
    });
    vm.pop(1);
    vm.gc(GcCommand::Collect).unwrap();
    let revived = vm.get_global("revived").unwrap();
    assert_eq!(revived.type_name(), "table");
    assert_eq!(vm.raw_get_field(-1, "v").unwrap(), TValue::Int(5));
    vm.pop(2);
    // a second collection leaves it alone: it is still referenced
    vm.gc(GcCommand::Collect).unwrap();
    let again = vm.get_global("revived").unwrap();
    assert_eq!(vm.raw_get_field(-1, "v").unwrap(), TValue::Int(5));
    assert_eq!(again, revived);
}

#[test]
fn test_finalizer_error_is_reported() {
    let mut vm = new_vm();
    vm.create_table(0, 0).unwrap();
    set_finalizer(&mut vm, |vm| {
        vm.push_string("bad finalizer")?;
        Err(vm.error())
    });
    vm.pop(1);
    let err = vm.gc(GcCommand::Collect).unwrap_err();
    assert!(matches!(err, LuaError::GcMetamethod(_)));
    assert_eq!(err.to_string(), "error in __gc metamethod (bad finalizer)");
    // the collector itself is still consistent
    vm.gc(GcCommand::Collect).unwrap();
}

#[test]
fn test_userdata_finalizer_on_close() {
    static CALLS: AtomicUsize = AtomicUsize::new(0);
    let mut vm = new_vm();
    for _ in 0..10 {
        vm.new_userdata(16).unwrap();
        set_finalizer(&mut vm, |_| {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        });
    }
    assert_eq!(vm.get_top(), 10);
    drop(vm);
    assert_eq!(CALLS.load(Ordering::SeqCst), 10);
}

#[test]
fn test_finalizer_errors_ignored_on_close() {
    let mut vm = new_vm();
    vm.create_table(0, 0).unwrap();
    set_finalizer(&mut vm, |vm| {
        vm.push_string("ignored")?;
        Err(vm.error())
    });
    drop(vm);
}

// ---- weak tables ----

#[test]
fn test_weak_values_are_cleared() {
    let mut vm = new_vm();
    weak_table(&mut vm, "v");
    vm.create_table(0, 0).unwrap();
    vm.raw_set_i(1, 1).unwrap();
    vm.push_integer(10);
    vm.raw_set_i(1, 2).unwrap();
    vm.push_string("strings are values").unwrap();
    vm.raw_set_i(1, 3).unwrap();
    vm.gc(GcCommand::Collect).unwrap();
    assert!(vm.raw_get_i(1, 1).unwrap().is_nil());
    assert_eq!(vm.raw_get_i(1, 2).unwrap(), TValue::Int(10));
    assert_eq!(vm.raw_get_i(1, 3).unwrap().type_name(), "string");
}

#[test]
fn test_weak_keys_drop_unreachable_keys() {
    let mut vm = new_vm();
    weak_table(&mut vm, "k");
    // key only reachable through the table
    vm.create_table(0, 0).unwrap();
    vm.push_integer(1);
    vm.raw_set(1).unwrap();
    // key kept alive by a global
    vm.create_table(0, 0).unwrap();
    vm.push_value(-1);
    vm.set_global("live_key").unwrap();
    vm.push_integer(2);
    vm.raw_set(1).unwrap();
    assert_eq!(count_entries(&mut vm, 1), 2);
    vm.gc(GcCommand::Collect).unwrap();
    assert_eq!(count_entries(&mut vm, 1), 1);
    vm.get_global("live_key").unwrap();
    assert_eq!(vm.raw_get(1).unwrap(), TValue::Int(2));
}

#[test]
fn test_ephemeron_value_referring_to_its_key() {
    let mut vm = new_vm();
    weak_table(&mut vm, "k");
    // t[k] = {k}: the value refers back to the key
    vm.create_table(0, 0).unwrap();
    vm.create_table(1, 0).unwrap();
    vm.push_value(-2);
    vm.raw_set_i(-2, 1).unwrap();
    vm.raw_set(1).unwrap();
    assert_eq!(count_entries(&mut vm, 1), 1);
    vm.gc(GcCommand::Collect).unwrap();
    assert_eq!(count_entries(&mut vm, 1), 0);
}

#[test]
fn test_fully_weak_table() {
    let mut vm = new_vm();
    weak_table(&mut vm, "kv");
    for i in 1..=20 {
        vm.create_table(0, 0).unwrap();
        vm.raw_set_i(1, i).unwrap();
    }
    vm.gc(GcCommand::Collect).unwrap();
    assert_eq!(count_entries(&mut vm, 1), 0);
}

// ---- collector control ----

#[test]
fn test_stopped_collector_lets_memory_grow() {
    let mut vm = new_vm();
    vm.gc(GcCommand::Collect).unwrap();
    vm.gc(GcCommand::Stop).unwrap();
    let before = vm.gc(GcCommand::Count).unwrap();
    for _ in 0..2000 {
        vm.create_table(8, 0).unwrap();
        vm.pop(1);
    }
    let after = vm.gc(GcCommand::Count).unwrap();
    assert!(after > before + 100, "before {before} KB, after {after} KB");
    vm.gc(GcCommand::Collect).unwrap();
    assert!(vm.gc(GcCommand::Count).unwrap() <= before + 1);
}

#[test]
fn test_incremental_collection_bounds_memory() {
    let mut vm = new_vm();
    vm.gc(GcCommand::Collect).unwrap();
    let base = vm.gc(GcCommand::Count).unwrap();
    let mut peak = 0;
    for _ in 0..50_000 {
        vm.create_table(8, 0).unwrap();
        vm.pop(1);
        peak = peak.max(vm.gc(GcCommand::Count).unwrap());
    }
    // pause 200 lets memory roughly double before a cycle starts
    assert!(peak < base * 4 + 256, "base {base} KB, peak {peak} KB");
}

#[test]
fn test_scripted_garbage_is_collected_incrementally() {
    let mut vm = new_vm();
    vm.gc(GcCommand::Collect).unwrap();
    let base = vm.gc(GcCommand::Count).unwrap();
    for _ in 0..100 {
        vm.push_lua_closure(GARBAGE, 0).unwrap();
        call_with(&mut vm, &[TValue::Int(200)]);
    }
    assert!(vm.gc(GcCommand::Count).unwrap() < base * 4 + 256);
    assert!(vm.g.invariant_violations().is_empty());
}

#[test]
fn test_memory_limit_surfaces_as_error() {
    let mut vm = new_vm_with(RuntimeConfig {
        memory_limit: Some(128 * 1024),
        ..RuntimeConfig::default()
    });
    vm.create_table(0, 0).unwrap();
    let mut err = None;
    for i in 1..100_000 {
        if let Err(e) = vm.create_table(32, 0) {
            err = Some(e);
            break;
        }
        if let Err(e) = vm.raw_set_i(1, i) {
            err = Some(e);
            break;
        }
    }
    assert!(matches!(err, Some(LuaError::Memory)));
    assert!(vm.g.gc.total_bytes() <= 128 * 1024);
}

#[test]
fn test_collector_tunables_from_json_config() {
    let config: RuntimeConfig =
        serde_json::from_str(r#"{"gc_pause": 120, "gc_stepmul": 300, "seed": 9}"#).unwrap();
    let mut vm = new_vm_with(config);
    assert_eq!(vm.gc(GcCommand::SetPause(200)).unwrap(), 120);
    assert_eq!(vm.gc(GcCommand::SetStepMul(200)).unwrap(), 300);
}
