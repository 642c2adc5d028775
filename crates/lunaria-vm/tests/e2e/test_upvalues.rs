use super::helpers::*;
use lunaria_vm::{LuaError, TValue, Vm};

/// Returns two counters sharing one captured local that starts at 0.
fn make_counters(vm: &mut Vm) -> Result<usize, LuaError> {
    vm.set_top(0);
    vm.push_integer(0);
    vm.push_lua_closure(COUNTER, 1)?;
    vm.capture_local(2, 1, 1)?;
    vm.push_lua_closure(GET_UPVALUE, 1)?;
    vm.capture_local(3, 1, 1)?;
    Ok(2)
}

/// Captures local 1, bumps it on the stack, and returns the closure.
fn capture_then_write(vm: &mut Vm) -> Result<usize, LuaError> {
    vm.set_top(0);
    vm.push_integer(1);
    vm.push_lua_closure(GET_UPVALUE, 1)?;
    vm.capture_local(2, 1, 1)?;
    // writes to the slot are visible while the upvalue is open
    vm.push_integer(99);
    vm.replace(1)?;
    Ok(1)
}

fn counters(vm: &mut Vm) -> (TValue, TValue) {
    let f = vm.register_native(make_counters);
    vm.push_native(f, "make_counters", 0).unwrap();
    let r = call_with(vm, &[]);
    assert_eq!(r.len(), 2);
    (r[0], r[1])
}

// ---- sharing ----

#[test]
fn test_closures_share_captured_local() {
    let mut vm = new_vm();
    let (inc, get) = counters(&mut vm);
    vm.push(inc);
    assert_int(&call_with(&mut vm, &[]), 0, 1);
    vm.push(inc);
    assert_int(&call_with(&mut vm, &[]), 0, 2);
    vm.push(get);
    assert_int(&call_with(&mut vm, &[]), 0, 2);
}

#[test]
fn test_shared_cell_has_one_identity() {
    let mut vm = new_vm();
    let (inc, get) = counters(&mut vm);
    vm.push(inc);
    vm.push(get);
    let a = vm.upvalue_id(-2, 1).unwrap();
    let b = vm.upvalue_id(-1, 1).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_open_upvalue_sees_stack_writes() {
    let mut vm = new_vm();
    let f = vm.register_native(capture_then_write);
    vm.push_native(f, "capture", 0).unwrap();
    let r = call_with(&mut vm, &[]);
    vm.push(r[0]);
    assert_int(&call_with(&mut vm, &[]), 0, 99);
}

#[test]
fn test_separate_factories_do_not_share() {
    let mut vm = new_vm();
    let (inc1, _) = counters(&mut vm);
    let (inc2, get2) = counters(&mut vm);
    for _ in 0..3 {
        vm.push(inc1);
        call_with(&mut vm, &[]);
    }
    vm.push(inc2);
    assert_int(&call_with(&mut vm, &[]), 0, 1);
    vm.push(get2);
    assert_int(&call_with(&mut vm, &[]), 0, 1);
}

// ---- get / set / join ----

#[test]
fn test_set_upvalue_through_api() {
    let mut vm = new_vm();
    let (inc, get) = counters(&mut vm);
    vm.push(get);
    vm.push_integer(41);
    assert!(vm.set_upvalue(-2, 1));
    vm.pop(1);
    vm.push(inc);
    assert_int(&call_with(&mut vm, &[]), 0, 42);
    vm.push(get);
    assert_eq!(vm.get_upvalue(-1, 1), Some(TValue::Int(42)));
    assert_eq!(vm.get_upvalue(-2, 2), None);
}

#[test]
fn test_upvalue_join_redirects() {
    let mut vm = new_vm();
    let (inc1, _) = counters(&mut vm);
    let (_, get2) = counters(&mut vm);
    vm.push(inc1);
    call_with(&mut vm, &[]);
    vm.push(get2);
    vm.push(inc1);
    vm.upvalue_join(-2, 1, -1, 1).unwrap();
    assert_eq!(vm.upvalue_id(-2, 1), vm.upvalue_id(-1, 1));
    vm.pop(1);
    assert_int(&call_with(&mut vm, &[]), 0, 1);
}

#[test]
fn test_fresh_closure_upvalues_are_nil() {
    let mut vm = new_vm();
    vm.push_lua_closure(GET_UPVALUE, 1).unwrap();
    assert_nil(&call_with(&mut vm, &[]), 0);
}

#[test]
fn test_close_upvalues_explicitly() {
    let mut vm = new_vm();
    vm.push_integer(5);
    vm.push_lua_closure(GET_UPVALUE, 1).unwrap();
    vm.capture_local(2, 1, 1).unwrap();
    vm.close_upvalues(1).unwrap();
    // the closed cell keeps the value after the slot changes
    vm.push_integer(6);
    vm.replace(1).unwrap();
    assert_int(&call_with(&mut vm, &[]), 0, 5);
}

#[test]
fn test_captured_values_survive_collection() {
    let mut vm = new_vm();
    let (inc, get) = counters(&mut vm);
    vm.push(inc);
    vm.push(get);
    vm.create_table(0, 0).unwrap();
    vm.push_lua_closure(GET_UPVALUE, 1).unwrap();
    // table as the upvalue value
    vm.push_value(-2);
    assert!(vm.set_upvalue(-2, 1));
    vm.remove(-2).unwrap();
    vm.gc(lunaria_vm::GcCommand::Collect).unwrap();
    let r = call_with(&mut vm, &[]);
    assert_eq!(r[0].type_name(), "table");
}
