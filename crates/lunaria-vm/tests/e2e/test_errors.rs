use super::helpers::*;
use lunaria_vm::{GcCommand, LuaError, RuntimeConfig, TValue, ThreadStatus, Vm};

fn raise_table(vm: &mut Vm) -> Result<usize, LuaError> {
    vm.create_table(0, 1)?;
    vm.push_integer(404);
    vm.raw_set_field(-2, "code")?;
    Err(vm.error())
}

fn raise_str(vm: &mut Vm) -> Result<usize, LuaError> {
    vm.push_string("deep failure")?;
    Err(vm.error())
}

/// Calls its first argument, one frame deeper.
fn call_first(vm: &mut Vm) -> Result<usize, LuaError> {
    vm.push_value(1);
    vm.call(0, 0)?;
    Ok(0)
}

fn huge_stack(vm: &mut Vm) -> Result<usize, LuaError> {
    vm.check_stack(1 << 20)?;
    Ok(0)
}

fn pcall_top(vm: &mut Vm) -> ThreadStatus {
    vm.pcall(0, 1, 0).unwrap_or_else(|e| panic!("pcall itself failed: {e}"))
}

// ---- error objects ----

#[test]
fn test_error_object_can_be_a_table() {
    let mut vm = new_vm();
    let f = vm.register_native(raise_table);
    vm.push_native(f, "raise_table", 0).unwrap();
    assert_eq!(pcall_top(&mut vm), ThreadStatus::ErrRun);
    let code = vm.raw_get_field(-1, "code").unwrap();
    assert_eq!(code, TValue::Int(404));
}

#[test]
fn test_unprotected_error_reaches_host() {
    let mut vm = new_vm();
    let f = vm.register_native(raise_str);
    vm.push_native(f, "raise_str", 0).unwrap();
    match vm.call(0, 0) {
        Err(LuaError::Value(TValue::Str(id))) => assert_eq!(vm.g.string_lossy(id), "deep failure"),
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[test]
fn test_runtime_error_message_through_pcall() {
    let mut vm = new_vm();
    let f = vm.register_native(|vm| {
        vm.create_table(0, 0)?;
        vm.push_nil();
        vm.push_integer(1);
        vm.raw_set(-3)?;
        Ok(0)
    });
    vm.push_native(f, "nil_key", 0).unwrap();
    assert_eq!(pcall_top(&mut vm), ThreadStatus::ErrRun);
    assert_eq!(vm.to_str(-1).as_deref(), Some("table index is nil"));
}

// ---- message handler ----

#[test]
fn test_handler_runs_before_unwinding() {
    let mut vm = new_vm();
    let handler = vm.register_native(|vm| {
        let depth = vm.call_depth() as i64;
        vm.push_integer(depth);
        Ok(1)
    });
    let mid = vm.register_native(call_first);
    let bad = vm.register_native(raise_str);
    vm.push_native(handler, "handler", 0).unwrap();
    vm.push_native(mid, "mid", 0).unwrap();
    vm.push_native(bad, "raise_str", 0).unwrap();
    let status = vm.pcall(1, 1, 1).unwrap();
    assert_eq!(status, ThreadStatus::ErrRun);
    // base, mid, raise_str and the handler itself
    assert_eq!(vm.to_integer(-1), Some(4));
    assert_eq!(vm.call_depth(), 1);
}

#[test]
fn test_handler_not_called_for_memory_errors() {
    let mut vm = new_vm_with(RuntimeConfig {
        seed: Some(1),
        memory_limit: Some(256 * 1024),
        ..RuntimeConfig::default()
    });
    let handler = vm.register_native(|vm| {
        vm.push_string("handled")?;
        Ok(1)
    });
    let hog = vm.register_native(|vm| {
        let mut i = 1;
        vm.create_table(0, 0)?;
        loop {
            vm.create_table(64, 0)?;
            vm.raw_set_i(-2, i)?;
            i += 1;
        }
    });
    vm.push_native(handler, "handler", 0).unwrap();
    vm.push_native(hog, "hog", 0).unwrap();
    let status = vm.pcall(0, 1, 1).unwrap();
    assert_eq!(status, ThreadStatus::ErrMem);
    assert_eq!(vm.to_str(-1).as_deref(), Some("not enough memory"));
    // the garbage is collectable again and the state keeps working
    vm.gc(GcCommand::Collect).unwrap();
    vm.create_table(4, 4).unwrap();
}

// ---- overflows ----

#[test]
fn test_stack_overflow_is_recoverable() {
    let mut vm = new_vm_with(RuntimeConfig {
        max_stack: 10_000,
        ..RuntimeConfig::default()
    });
    let f = vm.register_native(huge_stack);
    for _ in 0..3 {
        vm.push_native(f, "huge_stack", 0).unwrap();
        assert_eq!(pcall_top(&mut vm), ThreadStatus::ErrRun);
        assert_eq!(vm.to_str(-1).as_deref(), Some("stack overflow"));
        vm.pop(1);
    }
}

#[test]
fn test_c_stack_overflow() {
    let mut vm = new_vm();
    let f = vm.register_native(|vm| {
        vm.push_value(lunaria_vm::upvalue_index(1));
        vm.call(0, 0)?;
        Ok(0)
    });
    vm.push_nil();
    vm.push_native(f, "recurse", 1).unwrap();
    vm.push_value(-1);
    assert!(vm.set_upvalue(-2, 1));
    assert_eq!(pcall_top(&mut vm), ThreadStatus::ErrRun);
    assert_eq!(vm.to_str(-1).as_deref(), Some("C stack overflow"));
    assert_eq!(vm.call_depth(), 1);
}

#[test]
fn test_error_in_scripted_callee() {
    let mut vm = new_vm();
    let bad = vm.register_native(raise_str);
    vm.push_lua_closure(CALL_ARG, 0).unwrap();
    vm.push_native(bad, "raise_str", 0).unwrap();
    assert_eq!(vm.pcall(1, 1, 0).unwrap(), ThreadStatus::ErrRun);
    assert_eq!(vm.to_str(-1).as_deref(), Some("deep failure"));
}

#[test]
fn test_unknown_prototype_is_an_error() {
    let mut vm = new_vm();
    vm.push_lua_closure(1000, 0).unwrap();
    assert_eq!(pcall_top(&mut vm), ThreadStatus::ErrRun);
    assert_eq!(vm.to_str(-1).as_deref(), Some("unknown prototype 1000"));
}

// ---- errors near the memory limit ----

/// Leave unreachable tables behind with the collector stopped.
fn leave_garbage(vm: &mut Vm) -> Result<(), LuaError> {
    vm.gc(GcCommand::Stop)?;
    for _ in 0..64 {
        vm.create_table(8, 8)?;
        vm.pop(1);
    }
    Ok(())
}

/// Fill the frame up to two slots short of the stack end, keeping room
/// for one more push.
fn fill_to_stack_end(vm: &mut Vm) -> Result<(), LuaError> {
    let n = {
        let t = vm.g.heap.thread(vm.running());
        t.stack_last() - 2 - t.top
    };
    vm.check_stack(n + 1)?;
    let top = vm.get_top();
    vm.set_top((top + n) as i32);
    Ok(())
}

fn tighten_limit(vm: &mut Vm, slack: usize) {
    vm.g.gc.memory_limit = Some(vm.g.gc.total_bytes() + slack);
}

/// Fails with a runtime message once any further growth has to collect.
fn fail_at_stack_end(vm: &mut Vm) -> Result<usize, LuaError> {
    let slack = vm.to_integer(1).unwrap_or(0) as usize;
    leave_garbage(vm)?;
    fill_to_stack_end(vm)?;
    tighten_limit(vm, slack);
    Err(LuaError::Runtime("failure at the end of the stack".into()))
}

/// Like `fail_at_stack_end`, with a string error object popped off the stack.
fn raise_at_stack_end(vm: &mut Vm) -> Result<usize, LuaError> {
    let slack = vm.to_integer(1).unwrap_or(0) as usize;
    leave_garbage(vm)?;
    fill_to_stack_end(vm)?;
    vm.push_string("raised at the end of the stack")?;
    tighten_limit(vm, slack);
    Err(vm.error())
}

fn annotate(vm: &mut Vm) -> Result<usize, LuaError> {
    let msg = vm.to_str(1).unwrap_or_default();
    vm.push_string(&format!("handled: {msg}"))?;
    Ok(1)
}

fn pcall_with_handler(vm: &mut Vm, body: lunaria_vm::NativeFn, slack: i64) -> (ThreadStatus, Option<String>) {
    let h = vm.register_native(annotate);
    let f = vm.register_native(body);
    vm.push_native(h, "annotate", 0).unwrap();
    vm.push_native(f, "body", 0).unwrap();
    vm.push_integer(slack);
    let status = vm.pcall(1, 1, 1).unwrap();
    let msg = vm.to_str(-1);
    vm.g.gc.memory_limit = None;
    (status, msg)
}

#[test]
fn test_handler_message_survives_emergency_collection() {
    for slack in (0..256).step_by(16) {
        let mut vm = new_vm();
        let (status, msg) = pcall_with_handler(&mut vm, fail_at_stack_end, slack);
        assert_eq!(status, ThreadStatus::ErrRun, "slack {slack}");
        assert_eq!(msg.as_deref(), Some("handled: failure at the end of the stack"), "slack {slack}");
        vm.gc(GcCommand::Restart).unwrap();
        vm.gc(GcCommand::Collect).unwrap();
        assert!(vm.g.invariant_violations().is_empty());
    }
}

#[test]
fn test_handler_error_object_survives_emergency_collection() {
    for slack in (0..256).step_by(16) {
        let mut vm = new_vm();
        let (status, msg) = pcall_with_handler(&mut vm, raise_at_stack_end, slack);
        assert_eq!(status, ThreadStatus::ErrRun, "slack {slack}");
        assert_eq!(msg.as_deref(), Some("handled: raised at the end of the stack"), "slack {slack}");
    }
}

#[test]
fn test_coroutine_error_message_under_memory_limit() {
    for slack in (0..256).step_by(16) {
        let mut vm = new_vm();
        let f = vm.register_native(fail_at_stack_end);
        vm.push_native(f, "body", 0).unwrap();
        let co = spawn(&mut vm);
        let (status, r) = resume_with(&mut vm, co, &[TValue::Int(slack)]);
        vm.g.gc.memory_limit = None;
        assert_eq!(status, ThreadStatus::ErrRun, "slack {slack}");
        assert_eq!(r.len(), 1);
        assert_str(&r, 0, "failure at the end of the stack", &vm);
        assert_eq!(vm.coroutine_status(co), lunaria_vm::CoStatus::Dead);
    }
}
