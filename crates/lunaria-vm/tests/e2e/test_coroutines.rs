use super::helpers::*;
use lunaria_core::func::ContinuationId;
use lunaria_vm::{CoStatus, LuaError, TValue, ThreadStatus, Vm};

// ---- natives used as coroutine bodies ----

/// Yields 1, 2, 3 through a continuation, then returns "done".
fn generator(vm: &mut Vm) -> Result<usize, LuaError> {
    generator_k(vm, ThreadStatus::Ok, 0)
}

fn generator_k(vm: &mut Vm, _status: ThreadStatus, ctx: isize) -> Result<usize, LuaError> {
    if ctx == 3 {
        vm.push_string("done")?;
        return Ok(1);
    }
    vm.push_integer(ctx as i64 + 1);
    // continuation 0 is generator_k in every test that uses this body
    vm.yield_k(1, ctx + 1, Some(ContinuationId(0)))
}

fn yield_args(vm: &mut Vm) -> Result<usize, LuaError> {
    let n = vm.get_top();
    vm.yield_(n)
}

fn raise(vm: &mut Vm) -> Result<usize, LuaError> {
    vm.push_string("boom")?;
    Err(vm.error())
}

/// pcall_k on its first argument; the continuation reports what happened.
fn protected_body(vm: &mut Vm) -> Result<usize, LuaError> {
    vm.push_value(1);
    let status = vm.pcall_k(0, 1, 0, 7, Some(ContinuationId(0)))?;
    report_k(vm, status, 7)
}

fn report_k(vm: &mut Vm, status: ThreadStatus, ctx: isize) -> Result<usize, LuaError> {
    assert_eq!(ctx, 7);
    let tag = match status {
        ThreadStatus::Ok | ThreadStatus::Yield => "ok",
        _ => "caught",
    };
    vm.push_string(tag)?;
    vm.insert(-2)?;
    Ok(2)
}

fn status_of_arg(vm: &mut Vm) -> Result<usize, LuaError> {
    let co = vm.to_thread(1).ok_or_else(|| LuaError::Runtime("thread expected".into()))?;
    let name = vm.coroutine_status(co).name();
    vm.push_string(name)?;
    vm.push_boolean(vm.is_yieldable());
    Ok(2)
}

/// Runs its first argument as a nested coroutine, passing the running thread.
fn run_nested(vm: &mut Vm) -> Result<usize, LuaError> {
    let me = vm.running();
    let co = vm.new_thread()?;
    vm.push_value(1);
    vm.xmove(me, co, 1)?;
    vm.push(TValue::Thread(me));
    vm.xmove(me, co, 1)?;
    let (status, n) = vm.resume(co, 1);
    assert_eq!(status, ThreadStatus::Ok);
    vm.check_stack(n)?;
    vm.xmove(co, me, n)?;
    Ok(n)
}

fn resume_self(vm: &mut Vm) -> Result<usize, LuaError> {
    let me = vm.running();
    let (status, n) = vm.resume(me, 0);
    assert_eq!((status, n), (ThreadStatus::ErrRun, 1));
    // the message was pushed onto our own stack
    Ok(1)
}

// ---- basic resume / yield ----

#[test]
fn test_generator_with_continuation() {
    let mut vm = new_vm();
    vm.register_continuation(generator_k);
    let f = vm.register_native(generator);
    vm.push_native(f, "generator", 0).unwrap();
    let co = spawn(&mut vm);
    for i in 1..=3 {
        let (status, r) = resume_with(&mut vm, co, &[]);
        assert_eq!(status, ThreadStatus::Yield);
        assert_int(&r, 0, i);
        assert_eq!(vm.coroutine_status(co), CoStatus::Suspended);
    }
    let (status, r) = resume_with(&mut vm, co, &[]);
    assert_eq!(status, ThreadStatus::Ok);
    assert_str(&r, 0, "done", &vm);
    assert_eq!(vm.coroutine_status(co), CoStatus::Dead);
}

#[test]
fn test_resume_values_pass_through_yield() {
    let mut vm = new_vm();
    let f = vm.register_native(yield_args);
    vm.push_native(f, "yield_args", 0).unwrap();
    let co = spawn(&mut vm);
    let (status, r) = resume_with(&mut vm, co, &[TValue::Int(1), TValue::Int(2)]);
    assert_eq!(status, ThreadStatus::Yield);
    assert_eq!(r.len(), 2);
    assert_int(&r, 1, 2);
    // without a continuation the next resume's arguments are the results
    let (status, r) = resume_with(&mut vm, co, &[TValue::Int(3), TValue::Int(4), TValue::Int(5)]);
    assert_eq!(status, ThreadStatus::Ok);
    assert_eq!(r.len(), 3);
    assert_int(&r, 2, 5);
}

#[test]
fn test_yield_through_scripted_frame() {
    let mut vm = new_vm();
    let y = vm.register_native(yield_args);
    vm.push_lua_closure(CALL_ARG, 0).unwrap();
    let co = spawn(&mut vm);
    vm.push_native(y, "yield_args", 0).unwrap();
    let arg = vm.value_at(-1);
    vm.pop(1);
    let (status, r) = resume_with(&mut vm, co, &[arg, TValue::Int(7)]);
    assert_eq!(status, ThreadStatus::Yield);
    assert_int(&r, 0, 7);
    let (status, r) = resume_with(&mut vm, co, &[TValue::Int(9)]);
    assert_eq!(status, ThreadStatus::Ok);
    assert_eq!(r.len(), 1);
    assert_int(&r, 0, 9);
}

// ---- protected calls inside coroutines ----

#[test]
fn test_error_in_yieldable_pcall_is_recovered() {
    let mut vm = new_vm();
    vm.register_continuation(report_k);
    let body = vm.register_native(protected_body);
    let bad = vm.register_native(raise);
    vm.push_native(body, "body", 0).unwrap();
    let co = spawn(&mut vm);
    vm.push_native(bad, "raise", 0).unwrap();
    let arg = vm.value_at(-1);
    vm.pop(1);
    let (status, r) = resume_with(&mut vm, co, &[arg]);
    assert_eq!(status, ThreadStatus::Ok);
    assert_str(&r, 0, "caught", &vm);
    assert_str(&r, 1, "boom", &vm);
    assert_eq!(vm.coroutine_status(co), CoStatus::Dead);
}

#[test]
fn test_yield_inside_yieldable_pcall() {
    let mut vm = new_vm();
    vm.register_continuation(report_k);
    let body = vm.register_native(protected_body);
    let y = vm.register_native(|vm| {
        vm.push_integer(11);
        vm.yield_(1)
    });
    vm.push_native(body, "body", 0).unwrap();
    let co = spawn(&mut vm);
    vm.push_native(y, "yielder", 0).unwrap();
    let arg = vm.value_at(-1);
    vm.pop(1);
    let (status, r) = resume_with(&mut vm, co, &[arg]);
    assert_eq!(status, ThreadStatus::Yield);
    assert_int(&r, 0, 11);
    let (status, r) = resume_with(&mut vm, co, &[TValue::Int(12)]);
    assert_eq!(status, ThreadStatus::Ok);
    assert_str(&r, 0, "ok", &vm);
    assert_int(&r, 1, 12);
}

#[test]
fn test_plain_pcall_in_coroutine_is_not_yieldable() {
    let mut vm = new_vm();
    let y = vm.register_native(|vm| vm.yield_(0));
    let body = vm.register_native(|vm| {
        vm.push_value(1);
        let status = vm.pcall(0, 1, 0)?;
        vm.push_boolean(status == ThreadStatus::Ok);
        vm.insert(-2)?;
        Ok(2)
    });
    vm.push_native(body, "body", 0).unwrap();
    let co = spawn(&mut vm);
    vm.push_native(y, "yielder", 0).unwrap();
    let arg = vm.value_at(-1);
    vm.pop(1);
    let (status, r) = resume_with(&mut vm, co, &[arg]);
    assert_eq!(status, ThreadStatus::Ok);
    assert_bool(&r, 0, false);
    assert_str(&r, 1, "attempt to yield across a C-call boundary", &vm);
}

// ---- status ----

#[test]
fn test_status_from_nested_coroutine() {
    let mut vm = new_vm();
    let outer = vm.register_native(run_nested);
    let inner = vm.register_native(status_of_arg);
    vm.push_native(outer, "outer", 0).unwrap();
    let co = spawn(&mut vm);
    vm.push_native(inner, "inner", 0).unwrap();
    let arg = vm.value_at(-1);
    vm.pop(1);
    let (status, r) = resume_with(&mut vm, co, &[arg]);
    assert_eq!(status, ThreadStatus::Ok);
    assert_str(&r, 0, "normal", &vm);
    assert_bool(&r, 1, true);
}

#[test]
fn test_resume_running_coroutine_fails() {
    let mut vm = new_vm();
    let f = vm.register_native(resume_self);
    vm.push_native(f, "resume_self", 0).unwrap();
    let co = spawn(&mut vm);
    let (status, r) = resume_with(&mut vm, co, &[]);
    assert_eq!(status, ThreadStatus::Ok);
    assert_str(&r, 0, "cannot resume non-suspended coroutine", &vm);
}

#[test]
fn test_main_thread_is_not_yieldable() {
    let mut vm = new_vm();
    assert!(!vm.is_yieldable());
    assert!(matches!(vm.yield_(0), Err(LuaError::YieldOutsideCoroutine)));
    let main = vm.running();
    assert_eq!(vm.coroutine_status(main), CoStatus::Running);
}

#[test]
fn test_error_kills_coroutine() {
    let mut vm = new_vm();
    let f = vm.register_native(raise);
    vm.push_native(f, "raise", 0).unwrap();
    let co = spawn(&mut vm);
    let (status, r) = resume_with(&mut vm, co, &[]);
    assert_eq!(status, ThreadStatus::ErrRun);
    assert_str(&r, 0, "boom", &vm);
    assert_eq!(vm.coroutine_status(co), CoStatus::Dead);
    let (status, r) = resume_with(&mut vm, co, &[]);
    assert_eq!(status, ThreadStatus::ErrRun);
    assert_str(&r, 0, "cannot resume dead coroutine", &vm);
}

#[test]
fn test_close_suspended_coroutine_closes_upvalues() {
    let mut vm = new_vm();
    // body: capture local 1 in a closure, hand the closure out, then yield
    let f = vm.register_native(|vm| {
        vm.set_top(0);
        vm.push_integer(5);
        vm.push_lua_closure(GET_UPVALUE, 1)?;
        vm.capture_local(2, 1, 1)?;
        vm.yield_(1)
    });
    vm.push_native(f, "body", 0).unwrap();
    let co = spawn(&mut vm);
    let (status, r) = resume_with(&mut vm, co, &[]);
    assert_eq!(status, ThreadStatus::Yield);
    let getter = r[0];
    vm.close_thread(co).unwrap();
    assert_eq!(vm.coroutine_status(co), CoStatus::Dead);
    vm.push(getter);
    assert_int(&call_with(&mut vm, &[]), 0, 5);
}

#[test]
fn test_many_values_cross_threads() {
    let mut vm = new_vm();
    let f = vm.register_native(yield_args);
    vm.push_native(f, "yield_args", 0).unwrap();
    let co = spawn(&mut vm);
    let args: Vec<TValue> = (0..100).map(TValue::Int).collect();
    let (status, r) = resume_with(&mut vm, co, &args);
    assert_eq!(status, ThreadStatus::Yield);
    assert_eq!(r.len(), 100);
    assert_int(&r, 99, 99);
}
