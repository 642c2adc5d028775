#![allow(dead_code)]

use lunaria_core::func::LuaClosure;
use lunaria_core::gc::GcIdx;
use lunaria_core::state::LuaThread;
use lunaria_vm::{LuaError, RuntimeConfig, TValue, ThreadStatus, Vm};

// ---- scripted prototypes understood by the test executor ----

/// Increments upvalue 1 and returns the new value.
pub const COUNTER: usize = 0;
/// Returns upvalue 1.
pub const GET_UPVALUE: usize = 1;
/// Calls its first argument with the rest and returns one result.
pub const CALL_ARG: usize = 2;
/// Allocates as many tables as its first argument says.
pub const GARBAGE: usize = 3;

/// A tiny stand-in for a bytecode interpreter: every prototype index is one
/// hand-written behavior.
pub fn script_executor(vm: &mut Vm, cl: GcIdx<LuaClosure>) -> Result<usize, LuaError> {
    let proto = vm.g.heap.closure(cl).proto_idx;
    match proto {
        COUNTER => {
            let n = vm.g.closure_upval(cl, 0).and_then(|v| v.as_integer()).unwrap_or(0) + 1;
            vm.g.set_closure_upval(cl, 0, TValue::Int(n));
            vm.push_integer(n);
            Ok(1)
        }
        GET_UPVALUE => {
            let v = vm.g.closure_upval(cl, 0).unwrap_or_default();
            vm.push(v);
            Ok(1)
        }
        CALL_ARG => {
            // pc 1 means the call already happened and its result is in place
            if vm.frame_pc() == 0 {
                vm.set_frame_pc(1);
                let nargs = vm.get_top() - 1;
                vm.call(nargs, 1)?;
            }
            Ok(1)
        }
        GARBAGE => {
            let n = vm.to_integer(1).unwrap_or(0);
            for _ in 0..n {
                vm.create_table(4, 4)?;
                vm.pop(1);
            }
            Ok(0)
        }
        _ => Err(LuaError::Runtime(format!("unknown prototype {proto}"))),
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A runtime with a fixed seed and the test executor installed.
pub fn new_vm() -> Vm {
    new_vm_with(RuntimeConfig {
        seed: Some(42),
        ..RuntimeConfig::default()
    })
}

pub fn new_vm_with(config: RuntimeConfig) -> Vm {
    init_tracing();
    let mut vm = Vm::new(config).unwrap_or_else(|e| panic!("cannot create runtime: {e}"));
    vm.set_executor(script_executor);
    vm
}

/// Pop the top `n` values, bottom first.
pub fn take(vm: &mut Vm, n: usize) -> Vec<TValue> {
    let out = (0..n).map(|i| vm.value_at(-(n as i32) + i as i32)).collect();
    vm.pop(n);
    out
}

/// Call the function below `args` and return every result.
pub fn call_with(vm: &mut Vm, args: &[TValue]) -> Vec<TValue> {
    let base = vm.get_top() - 1;
    vm.check_stack(args.len()).unwrap();
    for &a in args {
        vm.push(a);
    }
    vm.call(args.len(), -1).unwrap_or_else(|e| panic!("runtime error: {e}"));
    let n = vm.get_top() - base;
    take(vm, n)
}

/// Create a coroutine whose body is the value on top of the stack. The
/// thread is left in its place.
pub fn spawn(vm: &mut Vm) -> GcIdx<LuaThread> {
    let co = vm.new_thread().unwrap();
    vm.insert(-2).unwrap();
    let main = vm.running();
    vm.xmove(main, co, 1).unwrap();
    co
}

/// Resume `co` with `args` and collect what it hands back.
pub fn resume_with(vm: &mut Vm, co: GcIdx<LuaThread>, args: &[TValue]) -> (ThreadStatus, Vec<TValue>) {
    vm.check_stack(args.len()).unwrap();
    for &a in args {
        vm.push(a);
    }
    let main = vm.running();
    vm.xmove(main, co, args.len()).unwrap();
    let (status, n) = vm.resume(co, args.len());
    vm.check_stack(n).unwrap();
    vm.xmove(co, main, n).unwrap();
    (status, take(vm, n))
}

pub fn str_value(vm: &mut Vm, s: &str) -> TValue {
    TValue::Str(vm.g.new_str(s).unwrap())
}

/// Check that results[idx] is an integer with the expected value.
pub fn assert_int(results: &[TValue], idx: usize, expected: i64) {
    let val = results[idx];
    let got = val
        .as_integer()
        .unwrap_or_else(|| panic!("result[{idx}] = {:?}, expected integer {expected}", val));
    assert_eq!(got, expected, "result[{idx}] = {got}, expected {expected}");
}

/// Check that results[idx] is a boolean with the expected value.
pub fn assert_bool(results: &[TValue], idx: usize, expected: bool) {
    let val = results[idx];
    let got = val
        .as_bool()
        .unwrap_or_else(|| panic!("result[{idx}] = {:?}, expected bool {expected}", val));
    assert_eq!(got, expected, "result[{idx}] = {got}, expected {expected}");
}

/// Check that results[idx] is nil.
pub fn assert_nil(results: &[TValue], idx: usize) {
    let val = results[idx];
    assert!(val.is_nil(), "result[{idx}] = {:?}, expected nil", val);
}

/// Check that results[idx] is a string with the expected value.
pub fn assert_str(results: &[TValue], idx: usize, expected: &str, vm: &Vm) {
    let val = results[idx];
    let sid = val
        .as_string_id()
        .unwrap_or_else(|| panic!("result[{idx}] = {:?}, expected string \"{expected}\"", val));
    let got = vm.g.string_lossy(sid);
    assert_eq!(got, expected, "result[{idx}] = \"{got}\", expected \"{expected}\"");
}
