use super::helpers::*;
use std::collections::HashMap;

use lunaria_core::func::ContinuationId;
use lunaria_vm::{CoStatus, GcCommand, LuaError, TValue, ThreadStatus, Vm};
use proptest::prelude::*;

/// Yields 0..ctx-limit through a continuation, building a table each time.
fn ticker(vm: &mut Vm) -> Result<usize, LuaError> {
    ticker_k(vm, ThreadStatus::Ok, 0)
}

fn ticker_k(vm: &mut Vm, _status: ThreadStatus, ctx: isize) -> Result<usize, LuaError> {
    if ctx == 5 {
        return Ok(0);
    }
    vm.create_table(0, 0)?;
    vm.push_integer(ctx as i64);
    vm.raw_set_i(-2, 1)?;
    vm.yield_k(1, ctx + 1, Some(ContinuationId(0)))
}

// ---- many coroutines ----

#[test]
fn test_round_robin_coroutines_under_collection() {
    let mut vm = new_vm();
    vm.register_continuation(ticker_k);
    let f = vm.register_native(ticker);
    vm.gc(GcCommand::SetPause(100)).unwrap();
    vm.check_stack(210).unwrap();
    let mut threads = Vec::new();
    for _ in 0..200 {
        vm.push_native(f, "ticker", 0).unwrap();
        threads.push(spawn(&mut vm));
    }
    let mut yields = 0;
    for round in 0..6 {
        for &co in &threads {
            let (status, r) = resume_with(&mut vm, co, &[]);
            if round < 5 {
                assert_eq!(status, ThreadStatus::Yield);
                let TValue::Table(t) = r[0] else { panic!("expected a table, got {:?}", r[0]) };
                assert_eq!(vm.g.table_get_int(t, 1), TValue::Int(round));
                yields += 1;
            } else {
                assert_eq!(status, ThreadStatus::Ok);
            }
        }
        vm.gc(GcCommand::Step(0)).unwrap();
        assert!(vm.g.invariant_violations().is_empty());
    }
    assert_eq!(yields, 1000);
    assert!(threads.iter().all(|&co| vm.coroutine_status(co) == CoStatus::Dead));
    vm.set_top(0);
    vm.gc(GcCommand::Collect).unwrap();
}

// ---- object graphs ----

#[test]
fn test_linked_list_survives_incremental_cycles() {
    let mut vm = new_vm();
    vm.gc(GcCommand::SetStepMul(400)).unwrap();
    vm.create_table(0, 0).unwrap();
    // head at 1, tail cursor at 2
    vm.push_value(1);
    for i in 0..2000 {
        vm.create_table(0, 2).unwrap();
        vm.push_integer(i);
        vm.raw_set_field(-2, "v").unwrap();
        vm.push_value(-1);
        vm.raw_set_field(2, "next").unwrap();
        vm.replace(2).unwrap();
        if i % 100 == 0 {
            vm.create_table(64, 0).unwrap();
            vm.pop(1);
            assert!(vm.g.invariant_violations().is_empty());
        }
    }
    vm.gc(GcCommand::Collect).unwrap();
    vm.set_top(1);
    let mut count = 0;
    vm.push_value(1);
    loop {
        vm.raw_get_field(-1, "next").unwrap();
        vm.remove(-2).unwrap();
        if vm.is_none_or_nil(-1) {
            break;
        }
        vm.raw_get_field(-1, "v").unwrap();
        assert_eq!(vm.to_integer(-1), Some(count));
        vm.pop(1);
        count += 1;
    }
    assert_eq!(count, 2000);
}

#[test]
fn test_cycles_are_collected() {
    let mut vm = new_vm();
    vm.gc(GcCommand::Collect).unwrap();
    let before = vm.gc(GcCommand::Count).unwrap();
    for _ in 0..500 {
        vm.create_table(0, 1).unwrap();
        vm.create_table(0, 1).unwrap();
        vm.push_value(-2);
        vm.raw_set_field(-2, "peer").unwrap();
        vm.push_value(-1);
        vm.raw_set_field(-3, "peer").unwrap();
        vm.pop(2);
    }
    vm.gc(GcCommand::Collect).unwrap();
    assert!(vm.gc(GcCommand::Count).unwrap() <= before + 1);
}

// ---- table model ----

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Key {
    Int(i64),
    Str(String),
}

fn key_strategy() -> impl Strategy<Value = Key> {
    prop_oneof![
        (-4i64..48).prop_map(Key::Int),
        "[a-e]{1,3}".prop_map(Key::Str),
    ]
}

fn push_key(vm: &mut Vm, key: &Key) {
    match key {
        Key::Int(i) => vm.push_integer(*i),
        Key::Str(s) => vm.push_string(s).unwrap(),
    }
}

proptest! {
    #[test]
    fn table_behaves_like_a_map(ops in prop::collection::vec((key_strategy(), prop::option::of(any::<i64>())), 1..200)) {
        let mut vm = new_vm();
        let mut model: HashMap<Key, i64> = HashMap::new();
        vm.create_table(0, 0).unwrap();
        for (i, (key, value)) in ops.iter().enumerate() {
            push_key(&mut vm, key);
            match value {
                Some(v) => {
                    vm.push_integer(*v);
                    model.insert(key.clone(), *v);
                }
                None => {
                    vm.push_nil();
                    model.remove(key);
                }
            }
            vm.raw_set(1).unwrap();
            if i % 16 == 0 {
                vm.gc(GcCommand::Step(0)).unwrap();
            }
        }
        for (key, v) in &model {
            push_key(&mut vm, key);
            prop_assert_eq!(vm.raw_get(1).unwrap(), TValue::Int(*v));
            vm.pop(1);
        }
        let mut seen = 0;
        vm.push_nil();
        while vm.next(1).unwrap() {
            seen += 1;
            vm.pop(1);
        }
        prop_assert_eq!(seen, model.len());
        let n = vm.raw_len(1) as i64;
        if n > 0 {
            prop_assert!(model.contains_key(&Key::Int(n)));
        }
        prop_assert!(!model.contains_key(&Key::Int(n + 1)));
    }
}
