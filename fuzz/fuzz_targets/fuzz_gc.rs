#![no_main]

use libfuzzer_sys::fuzz_target;
use lunaria_vm::{GcCommand, RuntimeConfig, Vm};

// Interleave allocation, stack shuffling and collector commands; the heap
// must keep the tri-color invariant throughout.
fuzz_target!(|data: &[u8]| {
    let Ok(mut vm) = Vm::new(RuntimeConfig { seed: Some(3), ..RuntimeConfig::default() }) else {
        return;
    };
    let _ = vm.check_stack(64);
    for &b in data {
        let top = vm.get_top();
        let r = match b & 7 {
            0 if top < 60 => vm.create_table(0, 0),
            1 if top < 60 => vm.push_string(&format!("s{}", b >> 3)),
            2 if top >= 3 => {
                vm.push_integer(b as i64);
                vm.raw_set_i(-3, (b >> 3) as i64)
            }
            3 if top >= 3 => vm.raw_set(-3).or(Ok(())),
            4 if top > 0 => {
                vm.pop(1);
                Ok(())
            }
            5 => vm.gc(GcCommand::Step(0)).map(drop),
            6 if b > 0xf0 => vm.gc(GcCommand::Collect).map(drop),
            _ => Ok(()),
        };
        if r.is_err() {
            vm.set_top(0);
        }
        assert!(vm.g.invariant_violations().is_empty());
    }
});
