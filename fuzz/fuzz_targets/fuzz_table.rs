#![no_main]

use libfuzzer_sys::fuzz_target;
use lunaria_core::config::RuntimeConfig;
use lunaria_core::state::GlobalState;
use lunaria_core::value::TValue;

fn key(g: &mut GlobalState, b: u8, c: u8) -> TValue {
    match b % 5 {
        0 => TValue::Int(c as i64 - 8),
        1 => TValue::Float(c as f64 / 4.0),
        2 => TValue::Str(g.new_str(&format!("k{}", c % 32)).unwrap()),
        3 => TValue::Bool(c & 1 == 1),
        _ => TValue::Int((c as i64) << 40),
    }
}

// Arbitrary set/get/next sequences must never panic, and reads must agree
// with the last write.
fuzz_target!(|data: &[u8]| {
    let Ok(mut g) = GlobalState::new(RuntimeConfig { seed: Some(1), ..RuntimeConfig::default() }) else {
        return;
    };
    let Ok(t) = g.new_table(0, 0) else { return };
    for op in data.chunks_exact(3) {
        let k = key(&mut g, op[0], op[1]);
        match op[0] >> 5 {
            0..=4 => {
                let v = if op[2] == 0 { TValue::Nil } else { TValue::Int(op[2] as i64) };
                if g.table_set(t, k, v).is_ok() {
                    assert!(g.table_get(t, k) == v);
                }
            }
            5 => {
                let _ = g.table_next(t, k);
            }
            _ => {
                let n = g.table_len(t);
                if n > 0 {
                    assert!(!g.table_get_int(t, n as i64).is_nil());
                }
            }
        }
    }
});
