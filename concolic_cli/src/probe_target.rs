//! A small function with hand-placed probes, standing in for a target
//! rewritten by the instrumentation pass.

use concolic_core::dispatcher::{on_branch, on_step};
use concolic_core::{ConcreteValue, EVALUATED_SLOT, InstructionEvent};

pub const PROBE_ENTRY: u64 = 0x0001_0000;
pub const PROBE_SWITCH: u64 = 0x0001_0001;
pub const PROBE_CALL_ADD_FIVE: u64 = 0x0001_0002;
pub const PROBE_IF_BELOW_TEN: u64 = 0x0001_0003;
pub const PROBE_RETURN: u64 = 0x0001_0004;

pub const ALL_PROBES: [(u64, &str); 5] = [
    (PROBE_ENTRY, "entry"),
    (PROBE_SWITCH, "switch"),
    (PROBE_CALL_ADD_FIVE, "call add_five"),
    (PROBE_IF_BELOW_TEN, "if a < 10"),
    (PROBE_RETURN, "return"),
];

pub fn probe_name(id: u64) -> &'static str {
    ALL_PROBES
        .iter()
        .find(|(probe, _)| *probe == id)
        .map_or("unknown", |(_, name)| name)
}

const SWITCH_KEYS: [i64; 3] = [5, 6, 7];

fn add_five(x: i64) -> i64 {
    x + 5
}

pub fn classify(a: i64) -> i64 {
    on_step(&InstructionEvent::new(PROBE_ENTRY).with_argument(0, ConcreteValue::Int(a)));

    // The probe reports the index of the taken case, or the case count for default.
    let case = SWITCH_KEYS
        .iter()
        .position(|&key| key == a)
        .unwrap_or(SWITCH_KEYS.len());
    on_branch(
        &InstructionEvent::new(PROBE_SWITCH)
            .with_argument(0, ConcreteValue::Int(a))
            .with_argument(EVALUATED_SLOT, ConcreteValue::Int(case as i64)),
    );
    match case {
        0 => return 2,
        1 => return 3,
        2 => return 4,
        _ => {}
    }

    on_step(&InstructionEvent::new(PROBE_CALL_ADD_FIVE).with_argument(0, ConcreteValue::Int(3)));
    let d = add_five(3);
    on_step(&InstructionEvent::new(PROBE_CALL_ADD_FIVE).with_argument(0, ConcreteValue::Int(a)));
    let mut e = add_five(a);

    let below_ten = a < 10;
    on_branch(
        &InstructionEvent::new(PROBE_IF_BELOW_TEN)
            .with_argument(0, ConcreteValue::Int(a))
            .with_argument(EVALUATED_SLOT, ConcreteValue::Bool(below_ten)),
    );
    if below_ten {
        e += 18;
    }

    let result = d + e;
    on_step(&InstructionEvent::new(PROBE_RETURN).with_argument(0, ConcreteValue::Int(result)));
    result
}
