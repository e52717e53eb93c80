#![allow(dead_code, unused_imports)]

pub use exprun_test_utils::builders::{QueueBuilder, SpecBuilder};
pub use exprun_test_utils::{init_tracing, with_timeout, Harness};

use exprun::run::RunState;

/// Whether `states` only ever moves forward through the run life cycle.
pub fn is_monotonic(states: &[RunState]) -> bool {
    let order = |s: &RunState| match s {
        RunState::NotRun => 0,
        RunState::Extraction => 1,
        RunState::Measurement => 2,
        RunState::PostMeasurement => 3,
        _ => 4,
    };
    let terminals = states.iter().filter(|s| s.is_terminal()).count();
    terminals <= 1 && states.windows(2).all(|w| order(&w[0]) < order(&w[1]))
}
