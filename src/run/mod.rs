// src/run/mod.rs

//! Run specifications and the per-run state machine.

pub mod automated;
pub mod identifier;
pub mod persister;
pub mod spec;
pub mod state;

pub use automated::{AutomatedRun, HardwareLeases, RunContext};
pub use persister::Persister;
pub use spec::{RunSpec, RunSpecConfig};
pub use state::{PhaseResult, RunState};
