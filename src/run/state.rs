// src/run/state.rs

//! Per-run life cycle state.

use std::fmt;

use serde::Serialize;

/// State of an automated run.
///
/// Runs move forward through
/// `NotRun -> Extraction -> Measurement -> PostMeasurement -> <terminal>`.
/// Phases may be skipped (a run without an extraction script goes straight to
/// measurement) but never revisited, and cancel/truncate/failure may jump to
/// a terminal state early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotRun,
    Extraction,
    Measurement,
    PostMeasurement,
    Success,
    Truncated,
    Canceled,
    Failed,
}

impl RunState {
    fn rank(&self) -> u8 {
        match self {
            RunState::NotRun => 0,
            RunState::Extraction => 1,
            RunState::Measurement => 2,
            RunState::PostMeasurement => 3,
            RunState::Success | RunState::Truncated | RunState::Canceled | RunState::Failed => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 4
    }

    /// Extraction or measurement: the run is holding hardware.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, RunState::Extraction | RunState::Measurement)
    }

    /// Whether moving from `self` to `next` keeps the life cycle monotonic.
    pub fn can_advance_to(&self, next: RunState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::NotRun => "not run",
            RunState::Extraction => "extraction",
            RunState::Measurement => "measurement",
            RunState::PostMeasurement => "post_measurement",
            RunState::Success => "success",
            RunState::Truncated => "truncated",
            RunState::Canceled => "canceled",
            RunState::Failed => "failed",
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        RunState::NotRun
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single run phase.
///
/// Expected failures travel as values; only unexpected errors are raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseResult {
    Completed,
    Failed(String),
    Canceled,
}

impl PhaseResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, PhaseResult::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_only_move_forward() {
        assert!(RunState::NotRun.can_advance_to(RunState::Extraction));
        assert!(RunState::NotRun.can_advance_to(RunState::Measurement));
        assert!(RunState::Measurement.can_advance_to(RunState::Canceled));
        assert!(!RunState::Measurement.can_advance_to(RunState::Extraction));
        assert!(!RunState::Extraction.can_advance_to(RunState::Extraction));
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [
            RunState::Success,
            RunState::Truncated,
            RunState::Canceled,
            RunState::Failed,
        ] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_advance_to(RunState::Failed));
        }
    }
}
