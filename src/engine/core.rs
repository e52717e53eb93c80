// src/engine/core.rs

//! Pure scheduling decisions.
//!
//! Nothing here touches Tokio, channels, hardware or the database, so every
//! rule the executor follows can be unit tested in isolation.

use crate::engine::QueueOutcome;
use crate::run::{RunSpec, RunState};
use crate::types::AnalysisType;

/// Whether `spec` may be extracted while the previous run is still
/// measuring.
pub fn should_overlap(spec: &RunSpec, overlap_types: &[AnalysisType], is_last: bool) -> bool {
    spec.overlap && !is_last && overlap_types.contains(&spec.analysis_type)
}

/// Offsets that push `spec` past same-identifier runs that are in flight but
/// not yet committed.
///
/// Returns `(aliquot_offset, step_offset)`.
pub fn numbering_offsets(spec: &RunSpec, in_flight: &[RunSpec]) -> (u32, usize) {
    let same: Vec<&RunSpec> = in_flight
        .iter()
        .filter(|r| r.labnumber == spec.labnumber)
        .collect();

    if spec.is_step_heat() {
        let steps = same
            .iter()
            .filter(|r| r.aliquot == spec.aliquot && r.step.is_some())
            .count();
        (0, steps)
    } else {
        let aliquots = same.iter().filter(|r| r.step.is_none()).count();
        (aliquots as u32, 0)
    }
}

/// The first run that needs a preceding blank but has none before it.
///
/// Returns `(run type, required blank type)`.
pub fn missing_preceding_blank<'a, I>(runs: I) -> Option<(AnalysisType, AnalysisType)>
where
    I: IntoIterator<Item = &'a RunSpec>,
{
    let mut seen: Vec<AnalysisType> = Vec::new();
    for run in runs {
        if let Some(blank) = run.analysis_type.preceding_blank() {
            if seen.contains(&blank) {
                return None;
            }
            return Some((run.analysis_type, blank));
        }
        seen.push(run.analysis_type);
    }
    None
}

/// Whether a finished run's results replace the current blank values.
pub fn forwards_blanks(analysis_type: AnalysisType, state: RunState) -> bool {
    analysis_type.is_blank() && matches!(state, RunState::Success | RunState::Truncated)
}

pub fn queue_outcome(canceled: bool, stopped: bool, errored: bool) -> QueueOutcome {
    if canceled || errored {
        QueueOutcome::Canceled
    } else if stopped {
        QueueOutcome::Stopped
    } else {
        QueueOutcome::Finished
    }
}

/// `(on, off)` seconds for a flashing label, `None` for a steady one.
pub fn flash_pattern(flash: f64, period: f64) -> Option<(f64, f64)> {
    if flash <= 0.0 || flash >= 1.0 || period <= 0.0 {
        return None;
    }
    Some((flash * period, (1.0 - flash) * period))
}
