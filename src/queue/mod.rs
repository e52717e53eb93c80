// src/queue/mod.rs

//! Experiment queues and the restartable run cursor.

use std::path::PathBuf;

use uuid::Uuid;

use crate::run::{RunSpec, RunState};

pub mod actions;

pub use actions::{ActionKind, QueueAction, QueueActionConfig};

/// An ordered list of runs plus queue-level settings.
///
/// During execution `automated_runs` only shrinks (except for repeat
/// insertion) and `executed_runs` only grows.
#[derive(Debug, Clone, Default)]
pub struct ExperimentQueue {
    pub name: String,
    pub path: Option<PathBuf>,
    pub mass_spectrometer: String,
    pub extract_device: String,
    pub load_name: Option<String>,
    /// Seconds.
    pub delay_before_analyses: f64,
    /// Seconds.
    pub delay_between_analyses: f64,

    pub automated_runs: Vec<RunSpec>,
    pub executed_runs: Vec<RunSpec>,
    pub queue_actions: Vec<QueueAction>,

    /// Assigned the first time the queue is saved to the database.
    pub database_identifier: Option<u64>,
    pub executed: bool,
}

impl ExperimentQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Queued runs that will actually execute.
    pub fn cleaned_automated_runs(&self) -> impl Iterator<Item = &RunSpec> {
        self.automated_runs.iter().filter(|r| !r.skip)
    }

    /// A fresh cursor over the remaining runs.
    ///
    /// Rebuilt whenever the queue is edited during execution.
    pub fn new_runs_generator(&self) -> RunCursor {
        RunCursor {
            nruns: self.cleaned_automated_runs().count(),
            cnt: 0,
        }
    }

    /// Remove and return the next non-skipped run.
    pub fn pop_next(&mut self) -> Option<RunSpec> {
        let idx = self.automated_runs.iter().position(|r| !r.skip)?;
        Some(self.automated_runs.remove(idx))
    }

    /// Put a run that never started back at the head of the queue.
    pub fn restore(&mut self, spec: RunSpec) {
        self.automated_runs.insert(0, spec);
    }

    pub fn add_executed(&mut self, spec: RunSpec) {
        self.executed_runs.push(spec);
    }

    /// Mirror a live run's state into its executed entry. Returns `true` if
    /// the mirrored state changed.
    pub fn set_run_state(&mut self, uuid: Uuid, state: RunState) -> bool {
        match self
            .executed_runs
            .iter_mut()
            .rev()
            .find(|s| s.uuid == Some(uuid))
        {
            Some(spec) if spec.state != state => {
                spec.state = state;
                true
            }
            _ => false,
        }
    }

    /// Executed runs still holding hardware.
    pub fn in_flight(&self) -> impl Iterator<Item = &RunSpec> {
        self.executed_runs.iter().filter(|r| r.state.is_in_flight())
    }

    /// Queue a copy of `spec` to run again next and return it, still
    /// carrying the numbering of the run it repeats.
    pub fn insert_repeat(&mut self, spec: &RunSpec) -> &mut RunSpec {
        let mut again = spec.clone();
        again.state = RunState::NotRun;
        again.conflicts_checked = false;
        again.uuid = None;
        self.automated_runs.insert(0, again);
        &mut self.automated_runs[0]
    }

    pub fn total_runs(&self) -> usize {
        self.automated_runs.len() + self.executed_runs.len()
    }
}

/// Index-free cursor over a live queue.
///
/// Runs are taken from the head of `automated_runs`, so edits made while the
/// queue executes are picked up on the next pull. `nruns` and `cnt` only
/// drive the between-runs delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunCursor {
    pub nruns: usize,
    pub cnt: usize,
}

impl RunCursor {
    pub fn next(&self, queue: &mut ExperimentQueue) -> Option<RunSpec> {
        queue.pop_next()
    }

    pub fn advance(&mut self) {
        self.cnt += 1;
    }

    /// Whether to delay before the next run: not before the first one and
    /// not after the last one.
    pub fn should_delay(&self) -> bool {
        self.cnt != 0 && self.cnt < self.nruns
    }
}
