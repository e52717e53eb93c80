// src/engine/mod.rs

//! Experiment execution engine.
//!
//! This module ties together:
//! - the queue loop that walks every run of every experiment queue
//! - the overlap hand-off (next run extracts while the previous one measures)
//! - pre-flight checks, numbering and crash recovery
//!
//! Decisions that need no IO (overlap eligibility, numbering offsets, how a
//! queue ended) live in [`core`]; the async shell is [`ExperimentExecutor`].
//! Observers (display, tests) follow the engine through [`ExecutorEvent`]s
//! on a broadcast channel.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::run::RunState;
use crate::types::ConsoleColor;

pub mod backup;
mod checks;
pub mod consumer;
pub mod core;
pub mod executor;
mod numbering;

pub use backup::BackupRecovery;
pub use consumer::{ConsumerQueue, Overlapped};
pub use executor::{Collaborators, ExperimentExecutor, PreviousBlanks};

/// How an experiment queue ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Finished,
    Stopped,
    Canceled,
}

impl QueueOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            QueueOutcome::Finished => "Finished",
            QueueOutcome::Stopped => "Stopped",
            QueueOutcome::Canceled => "Canceled",
        }
    }

    pub fn color(&self) -> ConsoleColor {
        match self {
            QueueOutcome::Finished => ConsoleColor::Green,
            QueueOutcome::Stopped => ConsoleColor::Orange,
            QueueOutcome::Canceled => ConsoleColor::Red,
        }
    }
}

/// Everything the engine reports to its observers.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    /// A console line, already styled for its severity.
    Console { text: String, color: ConsoleColor },
    /// Status label for the extraction display. `flash` is `(on, off)` in
    /// seconds.
    ExtractState {
        label: String,
        color: ConsoleColor,
        flash: Option<(f64, f64)>,
    },
    /// A run's mirrored state in its queue changed.
    RunStateChanged { runid: String, state: RunState },
    MeasuringRunChanged(Option<String>),
    ExtractingRunChanged(Option<String>),
    RunFinished {
        runid: String,
        state: RunState,
        duration: Duration,
    },
    QueueFinished { name: String, outcome: QueueOutcome },
    /// The queue has unsaved edits and the save timeout ran out.
    AutoSaveRequested,
}

const BANNER_WIDTH: usize = 40;

/// Operator console. Every line is also logged.
#[derive(Debug, Clone)]
pub struct Console {
    tx: broadcast::Sender<ExecutorEvent>,
}

impl Console {
    pub fn new(tx: broadcast::Sender<ExecutorEvent>) -> Self {
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ExecutorEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        info!(target: "exprun::console", "{msg}");
        self.line(msg.to_string(), ConsoleColor::Green);
    }

    pub fn warning(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        warn!(target: "exprun::console", "{msg}");
        self.line(format!("****** {}", msg.to_uppercase()), ConsoleColor::Red);
    }

    pub fn heading(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        info!(target: "exprun::console", "{msg}");
        let banner = "=".repeat(BANNER_WIDTH);
        self.line(format!("{banner}\n{msg}\n{banner}"), ConsoleColor::Green);
    }

    fn line(&self, text: String, color: ConsoleColor) {
        self.emit(ExecutorEvent::Console { text, color });
    }
}
