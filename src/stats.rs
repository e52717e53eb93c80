// src/stats.rs

//! Elapsed / remaining time bookkeeping for the running queue.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Inner {
    started: Option<DateTime<Utc>>,
    stopped: Option<DateTime<Utc>>,
    nruns_finished: usize,
    run_durations: Vec<Duration>,
}

#[derive(Debug, Default)]
pub struct StatsGroup {
    inner: Mutex<Inner>,
}

impl StatsGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self) {
        *self.inner.lock() = Inner::default();
    }

    pub fn start_timer(&self) {
        let mut inner = self.inner.lock();
        inner.started = Some(Utc::now());
        inner.stopped = None;
    }

    pub fn stop_timer(&self) {
        let mut inner = self.inner.lock();
        if inner.started.is_some() && inner.stopped.is_none() {
            inner.stopped = Some(Utc::now());
        }
    }

    pub fn started(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().started
    }

    pub fn is_running(&self) -> bool {
        let inner = self.inner.lock();
        inner.started.is_some() && inner.stopped.is_none()
    }

    pub fn run_finished(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.nruns_finished += 1;
        inner.run_durations.push(duration);
    }

    pub fn nruns_finished(&self) -> usize {
        self.inner.lock().nruns_finished
    }

    /// Time since `start_timer`, frozen at `stop_timer`.
    pub fn elapsed(&self) -> Duration {
        let inner = self.inner.lock();
        match inner.started {
            Some(start) => {
                let end = inner.stopped.unwrap_or_else(Utc::now);
                (end - start).to_std().unwrap_or_default()
            }
            None => Duration::ZERO,
        }
    }

    /// Mean run duration times `remaining_runs`; `None` before the first run
    /// finishes or if the estimate overflows.
    pub fn estimated_remaining(&self, remaining_runs: usize) -> Option<Duration> {
        let inner = self.inner.lock();
        let nruns = u32::try_from(inner.run_durations.len()).ok().filter(|n| *n > 0)?;
        let total = inner
            .run_durations
            .iter()
            .try_fold(Duration::ZERO, |acc, d| acc.checked_add(*d))?;
        let mean = total / nruns;
        mean.checked_mul(u32::try_from(remaining_runs).ok()?)
    }

    /// Projected wall-clock end of the queue.
    pub fn eta(&self, remaining_runs: usize) -> Option<DateTime<Utc>> {
        let remaining = self.estimated_remaining(remaining_runs)?;
        let remaining = chrono::Duration::from_std(remaining).ok()?;
        Utc::now().checked_add_signed(remaining)
    }
}
