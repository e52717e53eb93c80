// src/wait.rs

//! Interruptible countdowns.
//!
//! A [`WaitControl`] is one cancelable delay with live progress. The
//! [`WaitGroup`] pools controls so an inter-run delay and a "waiting for
//! save" countdown can run at the same time without overwriting each other.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Progress of a countdown, in seconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WaitSnapshot {
    pub high: f64,
    pub current_time: f64,
    pub wtime: f64,
    pub message: String,
    pub page_name: String,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Stopped,
}

#[derive(Debug)]
struct ControlInner {
    id: u64,
    state: Mutex<WaitSnapshot>,
    stop: Mutex<CancellationToken>,
}

/// A single countdown. Clones share the same countdown.
#[derive(Debug, Clone)]
pub struct WaitControl {
    inner: Arc<ControlInner>,
}

static NEXT_CONTROL_ID: AtomicU64 = AtomicU64::new(1);

impl Default for WaitControl {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitControl {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ControlInner {
                id: NEXT_CONTROL_ID.fetch_add(1, Ordering::Relaxed),
                state: Mutex::new(WaitSnapshot::default()),
                stop: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    pub fn snapshot(&self) -> WaitSnapshot {
        self.inner.state.lock().clone()
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.inner.state.lock().message = message.into();
    }

    pub fn set_page_name(&self, name: impl Into<String>) {
        self.inner.state.lock().page_name = name.into();
    }

    /// Count down `wtime`, updating `current_time` every `tick`.
    ///
    /// Returns early with [`WaitOutcome::Stopped`] when [`stop`](Self::stop)
    /// is called.
    pub async fn start(&self, wtime: Duration, tick: Duration) -> WaitOutcome {
        let token = CancellationToken::new();
        *self.inner.stop.lock() = token.clone();
        {
            let mut s = self.inner.state.lock();
            s.high = wtime.as_secs_f64();
            s.wtime = wtime.as_secs_f64();
            s.current_time = wtime.as_secs_f64();
            s.active = true;
        }

        let began = Instant::now();
        let tick = if tick.is_zero() { wtime } else { tick };
        let outcome = loop {
            let elapsed = began.elapsed();
            if elapsed >= wtime {
                break WaitOutcome::Elapsed;
            }
            let remaining = wtime - elapsed;
            self.inner.state.lock().current_time = remaining.as_secs_f64();

            tokio::select! {
                _ = tokio::time::sleep(remaining.min(tick)) => {}
                _ = token.cancelled() => break WaitOutcome::Stopped,
            }
        };

        let mut s = self.inner.state.lock();
        s.current_time = 0.0;
        s.active = false;
        debug!(id = self.inner.id, ?outcome, "wait finished");
        outcome
    }

    /// Release anyone blocked in [`start`](Self::start).
    pub fn stop(&self) {
        self.inner.stop.lock().cancel();
    }
}

/// Pool of wait controls; the last one is the active one.
#[derive(Debug, Clone)]
pub struct WaitGroup {
    controls: Arc<Mutex<Vec<WaitControl>>>,
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroup {
    pub fn new() -> Self {
        Self {
            controls: Arc::new(Mutex::new(vec![WaitControl::new()])),
        }
    }

    pub fn active_control(&self) -> WaitControl {
        let mut controls = self.controls.lock();
        if controls.is_empty() {
            controls.push(WaitControl::new());
        }
        controls[controls.len() - 1].clone()
    }

    pub fn add_control(&self) -> WaitControl {
        let control = WaitControl::new();
        self.controls.lock().push(control.clone());
        control
    }

    /// The active control if it is idle, otherwise a fresh one.
    pub fn get_wait_control(&self) -> WaitControl {
        let active = self.active_control();
        if active.is_active() {
            self.add_control()
        } else {
            active
        }
    }

    /// Remove `control` (or the active control). The group always keeps one.
    pub fn pop(&self, control: Option<&WaitControl>) {
        let mut controls = self.controls.lock();
        match control {
            Some(c) => controls.retain(|x| x.id() != c.id()),
            None => {
                controls.pop();
            }
        }
        if controls.is_empty() {
            controls.push(WaitControl::new());
        }
    }

    /// Stop every countdown in the group.
    pub fn stop(&self) {
        for control in self.controls.lock().iter() {
            control.stop();
        }
    }

    pub fn len(&self) -> usize {
        self.controls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.controls.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn short_wait_elapses() {
        let control = WaitControl::new();
        let outcome = control
            .start(Duration::from_millis(20), Duration::from_millis(5))
            .await;
        assert_eq!(outcome, WaitOutcome::Elapsed);
        assert!(!control.is_active());
    }

    #[tokio::test]
    async fn stop_releases_a_long_wait_promptly() {
        let group = WaitGroup::new();
        let control = group.get_wait_control();
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move {
                control
                    .start(Duration::from_secs(3600), Duration::from_secs(1))
                    .await
            })
        };

        while !control.is_active() {
            tokio::task::yield_now().await;
        }
        assert_eq!(control.snapshot().high, 3600.0);

        group.stop();
        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Stopped);
    }

    #[test]
    fn busy_active_control_gets_a_sibling() {
        let group = WaitGroup::new();
        let first = group.active_control();
        first.inner.state.lock().active = true;

        let second = group.get_wait_control();
        assert_ne!(first.id(), second.id());
        assert_eq!(group.len(), 2);

        group.pop(Some(&second));
        assert_eq!(group.active_control().id(), first.id());
        group.pop(None);
        assert_eq!(group.len(), 1);
    }
}
