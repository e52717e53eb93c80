// src/run/automated.rs

//! One run's life cycle: start, extraction, measurement, post-measurement,
//! teardown.
//!
//! The executor drives the phases in order and owns the run through an
//! `Arc`; the run never holds a reference back to the executor. Expected
//! failures come back as [`PhaseResult`] values.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{watch, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hardware::{ManagerRegistry, ScriptKind, ScriptRequest};
use crate::run::persister::Persister;
use crate::run::state::{PhaseResult, RunState};
use crate::run::RunSpec;
use crate::types::TruncateStyle;

/// Fraction of the configured counts a quick truncate still collects.
const QUICK_TRUNCATE_FRACTION: f64 = 0.25;

/// Exclusive access to the extraction device and the spectrometer.
///
/// Shared by every run of an execution; a run holds the extraction lease for
/// its whole extraction phase and the measurement lease for its whole
/// measurement phase.
#[derive(Debug, Clone, Default)]
pub struct HardwareLeases {
    extraction: Arc<tokio::sync::Mutex<()>>,
    measurement: Arc<tokio::sync::Mutex<()>>,
}

impl HardwareLeases {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Collaborators a run is wired to when it is built.
pub struct RunContext {
    pub managers: ManagerRegistry,
    pub persister: Persister,
    pub leases: HardwareLeases,
    pub previous_blanks: BTreeMap<String, f64>,
    pub previous_baselines: BTreeMap<String, f64>,
}

pub struct AutomatedRun {
    runid: String,
    spec: Mutex<RunSpec>,
    history: Mutex<Vec<RunState>>,
    state_tx: watch::Sender<RunState>,
    extraction_ended: watch::Sender<bool>,

    cancel: CancellationToken,
    alive: AtomicBool,
    is_last: AtomicBool,
    truncate: Mutex<Option<TruncateStyle>>,
    truncated: AtomicBool,

    managers: ManagerRegistry,
    persister: Persister,
    leases: HardwareLeases,
    extraction_guard: Mutex<Option<OwnedMutexGuard<()>>>,
    measurement_guard: Mutex<Option<OwnedMutexGuard<()>>>,

    previous_blanks: BTreeMap<String, f64>,
    previous_baselines: BTreeMap<String, f64>,
}

impl std::fmt::Debug for AutomatedRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomatedRun")
            .field("runid", &self.runid)
            .field("state", &self.state())
            .finish()
    }
}

impl AutomatedRun {
    pub fn new(spec: RunSpec, ctx: RunContext) -> Self {
        let runid = spec.runid();
        let (state_tx, _) = watch::channel(RunState::NotRun);
        let (extraction_ended, _) = watch::channel(false);
        Self {
            runid,
            spec: Mutex::new(spec),
            history: Mutex::new(vec![RunState::NotRun]),
            state_tx,
            extraction_ended,
            cancel: CancellationToken::new(),
            alive: AtomicBool::new(false),
            is_last: AtomicBool::new(false),
            truncate: Mutex::new(None),
            truncated: AtomicBool::new(false),
            managers: ctx.managers,
            persister: ctx.persister,
            leases: ctx.leases,
            extraction_guard: Mutex::new(None),
            measurement_guard: Mutex::new(None),
            previous_blanks: ctx.previous_blanks,
            previous_baselines: ctx.previous_baselines,
        }
    }

    pub fn runid(&self) -> &str {
        &self.runid
    }

    /// Snapshot of the spec, including the current state.
    pub fn spec(&self) -> RunSpec {
        self.spec.lock().clone()
    }

    pub fn uuid(&self) -> Option<uuid::Uuid> {
        self.spec.lock().uuid
    }

    pub fn state(&self) -> RunState {
        *self.state_tx.borrow()
    }

    /// Every state the run has been in, in order.
    pub fn state_history(&self) -> Vec<RunState> {
        self.history.lock().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunState> {
        self.state_tx.subscribe()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn is_last(&self) -> bool {
        self.is_last.load(Ordering::SeqCst)
    }

    pub fn set_is_last(&self, last: bool) {
        self.is_last.store(last, Ordering::SeqCst);
    }

    pub fn previous_blanks(&self) -> &BTreeMap<String, f64> {
        &self.previous_blanks
    }

    pub fn previous_baselines(&self) -> &BTreeMap<String, f64> {
        &self.previous_baselines
    }

    /// Advance the state; refuses backwards moves and leaving a terminal
    /// state.
    fn set_state(&self, next: RunState) -> bool {
        let mut spec = self.spec.lock();
        if !spec.state.can_advance_to(next) {
            debug!(runid = %self.runid, from = %spec.state, to = %next, "ignoring state change");
            return false;
        }
        spec.state = next;
        self.history.lock().push(next);
        self.state_tx.send_replace(next);
        true
    }

    fn request(&self, kind: ScriptKind, name: &str) -> ScriptRequest {
        let spec = self.spec.lock();
        ScriptRequest {
            kind,
            name: name.to_string(),
            runid: self.runid.clone(),
            extract_device: spec.extract_device.clone(),
            extract_value: spec.extract_value,
            extract_units: spec.extract_units.clone(),
            duration: spec.duration,
            cleanup: spec.cleanup,
            position: spec.position.clone(),
        }
    }

    async fn run_script(&self, kind: ScriptKind, name: &str) -> PhaseResult {
        let request = self.request(kind, name);
        let runner = self.managers.script_runner.clone();
        match runner.execute(request, self.cancel.child_token()).await {
            Ok(res) => res,
            Err(err) => PhaseResult::Failed(format!("{kind} script {name} errored: {err:#}")),
        }
    }

    fn phase_failed(&self, result: &PhaseResult) {
        match result {
            PhaseResult::Failed(reason) => {
                warn!(runid = %self.runid, %reason, "phase failed");
                self.set_state(RunState::Failed);
            }
            PhaseResult::Canceled => {
                self.set_state(RunState::Canceled);
            }
            PhaseResult::Completed => {}
        }
    }

    /// Make the run live. Returns `false` if the run cannot proceed.
    pub async fn start(&self) -> bool {
        let spec = self.spec();
        if self.cancel.is_cancelled() {
            return false;
        }
        if spec.measurement_script.is_some() && self.managers.spectrometer.is_none() {
            warn!(runid = %self.runid, "measurement script given but no spectrometer");
            return false;
        }
        if let Some(monitor) = &self.managers.monitor {
            match monitor.check().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(runid = %self.runid, "run monitor check failed");
                    return false;
                }
                Err(err) => {
                    warn!(runid = %self.runid, error = %err, "run monitor errored");
                    return false;
                }
            }
        }
        self.alive.store(true, Ordering::SeqCst);
        info!(runid = %self.runid, analysis_type = %spec.analysis_type, "start automated run");
        true
    }

    /// Take the extraction lease and enter `extraction`.
    ///
    /// Returns `false` if the run has no extraction script or was canceled
    /// while waiting for the extraction device.
    pub async fn start_extraction(&self) -> bool {
        if self.spec.lock().extraction_script.is_none() {
            debug!(runid = %self.runid, "no extraction script");
            return false;
        }
        let guard = tokio::select! {
            g = self.leases.extraction.clone().lock_owned() => g,
            _ = self.cancel.cancelled() => return false,
        };
        *self.extraction_guard.lock() = Some(guard);
        self.set_state(RunState::Extraction)
    }

    pub async fn do_extraction(&self) -> PhaseResult {
        let script = self.spec.lock().extraction_script.clone().unwrap_or_default();
        info!(runid = %self.runid, %script, "extraction started");
        let result = self.run_script(ScriptKind::Extraction, &script).await;
        if !result.is_completed() {
            self.phase_failed(&result);
            self.end_extraction();
        }
        info!(runid = %self.runid, ?result, "extraction finished");
        result
    }

    /// Release the extraction device and wake anyone waiting to overlap.
    ///
    /// A successful extraction keeps the device until the run has left the
    /// `extraction` state, so the next run can never be seen extracting
    /// alongside it.
    pub fn end_extraction(&self) {
        self.extraction_guard.lock().take();
        self.extraction_ended.send_replace(true);
    }

    /// Wait until this run no longer needs the extraction device, then the
    /// spec's overlap delay.
    pub async fn wait_for_overlap(&self) {
        let mut rx = self.extraction_ended.subscribe();
        let ended = async move {
            let _ = rx.wait_for(|ended| *ended).await;
        };
        tokio::select! {
            _ = ended => {}
            _ = self.cancel.cancelled() => return,
        }
        let delay = self.spec.lock().overlap_delay;
        let wait = Duration::try_from_secs_f64(delay).unwrap_or_default();
        if !wait.is_zero() {
            debug!(runid = %self.runid, delay, "overlap delay");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    /// Take the measurement lease and enter `measurement`, then hand the
    /// extraction device to the next run.
    pub async fn start_measurement(&self) -> bool {
        if self.spec.lock().measurement_script.is_none() {
            debug!(runid = %self.runid, "no measurement script");
            return false;
        }
        let guard = tokio::select! {
            g = self.leases.measurement.clone().lock_owned() => g,
            _ = self.cancel.cancelled() => return false,
        };
        *self.measurement_guard.lock() = Some(guard);
        let entered = self.set_state(RunState::Measurement);
        self.end_extraction();
        entered
    }

    pub async fn do_measurement(&self) -> PhaseResult {
        let result = self.measure().await;
        self.measurement_guard.lock().take();
        self.phase_failed(&result);
        info!(runid = %self.runid, ?result, ncounts = self.persister.signal_count(), "measurement finished");
        result
    }

    async fn measure(&self) -> PhaseResult {
        let spec = self.spec();
        let script = spec.measurement_script.clone().unwrap_or_default();
        let Some(spectrometer) = self.managers.spectrometer.clone() else {
            return PhaseResult::Failed("no spectrometer manager".into());
        };

        let res = self.run_script(ScriptKind::Measurement, &script).await;
        if !res.is_completed() {
            return res;
        }

        if spec.peak_center {
            if let Some(ion_optics) = &self.managers.ion_optics {
                match ion_optics.peak_center(&spec.reference_detector).await {
                    Ok(dac) => info!(runid = %self.runid, dac, "peak center"),
                    Err(err) => {
                        return PhaseResult::Failed(format!("peak center failed: {err:#}"));
                    }
                }
            }
        }

        if let Err(err) = spectrometer.set_baseline_mode(false).await {
            return PhaseResult::Failed(format!("positioning magnet failed: {err:#}"));
        }
        let res = self.count(spec.ncounts, false).await;
        if !res.is_completed() || self.truncate_style() == Some(TruncateStyle::Normal) {
            return res;
        }

        if spec.baseline_counts > 0 {
            if let Err(err) = spectrometer.set_baseline_mode(true).await {
                return PhaseResult::Failed(format!("positioning magnet failed: {err:#}"));
            }
            let res = self.count(spec.baseline_counts, true).await;
            if let Err(err) = spectrometer.set_baseline_mode(false).await {
                warn!(runid = %self.runid, error = %err, "failed leaving baseline");
            }
            return res;
        }
        PhaseResult::Completed
    }

    async fn count(&self, ncounts: u32, baseline: bool) -> PhaseResult {
        let Some(spectrometer) = self.managers.spectrometer.clone() else {
            return PhaseResult::Failed("no spectrometer manager".into());
        };
        let quick_limit = (ncounts as f64 * QUICK_TRUNCATE_FRACTION).ceil() as u32;

        let mut i = 0;
        while i < ncounts {
            if self.cancel.is_cancelled() {
                return PhaseResult::Canceled;
            }
            match self.truncate_style() {
                Some(TruncateStyle::Normal) => break,
                Some(TruncateStyle::Quick) if i >= quick_limit => break,
                _ => {}
            }

            let cycle = tokio::select! {
                r = spectrometer.read_intensities() => r,
                _ = self.cancel.cancelled() => return PhaseResult::Canceled,
            };
            match cycle {
                Ok(cycle) if baseline => self.persister.add_baseline(cycle),
                Ok(cycle) => self.persister.add_signal(cycle),
                Err(err) => return PhaseResult::Failed(format!("reading intensities: {err:#}")),
            }
            i += 1;
        }
        PhaseResult::Completed
    }

    pub async fn do_post_measurement(&self) -> PhaseResult {
        self.set_state(RunState::PostMeasurement);
        self.end_extraction();

        let script = self.spec.lock().post_measurement_script.clone();
        if let Some(script) = script {
            let res = self.run_script(ScriptKind::PostMeasurement, &script).await;
            if !res.is_completed() {
                self.phase_failed(&res);
                return res;
            }
        }

        let mut spec = self.spec();
        if spec.measurement_script.is_some() {
            spec.state = self.completed_state();
            if let Err(err) = self.persister.save(&spec, self.previous_blanks.clone()) {
                let res = PhaseResult::Failed(format!("saving run failed: {err}"));
                self.phase_failed(&res);
                return res;
            }
        }
        PhaseResult::Completed
    }

    fn completed_state(&self) -> RunState {
        if self.truncated.load(Ordering::SeqCst) {
            RunState::Truncated
        } else {
            RunState::Success
        }
    }

    /// Mark a run that went through every phase as done.
    ///
    /// Becomes `truncated` if counting was cut short, `success` otherwise.
    pub fn complete(&self) {
        self.set_state(self.completed_state());
    }

    fn truncate_style(&self) -> Option<TruncateStyle> {
        *self.truncate.lock()
    }

    /// Cut counting short. Only meaningful while measuring.
    pub fn truncate_run(&self, style: TruncateStyle) -> bool {
        if self.state() != RunState::Measurement {
            debug!(runid = %self.runid, state = %self.state(), "truncate ignored");
            return false;
        }
        info!(runid = %self.runid, ?style, "truncating run");
        *self.truncate.lock() = Some(style);
        self.truncated.store(true, Ordering::SeqCst);
        true
    }

    /// Abort the run mid-phase. `state` is applied immediately when given;
    /// otherwise the run becomes `canceled` when it finishes.
    pub fn cancel_run(&self, state: Option<RunState>) {
        info!(runid = %self.runid, ?state, "canceling run");
        self.alive.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        if let Some(state) = state {
            self.set_state(state);
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Leave the run in a terminal state and release its hardware.
    pub fn finish(&self) {
        if !self.state().is_terminal() {
            let terminal = if self.cancel.is_cancelled() {
                RunState::Canceled
            } else {
                RunState::Failed
            };
            self.set_state(terminal);
        }
        self.end_extraction();
        self.measurement_guard.lock().take();
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn get_baseline_corrected_signals(&self) -> Option<BTreeMap<String, f64>> {
        self.persister.baseline_corrected()
    }

    pub fn get_baselines(&self) -> BTreeMap<String, f64> {
        self.persister.baselines()
    }

    pub fn teardown(&self) {
        debug!(runid = %self.runid, state = %self.state(), "teardown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datahub::{Datahub, InMemoryStore};
    use crate::hardware::sim;

    fn run_with(spec: RunSpec, leases: HardwareLeases) -> (AutomatedRun, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new("main"));
        let hub = Arc::new(Datahub::new(store.clone()));
        let ctx = RunContext {
            managers: sim::registry("Fusions CO2", Duration::ZERO),
            persister: Persister::new(hub, None, None),
            leases,
            previous_blanks: BTreeMap::new(),
            previous_baselines: BTreeMap::new(),
        };
        (AutomatedRun::new(spec, ctx), store)
    }

    fn full_spec() -> RunSpec {
        let mut spec = RunSpec::new("12345", 1);
        spec.extraction_script = Some("extract".into());
        spec.measurement_script = Some("measure".into());
        spec.ncounts = 8;
        spec.baseline_counts = 4;
        spec
    }

    #[tokio::test]
    async fn full_life_cycle_reaches_success_and_saves() {
        let (run, store) = run_with(full_spec(), HardwareLeases::new());
        assert!(run.start().await);
        assert!(run.start_extraction().await);
        assert_eq!(run.do_extraction().await, PhaseResult::Completed);
        assert!(run.start_measurement().await);
        assert_eq!(run.do_measurement().await, PhaseResult::Completed);
        assert_eq!(run.do_post_measurement().await, PhaseResult::Completed);
        run.complete();
        run.finish();

        assert_eq!(
            run.state_history(),
            vec![
                RunState::NotRun,
                RunState::Extraction,
                RunState::Measurement,
                RunState::PostMeasurement,
                RunState::Success,
            ]
        );
        let saved = store.analyses();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].signals["Ar40"] > 1000.0);
        assert!(saved[0].baselines["Ar40"] < 1.0);
    }

    #[tokio::test]
    async fn quick_truncate_keeps_a_quarter_of_the_counts() {
        let (run, _) = run_with(full_spec(), HardwareLeases::new());
        assert!(run.start().await);
        assert!(run.start_measurement().await);
        assert!(run.truncate_run(TruncateStyle::Quick));
        assert_eq!(run.do_measurement().await, PhaseResult::Completed);
        run.do_post_measurement().await;
        run.complete();

        assert_eq!(run.persister.signal_count(), 2);
        assert_eq!(run.persister.baseline_count(), 1);
        assert_eq!(run.state(), RunState::Truncated);
    }

    #[tokio::test]
    async fn normal_truncate_skips_baselines() {
        let (run, _) = run_with(full_spec(), HardwareLeases::new());
        assert!(run.start().await);
        assert!(run.start_measurement().await);
        run.truncate_run(TruncateStyle::Normal);
        assert_eq!(run.do_measurement().await, PhaseResult::Completed);
        assert_eq!(run.persister.signal_count(), 0);
        assert_eq!(run.persister.baseline_count(), 0);
    }

    #[tokio::test]
    async fn truncate_outside_measurement_is_ignored() {
        let (run, _) = run_with(full_spec(), HardwareLeases::new());
        assert!(!run.truncate_run(TruncateStyle::Normal));
    }

    #[tokio::test]
    async fn cancel_while_waiting_for_the_extraction_lease() {
        let leases = HardwareLeases::new();
        let _held = leases.extraction.clone().lock_owned().await;
        let (run, _) = run_with(full_spec(), leases);
        assert!(run.start().await);

        run.cancel_run(None);
        assert!(!run.start_extraction().await);
        run.finish();
        assert_eq!(run.state(), RunState::Canceled);
        assert_eq!(run.state_history(), vec![RunState::NotRun, RunState::Canceled]);
    }

    #[tokio::test]
    async fn extraction_device_is_held_until_measurement_starts() {
        let leases = HardwareLeases::new();
        let (run, _) = run_with(full_spec(), leases.clone());
        assert!(run.start().await);
        assert!(run.start_extraction().await);
        assert_eq!(run.do_extraction().await, PhaseResult::Completed);
        assert!(leases.extraction.try_lock().is_err());

        assert!(run.start_measurement().await);
        assert!(leases.extraction.try_lock().is_ok());
        assert!(*run.extraction_ended.borrow());
    }

    #[tokio::test]
    async fn wait_for_overlap_returns_once_extraction_ends() {
        let (run, _) = run_with(full_spec(), HardwareLeases::new());
        let run = Arc::new(run);
        let waiter = {
            let run = run.clone();
            tokio::spawn(async move { run.wait_for_overlap().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        run.end_extraction();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn unrepresentable_overlap_delay_is_skipped() {
        let mut spec = full_spec();
        spec.overlap_delay = 1e20;
        let (run, _) = run_with(spec, HardwareLeases::new());
        run.end_extraction();
        tokio::time::timeout(Duration::from_secs(1), run.wait_for_overlap())
            .await
            .unwrap();
    }
}
