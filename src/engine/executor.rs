// src/engine/executor.rs

//! The queue loop.
//!
//! [`ExperimentExecutor::execute`] runs the pre-flight checks and spawns one
//! worker task that walks every queue in order. Each run goes through its
//! phases either inline, or on its own task when it overlaps with the
//! previous run; overlapped tasks are joined by a [`ConsumerQueue`] before
//! the queue is declared done.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::datahub::{Datahub, ExperimentRecord};
use crate::engine::backup::BackupRecovery;
use crate::engine::consumer::{ConsumerQueue, Overlapped};
use crate::engine::core;
use crate::engine::{Console, ExecutorEvent};
use crate::hardware::ManagerRegistry;
use crate::interaction::{confirm_with_timeout, PromptKind, UserNotifier, UserPrompt};
use crate::memory::MemoryProbe;
use crate::queue::{ActionKind, ExperimentQueue};
use crate::run::identifier::is_special;
use crate::run::{
    AutomatedRun, HardwareLeases, Persister, PhaseResult, RunContext, RunSpec, RunState,
};
use crate::stats::StatsGroup;
use crate::types::{Answer, CancelStyle, ConsoleColor, TruncateStyle};
use crate::wait::{WaitControl, WaitGroup, WaitOutcome};

const EVENT_CAPACITY: usize = 256;

/// External collaborators the executor is wired to.
pub struct Collaborators {
    pub managers: ManagerRegistry,
    pub datahub: Arc<Datahub>,
    pub prompt: Arc<dyn UserPrompt>,
    pub notifier: Arc<dyn UserNotifier>,
    pub memory: Arc<dyn MemoryProbe>,
    pub backup: BackupRecovery,
}

/// Blank values handed to every run built from now on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreviousBlanks {
    /// Run the values came from.
    pub runid: Option<String>,
    pub blanks: BTreeMap<String, f64>,
    pub baselines: BTreeMap<String, f64>,
}

pub(crate) struct Inner {
    pub(crate) config: ExecutorConfig,
    pub(crate) queues: Mutex<Vec<ExperimentQueue>>,
    pub(crate) active_queue: AtomicUsize,

    pub(crate) managers: ManagerRegistry,
    pub(crate) datahub: Arc<Datahub>,
    pub(crate) prompt: Arc<dyn UserPrompt>,
    notifier: Arc<dyn UserNotifier>,
    pub(crate) memory: Arc<dyn MemoryProbe>,
    backup: BackupRecovery,
    leases: HardwareLeases,
    pub(crate) console: Console,

    alive: AtomicBool,
    alive_token: Mutex<CancellationToken>,
    pub(crate) canceled: AtomicBool,
    stopped: AtomicBool,
    err_message: Mutex<Option<String>>,

    measuring: watch::Sender<Option<Arc<AutomatedRun>>>,
    extracting: watch::Sender<Option<Arc<AutomatedRun>>>,
    pub(crate) prev_blanks: Mutex<PreviousBlanks>,

    queue_modified: AtomicBool,
    pub(crate) executable: AtomicBool,
    end_at_run_completion: AtomicBool,
    delaying_between_runs: AtomicBool,

    pub(crate) wait_group: WaitGroup,
    stats: StatsGroup,
}

/// Top-level scheduler. Clones share the same executor.
#[derive(Clone)]
pub struct ExperimentExecutor {
    pub(crate) inner: Arc<Inner>,
}

impl std::fmt::Debug for ExperimentExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentExecutor")
            .field("alive", &self.is_alive())
            .field("nqueues", &self.inner.queues.lock().len())
            .field("managers", &self.inner.managers)
            .finish_non_exhaustive()
    }
}

fn clear_slot(slot: &watch::Sender<Option<Arc<AutomatedRun>>>, run: &Arc<AutomatedRun>) -> bool {
    slot.send_if_modified(|current| {
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, run)) {
            *current = None;
            true
        } else {
            false
        }
    })
}

/// What a queue action decided after a run.
enum EndAction {
    Repeated { runid: String, count: u32, nrepeat: u32 },
    Cancel(String),
    Halt(String),
}

impl ExperimentExecutor {
    pub fn new(config: ExecutorConfig, queues: Vec<ExperimentQueue>, collab: Collaborators) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (measuring, _) = watch::channel(None);
        let (extracting, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                config,
                queues: Mutex::new(queues),
                active_queue: AtomicUsize::new(0),
                managers: collab.managers,
                datahub: collab.datahub,
                prompt: collab.prompt,
                notifier: collab.notifier,
                memory: collab.memory,
                backup: collab.backup,
                leases: HardwareLeases::new(),
                console: Console::new(tx),
                alive: AtomicBool::new(false),
                alive_token: Mutex::new(CancellationToken::new()),
                canceled: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                err_message: Mutex::new(None),
                measuring,
                extracting,
                prev_blanks: Mutex::new(PreviousBlanks::default()),
                queue_modified: AtomicBool::new(false),
                executable: AtomicBool::new(true),
                end_at_run_completion: AtomicBool::new(false),
                delaying_between_runs: AtomicBool::new(false),
                wait_group: WaitGroup::new(),
                stats: StatsGroup::new(),
            }),
        }
    }

    // ---- observers -------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.inner.console.subscribe()
    }

    pub fn console(&self) -> &Console {
        &self.inner.console
    }

    pub fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn err_message(&self) -> Option<String> {
        self.inner.err_message.lock().clone()
    }

    pub fn measuring_run(&self) -> Option<Arc<AutomatedRun>> {
        self.inner.measuring.borrow().clone()
    }

    pub fn extracting_run(&self) -> Option<Arc<AutomatedRun>> {
        self.inner.extracting.borrow().clone()
    }

    pub fn previous_blanks(&self) -> PreviousBlanks {
        self.inner.prev_blanks.lock().clone()
    }

    pub fn stats(&self) -> &StatsGroup {
        &self.inner.stats
    }

    pub fn wait_group(&self) -> &WaitGroup {
        &self.inner.wait_group
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.inner.config
    }

    /// Snapshot of every queue.
    pub fn queues(&self) -> Vec<ExperimentQueue> {
        self.inner.queues.lock().clone()
    }

    // ---- operator controls -----------------------------------------------

    /// Edit a queue while it executes. The run cursor is rebuilt before the
    /// next run is pulled.
    pub fn edit_queue<R>(&self, idx: usize, f: impl FnOnce(&mut ExperimentQueue) -> R) -> Option<R> {
        let out = self.inner.queues.lock().get_mut(idx).map(f);
        if out.is_some() {
            self.set_queue_modified();
        }
        out
    }

    pub fn set_queue_modified(&self) {
        self.inner.queue_modified.store(true, Ordering::SeqCst);
    }

    /// `false` while the queue has unsaved edits.
    pub fn set_executable(&self, executable: bool) {
        self.inner.executable.store(executable, Ordering::SeqCst);
    }

    /// Finish the current run and end the queue after it.
    pub fn set_end_at_run_completion(&self, end: bool) {
        self.inner.end_at_run_completion.store(end, Ordering::SeqCst);
        if end {
            for run in [self.extracting_run(), self.measuring_run()].into_iter().flatten() {
                run.set_is_last(true);
            }
        }
    }

    /// Advisory status for the extraction display. `flash` is the lit
    /// fraction of each `period` (seconds); `0` means steady.
    pub fn set_extract_state(
        &self,
        label: impl Into<String>,
        flash: f64,
        color: ConsoleColor,
        period: f64,
    ) {
        self.inner.console.emit(ExecutorEvent::ExtractState {
            label: label.into(),
            color,
            flash: core::flash_pattern(flash, period),
        });
    }

    /// Run the pre-flight checks and spawn the queue worker.
    ///
    /// Returns `None`, leaving the executor not alive, if a check fails.
    pub async fn execute(&self) -> Option<JoinHandle<()>> {
        if self.is_alive() {
            warn!("executor already running");
            return None;
        }
        self.reset();

        if !self.pre_execute_check().await {
            info!("pre execute check failed");
            return None;
        }

        self.inner.alive.store(true, Ordering::SeqCst);
        // A cancel during the checks has already fired the token.
        if self.alive_token().is_cancelled() {
            self.inner.alive.store(false, Ordering::SeqCst);
            info!("queue canceled before it started");
            return None;
        }
        self.inner.stats.reset();
        self.inner.stats.start_timer();
        let this = self.clone();
        Some(tokio::spawn(async move { this.execute_queues().await }))
    }

    /// Halt an inter-run delay without touching in-flight runs; outside a
    /// delay this is a confirmed queue cancel.
    pub async fn stop(&self) {
        if !self.inner.delaying_between_runs.load(Ordering::SeqCst) {
            self.cancel(CancelStyle::Queue, false, true).await;
            return;
        }
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.set_alive_false();
        self.inner.stats.stop_timer();
        self.inner.wait_group.stop();
        self.inner.wait_group.active_control().set_message("Stopped");
        self.set_extract_state("Stopped", 0.0, ConsoleColor::Orange, 1.0);
        self.inner.console.info("Queue Stopped");
    }

    /// Terminal abort.
    ///
    /// `Queue` stops the loop and cancels the extracting and measuring runs,
    /// after confirmation if `confirm`. `Run` cancels only the measuring run.
    /// With `cancel_run` the canceled runs are marked `canceled` at once
    /// instead of when they unwind.
    pub async fn cancel(&self, style: CancelStyle, cancel_run: bool, confirm: bool) {
        match style {
            CancelStyle::Run => {
                if let Some(run) = self.measuring_run() {
                    self.inner.console.info(format!("Canceling run {}", run.runid()));
                    run.cancel_run(Some(RunState::Canceled));
                }
            }
            CancelStyle::Queue => {
                if confirm && self.is_alive() {
                    let msg = match self.measuring_run() {
                        Some(run) => format!(
                            "{} is in progress. Are you sure you want to cancel?",
                            run.runid()
                        ),
                        None => "Queue is in progress. Are you sure you want to cancel?".into(),
                    };
                    let answer = confirm_with_timeout(
                        self.inner.prompt.as_ref(),
                        PromptKind::ConfirmCancel,
                        &msg,
                        self.inner.config.confirmation_timeout,
                    )
                    .await;
                    if answer != Answer::Yes {
                        info!("cancel declined");
                        return;
                    }
                }

                self.inner.canceled.store(true, Ordering::SeqCst);
                if self.set_alive_false() {
                    self.inner.console.warning("Canceling Queue");
                }
                self.inner.stats.stop_timer();
                self.inner.wait_group.stop();
                self.set_extract_state("", 0.0, ConsoleColor::Black, 1.0);

                let state = cancel_run.then_some(RunState::Canceled);
                for run in [self.extracting_run(), self.measuring_run()].into_iter().flatten() {
                    run.cancel_run(state);
                }
            }
        }
    }

    /// Cut the measuring run's counting short.
    pub fn truncate(&self, style: TruncateStyle) -> bool {
        match self.measuring_run() {
            Some(run) => run.truncate_run(style),
            None => false,
        }
    }

    /// Cancel only the measuring run, from a background task.
    pub fn cancel_run(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.cancel(CancelStyle::Run, true, false).await })
    }

    // ---- shared helpers --------------------------------------------------

    fn reset(&self) {
        *self.inner.alive_token.lock() = CancellationToken::new();
        self.inner.canceled.store(false, Ordering::SeqCst);
        self.inner.stopped.store(false, Ordering::SeqCst);
        self.inner.delaying_between_runs.store(false, Ordering::SeqCst);
        *self.inner.err_message.lock() = None;
    }

    /// Flip `alive` off. Returns `true` for the call that flipped it.
    pub(crate) fn set_alive_false(&self) -> bool {
        let was_alive = self.inner.alive.swap(false, Ordering::SeqCst);
        self.inner.alive_token.lock().cancel();
        if was_alive {
            debug!("executor no longer alive");
        }
        was_alive
    }

    pub(crate) fn alive_token(&self) -> CancellationToken {
        self.inner.alive_token.lock().clone()
    }

    /// Record a queue-fatal error and stop the loop.
    pub(crate) fn halt(&self, msg: impl Into<String>) {
        let msg = msg.into();
        self.inner.console.warning(&msg);
        *self.inner.err_message.lock() = Some(msg);
        self.set_alive_false();
    }

    /// Apply `f` to the queue being executed.
    pub(crate) fn with_queue<R>(&self, f: impl FnOnce(&mut ExperimentQueue) -> R) -> R {
        let idx = self.inner.active_queue.load(Ordering::SeqCst);
        let mut queues = self.inner.queues.lock();
        f(&mut queues[idx])
    }

    /// Ask the operator, with the usual timeout. `None` if the executor is
    /// canceled before an answer arrives.
    pub(crate) async fn ask(&self, kind: PromptKind, message: &str) -> Option<Answer> {
        let token = self.alive_token();
        let asked = confirm_with_timeout(
            self.inner.prompt.as_ref(),
            kind,
            message,
            self.inner.config.confirmation_timeout,
        );
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(?kind, "dialog abandoned, executor canceled");
                None
            }
            answer = asked => Some(answer),
        }
    }

    /// Sleep `d` unless the executor stops first. Returns `false` if
    /// interrupted.
    pub(crate) async fn pause(&self, d: Duration) -> bool {
        let token = self.alive_token();
        tokio::select! {
            _ = tokio::time::sleep(d) => true,
            _ = token.cancelled() => false,
        }
    }

    fn set_measuring_run(&self, run: &Arc<AutomatedRun>) {
        self.inner.measuring.send_replace(Some(run.clone()));
        self.inner
            .console
            .emit(ExecutorEvent::MeasuringRunChanged(Some(run.runid().to_string())));
    }

    fn set_extracting_run(&self, run: &Arc<AutomatedRun>) {
        self.inner.extracting.send_replace(Some(run.clone()));
        self.inner
            .console
            .emit(ExecutorEvent::ExtractingRunChanged(Some(run.runid().to_string())));
    }

    /// Clear the measuring slot if `run` still holds it.
    fn clear_measuring_run(&self, run: &Arc<AutomatedRun>) {
        if clear_slot(&self.inner.measuring, run) {
            self.inner.console.emit(ExecutorEvent::MeasuringRunChanged(None));
        }
    }

    /// Clear the extracting slot if `run` still holds it; an overlapped
    /// successor may already have taken it.
    fn clear_extracting_run(&self, run: &Arc<AutomatedRun>) {
        if clear_slot(&self.inner.extracting, run) {
            self.inner.console.emit(ExecutorEvent::ExtractingRunChanged(None));
        }
    }

    /// Mirror the run's state into the queue and report changes.
    fn sync_state(&self, run: &AutomatedRun) {
        let Some(uuid) = run.uuid() else {
            return;
        };
        let state = run.state();
        if self.with_queue(|q| q.set_run_state(uuid, state)) {
            self.inner.console.emit(ExecutorEvent::RunStateChanged {
                runid: run.runid().to_string(),
                state,
            });
        }
    }

    // ---- queue loop ------------------------------------------------------

    async fn execute_queues(self) {
        let nqueues = self.inner.queues.lock().len();
        for idx in 0..nqueues {
            if !self.is_alive() {
                break;
            }
            self.inner.active_queue.store(idx, Ordering::SeqCst);
            self.execute_queue().await;
            if self.inner.end_at_run_completion.load(Ordering::SeqCst) {
                break;
            }
        }
        self.inner.stats.stop_timer();
        self.set_alive_false();
        info!(
            nruns = self.inner.stats.nruns_finished(),
            elapsed = ?self.inner.stats.elapsed(),
            "executor finished"
        );
    }

    async fn execute_queue(&self) {
        let (name, delay_before) = self.with_queue(|q| (q.name.clone(), q.delay_before_analyses));
        self.inner.console.heading(format!("Starting Execution \"{name}\""));

        if delay_before > 0.0 {
            self.delay(delay_before, "before analyses", false).await;
        }
        if self.is_alive() {
            self.add_experiment();
        }

        let consumer = {
            let this = self.clone();
            ConsumerQueue::spawn(move |run| this.finalize_run(&run))
        };
        let mut cursor = self.with_queue(|q| q.new_runs_generator());
        let mut last_runid: Option<String> = None;
        let mut overlapped: Option<Arc<AutomatedRun>> = None;

        while self.is_alive() {
            if !self.pre_run_check().await {
                break;
            }
            if self.inner.queue_modified.swap(false, Ordering::SeqCst) {
                info!("queue modified, regenerating runs");
                cursor = self.with_queue(|q| q.new_runs_generator());
            }

            let overlapping = overlapped.as_ref().is_some_and(|r| r.is_alive());
            if !overlapping && cursor.should_delay() {
                let delay = self.with_queue(|q| q.delay_between_analyses);
                if delay > 0.0 {
                    self.delay(delay, "between analyses", true).await;
                    if !self.is_alive() {
                        break;
                    }
                }
            }

            let Some(spec) = self.with_queue(|q| cursor.next(q)) else {
                break;
            };
            let is_last = spec.end_after
                || self.inner.end_at_run_completion.load(Ordering::SeqCst)
                || self.with_queue(|q| q.cleaned_automated_runs().next().is_none());
            let overlap = core::should_overlap(&spec, &self.inner.config.overlap_types, is_last);

            let Some((run, control)) = self.make_run(spec).await else {
                break;
            };
            cursor.advance();
            last_runid = Some(run.runid().to_string());

            if overlap {
                self.wait_for_extracting_run().await;
                if !self.is_alive() {
                    self.discard_run(&run, &control);
                    break;
                }
                info!(runid = %run.runid(), "overlapping run");
                let handle = {
                    let this = self.clone();
                    let run = run.clone();
                    tokio::spawn(async move { this.do_run(run, control).await })
                };
                let token = self.alive_token();
                tokio::select! {
                    _ = run.wait_for_overlap() => {}
                    _ = token.cancelled() => {}
                }
                consumer
                    .add(Overlapped {
                        run: run.clone(),
                        handle,
                    })
                    .await;
                overlapped = Some(run);
            } else {
                self.join_run(run, control).await;
            }

            if self.inner.end_at_run_completion.load(Ordering::SeqCst) {
                info!("ending queue at run completion");
                break;
            }
        }

        if self.inner.end_at_run_completion.load(Ordering::SeqCst) {
            if let Some(run) = self.extracting_run() {
                if is_special(&run.spec().labnumber) {
                    info!(runid = %run.runid(), "canceling special extracting run");
                    run.cancel_run(None);
                }
            }
        }
        // Joins every overlapped run, so nothing is measuring afterwards.
        consumer.join().await;

        self.with_queue(|q| q.executed = true);
        self.end_runs(last_runid);
    }

    fn add_experiment(&self) {
        let record = self.with_queue(|q| ExperimentRecord {
            name: q.name.clone(),
            path: q.path.as_ref().map(|p| p.display().to_string()),
            mass_spectrometer: q.mass_spectrometer.clone(),
            extract_device: q.extract_device.clone(),
            load_name: q.load_name.clone(),
            started: Utc::now(),
        });
        match self.inner.datahub.add_experiment(record) {
            Ok(id) => {
                debug!(id, "experiment saved");
                self.with_queue(|q| q.database_identifier = Some(id));
            }
            Err(err) => self.halt(format!("Failed saving experiment: {err}")),
        }
    }

    async fn delay(&self, secs: f64, message: &str, between_runs: bool) -> WaitOutcome {
        let control = self.inner.wait_group.get_wait_control();
        control.set_message(format!("Waiting {message}"));
        if between_runs {
            self.inner.delaying_between_runs.store(true, Ordering::SeqCst);
        }
        self.inner.console.info(format!("Delay {message} {secs:.1} s"));
        let wtime = Duration::try_from_secs_f64(secs).unwrap_or_default();
        let token = self.alive_token();
        let outcome = tokio::select! {
            outcome = control.start(wtime, self.inner.config.poll_interval) => outcome,
            _ = token.cancelled() => {
                control.stop();
                WaitOutcome::Stopped
            }
        };
        self.inner.delaying_between_runs.store(false, Ordering::SeqCst);
        outcome
    }

    async fn wait_for_extracting_run(&self) {
        let mut rx = self.inner.extracting.subscribe();
        let token = self.alive_token();
        let cleared = async move {
            let _ = rx.wait_for(|run| run.is_none()).await;
        };
        tokio::select! {
            _ = cleared => {}
            _ = token.cancelled() => {}
        }
    }

    async fn make_run(&self, mut spec: RunSpec) -> Option<(Arc<AutomatedRun>, WaitControl)> {
        if !self.set_run_aliquot(&mut spec).await {
            self.with_queue(|q| q.restore(spec));
            return None;
        }

        let uuid = Uuid::new_v4();
        spec.uuid = Some(uuid);
        spec.state = RunState::NotRun;
        if let Err(err) = self.inner.backup.add(uuid) {
            warn!(%uuid, error = %err, "failed writing backup-recovery file");
        }
        if spec.end_after {
            self.inner.end_at_run_completion.store(true, Ordering::SeqCst);
        }

        let (experiment_id, load_name) = self.with_queue(|q| {
            q.add_executed(spec.clone());
            (q.database_identifier, q.load_name.clone())
        });
        let prev = self.inner.prev_blanks.lock().clone();
        let ctx = RunContext {
            managers: self.inner.managers.clone(),
            persister: Persister::new(self.inner.datahub.clone(), experiment_id, load_name),
            leases: self.inner.leases.clone(),
            previous_blanks: prev.blanks,
            previous_baselines: prev.baselines,
        };
        let run = Arc::new(AutomatedRun::new(spec, ctx));
        if self.inner.end_at_run_completion.load(Ordering::SeqCst) {
            run.set_is_last(true);
        }

        let control = self.inner.wait_group.add_control();
        control.set_page_name(run.runid());
        debug!(runid = %run.runid(), blanks_from = ?prev.runid, "run built");
        Some((run, control))
    }

    async fn join_run(&self, run: Arc<AutomatedRun>, control: WaitControl) {
        self.do_run(run.clone(), control).await;
        self.finalize_run(&run);
    }

    /// Drive one run through its phases, then do the bookkeeping every run
    /// gets whatever the outcome.
    async fn do_run(&self, run: Arc<AutomatedRun>, control: WaitControl) {
        let began = Instant::now();
        self.inner.console.info(format!("Starting run {}", run.runid()));

        if self.run_phases(&run).await {
            run.complete();
        }

        let duration = began.elapsed();
        self.inner.stats.run_finished(duration);
        if let Some(uuid) = run.uuid() {
            if let Err(err) = self.inner.backup.remove(uuid) {
                warn!(%uuid, error = %err, "failed updating backup-recovery file");
            }
        }
        if core::forwards_blanks(run.spec().analysis_type, run.state()) {
            self.forward_blanks(&run);
        }
        self.check_run_at_end(&run).await;

        run.finish();
        self.sync_state(&run);
        self.inner.console.emit(ExecutorEvent::RunFinished {
            runid: run.runid().to_string(),
            state: run.state(),
            duration,
        });
        self.inner.wait_group.pop(Some(&control));
    }

    /// `true` only if every phase completed.
    async fn run_phases(&self, run: &Arc<AutomatedRun>) -> bool {
        if !self.start_run(run).await {
            return false;
        }

        let extracted = run.start_extraction().await;
        if extracted {
            self.sync_state(run);
            self.set_extracting_run(run);
            let res = run.do_extraction().await;
            if !res.is_completed() {
                self.clear_extracting_run(run);
                return self.failed_execution_step(run, "Extraction", &res);
            }
        } else {
            run.end_extraction();
            if run.is_canceled() {
                return false;
            }
        }

        let measuring = run.start_measurement().await;
        if extracted {
            self.clear_extracting_run(run);
        }
        if measuring {
            self.sync_state(run);
            self.set_measuring_run(run);
            let res = run.do_measurement().await;
            self.clear_measuring_run(run);
            if !res.is_completed() {
                return self.failed_execution_step(run, "Measurement", &res);
            }
        } else if run.is_canceled() {
            return false;
        }

        let res = run.do_post_measurement().await;
        self.sync_state(run);
        if !res.is_completed() {
            return self.failed_execution_step(run, "Post Measurement", &res);
        }
        true
    }

    async fn start_run(&self, run: &AutomatedRun) -> bool {
        if run.start().await {
            self.sync_state(run);
            return true;
        }
        if run.is_canceled() {
            return false;
        }
        let msg = format!("Run {} did not start properly", run.runid());
        self.inner.canceled.store(true, Ordering::SeqCst);
        self.halt(&msg);
        let alert = self.inner.prompt.alert(&msg);
        if tokio::time::timeout(self.inner.config.confirmation_timeout, alert)
            .await
            .is_err()
        {
            debug!("alert dismissed by timeout");
        }
        false
    }

    /// Record a failed phase. Cancels are not errors.
    fn failed_execution_step(&self, run: &AutomatedRun, phase: &str, res: &PhaseResult) -> bool {
        if run.is_canceled() || self.is_canceled() || matches!(res, PhaseResult::Canceled) {
            debug!(runid = %run.runid(), phase, "phase ended by cancel");
            return false;
        }
        let reason = match res {
            PhaseResult::Failed(reason) => reason.as_str(),
            _ => "",
        };
        self.halt(format!("{phase} Failed. {}: {reason}", run.runid()));
        false
    }

    fn forward_blanks(&self, run: &AutomatedRun) {
        let Some(blanks) = run.get_baseline_corrected_signals() else {
            return;
        };
        let baselines = run.get_baselines();
        info!(runid = %run.runid(), "updating previous blanks");
        *self.inner.prev_blanks.lock() = PreviousBlanks {
            runid: Some(run.runid().to_string()),
            blanks,
            baselines,
        };
    }

    async fn check_run_at_end(&self, run: &AutomatedRun) {
        let spec = run.spec();
        let state = run.state();
        let signals = run.get_baseline_corrected_signals().unwrap_or_default();

        let datahub = &self.inner.datahub;
        let decided = self.with_queue(|q| {
            let idx = q
                .queue_actions
                .iter()
                .position(|a| a.check_run(spec.analysis_type, state, &signals))?;
            let action = &mut q.queue_actions[idx];
            let condition = action.condition.to_string();
            if action.action == ActionKind::Repeat && action.count < action.nrepeat {
                action.count += 1;
                let (count, nrepeat) = (action.count, action.nrepeat);
                // The repeated run's own result is committed, possibly to the
                // secondary database too, so it needs the next free number.
                let again = q.insert_repeat(&spec);
                if let Err(err) = datahub.update_spec(again, 0, 0) {
                    q.automated_runs.remove(0);
                    return Some(EndAction::Halt(format!(
                        "Numbering repeat of {} failed: {err}",
                        spec.runid()
                    )));
                }
                again.conflicts_checked = true;
                let runid = again.runid();
                return Some(EndAction::Repeated {
                    runid,
                    count,
                    nrepeat,
                });
            }
            Some(EndAction::Cancel(condition))
        });

        match decided {
            Some(EndAction::Repeated {
                runid,
                count,
                nrepeat,
            }) => {
                self.set_queue_modified();
                self.inner.console.info(format!(
                    "Repeating run {} as {runid} ({count}/{nrepeat})",
                    run.runid()
                ));
            }
            Some(EndAction::Halt(msg)) => self.halt(msg),
            Some(EndAction::Cancel(condition)) => {
                self.inner.console.warning(format!(
                    "{} triggered \"{condition}\". Canceling queue",
                    run.runid()
                ));
                self.cancel(CancelStyle::Queue, false, false).await;
            }
            None => {}
        }
    }

    /// Bookkeeping after the run's task is joined.
    fn finalize_run(&self, run: &AutomatedRun) {
        let state = run.state();
        match state {
            RunState::Failed => self
                .inner
                .console
                .warning(format!("Run {} {state}", run.runid())),
            _ => self.inner.console.info(format!("Run {} {state}", run.runid())),
        }
        run.teardown();
    }

    /// Release a built run that will never execute.
    fn discard_run(&self, run: &AutomatedRun, control: &WaitControl) {
        run.cancel_run(None);
        run.finish();
        self.sync_state(run);
        if let Some(uuid) = run.uuid() {
            if let Err(err) = self.inner.backup.remove(uuid) {
                warn!(%uuid, error = %err, "failed updating backup-recovery file");
            }
        }
        self.inner.wait_group.pop(Some(control));
    }

    fn end_runs(&self, last_runid: Option<String>) {
        let name = self.with_queue(|q| q.name.clone());
        let err = self.err_message();
        if let Some(err) = &err {
            self.inner
                .console
                .warning("automated runs did not complete successfully");
            self.inner.console.warning(format!("error: {err}"));
        }

        let outcome = core::queue_outcome(self.is_canceled(), self.is_stopped(), err.is_some());
        self.set_extract_state(outcome.label(), 0.0, outcome.color(), 1.0);
        self.inner
            .console
            .heading(format!("Queue \"{name}\" {}", outcome.label()));
        self.inner.console.emit(ExecutorEvent::QueueFinished {
            name: name.clone(),
            outcome,
        });

        let notifier = self.inner.notifier.clone();
        tokio::spawn(async move {
            if let Err(err) = notifier
                .notify(&name, last_runid.as_deref(), err.as_deref())
                .await
            {
                warn!(error = %err, "user notification failed");
            }
        });
    }
}
