#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use exprun::engine::{ExecutorEvent, ExperimentExecutor};
use exprun::hardware::{
    DeviceMode, ExtractDeviceManager, ExtractionLineManager, ScriptKind, ScriptRequest,
    ScriptRunner,
};
use exprun::run::{PhaseResult, RunState};

/// One script the runner was asked to execute.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptCall {
    pub runid: String,
    pub kind: ScriptKind,
}

impl ScriptCall {
    pub fn new(runid: &str, kind: ScriptKind) -> Self {
        Self {
            runid: runid.to_string(),
            kind,
        }
    }
}

/// A script runner that tests can hold open.
///
/// Scripts of a held kind block until [`release`](Self::release) is called
/// for their run (or the run is canceled). Every call is recorded, and the
/// runner tracks how many scripts of each kind were running at once.
#[derive(Debug)]
pub struct GatedScriptRunner {
    held: Mutex<HashSet<ScriptKind>>,
    gates: Mutex<HashMap<ScriptCall, Arc<Notify>>>,
    failures: Mutex<HashMap<ScriptCall, String>>,
    calls: watch::Sender<Vec<ScriptCall>>,
    active: Mutex<HashMap<ScriptKind, usize>>,
    max_active: Mutex<HashMap<ScriptKind, usize>>,
    connected: AtomicBool,
}

impl Default for GatedScriptRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl GatedScriptRunner {
    pub fn new() -> Self {
        let (calls, _) = watch::channel(Vec::new());
        Self {
            held: Mutex::new(HashSet::new()),
            gates: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            calls,
            active: Mutex::new(HashMap::new()),
            max_active: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Hold every script of `kind` until released.
    pub fn hold(&self, kind: ScriptKind) {
        self.held.lock().insert(kind);
    }

    /// Let `runid`'s `kind` script finish. Works before the script starts.
    pub fn release(&self, runid: &str, kind: ScriptKind) {
        self.gate(&ScriptCall::new(runid, kind)).notify_one();
    }

    /// Make `runid`'s `kind` script fail with `reason`.
    pub fn fail(&self, runid: &str, kind: ScriptKind, reason: &str) {
        self.failures
            .lock()
            .insert(ScriptCall::new(runid, kind), reason.to_string());
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ScriptCall> {
        self.calls.borrow().clone()
    }

    pub fn called(&self, runid: &str, kind: ScriptKind) -> bool {
        self.calls.borrow().contains(&ScriptCall::new(runid, kind))
    }

    /// Wait until `runid`'s `kind` script has been started.
    pub async fn wait_started(&self, runid: &str, kind: ScriptKind) {
        let call = ScriptCall::new(runid, kind);
        let mut rx = self.calls.subscribe();
        let _ = rx.wait_for(|calls| calls.contains(&call)).await;
    }

    /// Highest number of `kind` scripts that ever ran at the same time.
    pub fn max_concurrent(&self, kind: ScriptKind) -> usize {
        self.max_active.lock().get(&kind).copied().unwrap_or(0)
    }

    fn gate(&self, call: &ScriptCall) -> Arc<Notify> {
        self.gates
            .lock()
            .entry(call.clone())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn enter(&self, kind: ScriptKind) {
        let mut active = self.active.lock();
        let n = active.entry(kind).or_insert(0);
        *n += 1;
        let mut max = self.max_active.lock();
        let m = max.entry(kind).or_insert(0);
        *m = (*m).max(*n);
    }

    fn leave(&self, kind: ScriptKind) {
        if let Some(n) = self.active.lock().get_mut(&kind) {
            *n = n.saturating_sub(1);
        }
    }

    async fn run_script(&self, call: &ScriptCall, cancel: &CancellationToken) -> PhaseResult {
        if self.held.lock().contains(&call.kind) {
            let gate = self.gate(call);
            tokio::select! {
                _ = gate.notified() => {}
                _ = cancel.cancelled() => return PhaseResult::Canceled,
            }
        }
        if cancel.is_cancelled() {
            return PhaseResult::Canceled;
        }
        match self.failures.lock().get(call) {
            Some(reason) => PhaseResult::Failed(reason.clone()),
            None => PhaseResult::Completed,
        }
    }
}

#[async_trait]
impl ScriptRunner for GatedScriptRunner {
    async fn connect(&self) -> Result<bool> {
        Ok(self.connected.load(Ordering::SeqCst))
    }

    async fn execute(
        &self,
        request: ScriptRequest,
        cancel: CancellationToken,
    ) -> Result<PhaseResult> {
        let call = ScriptCall::new(&request.runid, request.kind);
        self.enter(call.kind);
        self.calls.send_modify(|calls| calls.push(call.clone()));
        let result = self.run_script(&call, &cancel).await;
        self.leave(call.kind);
        Ok(result)
    }
}

/// Extraction line that only reports ready from its `ready_from`-th check
/// on.
#[derive(Debug)]
pub struct WarmingExtractionLine {
    ready_from: usize,
    checks: AtomicUsize,
}

impl WarmingExtractionLine {
    pub fn new(ready_from: usize) -> Self {
        Self {
            ready_from,
            checks: AtomicUsize::new(0),
        }
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

impl ExtractionLineManager for WarmingExtractionLine {
    fn is_ready(&self) -> bool {
        self.checks.fetch_add(1, Ordering::SeqCst) + 1 >= self.ready_from
    }
}

/// Extract device reached over the network.
#[derive(Debug)]
pub struct ClientExtractDevice {
    name: String,
    reachable: AtomicBool,
    tests: AtomicUsize,
}

impl ClientExtractDevice {
    pub fn new(name: &str, reachable: bool) -> Self {
        Self {
            name: name.to_string(),
            reachable: AtomicBool::new(reachable),
            tests: AtomicUsize::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// How often `test_connection` was called.
    pub fn tests(&self) -> usize {
        self.tests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExtractDeviceManager for ClientExtractDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> DeviceMode {
        DeviceMode::Client {
            host: "192.168.0.20".to_string(),
            port: 1069,
            kind: "tcp".to_string(),
        }
    }

    async fn test_connection(&self) -> Result<bool> {
        self.tests.fetch_add(1, Ordering::SeqCst);
        Ok(self.reachable.load(Ordering::SeqCst))
    }
}

/// Collects every event an executor broadcasts.
#[derive(Debug)]
pub struct EventRecorder {
    events: watch::Sender<Vec<ExecutorEvent>>,
    task: JoinHandle<()>,
}

impl EventRecorder {
    /// Subscribe before `execute()` so nothing is missed.
    pub fn attach(executor: &ExperimentExecutor) -> Self {
        let (events, _) = watch::channel(Vec::new());
        let mut rx = executor.subscribe();
        let tx = events.clone();
        let task = tokio::spawn(async move {
            use tokio::sync::broadcast::error::RecvError;
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        tx.send_modify(|events| events.push(event));
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "event recorder lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Self { events, task }
    }

    pub fn events(&self) -> Vec<ExecutorEvent> {
        self.events.borrow().clone()
    }

    /// Wait until `pred` holds for the events seen so far.
    pub async fn wait_for(&self, pred: impl Fn(&[ExecutorEvent]) -> bool) {
        let mut rx = self.events.subscribe();
        let _ = rx.wait_for(|events| pred(events)).await;
    }

    /// Wait until a console line containing `needle` was emitted.
    pub async fn wait_for_console(&self, needle: &str) {
        self.wait_for(|events| {
            events.iter().any(|e| {
                matches!(e, ExecutorEvent::Console { text, .. } if text.contains(needle))
            })
        })
        .await;
    }

    /// Mirrored states of one run, in the order they were reported.
    pub fn states_of(&self, runid: &str) -> Vec<RunState> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ExecutorEvent::RunStateChanged { runid: id, state } if id == runid => {
                    Some(*state)
                }
                _ => None,
            })
            .collect()
    }

    /// `(runid, final state)` for every finished run, in finishing order.
    pub fn finished(&self) -> Vec<(String, RunState)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ExecutorEvent::RunFinished { runid, state, .. } => Some((runid.clone(), *state)),
                _ => None,
            })
            .collect()
    }

    pub fn console_lines(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|e| match e {
                ExecutorEvent::Console { text, .. } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn has_console_line(&self, needle: &str) -> bool {
        self.console_lines().iter().any(|l| l.contains(needle))
    }
}

impl Drop for EventRecorder {
    fn drop(&mut self) {
        self.task.abort();
    }
}
