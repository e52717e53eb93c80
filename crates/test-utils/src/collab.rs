#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use exprun::datahub::AnalysisRecord;
use exprun::interaction::{PromptKind, UserNotifier, UserPrompt};
use exprun::memory::MemoryProbe;
use exprun::run::RunState;
use exprun::types::{AnalysisType, Answer};

/// Prompt with canned answers.
///
/// Kinds without an answer get their safe default at once; kinds marked
/// [`ignore`](Self::ignore) never answer, so the caller's timeout applies.
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    answers: Mutex<HashMap<PromptKind, Answer>>,
    ignored: Mutex<HashSet<PromptKind>>,
    delays: Mutex<HashMap<PromptKind, Duration>>,
    asked: Mutex<Vec<(PromptKind, String)>>,
    blank_choice: Mutex<Option<usize>>,
}

impl ScriptedPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answer(&self, kind: PromptKind, answer: Answer) {
        self.answers.lock().insert(kind, answer);
    }

    /// Answer `kind` only if no answer was given yet.
    pub fn answer_unless_set(&self, kind: PromptKind, answer: Answer) {
        self.answers.lock().entry(kind).or_insert(answer);
    }

    pub fn ignore(&self, kind: PromptKind) {
        self.ignored.lock().insert(kind);
    }

    /// Take `delay` to answer `kind`, like an operator reading the dialog.
    pub fn answer_after(&self, kind: PromptKind, delay: Duration) {
        self.delays.lock().insert(kind, delay);
    }

    /// Index picked from the blank candidates; `None` aborts.
    pub fn choose_blank(&self, index: Option<usize>) {
        *self.blank_choice.lock() = index;
    }

    pub fn asked(&self) -> Vec<PromptKind> {
        self.asked.lock().iter().map(|(k, _)| *k).collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.asked.lock().iter().map(|(_, m)| m.clone()).collect()
    }
}

#[async_trait]
impl UserPrompt for ScriptedPrompt {
    async fn confirm(&self, kind: PromptKind, message: &str) -> Answer {
        self.asked.lock().push((kind, message.to_string()));
        if self.ignored.lock().contains(&kind) {
            return std::future::pending().await;
        }
        let delay = self.delays.lock().get(&kind).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let answer = self.answers.lock().get(&kind).copied();
        answer.unwrap_or_else(|| kind.safe_default())
    }

    async fn select_blank(&self, candidates: &[AnalysisRecord]) -> Option<AnalysisRecord> {
        let choice = *self.blank_choice.lock();
        choice.and_then(|i| candidates.get(i).cloned())
    }
}

/// Memory probe reporting a settable amount.
#[derive(Debug)]
pub struct FixedMemory(AtomicU64);

impl FixedMemory {
    pub fn new(mb: u64) -> Self {
        Self(AtomicU64::new(mb))
    }

    pub fn set(&self, mb: u64) {
        self.0.store(mb, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedMemory {
    fn available_mb(&self) -> Result<u64> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub experiment: String,
    pub last_runid: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl UserNotifier for RecordingNotifier {
    async fn notify(
        &self,
        experiment: &str,
        last_runid: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        self.sent.lock().push(Notification {
            experiment: experiment.to_string(),
            last_runid: last_runid.map(str::to_string),
            error: error.map(str::to_string),
        });
        Ok(())
    }
}

/// A committed analysis, for seeding stores.
pub fn analysis_record(
    labnumber: &str,
    aliquot: u32,
    analysis_type: AnalysisType,
    mass_spectrometer: &str,
    extract_device: &str,
    signals: BTreeMap<String, f64>,
) -> AnalysisRecord {
    AnalysisRecord {
        labnumber: labnumber.to_string(),
        aliquot,
        step: None,
        analysis_type,
        uuid: Uuid::new_v4(),
        experiment_id: None,
        load_name: None,
        mass_spectrometer: mass_spectrometer.to_string(),
        extract_device: extract_device.to_string(),
        state: RunState::Success,
        signals,
        baselines: BTreeMap::new(),
        previous_blanks: BTreeMap::new(),
        timestamp: Utc::now(),
    }
}
