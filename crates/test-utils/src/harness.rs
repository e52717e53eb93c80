#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use exprun::config::{ExecutorConfig, ExecutorSection};
use exprun::datahub::{AnalysisStore, Datahub, InMemoryStore};
use exprun::engine::core::missing_preceding_blank;
use exprun::engine::{BackupRecovery, Collaborators, ExecutorEvent, ExperimentExecutor};
use exprun::fs::mock::MockFileSystem;
use exprun::hardware::sim::{
    SimExtractDevice, SimExtractionLine, SimIonOptics, SimRunMonitor, SimSpectrometer,
};
use exprun::hardware::{ExtractDeviceManager, ExtractionLineManager, ManagerRegistry};
use exprun::interaction::PromptKind;
use exprun::queue::ExperimentQueue;
use exprun::run::identifier::is_device_named;
use exprun::types::Answer;

use crate::builders::test_config;
use crate::collab::{analysis_record, FixedMemory, RecordingNotifier, ScriptedPrompt};
use crate::rig::{EventRecorder, GatedScriptRunner};

pub const BACKUP_FILE: &str = "/lab/.exprun/backup_recovery";

/// Blank signals seeded into the main store.
pub fn seeded_blank_signals() -> BTreeMap<String, f64> {
    BTreeMap::from([("Ar40".to_string(), 0.5), ("Ar36".to_string(), 0.01)])
}

/// An executor wired to controllable fakes.
pub struct Harness {
    pub executor: ExperimentExecutor,
    pub runner: Arc<GatedScriptRunner>,
    pub main: Arc<InMemoryStore>,
    pub secondary: Option<Arc<InMemoryStore>>,
    pub prompt: Arc<ScriptedPrompt>,
    pub memory: Arc<FixedMemory>,
    pub notifier: Arc<RecordingNotifier>,
    pub fs: Arc<MockFileSystem>,
    pub recorder: EventRecorder,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::new()
    }

    /// Execute and wait for the worker. Returns `false` if the pre-flight
    /// checks refused to start.
    pub async fn run(&self) -> bool {
        match self.executor.execute().await {
            Some(handle) => {
                handle.await.expect("executor worker panicked");
                self.settle().await;
                true
            }
            None => false,
        }
    }

    /// Wait until the recorder has seen the end of every executed queue.
    pub async fn settle(&self) {
        let executed = self.executor.queues().iter().filter(|q| q.executed).count();
        self.recorder
            .wait_for(|events| {
                events
                    .iter()
                    .filter(|e| matches!(e, ExecutorEvent::QueueFinished { .. }))
                    .count()
                    >= executed
            })
            .await;
    }

    /// Wait until the end-of-queue notification went out.
    pub async fn wait_notified(&self) {
        while self.notifier.sent().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn executed_runids(&self) -> Vec<String> {
        self.executor.queues()[0]
            .executed_runs
            .iter()
            .map(|r| r.runid())
            .collect()
    }

    /// Uuids left in the backup-recovery file.
    pub fn backup_entries(&self) -> Vec<String> {
        self.fs.lines(BACKUP_FILE)
    }
}

pub struct HarnessBuilder {
    config: ExecutorConfig,
    queues: Vec<ExperimentQueue>,
    secondary: Option<Arc<InMemoryStore>>,
    memory_mb: u64,
    seed_blanks: bool,
    prompt: ScriptedPrompt,
    runner: GatedScriptRunner,
    extraction_line: Option<Arc<dyn ExtractionLineManager>>,
    spectrometer: bool,
    extract_devices: Option<Vec<Arc<dyn ExtractDeviceManager>>>,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: test_config(),
            queues: Vec::new(),
            secondary: None,
            memory_mb: 4096,
            seed_blanks: true,
            prompt: ScriptedPrompt::new(),
            runner: GatedScriptRunner::new(),
            extraction_line: Some(Arc::new(SimExtractionLine)),
            spectrometer: true,
            extract_devices: None,
        }
    }

    pub fn queue(mut self, queue: ExperimentQueue) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn config(mut self, f: impl FnOnce(&mut ExecutorSection)) -> Self {
        f(self.config.section_mut());
        self
    }

    pub fn secondary(mut self, store: Arc<InMemoryStore>) -> Self {
        self.secondary = Some(store);
        self
    }

    pub fn memory_mb(mut self, mb: u64) -> Self {
        self.memory_mb = mb;
        self
    }

    /// Leave the main store empty instead of seeding the blank each queue
    /// needs.
    pub fn without_blanks(mut self) -> Self {
        self.seed_blanks = false;
        self
    }

    pub fn answer(self, kind: PromptKind, answer: Answer) -> Self {
        self.prompt.answer(kind, answer);
        self
    }

    /// Pick the blank at `index` when asked to select one.
    pub fn choose_blank(self, index: Option<usize>) -> Self {
        self.prompt.choose_blank(index);
        self
    }

    pub fn runner(mut self, runner: GatedScriptRunner) -> Self {
        self.runner = runner;
        self
    }

    /// Take `delay` to answer dialogs of `kind`.
    pub fn answer_after(self, kind: PromptKind, delay: Duration) -> Self {
        self.prompt.answer_after(kind, delay);
        self
    }

    /// `None` leaves the rig without an extraction line manager.
    pub fn extraction_line(mut self, manager: Option<Arc<dyn ExtractionLineManager>>) -> Self {
        self.extraction_line = manager;
        self
    }

    pub fn without_spectrometer(mut self) -> Self {
        self.spectrometer = false;
        self
    }

    /// Register exactly these extract devices instead of a simulated one
    /// per queue.
    pub fn extract_devices(mut self, devices: Vec<Arc<dyn ExtractDeviceManager>>) -> Self {
        self.extract_devices = Some(devices);
        self
    }

    pub fn build(self) -> Harness {
        let main = Arc::new(InMemoryStore::new("main"));
        if self.seed_blanks {
            let mut seeded = HashSet::new();
            for q in &self.queues {
                let Some((_, blank)) = missing_preceding_blank(q.cleaned_automated_runs()) else {
                    continue;
                };
                if seeded.insert((blank, q.mass_spectrometer.clone(), q.extract_device.clone())) {
                    main.add_analysis(analysis_record(
                        &format!("seed-{blank}"),
                        1,
                        blank,
                        &q.mass_spectrometer,
                        &q.extract_device,
                        seeded_blank_signals(),
                    ))
                    .expect("seed blank");
                }
            }
            self.prompt
                .answer_unless_set(PromptKind::PrecedingBlank, Answer::Yes);
        }

        let mut datahub = Datahub::new(main.clone());
        if let Some(secondary) = &self.secondary {
            datahub = datahub.with_secondary(secondary.clone());
        }

        let runner = Arc::new(self.runner);
        let mut managers = ManagerRegistry::new(runner.clone())
            .with_ion_optics(Arc::new(SimIonOptics))
            .with_monitor(Arc::new(SimRunMonitor));
        if let Some(el) = self.extraction_line {
            managers = managers.with_extraction_line(el);
        }
        if self.spectrometer {
            managers = managers.with_spectrometer(Arc::new(SimSpectrometer::new(Duration::ZERO)));
        }
        match self.extract_devices {
            Some(devices) => {
                for dev in devices {
                    managers = managers.with_extract_device(dev);
                }
            }
            None => {
                for q in &self.queues {
                    if is_device_named(&q.extract_device)
                        && managers.extract_device(&q.extract_device).is_none()
                    {
                        managers = managers.with_extract_device(Arc::new(SimExtractDevice::new(
                            q.extract_device.clone(),
                        )));
                    }
                }
            }
        }

        let prompt = Arc::new(self.prompt);
        let memory = Arc::new(FixedMemory::new(self.memory_mb));
        let notifier = Arc::new(RecordingNotifier::default());
        let fs = Arc::new(MockFileSystem::new());

        let collab = Collaborators {
            managers,
            datahub: Arc::new(datahub),
            prompt: prompt.clone(),
            notifier: notifier.clone(),
            memory: memory.clone(),
            backup: BackupRecovery::new(fs.clone(), BACKUP_FILE),
        };
        let executor = ExperimentExecutor::new(self.config, self.queues, collab);
        let recorder = EventRecorder::attach(&executor);

        Harness {
            executor,
            runner,
            main,
            secondary: self.secondary,
            prompt,
            memory,
            notifier,
            fs,
            recorder,
        }
    }
}
