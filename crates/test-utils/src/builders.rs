#![allow(dead_code)]

use std::time::Duration;

use exprun::config::ExecutorConfig;
use exprun::queue::actions::QueueActionConfig;
use exprun::queue::{ActionKind, ExperimentQueue, QueueAction};
use exprun::run::RunSpec;
use exprun::types::AnalysisType;

pub const MASS_SPECTROMETER: &str = "jan";
pub const EXTRACT_DEVICE: &str = "Fusions CO2";

/// Executor config tuned for tests: short polls and dialog timeouts.
pub fn test_config() -> ExecutorConfig {
    let mut config = ExecutorConfig::default();
    let section = config.section_mut();
    section.poll_interval = Duration::from_millis(10);
    section.confirmation_timeout = Duration::from_millis(200);
    section.auto_save_delay = Duration::from_millis(200);
    section.manager_check_retries = 1;
    section.memory_threshold_mb = 10;
    config
}

/// Builder for `RunSpec`.
///
/// Runs built with [`SpecBuilder::new`] have an extraction and a measurement
/// script and a handful of counts, so they go through every phase.
pub struct SpecBuilder {
    spec: RunSpec,
}

impl SpecBuilder {
    pub fn new(labnumber: &str) -> Self {
        let mut spec = RunSpec::new(labnumber, 1);
        spec.extraction_script = Some("extract".to_string());
        spec.measurement_script = Some("measure".to_string());
        spec.ncounts = 4;
        spec.baseline_counts = 2;
        Self { spec }
    }

    pub fn aliquot(mut self, aliquot: u32) -> Self {
        self.spec.aliquot = aliquot;
        self
    }

    pub fn step(mut self, step: char) -> Self {
        self.spec.step = Some(step);
        self
    }

    pub fn analysis_type(mut self, kind: AnalysisType) -> Self {
        self.spec.analysis_type = kind;
        self
    }

    pub fn overlap(mut self, val: bool) -> Self {
        self.spec.overlap = val;
        self
    }

    pub fn overlap_delay(mut self, secs: f64) -> Self {
        self.spec.overlap_delay = secs;
        self
    }

    pub fn no_extraction(mut self) -> Self {
        self.spec.extraction_script = None;
        self
    }

    pub fn no_measurement(mut self) -> Self {
        self.spec.measurement_script = None;
        self
    }

    pub fn ncounts(mut self, n: u32) -> Self {
        self.spec.ncounts = n;
        self
    }

    pub fn end_after(mut self, val: bool) -> Self {
        self.spec.end_after = val;
        self
    }

    pub fn skip(mut self, val: bool) -> Self {
        self.spec.skip = val;
        self
    }

    pub fn build(self) -> RunSpec {
        self.spec
    }
}

/// Builder for `ExperimentQueue`.
pub struct QueueBuilder {
    queue: ExperimentQueue,
}

impl QueueBuilder {
    pub fn new(name: &str) -> Self {
        let mut queue = ExperimentQueue::new(name);
        queue.mass_spectrometer = MASS_SPECTROMETER.to_string();
        queue.extract_device = EXTRACT_DEVICE.to_string();
        Self { queue }
    }

    /// Add a run; it inherits the queue's spectrometer and extract device.
    pub fn run(mut self, mut spec: RunSpec) -> Self {
        spec.mass_spectrometer = self.queue.mass_spectrometer.clone();
        spec.extract_device = self.queue.extract_device.clone();
        self.queue.automated_runs.push(spec);
        self
    }

    pub fn runs(self, specs: impl IntoIterator<Item = RunSpec>) -> Self {
        specs.into_iter().fold(self, |q, s| q.run(s))
    }

    pub fn action(mut self, kind: ActionKind, condition: &str, nrepeat: u32) -> Self {
        let action = QueueAction::try_from(QueueActionConfig {
            action: kind,
            condition: condition.to_string(),
            analysis_type: None,
            nrepeat,
        })
        .expect("valid queue action");
        self.queue.queue_actions.push(action);
        self
    }

    pub fn delay_before(mut self, secs: f64) -> Self {
        self.queue.delay_before_analyses = secs;
        self
    }

    pub fn delay_between(mut self, secs: f64) -> Self {
        self.queue.delay_between_analyses = secs;
        self
    }

    pub fn extract_device(mut self, name: &str) -> Self {
        self.queue.extract_device = name.to_string();
        self
    }

    pub fn build(self) -> ExperimentQueue {
        self.queue
    }
}
