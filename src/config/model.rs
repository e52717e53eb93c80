// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::queue::QueueActionConfig;
use crate::run::RunSpecConfig;
use crate::types::AnalysisType;

/// Executor configuration as read from `Exprun.toml`.
///
/// ```toml
/// [executor]
/// memory_threshold_mb = 10
/// auto_save_delay = "30s"
/// overlap_types = ["unknown"]
/// ```
///
/// Every key is optional.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub executor: ExecutorSection,
}

/// `[executor]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorSection {
    /// Stop the queue when less than this much memory (MB) is available.
    #[serde(default = "default_memory_threshold_mb")]
    pub memory_threshold_mb: u64,

    /// Attempts at finding every hardware manager before each run.
    #[serde(default = "default_manager_check_retries")]
    pub manager_check_retries: u32,

    /// On a save timeout, ask for an autosave instead of canceling.
    #[serde(default = "default_true")]
    pub use_auto_save: bool,

    #[serde(default = "default_auto_save_delay", with = "humantime_serde")]
    pub auto_save_delay: Duration,

    /// Minimum spectrometer pump time in seconds.
    #[serde(default = "default_min_ms_pumptime")]
    pub min_ms_pumptime: u64,

    /// How long a confirmation dialog waits before applying its default.
    #[serde(default = "default_confirmation_timeout", with = "humantime_serde")]
    pub confirmation_timeout: Duration,

    /// Granularity of every interruptible wait.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    #[serde(default = "default_backup_recovery_file")]
    pub backup_recovery_file: PathBuf,

    /// Skip hardware and memory pre-checks.
    #[serde(default)]
    pub experiment_debug: bool,

    /// Analysis types allowed to overlap with the previous run.
    #[serde(default = "default_overlap_types")]
    pub overlap_types: Vec<AnalysisType>,
}

fn default_memory_threshold_mb() -> u64 {
    10
}

fn default_manager_check_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_auto_save_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_min_ms_pumptime() -> u64 {
    30
}

fn default_confirmation_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_backup_recovery_file() -> PathBuf {
    PathBuf::from(".exprun/backup_recovery")
}

fn default_overlap_types() -> Vec<AnalysisType> {
    vec![AnalysisType::Unknown]
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            memory_threshold_mb: default_memory_threshold_mb(),
            manager_check_retries: default_manager_check_retries(),
            use_auto_save: default_true(),
            auto_save_delay: default_auto_save_delay(),
            min_ms_pumptime: default_min_ms_pumptime(),
            confirmation_timeout: default_confirmation_timeout(),
            poll_interval: default_poll_interval(),
            backup_recovery_file: default_backup_recovery_file(),
            experiment_debug: false,
            overlap_types: default_overlap_types(),
        }
    }
}

/// Validated executor configuration.
///
/// Only constructible through `TryFrom<RawConfigFile>` (or `Default`).
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfig {
    section: ExecutorSection,
}

impl ExecutorConfig {
    pub(crate) fn new_unchecked(section: ExecutorSection) -> Self {
        Self { section }
    }

    pub fn section(&self) -> &ExecutorSection {
        &self.section
    }

    /// Adjust settings after validation (tests, CLI overrides).
    pub fn section_mut(&mut self) -> &mut ExecutorSection {
        &mut self.section
    }
}

impl std::ops::Deref for ExecutorConfig {
    type Target = ExecutorSection;

    fn deref(&self) -> &Self::Target {
        &self.section
    }
}

/// One queue file.
///
/// ```toml
/// name = "J-cal 42"
/// mass_spectrometer = "jan"
/// extract_device = "Fusions CO2"
/// delay_between_analyses = 25.0
///
/// [[run]]
/// labnumber = "bu-01-01"
/// measurement_script = "jan_blank"
///
/// [[run]]
/// labnumber = "12345"
/// extraction_script = "fusions_co2_laser"
/// measurement_script = "jan_unknown"
/// overlap = true
///
/// [[action]]
/// action = "repeat"
/// condition = "Ar40 < 100"
/// nrepeat = 2
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueFile {
    /// Defaults to the file stem.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mass_spectrometer: String,
    #[serde(default)]
    pub extract_device: String,
    #[serde(default)]
    pub load_name: Option<String>,
    #[serde(default)]
    pub delay_before_analyses: f64,
    #[serde(default)]
    pub delay_between_analyses: f64,
    #[serde(default, rename = "run")]
    pub runs: Vec<RunSpecConfig>,
    #[serde(default, rename = "action")]
    pub actions: Vec<QueueActionConfig>,
}

/// A queue file together with where it came from.
#[derive(Debug, Clone)]
pub struct SourcedQueueFile {
    pub path: Option<PathBuf>,
    pub file: QueueFile,
}
