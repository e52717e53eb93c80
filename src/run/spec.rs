// src/run/spec.rs

//! Queued run specification.

use serde::Deserialize;
use uuid::Uuid;

use crate::run::identifier::{self, make_runid};
use crate::run::state::RunState;
use crate::types::AnalysisType;

/// Description of one queued analysis.
///
/// Built when a queue is loaded, renumbered by the datahub before it runs and
/// consumed to build an [`AutomatedRun`](crate::run::AutomatedRun). After the
/// run starts only `state` is updated.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpec {
    pub labnumber: String,
    pub aliquot: u32,
    pub step: Option<char>,
    pub analysis_type: AnalysisType,

    pub extract_device: String,
    pub mass_spectrometer: String,

    pub extraction_script: Option<String>,
    pub measurement_script: Option<String>,
    pub post_measurement_script: Option<String>,

    pub extract_value: f64,
    pub extract_units: String,
    pub duration: f64,
    pub cleanup: f64,
    pub position: Option<String>,

    /// Counting statistics for the measurement phase.
    pub ncounts: u32,
    pub baseline_counts: u32,
    pub peak_center: bool,
    pub reference_detector: String,

    /// Extract the next run while this one is measuring.
    pub overlap: bool,
    /// Seconds to wait after extraction ends before releasing the overlap.
    pub overlap_delay: f64,
    pub end_after: bool,
    pub skip: bool,

    pub conflicts_checked: bool,
    pub state: RunState,
    /// Crash-recovery token, assigned when the run is built.
    pub uuid: Option<Uuid>,
}

impl RunSpec {
    pub fn new(labnumber: impl Into<String>, aliquot: u32) -> Self {
        let labnumber = labnumber.into();
        let analysis_type = identifier::analysis_type_for(&labnumber);
        Self {
            labnumber,
            aliquot,
            step: None,
            analysis_type,
            extract_device: String::new(),
            mass_spectrometer: String::new(),
            extraction_script: None,
            measurement_script: None,
            post_measurement_script: None,
            extract_value: 0.0,
            extract_units: "watts".to_string(),
            duration: 0.0,
            cleanup: 0.0,
            position: None,
            ncounts: 0,
            baseline_counts: 0,
            peak_center: false,
            reference_detector: "H1".to_string(),
            overlap: false,
            overlap_delay: 0.0,
            end_after: false,
            skip: false,
            conflicts_checked: false,
            state: RunState::NotRun,
            uuid: None,
        }
    }

    pub fn runid(&self) -> String {
        make_runid(&self.labnumber, self.aliquot, self.step)
    }

    pub fn is_step_heat(&self) -> bool {
        self.step.is_some()
    }

    pub fn is_special(&self) -> bool {
        identifier::is_special(&self.labnumber)
    }
}

/// `[[run]]` table of a queue file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunSpecConfig {
    pub labnumber: String,

    #[serde(default = "default_aliquot")]
    pub aliquot: u32,

    #[serde(default)]
    pub step: Option<String>,

    /// Inferred from the labnumber when omitted.
    #[serde(default)]
    pub analysis_type: Option<AnalysisType>,

    #[serde(default)]
    pub extraction_script: Option<String>,
    #[serde(default)]
    pub measurement_script: Option<String>,
    #[serde(default)]
    pub post_measurement_script: Option<String>,

    #[serde(default)]
    pub extract_value: f64,
    #[serde(default = "default_extract_units")]
    pub extract_units: String,
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub cleanup: f64,
    #[serde(default)]
    pub position: Option<String>,

    #[serde(default = "default_ncounts")]
    pub ncounts: u32,
    #[serde(default = "default_baseline_counts")]
    pub baseline_counts: u32,
    #[serde(default)]
    pub peak_center: bool,
    #[serde(default = "default_reference_detector")]
    pub reference_detector: String,

    #[serde(default)]
    pub overlap: bool,
    #[serde(default)]
    pub overlap_delay: f64,
    #[serde(default)]
    pub end_after: bool,
    #[serde(default)]
    pub skip: bool,
}

fn default_aliquot() -> u32 {
    1
}

fn default_extract_units() -> String {
    "watts".to_string()
}

fn default_ncounts() -> u32 {
    100
}

fn default_baseline_counts() -> u32 {
    30
}

fn default_reference_detector() -> String {
    "H1".to_string()
}

impl RunSpecConfig {
    /// Build a spec, inheriting the queue-level device and spectrometer.
    ///
    /// `step` must already have been validated as a single letter.
    pub fn into_spec(self, extract_device: &str, mass_spectrometer: &str) -> RunSpec {
        let mut spec = RunSpec::new(self.labnumber, self.aliquot);
        if let Some(kind) = self.analysis_type {
            spec.analysis_type = kind;
        }
        spec.step = self
            .step
            .as_deref()
            .and_then(|s| s.trim().chars().next())
            .map(|c| c.to_ascii_uppercase());
        spec.extract_device = extract_device.to_string();
        spec.mass_spectrometer = mass_spectrometer.to_string();
        spec.extraction_script = self.extraction_script;
        spec.measurement_script = self.measurement_script;
        spec.post_measurement_script = self.post_measurement_script;
        spec.extract_value = self.extract_value;
        spec.extract_units = self.extract_units;
        spec.duration = self.duration;
        spec.cleanup = self.cleanup;
        spec.position = self.position;
        spec.ncounts = self.ncounts;
        spec.baseline_counts = self.baseline_counts;
        spec.peak_center = self.peak_center;
        spec.reference_detector = self.reference_detector;
        spec.overlap = self.overlap;
        spec.overlap_delay = self.overlap_delay;
        spec.end_after = self.end_after;
        spec.skip = self.skip;
        spec
    }
}
