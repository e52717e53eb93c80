// src/datahub/store.rs

//! Persistence interface and the records that cross it.

use std::collections::BTreeMap;
use std::fmt::Debug;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::run::identifier::make_runid;
use crate::run::RunState;
use crate::types::AnalysisType;

/// Queue metadata saved once per executed queue.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentRecord {
    pub name: String,
    pub path: Option<String>,
    pub mass_spectrometer: String,
    pub extract_device: String,
    pub load_name: Option<String>,
    pub started: DateTime<Utc>,
}

/// One committed analysis.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRecord {
    pub labnumber: String,
    pub aliquot: u32,
    pub step: Option<char>,
    pub analysis_type: AnalysisType,
    pub uuid: Uuid,
    pub experiment_id: Option<u64>,
    pub load_name: Option<String>,
    pub mass_spectrometer: String,
    pub extract_device: String,
    pub state: RunState,
    /// Mean signal minus mean baseline, per isotope.
    pub signals: BTreeMap<String, f64>,
    pub baselines: BTreeMap<String, f64>,
    /// Blank values that were current when this run was built.
    pub previous_blanks: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

impl AnalysisRecord {
    pub fn record_id(&self) -> String {
        make_runid(&self.labnumber, self.aliquot, self.step)
    }
}

/// Filter for blank lookups.
#[derive(Debug, Clone)]
pub struct BlankQuery<'a> {
    pub analysis_type: AnalysisType,
    pub mass_spectrometer: &'a str,
    /// Only honoured for `blank_unknown` lookups.
    pub extract_device: Option<&'a str>,
    pub limit: usize,
}

/// Named operations against an analysis database.
///
/// The engine never issues queries of its own; it calls these and branches
/// on `Ok(None)` / errors.
pub trait AnalysisStore: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn connect(&self) -> Result<bool>;

    fn add_experiment(&self, record: ExperimentRecord) -> Result<u64>;

    fn add_analysis(&self, record: AnalysisRecord) -> Result<()>;

    fn latest_aliquot(&self, labnumber: &str) -> Result<Option<u32>>;

    fn contains(&self, labnumber: &str, aliquot: u32, step: Option<char>) -> Result<bool>;

    /// Blank analyses matching `query`, most recent first.
    fn blanks(&self, query: &BlankQuery<'_>) -> Result<Vec<AnalysisRecord>>;
}
