// src/datahub/memory.rs

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{bail, Result};
use parking_lot::RwLock;

use super::store::{AnalysisRecord, AnalysisStore, BlankQuery, ExperimentRecord};
use crate::types::AnalysisType;

/// Analysis store kept in process memory.
///
/// Used as the main store when running headless and as a stand-in for the
/// remote database in tests.
#[derive(Debug)]
pub struct InMemoryStore {
    name: String,
    online: AtomicBool,
    next_experiment_id: AtomicU64,
    experiments: RwLock<Vec<(u64, ExperimentRecord)>>,
    analyses: RwLock<Vec<AnalysisRecord>>,
}

impl InMemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            online: AtomicBool::new(true),
            next_experiment_id: AtomicU64::new(1),
            experiments: RwLock::new(Vec::new()),
            analyses: RwLock::new(Vec::new()),
        }
    }

    /// Simulate losing (or regaining) the connection.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn analyses(&self) -> Vec<AnalysisRecord> {
        self.analyses.read().clone()
    }

    pub fn experiments(&self) -> Vec<ExperimentRecord> {
        self.experiments
            .read()
            .iter()
            .map(|(_, e)| e.clone())
            .collect()
    }

    fn ensure_online(&self) -> Result<()> {
        if !self.online.load(Ordering::SeqCst) {
            bail!("store {} is offline", self.name);
        }
        Ok(())
    }
}

impl AnalysisStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&self) -> Result<bool> {
        Ok(self.online.load(Ordering::SeqCst))
    }

    fn add_experiment(&self, record: ExperimentRecord) -> Result<u64> {
        self.ensure_online()?;
        let id = self.next_experiment_id.fetch_add(1, Ordering::SeqCst);
        self.experiments.write().push((id, record));
        Ok(id)
    }

    fn add_analysis(&self, record: AnalysisRecord) -> Result<()> {
        self.ensure_online()?;
        let mut analyses = self.analyses.write();
        if analyses.iter().any(|a| {
            a.labnumber == record.labnumber && a.aliquot == record.aliquot && a.step == record.step
        }) {
            bail!("analysis {} already exists", record.record_id());
        }
        analyses.push(record);
        Ok(())
    }

    fn latest_aliquot(&self, labnumber: &str) -> Result<Option<u32>> {
        self.ensure_online()?;
        Ok(self
            .analyses
            .read()
            .iter()
            .filter(|a| a.labnumber == labnumber)
            .map(|a| a.aliquot)
            .max())
    }

    fn contains(&self, labnumber: &str, aliquot: u32, step: Option<char>) -> Result<bool> {
        self.ensure_online()?;
        Ok(self
            .analyses
            .read()
            .iter()
            .any(|a| a.labnumber == labnumber && a.aliquot == aliquot && a.step == step))
    }

    fn blanks(&self, query: &BlankQuery<'_>) -> Result<Vec<AnalysisRecord>> {
        self.ensure_online()?;
        let device = query
            .extract_device
            .filter(|_| query.analysis_type == AnalysisType::BlankUnknown);

        let mut found: Vec<AnalysisRecord> = self
            .analyses
            .read()
            .iter()
            .filter(|a| a.analysis_type == query.analysis_type)
            .filter(|a| {
                query.mass_spectrometer.is_empty()
                    || a.mass_spectrometer.eq_ignore_ascii_case(query.mass_spectrometer)
            })
            .filter(|a| device.is_none_or(|d| a.extract_device == d))
            .cloned()
            .collect();

        found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        found.truncate(query.limit);
        Ok(found)
    }
}
