// src/run/persister.rs

//! Buffers a run's counting data until post-measurement commits it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

use crate::datahub::{AnalysisRecord, Datahub};
use crate::errors::Result;
use crate::run::RunSpec;

type Cycle = BTreeMap<String, f64>;

#[derive(Debug, Default)]
struct Buffers {
    signals: Vec<Cycle>,
    baselines: Vec<Cycle>,
}

/// Per-run data buffer bound to the shared [`Datahub`].
#[derive(Debug)]
pub struct Persister {
    datahub: Arc<Datahub>,
    experiment_id: Option<u64>,
    load_name: Option<String>,
    buffers: Mutex<Buffers>,
}

fn mean(cycles: &[Cycle]) -> Cycle {
    let mut sums: Cycle = BTreeMap::new();
    for cycle in cycles {
        for (iso, v) in cycle {
            *sums.entry(iso.clone()).or_insert(0.0) += v;
        }
    }
    let n = cycles.len() as f64;
    sums.into_iter().map(|(iso, s)| (iso, s / n)).collect()
}

impl Persister {
    pub fn new(datahub: Arc<Datahub>, experiment_id: Option<u64>, load_name: Option<String>) -> Self {
        Self {
            datahub,
            experiment_id,
            load_name,
            buffers: Mutex::new(Buffers::default()),
        }
    }

    pub fn add_signal(&self, cycle: Cycle) {
        self.buffers.lock().signals.push(cycle);
    }

    pub fn add_baseline(&self, cycle: Cycle) {
        self.buffers.lock().baselines.push(cycle);
    }

    pub fn signal_count(&self) -> usize {
        self.buffers.lock().signals.len()
    }

    pub fn baseline_count(&self) -> usize {
        self.buffers.lock().baselines.len()
    }

    /// Mean baseline per isotope; empty if no baseline was counted.
    pub fn baselines(&self) -> Cycle {
        mean(&self.buffers.lock().baselines)
    }

    /// Mean signal minus mean baseline, per isotope.
    ///
    /// `None` until at least one signal cycle has been counted.
    pub fn baseline_corrected(&self) -> Option<Cycle> {
        let buffers = self.buffers.lock();
        if buffers.signals.is_empty() {
            return None;
        }
        let baselines = mean(&buffers.baselines);
        Some(
            mean(&buffers.signals)
                .into_iter()
                .map(|(iso, v)| {
                    let b = baselines.get(&iso).copied().unwrap_or(0.0);
                    (iso, v - b)
                })
                .collect(),
        )
    }

    /// Commit the buffered data as an [`AnalysisRecord`].
    pub fn save(&self, spec: &RunSpec, previous_blanks: Cycle) -> Result<AnalysisRecord> {
        let record = AnalysisRecord {
            labnumber: spec.labnumber.clone(),
            aliquot: spec.aliquot,
            step: spec.step,
            analysis_type: spec.analysis_type,
            uuid: spec.uuid.unwrap_or_default(),
            experiment_id: self.experiment_id,
            load_name: self.load_name.clone(),
            mass_spectrometer: spec.mass_spectrometer.clone(),
            extract_device: spec.extract_device.clone(),
            state: spec.state,
            signals: self.baseline_corrected().unwrap_or_default(),
            baselines: self.baselines(),
            previous_blanks,
            timestamp: Utc::now(),
        };
        debug!(runid = %record.record_id(), nsignals = self.signal_count(), "saving analysis");
        self.datahub.add_analysis(record.clone())?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datahub::InMemoryStore;

    fn cycle(v: f64) -> Cycle {
        BTreeMap::from([("Ar40".to_string(), v), ("Ar36".to_string(), v / 100.0)])
    }

    #[test]
    fn baseline_corrected_is_mean_signal_minus_mean_baseline() {
        let hub = Arc::new(Datahub::new(Arc::new(InMemoryStore::new("main"))));
        let persister = Persister::new(hub, None, None);
        assert!(persister.baseline_corrected().is_none());

        persister.add_signal(cycle(100.0));
        persister.add_signal(cycle(102.0));
        persister.add_baseline(cycle(1.0));
        persister.add_baseline(cycle(3.0));

        let corrected = persister.baseline_corrected().unwrap();
        assert!((corrected["Ar40"] - 99.0).abs() < 1e-9);
        assert!((corrected["Ar36"] - 0.99).abs() < 1e-9);
    }

    #[test]
    fn save_commits_through_the_datahub() {
        let store = Arc::new(InMemoryStore::new("main"));
        let hub = Arc::new(Datahub::new(store.clone()));
        let persister = Persister::new(hub, Some(4), Some("load-1".into()));
        persister.add_signal(cycle(10.0));

        let spec = RunSpec::new("12345", 1);
        let record = persister.save(&spec, BTreeMap::new()).unwrap();
        assert_eq!(record.experiment_id, Some(4));
        assert_eq!(store.analyses().len(), 1);
    }
}
