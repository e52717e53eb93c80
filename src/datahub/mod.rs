// src/datahub/mod.rs

//! Numbering and persistence mediator.
//!
//! Every database read or write the executor performs goes through
//! [`Datahub`]. Its main job is keeping `(labnumber, aliquot, step)` unique
//! when several lab instances write the same identifiers: chosen numbers are
//! reserved for the lifetime of the hub so they are never handed out twice,
//! even before the analysis is committed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{ExprunError, Result};
use crate::run::identifier::{make_runid, step_index, step_letter};
use crate::run::RunSpec;
use crate::types::AnalysisType;

pub mod memory;
pub mod store;

pub use memory::InMemoryStore;
pub use store::{AnalysisRecord, AnalysisStore, BlankQuery, ExperimentRecord};

/// Upper bound on blank candidates offered to the operator.
pub const BLANK_CANDIDATE_LIMIT: usize = 100;

type RunKey = (String, u32, Option<char>);

#[derive(Debug)]
pub struct Datahub {
    mainstore: Arc<dyn AnalysisStore>,
    secondary: Option<Arc<dyn AnalysisStore>>,
    secondary_enabled: AtomicBool,
    reserved: Mutex<HashSet<RunKey>>,
}

impl Datahub {
    pub fn new(mainstore: Arc<dyn AnalysisStore>) -> Self {
        Self {
            mainstore,
            secondary: None,
            secondary_enabled: AtomicBool::new(true),
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Attach the remote (secondary) database other lab instances write to.
    pub fn with_secondary(mut self, store: Arc<dyn AnalysisStore>) -> Self {
        self.secondary = Some(store);
        self
    }

    pub fn mainstore(&self) -> &Arc<dyn AnalysisStore> {
        &self.mainstore
    }

    pub fn has_secondary(&self) -> bool {
        self.secondary().is_some()
    }

    /// Stop consulting the secondary database for this session.
    pub fn disable_secondary(&self) {
        if self.secondary_enabled.swap(false, Ordering::SeqCst) {
            info!("continuing with the main database only");
        }
    }

    fn secondary(&self) -> Option<&Arc<dyn AnalysisStore>> {
        self.secondary
            .as_ref()
            .filter(|_| self.secondary_enabled.load(Ordering::SeqCst))
    }

    /// Whether the secondary database is reachable.
    ///
    /// Returns `false` when no secondary database is configured.
    pub fn secondary_connect(&self) -> bool {
        match self.secondary() {
            Some(store) => match store.connect() {
                Ok(ok) => ok,
                Err(err) => {
                    warn!(store = store.name(), error = %err, "secondary connect failed");
                    false
                }
            },
            None => false,
        }
    }

    /// Describe a conflict if the spec's numbering already exists remotely.
    pub fn is_conflict(&self, spec: &RunSpec) -> Result<Option<String>> {
        let Some(secondary) = self.secondary() else {
            return Ok(None);
        };
        if secondary.contains(&spec.labnumber, spec.aliquot, spec.step)? {
            let msg = format!(
                "{} already exists in {}",
                spec.runid(),
                secondary.name()
            );
            debug!(conflict = %msg, "numbering conflict");
            return Ok(Some(msg));
        }
        Ok(None)
    }

    /// Run id `update_spec(spec, 0, 0)` would assign, without reserving it.
    pub fn new_runid(&self, spec: &RunSpec) -> Result<String> {
        let reserved = self.reserved.lock();
        let (aliquot, step) = self.next_available(spec, 0, 0, &reserved)?;
        Ok(make_runid(&spec.labnumber, aliquot, step))
    }

    /// Move the spec to the next free numbering and reserve it.
    ///
    /// Plain runs get a new aliquot; step-heat runs keep their aliquot and
    /// advance the step letter. The offsets push the choice past runs that
    /// are in flight and not yet committed.
    pub fn update_spec(
        &self,
        spec: &mut RunSpec,
        aliquot_offset: u32,
        step_offset: usize,
    ) -> Result<()> {
        let mut reserved = self.reserved.lock();
        let (aliquot, step) = self.next_available(spec, aliquot_offset, step_offset, &reserved)?;

        if aliquot != spec.aliquot || step != spec.step {
            info!(
                from = %spec.runid(),
                to = %make_runid(&spec.labnumber, aliquot, step),
                "renumbering run"
            );
        }
        spec.aliquot = aliquot;
        spec.step = step;
        reserved.insert((spec.labnumber.clone(), aliquot, step));
        Ok(())
    }

    fn next_available(
        &self,
        spec: &RunSpec,
        aliquot_offset: u32,
        step_offset: usize,
        reserved: &HashSet<RunKey>,
    ) -> Result<(u32, Option<char>)> {
        let ln = spec.labnumber.as_str();

        match spec.step {
            Some(step) => {
                let mut idx = step_index(step).ok_or_else(|| {
                    ExprunError::NumberingConflict(format!("invalid step {step:?}"))
                })? + step_offset;
                loop {
                    let letter = step_letter(idx).ok_or_else(|| {
                        ExprunError::NumberingConflict(format!(
                            "no step letters left for {}",
                            make_runid(ln, spec.aliquot, None)
                        ))
                    })?;
                    let key = (ln.to_string(), spec.aliquot, Some(letter));
                    if reserved.contains(&key) || self.committed(ln, spec.aliquot, Some(letter))? {
                        idx += 1;
                        continue;
                    }
                    return Ok((spec.aliquot, Some(letter)));
                }
            }
            None => {
                let latest = self.latest_aliquot(ln)?.unwrap_or(0);
                let mut aliquot = spec.aliquot.max(latest + 1) + aliquot_offset;
                while reserved.contains(&(ln.to_string(), aliquot, None)) {
                    aliquot += 1;
                }
                Ok((aliquot, None))
            }
        }
    }

    fn latest_aliquot(&self, labnumber: &str) -> Result<Option<u32>> {
        let mut latest = self.mainstore.latest_aliquot(labnumber)?;
        if let Some(secondary) = self.secondary() {
            latest = latest.max(secondary.latest_aliquot(labnumber)?);
        }
        Ok(latest)
    }

    fn committed(&self, labnumber: &str, aliquot: u32, step: Option<char>) -> Result<bool> {
        if self.mainstore.contains(labnumber, aliquot, step)? {
            return Ok(true);
        }
        match self.secondary() {
            Some(secondary) => Ok(secondary.contains(labnumber, aliquot, step)?),
            None => Ok(false),
        }
    }

    pub fn add_experiment(&self, record: ExperimentRecord) -> Result<u64> {
        let id = self
            .mainstore
            .add_experiment(record)
            .map_err(|e| ExprunError::Persistence(format!("adding experiment: {e:#}")))?;
        Ok(id)
    }

    /// Commit to the main store, then mirror to the secondary.
    ///
    /// A secondary failure is logged but does not fail the commit.
    pub fn add_analysis(&self, record: AnalysisRecord) -> Result<()> {
        let runid = record.record_id();
        if let Some(secondary) = self.secondary() {
            if let Err(err) = secondary.add_analysis(record.clone()) {
                warn!(%runid, store = secondary.name(), error = %err, "secondary save failed");
            }
        }
        self.mainstore
            .add_analysis(record)
            .map_err(|e| ExprunError::Persistence(format!("saving {runid}: {e:#}")))
    }

    /// Most recent blank of `kind` from the main store.
    pub fn last_blank(
        &self,
        kind: AnalysisType,
        mass_spectrometer: &str,
        extract_device: &str,
    ) -> Result<Option<AnalysisRecord>> {
        Ok(self
            .blanks_limited(kind, mass_spectrometer, extract_device, 1)?
            .into_iter()
            .next())
    }

    /// Recent blanks of `kind`, newest first, for the operator to choose from.
    pub fn blanks(
        &self,
        kind: AnalysisType,
        mass_spectrometer: &str,
        extract_device: &str,
    ) -> Result<Vec<AnalysisRecord>> {
        self.blanks_limited(kind, mass_spectrometer, extract_device, BLANK_CANDIDATE_LIMIT)
    }

    fn blanks_limited(
        &self,
        kind: AnalysisType,
        mass_spectrometer: &str,
        extract_device: &str,
        limit: usize,
    ) -> Result<Vec<AnalysisRecord>> {
        let device = crate::run::identifier::is_device_named(extract_device)
            .then_some(extract_device);
        let query = BlankQuery {
            analysis_type: kind,
            mass_spectrometer,
            extract_device: device,
            limit,
        };
        Ok(self.mainstore.blanks(&query)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunState;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn committed(labnumber: &str, aliquot: u32, step: Option<char>) -> AnalysisRecord {
        AnalysisRecord {
            labnumber: labnumber.into(),
            aliquot,
            step,
            analysis_type: AnalysisType::Unknown,
            uuid: Uuid::new_v4(),
            experiment_id: None,
            load_name: None,
            mass_spectrometer: "jan".into(),
            extract_device: String::new(),
            state: RunState::Success,
            signals: BTreeMap::new(),
            baselines: BTreeMap::new(),
            previous_blanks: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    fn hub_with_remote(remote: &[(&str, u32)]) -> Datahub {
        let secondary = InMemoryStore::new("massspec");
        for (ln, al) in remote {
            secondary.add_analysis(committed(ln, *al, None)).unwrap();
        }
        Datahub::new(Arc::new(InMemoryStore::new("main"))).with_secondary(Arc::new(secondary))
    }

    #[test]
    fn remote_duplicate_is_a_conflict() {
        let hub = hub_with_remote(&[("12345", 1)]);
        let spec = RunSpec::new("12345", 1);
        let conflict = hub.is_conflict(&spec).unwrap();
        assert!(conflict.unwrap().contains("12345-01"));
        assert_eq!(hub.new_runid(&spec).unwrap(), "12345-02");

        let other = RunSpec::new("12345", 2);
        assert!(hub.is_conflict(&other).unwrap().is_none());
    }

    #[test]
    fn update_spec_never_hands_out_a_reserved_aliquot() {
        let hub = Datahub::new(Arc::new(InMemoryStore::new("main")));
        let mut a = RunSpec::new("12345", 1);
        let mut b = RunSpec::new("12345", 1);
        hub.update_spec(&mut a, 0, 0).unwrap();
        hub.update_spec(&mut b, 0, 0).unwrap();
        assert_eq!(a.aliquot, 1);
        assert_eq!(b.aliquot, 2);
    }

    #[test]
    fn step_heat_advances_the_step_letter() {
        let hub = Datahub::new(Arc::new(InMemoryStore::new("main")));
        hub.mainstore()
            .add_analysis(committed("12345", 3, Some('A')))
            .unwrap();

        let mut spec = RunSpec::new("12345", 3);
        spec.step = Some('A');
        hub.update_spec(&mut spec, 0, 0).unwrap();
        assert_eq!(spec.aliquot, 3);
        assert_eq!(spec.step, Some('B'));

        let mut next = RunSpec::new("12345", 3);
        next.step = Some('B');
        hub.update_spec(&mut next, 0, 1).unwrap();
        assert_eq!(next.step, Some('C'));
    }

    #[test]
    fn no_secondary_means_not_connected_and_no_conflicts() {
        let hub = Datahub::new(Arc::new(InMemoryStore::new("main")));
        assert!(!hub.secondary_connect());
        assert!(hub.is_conflict(&RunSpec::new("12345", 1)).unwrap().is_none());
    }
}
