use std::collections::HashSet;
use std::sync::Arc;

use proptest::prelude::*;

use exprun::datahub::{AnalysisStore, Datahub, InMemoryStore};
use exprun::engine::core::numbering_offsets;
use exprun::run::identifier::step_letter;
use exprun::run::{RunSpec, RunState};
use exprun::types::AnalysisType;
use exprun_test_utils::builders::{EXTRACT_DEVICE, MASS_SPECTROMETER};
use exprun_test_utils::collab::analysis_record;

const LABNUMBERS: [&str; 2] = ["10001", "10002"];

/// One queued run: which labnumber, an optional step-heat `(aliquot, step)`,
/// and whether it commits before the next run is numbered.
#[derive(Debug, Clone)]
struct Queued {
    lab: usize,
    step_heat: Option<(u32, usize)>,
    commits: bool,
}

fn queued_strategy() -> impl Strategy<Value = Queued> {
    (
        0..LABNUMBERS.len(),
        proptest::option::of((1..4u32, 0..3usize)),
        any::<bool>(),
    )
        .prop_map(|(lab, step_heat, commits)| Queued {
            lab,
            step_heat,
            commits,
        })
}

fn spec_for(q: &Queued) -> RunSpec {
    let mut spec = RunSpec::new(LABNUMBERS[q.lab], 1);
    if let Some((aliquot, step)) = q.step_heat {
        spec.aliquot = aliquot;
        spec.step = step_letter(step);
    }
    spec
}

fn commit(store: &InMemoryStore, spec: &RunSpec) {
    let mut record = analysis_record(
        &spec.labnumber,
        spec.aliquot,
        AnalysisType::Unknown,
        MASS_SPECTROMETER,
        EXTRACT_DEVICE,
        Default::default(),
    );
    record.step = spec.step;
    store.add_analysis(record).expect("commit numbered run");
}

proptest! {
    #[test]
    fn numbering_never_repeats_an_identifier(
        committed in proptest::collection::vec((0..LABNUMBERS.len(), 1..5u32), 0..4),
        queued in proptest::collection::vec(queued_strategy(), 1..=10),
    ) {
        let store = Arc::new(InMemoryStore::new("main"));
        let mut taken: HashSet<(String, u32, Option<char>)> = HashSet::new();
        for (lab, aliquot) in committed {
            let spec = RunSpec::new(LABNUMBERS[lab], aliquot);
            if taken.insert((spec.labnumber.clone(), aliquot, None)) {
                commit(&store, &spec);
            }
        }
        let hub = Datahub::new(store.clone());

        let mut in_flight: Vec<RunSpec> = Vec::new();
        for q in &queued {
            let mut spec = spec_for(q);
            let same: Vec<RunSpec> = in_flight
                .iter()
                .filter(|r| r.labnumber == spec.labnumber)
                .cloned()
                .collect();
            let (aliquot_offset, step_offset) = numbering_offsets(&spec, &same);
            hub.update_spec(&mut spec, aliquot_offset, step_offset)
                .expect("numbering succeeds");

            let key = (spec.labnumber.clone(), spec.aliquot, spec.step);
            prop_assert!(taken.insert(key), "{} handed out twice", spec.runid());

            if q.commits {
                commit(&store, &spec);
            } else {
                spec.state = RunState::Measurement;
                in_flight.push(spec);
            }
        }
    }

    #[test]
    fn remote_identifiers_are_skipped(
        remote_aliquots in proptest::collection::btree_set(1..8u32, 1..5),
        nruns in 1..6usize,
    ) {
        let main = Arc::new(InMemoryStore::new("main"));
        let remote = Arc::new(InMemoryStore::new("remote"));
        for aliquot in &remote_aliquots {
            commit(&remote, &RunSpec::new("12345", *aliquot));
        }
        let hub = Datahub::new(main).with_secondary(remote);

        let latest = *remote_aliquots.iter().max().expect("non-empty set");
        for n in 0..nruns {
            let mut spec = RunSpec::new("12345", 1);
            let conflict = hub.is_conflict(&spec).expect("remote reachable");
            prop_assert_eq!(conflict.is_some(), remote_aliquots.contains(&1));
            hub.update_spec(&mut spec, 0, 0).expect("numbering succeeds");
            prop_assert_eq!(spec.aliquot, latest + 1 + n as u32);
            prop_assert!(!remote_aliquots.contains(&spec.aliquot));
        }
    }
}
