mod common;
use crate::common::{init_tracing, with_timeout, Harness, QueueBuilder, SpecBuilder};

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use exprun::datahub::{AnalysisStore, InMemoryStore};
use exprun::engine::{ExecutorEvent, QueueOutcome};
use exprun::hardware::ScriptKind;
use exprun::interaction::PromptKind;
use exprun::queue::ActionKind;
use exprun::run::RunState;
use exprun::types::{AnalysisType, Answer};
use exprun_test_utils::builders::{EXTRACT_DEVICE, MASS_SPECTROMETER};
use exprun_test_utils::collab::analysis_record;

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn sequential_runs_execute_in_queue_order() -> TestResult {
    init_tracing();

    let queue = QueueBuilder::new("sequential")
        .run(SpecBuilder::new("10001").build())
        .run(SpecBuilder::new("10002").build())
        .build();
    let h = Harness::builder().queue(queue).build();

    assert!(with_timeout(h.run()).await);

    assert_eq!(h.executed_runids(), vec!["10001-01", "10002-01"]);
    assert_eq!(
        h.recorder.finished(),
        vec![
            ("10001-01".to_string(), RunState::Success),
            ("10002-01".to_string(), RunState::Success),
        ]
    );
    // The second run did not start extracting before the first one finished.
    let calls = h.runner.calls();
    let first_measure = calls
        .iter()
        .position(|c| c.runid == "10001-01" && c.kind == ScriptKind::Measurement)
        .ok_or("first run never measured")?;
    let second_extract = calls
        .iter()
        .position(|c| c.runid == "10002-01" && c.kind == ScriptKind::Extraction)
        .ok_or("second run never extracted")?;
    assert!(first_measure < second_extract);

    assert!(h.executor.measuring_run().is_none());
    assert!(h.executor.extracting_run().is_none());
    assert!(!h.executor.is_alive());
    assert!(h.executor.err_message().is_none());
    assert_eq!(h.main.analyses().len(), 3); // seeded blank + two runs
    assert!(h.backup_entries().is_empty());
    assert!(h.executor.queues()[0].executed);
    Ok(())
}

#[tokio::test]
async fn overlapped_run_waits_for_extraction_not_measurement() -> TestResult {
    init_tracing();

    let queue = QueueBuilder::new("overlap")
        .run(SpecBuilder::new("10001").overlap(true).build())
        .run(SpecBuilder::new("10002").overlap(true).build())
        .build();
    let h = Harness::builder().queue(queue).build();
    h.runner.hold(ScriptKind::Extraction);
    h.runner.hold(ScriptKind::Measurement);

    let handle = h.executor.execute().await.ok_or("executor did not start")?;

    with_timeout(h.runner.wait_started("10001-01", ScriptKind::Extraction)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h.runner.called("10002-01", ScriptKind::Extraction));

    // Finishing the first extraction lets the second run extract while the
    // first one is still measuring.
    h.runner.release("10001-01", ScriptKind::Extraction);
    with_timeout(h.runner.wait_started("10001-01", ScriptKind::Measurement)).await;
    with_timeout(h.runner.wait_started("10002-01", ScriptKind::Extraction)).await;

    let measuring = h.executor.measuring_run().ok_or("nothing measuring")?;
    let extracting = h.executor.extracting_run().ok_or("nothing extracting")?;
    assert_eq!(measuring.runid(), "10001-01");
    assert_eq!(measuring.state(), RunState::Measurement);
    assert_eq!(extracting.runid(), "10002-01");
    assert_eq!(extracting.state(), RunState::Extraction);

    h.runner.release("10002-01", ScriptKind::Extraction);
    h.runner.release("10001-01", ScriptKind::Measurement);
    h.runner.release("10002-01", ScriptKind::Measurement);
    with_timeout(handle).await?;
    with_timeout(h.settle()).await;

    assert_eq!(h.executed_runids(), vec!["10001-01", "10002-01"]);
    assert_eq!(h.runner.max_concurrent(ScriptKind::Extraction), 1);
    assert_eq!(h.runner.max_concurrent(ScriptKind::Measurement), 1);
    assert!(h.executor.measuring_run().is_none());
    assert!(h
        .recorder
        .finished()
        .iter()
        .all(|(_, state)| *state == RunState::Success));
    Ok(())
}

#[tokio::test]
async fn remote_conflict_is_renumbered_when_operator_agrees() -> TestResult {
    init_tracing();

    let remote = Arc::new(InMemoryStore::new("remote"));
    seed_remote(&remote, "12345", 1);

    let queue = QueueBuilder::new("conflict")
        .run(SpecBuilder::new("12345").aliquot(1).build())
        .build();
    let h = Harness::builder()
        .queue(queue)
        .secondary(remote.clone())
        .answer(PromptKind::NumberingConflict, Answer::Yes)
        .build();

    assert!(with_timeout(h.run()).await);

    assert!(h.prompt.asked().contains(&PromptKind::NumberingConflict));
    assert_eq!(h.executed_runids(), vec!["12345-02"]);
    let saved: Vec<_> = h
        .main
        .analyses()
        .into_iter()
        .filter(|a| a.labnumber == "12345")
        .collect();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].aliquot, 2);
    // Mirrored to the secondary database as well.
    assert!(remote.analyses().iter().any(|a| a.record_id() == "12345-02"));
    Ok(())
}

#[tokio::test]
async fn remote_conflict_halts_when_operator_declines() -> TestResult {
    init_tracing();

    let remote = Arc::new(InMemoryStore::new("remote"));
    seed_remote(&remote, "12345", 1);

    let queue = QueueBuilder::new("conflict")
        .run(SpecBuilder::new("12345").build())
        .build();
    let h = Harness::builder()
        .queue(queue)
        .secondary(remote)
        .answer(PromptKind::NumberingConflict, Answer::No)
        .build();

    assert!(!with_timeout(h.run()).await);
    assert!(!h.executor.is_alive());
    let err = h.executor.err_message().ok_or("no error recorded")?;
    assert!(err.starts_with("Numbering conflict"), "{err}");
    assert!(h.runner.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn low_memory_refuses_to_start() -> TestResult {
    init_tracing();

    let queue = QueueBuilder::new("memory")
        .run(SpecBuilder::new("10001").build())
        .build();
    let h = Harness::builder().queue(queue).memory_mb(5).build();

    assert!(h.executor.execute().await.is_none());
    assert!(!h.executor.is_alive());
    let err = h.executor.err_message().ok_or("no error recorded")?;
    assert!(err.contains("Not enough free memory"), "{err}");
    with_timeout(h.recorder.wait_for(|events| {
        events.iter().any(|e| matches!(
            e,
            ExecutorEvent::Console { text, .. } if text.starts_with("****** NOT ENOUGH FREE MEMORY")
        ))
    }))
    .await;
    assert!(h.main.experiments().is_empty());
    assert!(h.runner.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn repeat_action_reruns_twice_then_cancels() -> TestResult {
    init_tracing();

    let queue = QueueBuilder::new("repeat")
        .run(SpecBuilder::new("10001").build())
        .action(ActionKind::Repeat, "Ar40 > 100", 2)
        .build();
    let h = Harness::builder().queue(queue).build();

    assert!(with_timeout(h.run()).await);

    assert_eq!(
        h.executed_runids(),
        vec!["10001-01", "10001-02", "10001-03"]
    );
    assert!(h.executor.is_canceled());
    let queue = &h.executor.queues()[0];
    assert_eq!(queue.queue_actions[0].count, 2);
    assert!(queue.automated_runs.is_empty());
    assert!(h.recorder.events().iter().any(|e| matches!(
        e,
        ExecutorEvent::QueueFinished { outcome: QueueOutcome::Canceled, .. }
    )));
    Ok(())
}

#[tokio::test]
async fn repeat_action_renumbers_past_its_own_saved_result() -> TestResult {
    init_tracing();

    let queue = QueueBuilder::new("repeat-remote")
        .run(SpecBuilder::new("10001").build())
        .action(ActionKind::Repeat, "Ar40 > 100", 2)
        .build();
    let remote = Arc::new(InMemoryStore::new("remote"));
    let h = Harness::builder()
        .queue(queue)
        .secondary(remote.clone())
        .build();

    assert!(with_timeout(h.run()).await);

    assert_eq!(
        h.executed_runids(),
        vec!["10001-01", "10001-02", "10001-03"]
    );
    assert!(h.executor.err_message().is_none());
    assert!(!h.prompt.asked().contains(&PromptKind::NumberingConflict));
    for aliquot in 1..=3 {
        assert!(remote.contains("10001", aliquot, None)?);
    }
    Ok(())
}

#[tokio::test]
async fn cancel_action_stops_after_first_match() -> TestResult {
    init_tracing();

    let queue = QueueBuilder::new("cancel-action")
        .run(SpecBuilder::new("10001").build())
        .run(SpecBuilder::new("10002").build())
        .action(ActionKind::Cancel, "Ar40 > 100", 1)
        .build();
    let h = Harness::builder().queue(queue).build();

    assert!(with_timeout(h.run()).await);

    assert_eq!(h.executed_runids(), vec!["10001-01"]);
    assert!(h.executor.is_canceled());
    assert!(h.recorder.has_console_line("TRIGGERED \"AR40 > 100\""));
    Ok(())
}

fn seed_remote(store: &InMemoryStore, labnumber: &str, aliquot: u32) {
    store
        .add_analysis(analysis_record(
            labnumber,
            aliquot,
            AnalysisType::Unknown,
            MASS_SPECTROMETER,
            EXTRACT_DEVICE,
            Default::default(),
        ))
        .expect("seed remote analysis");
}
