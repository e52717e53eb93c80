mod common;
use crate::common::{init_tracing, is_monotonic, with_timeout, Harness, QueueBuilder, SpecBuilder};

use std::error::Error;

use exprun::engine::{ExecutorEvent, QueueOutcome};
use exprun::hardware::ScriptKind;
use exprun::interaction::PromptKind;
use exprun::run::RunState;
use exprun::types::CancelStyle;
use exprun_test_utils::harness::seeded_blank_signals;

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn at_most_one_run_extracts_at_a_time() -> TestResult {
    init_tracing();

    let queue = QueueBuilder::new("overlap-chain")
        .runs((1..=3).map(|i| SpecBuilder::new(&format!("1000{i}")).overlap(true).build()))
        .build();
    let h = Harness::builder().queue(queue).build();

    assert!(with_timeout(h.run()).await);

    assert_eq!(h.executed_runids(), vec!["10001-01", "10002-01", "10003-01"]);
    assert_eq!(h.runner.max_concurrent(ScriptKind::Extraction), 1);
    assert_eq!(h.runner.max_concurrent(ScriptKind::Measurement), 1);
    assert!(h
        .recorder
        .finished()
        .iter()
        .all(|(_, state)| *state == RunState::Success));
    assert!(h.executor.extracting_run().is_none());
    assert!(h.executor.measuring_run().is_none());
    Ok(())
}

#[tokio::test]
async fn run_states_only_move_forward() -> TestResult {
    init_tracing();

    let queue = QueueBuilder::new("states")
        .run(SpecBuilder::new("10001").overlap(true).build())
        .run(SpecBuilder::new("10002").no_extraction().build())
        .run(SpecBuilder::new("10003").build())
        .build();
    let h = Harness::builder().queue(queue).build();

    assert!(with_timeout(h.run()).await);

    for runid in h.executed_runids() {
        let states = h.recorder.states_of(&runid);
        assert!(is_monotonic(&states), "{runid}: {states:?}");
        assert_eq!(states.last(), Some(&RunState::Success), "{runid}");
    }
    // No extraction script, so the run never reports extraction.
    assert!(!h.recorder.states_of("10002-01").contains(&RunState::Extraction));
    let queue = &h.executor.queues()[0];
    assert!(queue
        .executed_runs
        .iter()
        .all(|r| r.state == RunState::Success));
    Ok(())
}

#[tokio::test]
async fn cancel_during_delay_returns_promptly_and_once() -> TestResult {
    init_tracing();

    let queue = QueueBuilder::new("delayed")
        .run(SpecBuilder::new("10001").build())
        .run(SpecBuilder::new("10002").build())
        .delay_between(30.0)
        .build();
    let h = Harness::builder().queue(queue).build();

    let handle = h.executor.execute().await.ok_or("executor did not start")?;
    with_timeout(h.recorder.wait_for_console("Delay between analyses")).await;

    let (a, b) = (h.executor.clone(), h.executor.clone());
    tokio::join!(
        a.cancel(CancelStyle::Queue, false, false),
        b.cancel(CancelStyle::Queue, false, false),
    );
    with_timeout(handle).await?;
    with_timeout(h.settle()).await;

    assert!(!h.executor.is_alive());
    assert!(h.executor.is_canceled());
    assert_eq!(h.executed_runids(), vec!["10001-01"]);
    let banners = h
        .recorder
        .console_lines()
        .iter()
        .filter(|l| l.contains("CANCELING QUEUE"))
        .count();
    assert_eq!(banners, 1);
    assert!(h.recorder.events().iter().any(|e| matches!(
        e,
        ExecutorEvent::QueueFinished { outcome: QueueOutcome::Canceled, .. }
    )));
    Ok(())
}

#[tokio::test]
async fn stop_during_delay_keeps_remaining_runs() -> TestResult {
    init_tracing();

    let queue = QueueBuilder::new("delayed")
        .run(SpecBuilder::new("10001").build())
        .run(SpecBuilder::new("10002").build())
        .delay_between(30.0)
        .build();
    let h = Harness::builder().queue(queue).build();

    let handle = h.executor.execute().await.ok_or("executor did not start")?;
    with_timeout(h.recorder.wait_for_console("Delay between analyses")).await;

    h.executor.stop().await;
    with_timeout(handle).await?;
    with_timeout(h.settle()).await;

    assert!(h.executor.is_stopped());
    assert!(!h.executor.is_canceled());
    assert_eq!(h.executed_runids(), vec!["10001-01"]);
    let queue = &h.executor.queues()[0];
    assert_eq!(queue.automated_runs.len(), 1);
    assert_eq!(queue.automated_runs[0].labnumber, "10002");
    assert_eq!(h.executor.wait_group().active_control().snapshot().message, "Stopped");
    assert!(h.recorder.has_console_line("Queue Stopped"));
    assert!(h.recorder.events().iter().any(|e| matches!(
        e,
        ExecutorEvent::QueueFinished { outcome: QueueOutcome::Stopped, .. }
    )));
    // No cancel confirmation was needed.
    assert!(!h.prompt.asked().contains(&PromptKind::ConfirmCancel));
    Ok(())
}

#[tokio::test]
async fn finished_blank_feeds_the_next_run() -> TestResult {
    init_tracing();

    let queue = QueueBuilder::new("blank-then-unknown")
        .run(SpecBuilder::new("bu-01-01").build())
        .run(SpecBuilder::new("10001").build())
        .build();
    let h = Harness::builder().queue(queue).build();

    assert!(with_timeout(h.run()).await);

    let analyses = h.main.analyses();
    let blank = analyses
        .iter()
        .find(|a| a.record_id() == "bu-01-01-01")
        .ok_or("blank not saved")?;
    let unknown = analyses
        .iter()
        .find(|a| a.record_id() == "10001-01")
        .ok_or("unknown not saved")?;
    assert!(!blank.signals.is_empty());
    assert_eq!(unknown.previous_blanks, blank.signals);

    let prev = h.executor.previous_blanks();
    assert_eq!(prev.runid.as_deref(), Some("bu-01-01-01"));
    assert_eq!(prev.blanks, blank.signals);
    Ok(())
}

#[tokio::test]
async fn first_unknown_uses_the_stored_blank() -> TestResult {
    init_tracing();

    let queue = QueueBuilder::new("unknown-only")
        .run(SpecBuilder::new("10001").build())
        .build();
    let h = Harness::builder().queue(queue).build();

    assert!(with_timeout(h.run()).await);

    let unknown = h
        .main
        .analyses()
        .into_iter()
        .find(|a| a.record_id() == "10001-01")
        .ok_or("unknown not saved")?;
    assert_eq!(unknown.previous_blanks, seeded_blank_signals());
    // Unknowns never replace the blank values.
    assert_eq!(h.executor.previous_blanks().blanks, seeded_blank_signals());
    Ok(())
}
