mod common;
use crate::common::init_tracing;

use std::error::Error;
use std::fs;
use std::time::Duration;

use exprun::cli::CliArgs;
use exprun::config::loader::{load_and_validate, load_queue};
use exprun::queue::ActionKind;
use exprun::types::AnalysisType;

type TestResult = Result<(), Box<dyn Error>>;

const QUEUE: &str = r#"
mass_spectrometer = "jan"
extract_device = "Fusions CO2"
delay_between_analyses = 0.0

[[run]]
labnumber = "bu-01-01"
extraction_script = "fusions_co2_blank"
measurement_script = "jan_blank"
ncounts = 3
baseline_counts = 1

[[run]]
labnumber = "12345"
step = "b"
extraction_script = "fusions_co2_laser"
measurement_script = "jan_unknown"
ncounts = 3
baseline_counts = 1
overlap = true

[[action]]
action = "repeat"
condition = "Ar40 < 0.5"
nrepeat = 2
"#;

#[test]
fn executor_config_overrides_defaults() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("Exprun.toml");
    fs::write(
        &path,
        r#"
[executor]
memory_threshold_mb = 512
auto_save_delay = "2s"
confirmation_timeout = "250ms"
overlap_types = ["unknown", "blank_unknown"]
"#,
    )?;

    let cfg = load_and_validate(&path)?;
    assert_eq!(cfg.memory_threshold_mb, 512);
    assert_eq!(cfg.auto_save_delay, Duration::from_secs(2));
    assert_eq!(cfg.confirmation_timeout, Duration::from_millis(250));
    assert_eq!(
        cfg.overlap_types,
        vec![AnalysisType::Unknown, AnalysisType::BlankUnknown]
    );
    // Untouched keys keep their defaults.
    assert!(cfg.use_auto_save);
    assert_eq!(cfg.manager_check_retries, 3);
    Ok(())
}

#[test]
fn invalid_executor_config_is_rejected() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("Exprun.toml");
    fs::write(&path, "[executor]\nmanager_check_retries = 0\n")?;
    let err = load_and_validate(&path).err().ok_or("zero retries accepted")?;
    assert!(err.to_string().contains("manager_check_retries"), "{err}");

    fs::write(&path, "[executor]\nno_such_key = true\n")?;
    assert!(load_and_validate(&path).is_err());
    Ok(())
}

#[test]
fn queue_file_builds_runs_and_actions() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("jcal-42.toml");
    fs::write(&path, QUEUE)?;

    let queue = load_queue(&path)?;
    assert_eq!(queue.name, "jcal-42");
    assert_eq!(queue.path.as_deref(), Some(path.as_path()));
    assert_eq!(queue.automated_runs.len(), 2);

    let blank = &queue.automated_runs[0];
    assert_eq!(blank.analysis_type, AnalysisType::BlankUnknown);
    assert_eq!(blank.extract_device, "Fusions CO2");
    assert_eq!(blank.mass_spectrometer, "jan");
    assert_eq!(blank.runid(), "bu-01-01-01");

    let unknown = &queue.automated_runs[1];
    assert_eq!(unknown.step, Some('B'));
    assert_eq!(unknown.runid(), "12345-01B");
    assert!(unknown.overlap);

    assert_eq!(queue.queue_actions.len(), 1);
    assert_eq!(queue.queue_actions[0].action, ActionKind::Repeat);
    assert_eq!(queue.queue_actions[0].nrepeat, 2);
    Ok(())
}

#[test]
fn malformed_queue_files_are_rejected() -> TestResult {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("bad.toml");

    fs::write(&path, "mass_spectrometer = \"jan\"\n")?;
    let err = load_queue(&path).err().ok_or("queue without runs accepted")?;
    assert!(err.to_string().contains("at least one [[run]]"), "{err}");

    fs::write(&path, "[[run]]\nlabnumber = \"12345\"\nstep = \"AB\"\n")?;
    let err = load_queue(&path).err().ok_or("two-letter step accepted")?;
    assert!(err.to_string().contains("single letter"), "{err}");

    fs::write(
        &path,
        "delay_between_analyses = -1.0\n[[run]]\nlabnumber = \"12345\"\n",
    )?;
    assert!(load_queue(&path).is_err());

    fs::write(
        &path,
        "[[run]]\nlabnumber = \"12345\"\n[[action]]\naction = \"repeat\"\ncondition = \"Ar40 ~ 3\"\n",
    )?;
    assert!(load_queue(&path).is_err());
    Ok(())
}

#[tokio::test]
async fn dry_run_validates_without_executing() -> TestResult {
    init_tracing();

    let dir = tempfile::tempdir()?;
    let queue = dir.path().join("jcal.toml");
    fs::write(&queue, QUEUE)?;
    let backup = dir.path().join("state").join("backup_recovery");

    exprun::run(CliArgs {
        config: dir.path().join("missing.toml").display().to_string(),
        queues: vec![queue.display().to_string()],
        simulate_ms: 0,
        log_level: None,
        dry_run: true,
    })
    .await?;

    assert!(!backup.exists());
    Ok(())
}

#[tokio::test]
async fn headless_run_executes_a_queue_file() -> TestResult {
    init_tracing();

    let dir = tempfile::tempdir()?;
    let config = dir.path().join("Exprun.toml");
    let backup = dir.path().join("state").join("backup_recovery");
    fs::write(
        &config,
        format!(
            "[executor]\nmemory_threshold_mb = 1\npoll_interval = \"10ms\"\nbackup_recovery_file = {:?}\n",
            backup.display().to_string()
        ),
    )?;
    let queue = dir.path().join("jcal.toml");
    fs::write(&queue, QUEUE)?;

    let args = CliArgs {
        config: config.display().to_string(),
        queues: vec![queue.display().to_string()],
        simulate_ms: 1,
        log_level: None,
        dry_run: false,
    };
    tokio::time::timeout(Duration::from_secs(10), exprun::run(args)).await??;

    // Every run removed its line again.
    assert_eq!(fs::read_to_string(&backup)?.trim(), "");
    Ok(())
}

#[tokio::test]
async fn headless_run_refuses_an_unblanked_queue() -> TestResult {
    init_tracing();

    let dir = tempfile::tempdir()?;
    let queue = dir.path().join("unknowns.toml");
    fs::write(
        &queue,
        "mass_spectrometer = \"jan\"\n[[run]]\nlabnumber = \"12345\"\nmeasurement_script = \"jan_unknown\"\n",
    )?;

    let args = CliArgs {
        config: dir.path().join("missing.toml").display().to_string(),
        queues: vec![queue.display().to_string()],
        simulate_ms: 0,
        log_level: None,
        dry_run: false,
    };
    let err = exprun::run(args).await.err().ok_or("queue started")?;
    assert!(err.to_string().contains("Run a blank!!"), "{err}");
    Ok(())
}
