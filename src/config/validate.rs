// src/config/validate.rs

use std::time::Duration;

use crate::config::model::{ExecutorConfig, RawConfigFile, SourcedQueueFile};
use crate::errors::{ExprunError, Result};
use crate::queue::{ExperimentQueue, QueueAction};
use crate::run::RunSpecConfig;

impl TryFrom<RawConfigFile> for ExecutorConfig {
    type Error = ExprunError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_executor_config(&raw)?;
        Ok(ExecutorConfig::new_unchecked(raw.executor))
    }
}

fn validate_executor_config(cfg: &RawConfigFile) -> Result<()> {
    let ex = &cfg.executor;
    if ex.poll_interval.is_zero() {
        return Err(ExprunError::ConfigError(
            "[executor].poll_interval must be > 0".to_string(),
        ));
    }
    if ex.manager_check_retries == 0 {
        return Err(ExprunError::ConfigError(
            "[executor].manager_check_retries must be >= 1 (got 0)".to_string(),
        ));
    }
    if ex.backup_recovery_file.as_os_str().is_empty() {
        return Err(ExprunError::ConfigError(
            "[executor].backup_recovery_file must not be empty".to_string(),
        ));
    }
    Ok(())
}

impl TryFrom<SourcedQueueFile> for ExperimentQueue {
    type Error = ExprunError;

    fn try_from(src: SourcedQueueFile) -> std::result::Result<Self, Self::Error> {
        let SourcedQueueFile { path, file } = src;
        let name = file
            .name
            .clone()
            .or_else(|| {
                path.as_ref()
                    .and_then(|p| p.file_stem())
                    .map(|s| s.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "queue".to_string());

        ensure_has_runs(&name, &file.runs)?;
        validate_delay(&name, "delay_before_analyses", file.delay_before_analyses)?;
        validate_delay(&name, "delay_between_analyses", file.delay_between_analyses)?;
        for (i, run) in file.runs.iter().enumerate() {
            validate_run(&name, i, run)?;
        }

        let queue_actions = file
            .actions
            .into_iter()
            .map(QueueAction::try_from)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| ExprunError::QueueError(format!("queue '{name}': {e}")))?;

        let automated_runs = file
            .runs
            .into_iter()
            .map(|r| r.into_spec(&file.extract_device, &file.mass_spectrometer))
            .collect();

        Ok(ExperimentQueue {
            name,
            path,
            mass_spectrometer: file.mass_spectrometer,
            extract_device: file.extract_device,
            load_name: file.load_name,
            delay_before_analyses: file.delay_before_analyses,
            delay_between_analyses: file.delay_between_analyses,
            automated_runs,
            executed_runs: Vec::new(),
            queue_actions,
            database_identifier: None,
            executed: false,
        })
    }
}

fn ensure_has_runs(name: &str, runs: &[RunSpecConfig]) -> Result<()> {
    if runs.is_empty() {
        return Err(ExprunError::QueueError(format!(
            "queue '{name}' must contain at least one [[run]] table"
        )));
    }
    Ok(())
}

/// Whether `value` seconds fit in a `Duration`.
fn is_valid_secs(value: f64) -> bool {
    Duration::try_from_secs_f64(value).is_ok()
}

fn validate_delay(name: &str, key: &str, value: f64) -> Result<()> {
    if !is_valid_secs(value) {
        return Err(ExprunError::QueueError(format!(
            "queue '{name}': {key} must be a non-negative number of seconds (got {value})"
        )));
    }
    Ok(())
}

fn validate_run(name: &str, index: usize, run: &RunSpecConfig) -> Result<()> {
    let at = format!("queue '{name}', run {} ({})", index + 1, run.labnumber);

    if run.labnumber.trim().is_empty() {
        return Err(ExprunError::QueueError(format!(
            "queue '{name}', run {}: labnumber must not be empty",
            index + 1
        )));
    }
    if !is_valid_secs(run.overlap_delay) {
        return Err(ExprunError::QueueError(format!(
            "{at}: overlap_delay must be a non-negative number of seconds (got {})",
            run.overlap_delay
        )));
    }
    if let Some(step) = &run.step {
        let step = step.trim();
        let mut chars = step.chars();
        let valid = matches!(
            (chars.next(), chars.next()),
            (Some(c), None) if c.is_ascii_alphabetic()
        );
        if !valid {
            return Err(ExprunError::QueueError(format!(
                "{at}: step must be a single letter A-Z (got {step:?})"
            )));
        }
    }
    Ok(())
}
