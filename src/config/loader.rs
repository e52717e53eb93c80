// src/config/loader.rs

use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::model::{ExecutorConfig, QueueFile, RawConfigFile, SourcedQueueFile};
use crate::errors::Result;
use crate::fs::{FileSystem, RealFileSystem};
use crate::queue::ExperimentQueue;

/// Load an executor config file and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    load_from_path_with(&RealFileSystem, path.as_ref())
}

pub fn load_from_path_with(fs: &dyn FileSystem, path: &Path) -> Result<RawConfigFile> {
    let contents = fs.read_to_string(path)?;
    let config: RawConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

/// Load and validate the executor config.
///
/// A missing file is not an error: the built-in defaults apply.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ExecutorConfig> {
    load_and_validate_with(&RealFileSystem, path.as_ref())
}

pub fn load_and_validate_with(fs: &dyn FileSystem, path: &Path) -> Result<ExecutorConfig> {
    let raw = if fs.exists(path) {
        load_from_path_with(fs, path)?
    } else {
        info!(?path, "no executor config found, using defaults");
        RawConfigFile::default()
    };
    ExecutorConfig::try_from(raw)
}

/// Load and validate one queue file.
pub fn load_queue(path: impl AsRef<Path>) -> Result<ExperimentQueue> {
    load_queue_with(&RealFileSystem, path.as_ref())
}

pub fn load_queue_with(fs: &dyn FileSystem, path: &Path) -> Result<ExperimentQueue> {
    let contents = fs.read_to_string(path)?;
    let file: QueueFile = toml::from_str(&contents)?;
    ExperimentQueue::try_from(SourcedQueueFile {
        path: Some(path.to_path_buf()),
        file,
    })
}

/// Default executor config location.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Exprun.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;
    use std::time::Duration;

    #[test]
    fn missing_executor_config_uses_defaults() {
        let fs = MockFileSystem::new();
        let cfg = load_and_validate_with(&fs, Path::new("Exprun.toml")).unwrap();
        assert_eq!(cfg.memory_threshold_mb, 10);
        assert_eq!(cfg.auto_save_delay, Duration::from_secs(30));
        assert_eq!(cfg.manager_check_retries, 3);
    }

    #[test]
    fn humantime_durations_are_parsed() {
        let fs = MockFileSystem::new();
        fs.add_file(
            "Exprun.toml",
            r#"
[executor]
confirmation_timeout = "2m"
poll_interval = "250ms"
overlap_types = ["unknown", "air"]
"#,
        );
        let cfg = load_and_validate_with(&fs, Path::new("Exprun.toml")).unwrap();
        assert_eq!(cfg.confirmation_timeout, Duration::from_secs(120));
        assert_eq!(cfg.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.overlap_types.len(), 2);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let fs = MockFileSystem::new();
        fs.add_file("Exprun.toml", "[executor]\nmemory_treshold_mb = 5\n");
        assert!(load_and_validate_with(&fs, Path::new("Exprun.toml")).is_err());
    }

    #[test]
    fn queue_runs_inherit_queue_settings() {
        let fs = MockFileSystem::new();
        fs.add_file(
            "q.toml",
            r#"
mass_spectrometer = "jan"
extract_device = "Fusions CO2"

[[run]]
labnumber = "ba-01-01"
"#,
        );
        let q = load_queue_with(&fs, Path::new("q.toml")).unwrap();
        let spec = &q.automated_runs[0];
        assert_eq!(spec.mass_spectrometer, "jan");
        assert_eq!(spec.extract_device, "Fusions CO2");
        assert_eq!(spec.analysis_type, crate::types::AnalysisType::BlankAir);
    }
}
