// src/errors.rs

//! Crate-wide error aliases and helpers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExprunError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Queue file error: {0}")]
    QueueError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Numbering conflict: {0}")]
    NumberingConflict(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, ExprunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_category() {
        let err = ExprunError::NumberingConflict("12345-01 exists".into());
        assert_eq!(err.to_string(), "Numbering conflict: 12345-01 exists");
    }

    #[test]
    fn anyhow_errors_are_transparent() {
        let err: ExprunError = anyhow::anyhow!("spectrometer offline").into();
        assert_eq!(err.to_string(), "spectrometer offline");
    }
}
