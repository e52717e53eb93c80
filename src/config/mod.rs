// src/config/mod.rs

//! Configuration loading and validation.
//!
//! - `model.rs`: TOML-backed data model for `Exprun.toml` and queue files.
//! - `loader.rs`: reading files through the [`FileSystem`](crate::fs::FileSystem) seam.
//! - `validate.rs`: semantic checks, as `TryFrom` conversions into the
//!   validated types.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, load_queue};
pub use model::{ExecutorConfig, ExecutorSection, QueueFile, RawConfigFile, SourcedQueueFile};
