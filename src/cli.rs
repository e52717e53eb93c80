// src/cli.rs

//! CLI argument parsing using `clap`.
//!
//! The engine is a library; this front end exists to run queue files
//! headlessly against the simulated hardware in [`crate::hardware::sim`].

use clap::{Parser, ValueEnum};

/// Command-line arguments for `exprun`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "exprun",
    version,
    about = "Execute experiment queues of automated analyses.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the executor config file (TOML).
    ///
    /// Missing files fall back to built-in defaults.
    #[arg(long, value_name = "PATH", default_value = "Exprun.toml")]
    pub config: String,

    /// Queue file(s) to execute, in order.
    #[arg(long = "queue", value_name = "PATH", required = true)]
    pub queues: Vec<String>,

    /// Milliseconds the simulated spectrometer takes per count.
    #[arg(long, value_name = "MS", default_value_t = 5)]
    pub simulate_ms: u64,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `EXPRUN_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the queues, but don't execute anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
