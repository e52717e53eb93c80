// src/lib.rs

pub mod cli;
pub mod config;
pub mod datahub;
pub mod engine;
pub mod errors;
pub mod fs;
pub mod hardware;
pub mod interaction;
pub mod logging;
pub mod memory;
pub mod queue;
pub mod run;
pub mod stats;
pub mod types;
pub mod wait;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::loader::{load_and_validate, load_queue};
use crate::config::ExecutorConfig;
use crate::datahub::{Datahub, InMemoryStore};
use crate::engine::{BackupRecovery, Collaborators, ExecutorEvent, ExperimentExecutor};
use crate::fs::RealFileSystem;
use crate::interaction::{HeadlessPrompt, LogNotifier};
use crate::memory::SystemMemory;
use crate::queue::ExperimentQueue;
use crate::types::CancelStyle;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config and queue loading
/// - the simulated rig and headless collaborators
/// - the executor and its console
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let config = load_and_validate(PathBuf::from(&args.config))?;
    let queues = args
        .queues
        .iter()
        .map(load_queue)
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if args.dry_run {
        print_dry_run(&config, &queues);
        return Ok(());
    }

    let extract_device = queues
        .first()
        .map(|q| q.extract_device.clone())
        .unwrap_or_default();
    let collab = Collaborators {
        managers: hardware::sim::registry(
            &extract_device,
            Duration::from_millis(args.simulate_ms),
        ),
        datahub: Arc::new(Datahub::new(Arc::new(InMemoryStore::new("main")))),
        prompt: Arc::new(HeadlessPrompt),
        notifier: Arc::new(LogNotifier),
        memory: Arc::new(SystemMemory::new()),
        backup: BackupRecovery::new(
            Arc::new(RealFileSystem),
            config.backup_recovery_file.clone(),
        ),
    };
    let executor = ExperimentExecutor::new(config, queues, collab);

    // Ctrl-C → cancel the queue without asking.
    {
        let executor = executor.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            executor.cancel(CancelStyle::Queue, false, false).await;
        });
    }

    let printer = spawn_console_printer(&executor);

    let Some(handle) = executor.execute().await else {
        printer.abort();
        let err = executor
            .err_message()
            .unwrap_or_else(|| "pre execute check failed".into());
        anyhow::bail!("queue not started: {err}");
    };
    handle.await?;
    printer.abort();

    info!(
        nruns = executor.stats().nruns_finished(),
        elapsed = ?executor.stats().elapsed(),
        "all queues done"
    );
    match executor.err_message() {
        Some(err) => anyhow::bail!("queue ended with error: {err}"),
        None => Ok(()),
    }
}

/// Print console lines as they arrive.
fn spawn_console_printer(executor: &ExperimentExecutor) -> tokio::task::JoinHandle<()> {
    let mut rx = executor.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ExecutorEvent::Console { text, .. }) => println!("{text}"),
                Ok(ExecutorEvent::RunFinished {
                    runid,
                    state,
                    duration,
                }) => debug!(%runid, %state, ?duration, "run finished"),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "console lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Simple dry-run output: print the config and every queued run.
fn print_dry_run(config: &ExecutorConfig, queues: &[ExperimentQueue]) {
    println!("exprun dry-run");
    println!("  executor.memory_threshold_mb = {}", config.memory_threshold_mb);
    println!("  executor.overlap_types = {:?}", config.overlap_types);
    println!("  executor.poll_interval = {:?}", config.poll_interval);
    println!();

    for queue in queues {
        println!("queue \"{}\" ({} runs):", queue.name, queue.automated_runs.len());
        println!("  mass_spectrometer: {}", queue.mass_spectrometer);
        if !queue.extract_device.is_empty() {
            println!("  extract_device: {}", queue.extract_device);
        }
        if queue.delay_before_analyses > 0.0 {
            println!("  delay_before_analyses: {}", queue.delay_before_analyses);
        }
        if queue.delay_between_analyses > 0.0 {
            println!("  delay_between_analyses: {}", queue.delay_between_analyses);
        }
        for spec in &queue.automated_runs {
            let mut flags = Vec::new();
            if spec.overlap {
                flags.push("overlap");
            }
            if spec.end_after {
                flags.push("end_after");
            }
            if spec.skip {
                flags.push("skip");
            }
            println!(
                "  - {} [{}] {}",
                spec.runid(),
                spec.analysis_type,
                flags.join(" ")
            );
        }
        for action in &queue.queue_actions {
            println!("  action: {:?} when {}", action.action, action.condition);
        }
    }

    debug!("dry-run complete (no execution)");
}
