// src/engine/checks.rs

//! Checks run before the queue starts and before every run.

use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::datahub::BLANK_CANDIDATE_LIMIT;
use crate::engine::core;
use crate::engine::executor::{ExperimentExecutor, PreviousBlanks};
use crate::engine::ExecutorEvent;
use crate::hardware::DeviceMode;
use crate::interaction::PromptKind;
use crate::run::identifier::is_device_named;
use crate::types::{Answer, CancelStyle, ConsoleColor};
use crate::wait::WaitControl;

impl ExperimentExecutor {
    /// Everything that must hold before the worker is spawned.
    pub(crate) async fn pre_execute_check(&self) -> bool {
        if self.inner.queues.lock().is_empty() {
            self.halt("No experiment queues to execute");
            return false;
        }
        self.inner.active_queue.store(0, Ordering::SeqCst);

        if self.inner.datahub.has_secondary() {
            if self.inner.datahub.secondary_connect() {
                if !self.resolve_first_run_numbering().await {
                    return false;
                }
            } else {
                let Some(answer) = self
                    .ask(
                        PromptKind::SecondaryUnavailable,
                        "Not connected to the secondary database. Continue with the main database only?",
                    )
                    .await
                else {
                    return false;
                };
                if answer != Answer::Yes {
                    self.halt("Not connected to the secondary database");
                    return false;
                }
                self.inner.datahub.disable_secondary();
            }
        }

        if self.inner.config.experiment_debug {
            warn!("experiment debug: skipping pre execute checks");
            return true;
        }

        if !self.check_memory() {
            return false;
        }
        if !self.check_managers().await {
            return false;
        }
        if !self.check_preceding_blank().await {
            return false;
        }

        match self.inner.managers.script_runner.connect().await {
            Ok(true) => true,
            Ok(false) => {
                self.halt("Failed connecting to the script runner");
                false
            }
            Err(err) => {
                self.halt(format!("Failed connecting to the script runner: {err:#}"));
                false
            }
        }
    }

    /// Number the first run before any delay, so a conflict surfaces while
    /// the operator is still at the instrument.
    async fn resolve_first_run_numbering(&self) -> bool {
        let first = self.with_queue(|q| {
            let idx = q.automated_runs.iter().position(|r| !r.skip)?;
            Some((idx, q.automated_runs[idx].clone()))
        });
        let Some((idx, mut spec)) = first else {
            return true;
        };
        let ok = self.set_run_aliquot(&mut spec).await;
        self.with_queue(|q| {
            if let Some(slot) = q.automated_runs.get_mut(idx) {
                *slot = spec;
            }
        });
        ok
    }

    /// Checks before every run.
    pub(crate) async fn pre_run_check(&self) -> bool {
        if !self.inner.config.experiment_debug {
            if !self.check_memory() {
                return false;
            }
            if !self.check_managers().await {
                return false;
            }
        }

        if let Some(monitor) = &self.inner.managers.monitor {
            match monitor.check().await {
                Ok(true) => {}
                Ok(false) => {
                    self.halt("Automated run monitor failed");
                    return false;
                }
                Err(err) => {
                    self.halt(format!("Automated run monitor failed: {err:#}"));
                    return false;
                }
            }
        }

        self.wait_for_save().await
    }

    pub(crate) fn check_memory(&self) -> bool {
        let threshold = self.inner.config.memory_threshold_mb;
        match crate::memory::check_memory(self.inner.memory.as_ref(), threshold) {
            Ok(None) => true,
            Ok(Some(available)) => {
                self.halt(format!(
                    "Not enough free memory. Available: {available} MB, threshold: {threshold} MB"
                ));
                false
            }
            Err(err) => {
                warn!(error = %err, "memory probe failed, skipping memory check");
                true
            }
        }
    }

    /// Retry until every manager the queue needs is present, at most
    /// `manager_check_retries` times.
    pub(crate) async fn check_managers(&self) -> bool {
        let retries = self.inner.config.manager_check_retries.max(1);
        let mut missing = Vec::new();
        for attempt in 1..=retries {
            missing = self.missing_managers().await;
            if missing.is_empty() {
                return true;
            }
            debug!(attempt, ?missing, "managers not available");
            if attempt < retries && !self.pause(self.inner.config.poll_interval).await {
                break;
            }
        }
        if self.is_canceled() {
            return false;
        }
        self.halt(format!("Managers not available: {}", missing.join(", ")));
        false
    }

    async fn missing_managers(&self) -> Vec<String> {
        let managers = &self.inner.managers;
        let mut missing = Vec::new();

        match &managers.extraction_line {
            Some(el) if el.is_ready() => {}
            _ => missing.push("Extraction Line Manager".to_string()),
        }

        let (device, needs_spectrometer) = self.with_queue(|q| {
            (
                q.extract_device.clone(),
                q.cleaned_automated_runs()
                    .any(|r| r.measurement_script.is_some()),
            )
        });

        if is_device_named(&device) {
            match managers.extract_device(&device) {
                None => missing.push(device.clone()),
                Some(dev) => {
                    if matches!(dev.mode(), DeviceMode::Client { .. }) {
                        match dev.test_connection().await {
                            Ok(true) => {}
                            Ok(false) => {
                                missing.push(format!("{device} (client connection failed)"))
                            }
                            Err(err) => {
                                warn!(%device, error = %err, "client connection test errored");
                                missing.push(format!("{device} (client connection failed)"));
                            }
                        }
                    }
                }
            }
        }

        if needs_spectrometer {
            match &managers.spectrometer {
                Some(s) if s.is_ready() => {}
                _ => missing.push("Spectrometer Manager".to_string()),
            }
        }
        missing
    }

    /// Seed the blank values when the first measured run has no blank of
    /// its kind in front of it.
    pub(crate) async fn check_preceding_blank(&self) -> bool {
        let (needed, ms, ed) = self.with_queue(|q| {
            (
                core::missing_preceding_blank(q.cleaned_automated_runs()),
                q.mass_spectrometer.clone(),
                q.extract_device.clone(),
            )
        });
        let Some((run_type, blank_type)) = needed else {
            return true;
        };

        let last = match self.inner.datahub.last_blank(blank_type, &ms, &ed) {
            Ok(last) => last,
            Err(err) => {
                self.halt(format!("Failed looking up {blank_type}: {err}"));
                return false;
            }
        };
        let Some(last) = last else {
            self.halt(format!(
                "No blank for {run_type} is in the database. Run a blank!!"
            ));
            return false;
        };

        let msg = format!(
            "First \"{run_type}\" is not preceded by a blank.\n\
             Yes - use the last \"{blank_type}\" ({})\n\
             No - select from the last {BLANK_CANDIDATE_LIMIT} \"{blank_type}\" runs\n\
             Cancel - stop execution",
            last.record_id()
        );
        let Some(answer) = self.ask(PromptKind::PrecedingBlank, &msg).await else {
            return false;
        };

        let chosen = match answer {
            Answer::Yes => Some(last),
            Answer::No => match self.inner.datahub.blanks(blank_type, &ms, &ed) {
                Ok(candidates) => {
                    let token = self.alive_token();
                    let select = tokio::time::timeout(
                        self.inner.config.confirmation_timeout,
                        self.inner.prompt.select_blank(&candidates),
                    );
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return false,
                        chosen = select => chosen.ok().flatten(),
                    }
                }
                Err(err) => {
                    warn!(error = %err, "failed listing blanks");
                    None
                }
            },
            Answer::Cancel => None,
        };

        match chosen {
            Some(record) => {
                info!(runid = %record.record_id(), "using preceding blank");
                *self.inner.prev_blanks.lock() = PreviousBlanks {
                    runid: Some(record.record_id()),
                    blanks: record.signals,
                    baselines: record.baselines,
                };
                true
            }
            None => {
                self.halt(format!("No preceding {blank_type} selected"));
                false
            }
        }
    }

    /// Hold the queue while it has unsaved edits.
    ///
    /// Polls once per poll interval up to `auto_save_delay`; then either
    /// asks for an autosave or cancels the queue.
    pub(crate) async fn wait_for_save(&self) -> bool {
        if self.inner.executable.load(Ordering::SeqCst) {
            return true;
        }
        info!("waiting for save");
        let control = self.inner.wait_group.add_control();
        control.set_page_name("Waiting for save");
        let saved = self.wait_for_save_on(&control).await;
        self.inner.wait_group.pop(Some(&control));
        self.set_extract_state("", 0.0, ConsoleColor::Black, 1.0);
        saved
    }

    async fn wait_for_save_on(&self, control: &WaitControl) -> bool {
        let delay = self.inner.config.auto_save_delay;
        let poll = self.inner.config.poll_interval;
        let began = Instant::now();

        while !self.inner.executable.load(Ordering::SeqCst) {
            if !self.is_alive() {
                return false;
            }
            let elapsed = began.elapsed();
            if elapsed >= delay {
                if self.inner.config.use_auto_save {
                    self.inner.console.info("Autosaving queue");
                    self.inner.console.emit(ExecutorEvent::AutoSaveRequested);
                    self.inner.executable.store(true, Ordering::SeqCst);
                    return true;
                }
                self.inner.console.warning("Queue was not saved in time");
                self.cancel(CancelStyle::Queue, false, false).await;
                return false;
            }

            let msg = format!("Waiting for save. Autosave in {} s", (delay - elapsed).as_secs());
            control.set_message(msg.as_str());
            self.set_extract_state(msg, 0.0, ConsoleColor::Red, 1.0);
            control.start(poll.min(delay - elapsed), poll).await;
        }
        true
    }
}
