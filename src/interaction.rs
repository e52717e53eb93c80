// src/interaction.rs

//! Operator-facing collaborators: confirmation dialogs and notifications.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::datahub::AnalysisRecord;
use crate::types::Answer;

/// Which question is being asked. Each kind has its own safe default used
/// when nobody answers in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    /// "Queue is in progress. Are you sure you want to cancel?"
    ConfirmCancel,
    /// Numbering conflict with the secondary database; Yes renumbers.
    NumberingConflict,
    /// No preceding blank; Yes uses the last blank, No lets the operator
    /// pick one, Cancel aborts.
    PrecedingBlank,
    /// Secondary database unreachable; Yes continues with the main store only.
    SecondaryUnavailable,
}

impl PromptKind {
    /// Answer applied on timeout.
    pub fn safe_default(&self) -> Answer {
        match self {
            PromptKind::ConfirmCancel => Answer::Yes,
            PromptKind::NumberingConflict => Answer::No,
            PromptKind::PrecedingBlank => Answer::Cancel,
            PromptKind::SecondaryUnavailable => Answer::No,
        }
    }
}

#[async_trait]
pub trait UserPrompt: Send + Sync {
    async fn confirm(&self, kind: PromptKind, message: &str) -> Answer;

    /// Pick one of `candidates` (newest first); `None` aborts.
    async fn select_blank(&self, candidates: &[AnalysisRecord]) -> Option<AnalysisRecord>;

    /// Blocking information/warning dialog.
    async fn alert(&self, message: &str) {
        warn!(%message, "alert");
    }
}

/// Ask `prompt`, falling back to the kind's safe default after `timeout`.
pub async fn confirm_with_timeout(
    prompt: &dyn UserPrompt,
    kind: PromptKind,
    message: &str,
    timeout: Duration,
) -> Answer {
    match tokio::time::timeout(timeout, prompt.confirm(kind, message)).await {
        Ok(answer) => answer,
        Err(_) => {
            let answer = kind.safe_default();
            info!(?kind, ?answer, "no response from user, using default");
            answer
        }
    }
}

/// Prompt for unattended operation: every dialog gets its safe default.
#[derive(Debug, Default, Clone)]
pub struct HeadlessPrompt;

#[async_trait]
impl UserPrompt for HeadlessPrompt {
    async fn confirm(&self, kind: PromptKind, message: &str) -> Answer {
        let answer = kind.safe_default();
        info!(?kind, ?answer, %message, "headless confirmation");
        answer
    }

    async fn select_blank(&self, candidates: &[AnalysisRecord]) -> Option<AnalysisRecord> {
        candidates.first().cloned()
    }
}

/// Fire-and-forget end-of-queue notification.
#[async_trait]
pub trait UserNotifier: Send + Sync {
    async fn notify(
        &self,
        experiment: &str,
        last_runid: Option<&str>,
        error: Option<&str>,
    ) -> Result<()>;
}

#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl UserNotifier for LogNotifier {
    async fn notify(
        &self,
        experiment: &str,
        last_runid: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        match error {
            Some(error) => warn!(experiment, ?last_runid, error, "experiment ended with error"),
            None => info!(experiment, ?last_runid, "experiment finished"),
        }
        Ok(())
    }
}
