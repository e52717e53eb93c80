// src/engine/numbering.rs

use tracing::debug;

use crate::engine::core;
use crate::engine::executor::ExperimentExecutor;
use crate::interaction::PromptKind;
use crate::run::RunSpec;
use crate::types::Answer;

impl ExperimentExecutor {
    /// Resolve the spec's aliquot/step once, before its run is built.
    ///
    /// While same-identifier runs are in flight their numbering decides the
    /// offsets; otherwise the secondary database is asked for conflicts and
    /// the operator chooses whether to renumber. Returns `false`, with the
    /// queue halted, when the spec cannot be numbered.
    pub(crate) async fn set_run_aliquot(&self, spec: &mut RunSpec) -> bool {
        if spec.conflicts_checked {
            return true;
        }

        let labnumber = spec.labnumber.clone();
        let in_flight: Vec<RunSpec> = self.with_queue(|q| {
            q.in_flight()
                .filter(|r| r.labnumber == labnumber)
                .cloned()
                .collect()
        });
        let (aliquot_offset, step_offset) = core::numbering_offsets(spec, &in_flight);
        let datahub = &self.inner.datahub;

        if in_flight.is_empty() {
            match datahub.is_conflict(spec) {
                Ok(None) => {}
                Ok(Some(conflict)) => {
                    let msg = format!(
                        "Database identifier conflict. {conflict}\n\nWould you like to renumber {}?",
                        spec.runid()
                    );
                    let Some(answer) = self.ask(PromptKind::NumberingConflict, &msg).await else {
                        return false;
                    };
                    if answer != Answer::Yes {
                        self.halt(format!("Numbering conflict: {conflict}"));
                        return false;
                    }
                }
                Err(err) => {
                    self.halt(format!("Checking numbering of {} failed: {err}", spec.runid()));
                    return false;
                }
            }
        } else {
            debug!(
                runid = %spec.runid(),
                in_flight = in_flight.len(),
                "numbering against in-flight runs"
            );
        }

        if let Err(err) = datahub.update_spec(spec, aliquot_offset, step_offset) {
            self.halt(format!("Numbering {} failed: {err}", spec.runid()));
            return false;
        }
        spec.conflicts_checked = true;
        true
    }
}
