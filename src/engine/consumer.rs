// src/engine/consumer.rs

//! Single-slot hand-off for overlapped runs.
//!
//! When a run is overlapped, the queue loop hands its task over here and
//! moves on as soon as the run has released the extraction device. A
//! background worker joins the task and runs the finalisation callback, so
//! the loop never blocks on bookkeeping for the overlapped predecessor.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::run::AutomatedRun;

/// An overlapped run and the task driving its phases.
#[derive(Debug)]
pub struct Overlapped {
    pub run: Arc<AutomatedRun>,
    pub handle: JoinHandle<()>,
}

#[derive(Debug)]
pub struct ConsumerQueue {
    tx: mpsc::Sender<Overlapped>,
    worker: JoinHandle<()>,
}

impl ConsumerQueue {
    /// Spawn the worker. `finalize` runs once per consumed run, after its
    /// task has been joined.
    pub fn spawn<F>(finalize: F) -> Self
    where
        F: Fn(Arc<AutomatedRun>) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Overlapped>(1);
        let worker = tokio::spawn(async move {
            while let Some(Overlapped { run, handle }) = rx.recv().await {
                if let Err(err) = handle.await {
                    warn!(runid = %run.runid(), error = %err, "overlapped run task failed");
                }
                debug!(runid = %run.runid(), "finalizing overlapped run");
                finalize(run);
            }
        });
        Self { tx, worker }
    }

    /// Queue a run for finalisation. Waits while the slot is taken.
    pub async fn add(&self, item: Overlapped) {
        if let Err(mpsc::error::SendError(item)) = self.tx.send(item).await {
            warn!(runid = %item.run.runid(), "consumer closed, joining run inline");
            let _ = item.handle.await;
        }
    }

    /// Stop accepting runs and wait until every queued one is finalised.
    pub async fn join(self) {
        drop(self.tx);
        if let Err(err) = self.worker.await {
            warn!(error = %err, "consumer worker failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datahub::{Datahub, InMemoryStore};
    use crate::hardware::sim;
    use crate::run::{HardwareLeases, Persister, RunContext, RunSpec};
    use parking_lot::Mutex;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn run(labnumber: &str) -> Arc<AutomatedRun> {
        let hub = Arc::new(Datahub::new(Arc::new(InMemoryStore::new("main"))));
        Arc::new(AutomatedRun::new(
            RunSpec::new(labnumber, 1),
            RunContext {
                managers: sim::registry("", Duration::ZERO),
                persister: Persister::new(hub, None, None),
                leases: HardwareLeases::new(),
                previous_blanks: BTreeMap::new(),
                previous_baselines: BTreeMap::new(),
            },
        ))
    }

    #[tokio::test]
    async fn finalizes_in_hand_off_order_after_join() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let consumer = {
            let seen = seen.clone();
            ConsumerQueue::spawn(move |run| seen.lock().push(run.runid().to_string()))
        };

        for ln in ["1", "2"] {
            let handle = tokio::spawn(async {
                tokio::time::sleep(Duration::from_millis(5)).await;
            });
            consumer.add(Overlapped { run: run(ln), handle }).await;
        }
        consumer.join().await;

        assert_eq!(*seen.lock(), vec!["1-01".to_string(), "2-01".to_string()]);
    }
}
