//! Output collector: the single consumer of the output channel.
//!
//! The collector opens the job's result store, persists every output it
//! receives, and publishes the one-shot completion signal once the channel
//! is closed and drained. Successful outputs are stored under the `ok:`
//! keyspace; terminal failures under `err:` (as JSON-encoded error details),
//! so either class can be enumerated independently.
//!
//! Storage failures are fatal to the job (state moves to `Error`), but the
//! collector keeps draining so workers blocked on the output channel are
//! never stranded.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

use crate::store::{self, ResultStore};
use crate::types::Output;

use super::state::JobState;
use super::{ERR_PREFIX, Job, OK_PREFIX};

/// The collector task for one job.
pub(crate) struct Collector {
    pub job: Arc<Job>,
    pub out_rx: mpsc::Receiver<Output>,
    pub completion_tx: watch::Sender<bool>,
}

impl Collector {
    pub async fn run(mut self) {
        let store = match ResultStore::open(self.job.store_path()) {
            Ok(store) => store,
            Err(e) => {
                error!(job_id = %self.job.id(), error = %e, "cannot open result store");
                self.job.state_cell().mark_error();
                // With nowhere to put outputs the workers have nothing left
                // to do; firing work-done stops them. Dropping completion_tx
                // (on return) wakes anyone waiting on the signal, and they
                // observe the error state.
                self.job.work_done_token().cancel();
                return;
            }
        };
        *self.job.store_slot().write().await = Some(store);
        debug!(job_id = %self.job.id(), "result store opened");

        while let Some(output) = self.out_rx.recv().await {
            self.job.record_output();

            let persisted = {
                let mut slot = self.job.store_slot().write().await;
                match slot.as_mut() {
                    Some(store) => persist(store, &output),
                    // Store released mid-drain (teardown); nothing to do.
                    None => Ok(()),
                }
            };
            if let Err(e) = persisted {
                error!(
                    job_id = %self.job.id(),
                    key = %output.key,
                    error = %e,
                    "cannot persist output"
                );
                self.job.state_cell().mark_error();
            }

            self.job.check_work_complete();
        }

        // Channel closed by the completion waiter and fully drained.
        if self.job.state() == JobState::Error {
            // Storage-level failure: wake completion waiters by dropping the
            // sender, without ever publishing completion.
            return;
        }

        // Results must be durable before completion is announced.
        {
            let slot = self.job.store_slot().read().await;
            if let Some(store) = slot.as_ref()
                && let Err(e) = store.sync()
            {
                error!(job_id = %self.job.id(), error = %e, "cannot sync result store");
                self.job.state_cell().mark_error();
                return;
            }
        }

        debug!(
            job_id = %self.job.id(),
            outputs = self.job.outputs_count(),
            "all outputs collected"
        );
        let _ = self.completion_tx.send(true);
    }
}

/// Writes one output into its keyspace.
fn persist(store: &mut ResultStore, output: &Output) -> store::Result<()> {
    match &output.error {
        None => store.put(format!("{}{}", OK_PREFIX, output.key), &output.value),
        Some(err) => {
            let encoded = serde_json::to_vec(err)?;
            store.put(format!("{}{}", ERR_PREFIX, output.key), &encoded)
        }
    }
}
