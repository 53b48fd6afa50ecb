//! Failure handler: the safety net that keeps a terminated run from
//! sitting in GENERATING forever.
//!
//! For each terminal event it marks the run ERROR, clears the generating
//! flag and deletes the run's scratch area, after which the next request
//! for the key may start a fresh run. If reconciliation itself fails or
//! panics, the event is dead-lettered and an alert is logged.

use super::{PipelineError, PipelineResult, layout::scratch_prefix, workflow::TerminalEvent};
use crate::services::{
    dead_letters::DeadLetterQueue,
    job_store::JobStore,
    object_store::{ObjectStore, delete_prefix},
};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{error, info};

#[derive(Clone)]
pub struct FailureHandler {
    store: Arc<dyn ObjectStore>,
    jobs: JobStore,
    dead_letters: DeadLetterQueue,
}

impl FailureHandler {
    pub fn new(store: Arc<dyn ObjectStore>, jobs: JobStore, dead_letters: DeadLetterQueue) -> Self {
        Self {
            store,
            jobs,
            dead_letters,
        }
    }

    /// Reconcile one terminated run. Safe to repeat: a run that already
    /// reached a terminal status keeps it, and an empty scratch area is a no-op.
    pub async fn reconcile(&self, event: &TerminalEvent) -> PipelineResult<()> {
        let reason = format!("generation failed: {}", event.cause);
        let transitioned = self
            .jobs
            .mark_error(&event.job, &event.run_id, &reason)
            .await
            .map_err(|err| PipelineError::ReconciliationFailure(format!("marking ERROR: {err}")))?;

        let prefix = scratch_prefix(&event.job, &event.run_id);
        let removed = delete_prefix(self.store.as_ref(), &prefix)
            .await
            .map_err(|err| {
                PipelineError::ReconciliationFailure(format!("deleting scratch `{prefix}`: {err}"))
            })?;
        self.jobs
            .clear_chunk_results(&event.run_id)
            .await
            .map_err(|err| {
                PipelineError::ReconciliationFailure(format!("clearing chunk results: {err}"))
            })?;

        info!(
            execution_id = %event.execution_id,
            job = %event.job,
            run_id = %event.run_id,
            transitioned,
            scratch_removed = removed,
            "terminated run reconciled"
        );
        Ok(())
    }

    /// Consume terminal events until every sender is dropped.
    pub fn spawn(self, mut events: mpsc::Receiver<TerminalEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle(event).await;
            }
            info!("failure handler stopped");
        })
    }

    async fn handle(&self, event: TerminalEvent) {
        let handler = self.clone();
        let attempt = event.clone();
        let outcome = tokio::spawn(async move { handler.reconcile(&attempt).await }).await;

        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err.to_string(),
            Err(join_err) => format!("failure handler crashed: {join_err}"),
        };
        if let Err(err) = self
            .dead_letters
            .push(&event.execution_id, &event, &failure)
            .await
        {
            error!(
                alert = true,
                execution_id = %event.execution_id,
                error = %err,
                reconcile_error = %failure,
                "terminal event lost: could not dead-letter"
            );
        }
    }
}
