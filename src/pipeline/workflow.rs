//! Workflow engine: runs an execution (single archive, or fan-out over
//! chunk workers followed by merge) and reports abnormal terminations.
//!
//! Every execution is bounded by the generation timeout. When a run fails,
//! panics, or times out, a [`TerminalEvent`] goes to the failure handler's
//! channel; if that channel is gone the event is dead-lettered instead.

use super::{
    PipelineError, PipelineResult,
    archiver::{Archiver, SingleRun},
    chunk_worker::{ChunkTask, ChunkWorker},
    merge::{ChunkedRun, Merger},
    runner::{ChunkFuture, TaskRunner},
};
use crate::{models::zip_job::JobKey, services::dead_letters::DeadLetterQueue};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type ExecutionId = String;

#[derive(Debug, Clone)]
pub enum Execution {
    Single(SingleRun),
    Chunked(ChunkedRun),
}

impl Execution {
    pub fn job(&self) -> &JobKey {
        match self {
            Execution::Single(run) => &run.job,
            Execution::Chunked(run) => &run.job,
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Execution::Single(run) => &run.run_id,
            Execution::Chunked(run) => &run.run_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalStatus {
    /// A branch or the merge reported an error.
    Failed,
    /// The execution outlived the generation timeout and was aborted.
    TimedOut,
    /// The execution died without reporting (panic or cancellation).
    Aborted,
}

/// Abnormal-termination signal consumed by the failure handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalEvent {
    pub execution_id: ExecutionId,
    pub job: JobKey,
    pub run_id: String,
    pub status: TerminalStatus,
    pub cause: String,
}

#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Start `execution` in the background. Returns once it is accepted.
    async fn start(&self, execution: Execution) -> PipelineResult<ExecutionId>;
}

struct EngineInner {
    archiver: Archiver,
    worker: ChunkWorker,
    merger: Merger,
    runner: Arc<dyn TaskRunner>,
    failures: mpsc::Sender<TerminalEvent>,
    dead_letters: DeadLetterQueue,
    timeout: Duration,
}

/// In-process engine: executions are tokio tasks, chunk fan-out goes
/// through the configured [`TaskRunner`].
pub struct LocalWorkflowEngine {
    inner: Arc<EngineInner>,
    executions: Mutex<HashMap<ExecutionId, JoinHandle<()>>>,
    closed: AtomicBool,
}

impl LocalWorkflowEngine {
    pub fn new(
        archiver: Archiver,
        worker: ChunkWorker,
        merger: Merger,
        runner: Arc<dyn TaskRunner>,
        failures: mpsc::Sender<TerminalEvent>,
        dead_letters: DeadLetterQueue,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                archiver,
                worker,
                merger,
                runner,
                failures,
                dead_letters,
                timeout,
            }),
            executions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Wait for one execution to finish. Unknown or already-joined ids
    /// return immediately.
    #[cfg(test)]
    pub async fn wait(&self, execution_id: &str) {
        let handle = self
            .executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(execution_id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Refuse new executions and wait for the running ones.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let handles = self
            .executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect::<Vec<_>>();
        info!(running = handles.len(), "workflow engine draining");
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl WorkflowEngine for LocalWorkflowEngine {
    async fn start(&self, execution: Execution) -> PipelineResult<ExecutionId> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PipelineError::DispatchFailure(
                "workflow engine is shutting down".into(),
            ));
        }
        let execution_id = Uuid::new_v4().to_string();
        info!(
            %execution_id,
            job = %execution.job(),
            run_id = execution.run_id(),
            "execution started"
        );
        let handle = tokio::spawn(supervise(
            self.inner.clone(),
            execution_id.clone(),
            execution,
        ));

        let mut executions = self
            .executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        executions.retain(|_, handle| !handle.is_finished());
        executions.insert(execution_id.clone(), handle);
        Ok(execution_id)
    }
}

async fn supervise(inner: Arc<EngineInner>, execution_id: ExecutionId, execution: Execution) {
    let job = execution.job().clone();
    let run_id = execution.run_id().to_string();

    let body = tokio::spawn(inner.clone().execute(execution));
    let abort = body.abort_handle();
    let (status, cause) = match tokio::time::timeout(inner.timeout, body).await {
        Ok(Ok(Ok(()))) => {
            debug!(%execution_id, "execution succeeded");
            return;
        }
        Ok(Ok(Err(cause))) => (TerminalStatus::Failed, cause),
        Ok(Err(join_err)) => (
            TerminalStatus::Aborted,
            format!("execution terminated abnormally: {join_err}"),
        ),
        Err(_) => {
            abort.abort();
            (
                TerminalStatus::TimedOut,
                format!(
                    "execution exceeded the {}s generation timeout",
                    inner.timeout.as_secs_f64()
                ),
            )
        }
    };

    inner
        .emit(TerminalEvent {
            execution_id,
            job,
            run_id,
            status,
            cause,
        })
        .await;
}

impl EngineInner {
    async fn execute(self: Arc<Self>, execution: Execution) -> Result<(), String> {
        match execution {
            Execution::Single(run) => self
                .archiver
                .run(&run)
                .await
                .map(|_| ())
                .map_err(|err| err.to_string()),
            Execution::Chunked(run) => self.execute_chunked(run).await,
        }
    }

    /// Fan out one task per partition, then join with the merge step. Any
    /// failed branch skips the merge entirely.
    async fn execute_chunked(&self, run: ChunkedRun) -> Result<(), String> {
        let mut partitions = run.partitions.clone();
        partitions.sort_by_key(|p| p.chunk_index);
        let tasks = partitions
            .into_iter()
            .map(|partition| {
                let worker = self.worker.clone();
                let task = ChunkTask {
                    job: run.job.clone(),
                    run_id: run.run_id.clone(),
                    partition,
                };
                Box::pin(async move { worker.stage(&task).await }) as ChunkFuture
            })
            .collect::<Vec<_>>();

        let results = self.runner.run_all(tasks).await;
        let failures = results
            .iter()
            .filter_map(|r| r.as_ref().err().map(ToString::to_string))
            .collect::<Vec<_>>();
        if !failures.is_empty() {
            warn!(
                job = %run.job,
                run_id = %run.run_id,
                failed = failures.len(),
                chunks = run.worker_count(),
                "chunk fan-out failed; skipping merge"
            );
            return Err(failures.join("; "));
        }

        self.merger
            .finalize(&run)
            .await
            .map(|_| ())
            .map_err(|err| err.to_string())
    }

    async fn emit(&self, event: TerminalEvent) {
        warn!(
            execution_id = %event.execution_id,
            job = %event.job,
            run_id = %event.run_id,
            status = ?event.status,
            cause = %event.cause,
            "execution terminated abnormally"
        );
        if let Err(mpsc::error::SendError(event)) = self.failures.send(event).await {
            if let Err(err) = self
                .dead_letters
                .push(&event.execution_id, &event, "failure handler unavailable")
                .await
            {
                error!(
                    alert = true,
                    execution_id = %event.execution_id,
                    error = %err,
                    "terminal event lost: could not dead-letter"
                );
            }
        }
    }
}
