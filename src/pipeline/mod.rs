//! The chunked ZIP-generation pipeline.
//!
//! Control flow: [`router::JobRouter`] decides between the single-invocation
//! [`archiver::Archiver`] and a fan-out over [`chunk_worker::ChunkWorker`]s
//! joined by [`merge::Merger`]. [`workflow::LocalWorkflowEngine`] runs either
//! shape and reports abnormal terminations to the
//! [`failure_handler::FailureHandler`]. The job record in
//! [`crate::services::job_store::JobStore`] is the status tracker.

pub mod archiver;
pub mod chunk_worker;
pub mod failure_handler;
pub mod layout;
pub mod manifest;
pub mod merge;
pub mod partition;
pub mod router;
pub mod runner;
pub mod scratch;
pub mod workflow;
pub mod zip_stream;

#[cfg(test)]
mod testing;

use crate::{
    models::zip_job::InvalidJobKey,
    services::{
        dead_letters::DeadLetterQueue, job_store::JobStore, object_store::ObjectStore,
        object_store::StorageError,
    },
};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};

use self::{
    archiver::Archiver, chunk_worker::ChunkWorker, failure_handler::FailureHandler,
    manifest::StorageManifestSource, merge::Merger, router::JobRouter, runner::LocalTaskRunner,
    workflow::LocalWorkflowEngine,
};

/// Depth of the terminal-event channel between the engine and the failure handler.
const FAILURE_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    InvalidJobKey(#[from] InvalidJobKey),
    #[error("could not start workflow: {0}")]
    DispatchFailure(String),
    #[error("chunk {chunk_index} failed: {reason}")]
    ChunkCopyFailure { chunk_index: u32, reason: String },
    #[error("merge refused: {0}")]
    IncompleteChunks(String),
    #[error("archive finalization failed: {0}")]
    MergeFailure(String),
    #[error("run `{run_id}` was abandoned past the generation timeout")]
    OrphanedJob { run_id: String },
    #[error("failed to reconcile terminated run: {0}")]
    ReconciliationFailure(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Tunables. None of these affect correctness, only throughput and how
/// quickly an abandoned run may be superseded.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Manifests with at least this many keys take the chunked path.
    pub chunk_threshold: usize,
    /// Desired keys per chunk worker.
    pub target_chunk_size: usize,
    /// Chunk workers running at once.
    pub max_concurrency: usize,
    /// Execution window; a generating flag older than this is abandoned.
    pub generation_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_threshold: 100,
            target_chunk_size: 50,
            max_concurrency: 4,
            generation_timeout: Duration::from_secs(15 * 60),
        }
    }
}

impl PipelineConfig {
    pub fn timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.generation_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(3650))
    }
}

/// Everything the HTTP layer needs, wired together.
#[derive(Clone)]
pub struct Pipeline {
    pub config: PipelineConfig,
    pub router: Arc<JobRouter>,
    pub engine: Arc<LocalWorkflowEngine>,
    pub jobs: JobStore,
    pub dead_letters: DeadLetterQueue,
    store: Arc<dyn ObjectStore>,
}

impl Pipeline {
    /// Build the pipeline over `store` and `db` and spawn the failure
    /// handler. The returned handle finishes once every engine clone is gone.
    pub fn start(
        config: PipelineConfig,
        store: Arc<dyn ObjectStore>,
        db: SqlitePool,
    ) -> (Self, JoinHandle<()>) {
        let jobs = JobStore::new(db.clone());
        let dead_letters = DeadLetterQueue::new(db);
        let (failure_tx, failure_rx) = mpsc::channel(FAILURE_CHANNEL_DEPTH);

        let handler = FailureHandler::new(store.clone(), jobs.clone(), dead_letters.clone());
        let handler_task = handler.spawn(failure_rx);

        let engine = Arc::new(LocalWorkflowEngine::new(
            Archiver::new(store.clone(), jobs.clone()),
            ChunkWorker::new(store.clone(), jobs.clone()),
            Merger::new(store.clone(), jobs.clone()),
            Arc::new(LocalTaskRunner::new(config.max_concurrency)),
            failure_tx,
            dead_letters.clone(),
            config.generation_timeout,
        ));

        let manifests = Arc::new(StorageManifestSource::new(store.clone(), jobs.clone()));
        let router = Arc::new(JobRouter::new(
            config.clone(),
            jobs.clone(),
            store.clone(),
            manifests,
            engine.clone(),
        ));

        (
            Self {
                config,
                router,
                engine,
                jobs,
                dead_letters,
                store,
            },
            handler_task,
        )
    }

    /// Discard scratch areas left by runs that are no longer live, such as
    /// those of a process that crashed mid-run.
    pub async fn sweep_scratch(&self) -> PipelineResult<usize> {
        scratch::sweep(
            self.store.as_ref(),
            &self.jobs,
            chrono::Utc::now(),
            self.config.timeout(),
        )
        .await
    }
}
