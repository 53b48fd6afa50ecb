//! Parallel task runner: the fan-out half of a chunked run.
//!
//! The trait keeps the orchestration technology swappable; the local
//! implementation runs tasks on the tokio runtime under a semaphore that
//! caps how many chunk workers hit storage at once.

use super::PipelineError;
use crate::models::chunk::ChunkResult;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::{sync::Semaphore, task::AbortHandle};
use tracing::error;

pub type ChunkFuture = BoxFuture<'static, Result<ChunkResult, PipelineError>>;

#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run every task to completion and return their results in task
    /// order. The `i`-th task is chunk `i`. A task that dies without a
    /// result is reported as a failed chunk, never dropped.
    async fn run_all(&self, tasks: Vec<ChunkFuture>) -> Vec<Result<ChunkResult, PipelineError>>;
}

pub struct LocalTaskRunner {
    permits: Arc<Semaphore>,
}

impl LocalTaskRunner {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }
}

#[async_trait]
impl TaskRunner for LocalTaskRunner {
    async fn run_all(&self, tasks: Vec<ChunkFuture>) -> Vec<Result<ChunkResult, PipelineError>> {
        let handles = tasks
            .into_iter()
            .map(|task| {
                let permits = self.permits.clone();
                tokio::spawn(async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|_| PipelineError::DispatchFailure("task runner closed".into()))?;
                    task.await
                })
            })
            .collect::<Vec<_>>();
        // If the caller is cancelled (generation timeout), stop the workers too.
        let _guard = AbortOnDrop(handles.iter().map(|h| h.abort_handle()).collect());

        let mut results = Vec::with_capacity(handles.len());
        for (chunk_index, handle) in handles.into_iter().enumerate() {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) => {
                    error!(chunk_index, error = %join_err, "chunk worker died");
                    Err(PipelineError::ChunkCopyFailure {
                        chunk_index: chunk_index as u32,
                        reason: format!("worker terminated abnormally: {join_err}"),
                    })
                }
            };
            results.push(result);
        }
        results
    }
}

struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}
