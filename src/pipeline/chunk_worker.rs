//! Chunk worker: stages one partition's raw bytes into the run's scratch
//! area. It never builds a ZIP, so per-worker memory and time stay bounded
//! by the chunk size.

use super::{PipelineError, PipelineResult, layout::staged_key};
use crate::{
    models::{
        chunk::{ChunkResult, Partition},
        zip_job::JobKey,
    },
    services::{
        job_store::JobStore,
        object_store::{ObjectStore, StorageError},
    },
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Instant};
use tracing::{debug, info, warn};

/// Input of one chunk worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkTask {
    pub job: JobKey,
    pub run_id: String,
    pub partition: Partition,
}

#[derive(Clone)]
pub struct ChunkWorker {
    store: Arc<dyn ObjectStore>,
    jobs: JobStore,
}

impl ChunkWorker {
    pub fn new(store: Arc<dyn ObjectStore>, jobs: JobStore) -> Self {
        Self { store, jobs }
    }

    /// Copy every key of the partition into its scratch slot, then record
    /// the chunk result.
    ///
    /// Any single copy failure fails the whole chunk; nothing is reported
    /// for a partially staged chunk. Re-running with the same run and index
    /// overwrites the same slots.
    pub async fn stage(&self, task: &ChunkTask) -> PipelineResult<ChunkResult> {
        let started = Instant::now();
        let chunk_index = task.partition.chunk_index;

        for (position, key) in task.partition.keys.iter().enumerate() {
            let slot = staged_key(&task.job, &task.run_id, chunk_index, position);
            if let Err(err) = self.copy(key, &slot).await {
                warn!(
                    job = %task.job,
                    run_id = %task.run_id,
                    chunk_index,
                    key = %key,
                    error = %err,
                    "chunk copy failed"
                );
                return Err(PipelineError::ChunkCopyFailure {
                    chunk_index,
                    reason: format!("copying `{key}`: {err}"),
                });
            }
            debug!(chunk_index, position, key = %key, "staged");
        }

        let result = ChunkResult {
            chunk_index: i64::from(chunk_index),
            files_added: task.partition.keys.len() as i64,
            duration_ms: started.elapsed().as_millis() as i64,
        };
        self.jobs.record_chunk_result(&task.run_id, &result).await?;

        info!(
            job = %task.job,
            run_id = %task.run_id,
            chunk_index,
            files_added = result.files_added,
            duration_ms = result.duration_ms,
            "chunk staged"
        );
        Ok(result)
    }

    async fn copy(&self, key: &str, slot: &str) -> Result<(), StorageError> {
        let (meta, body) = self.store.get(key).await?;
        self.store.put(slot, meta.content_type, body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::zip_job::ArchiveKind;
    use crate::pipeline::{layout::chunk_prefix, testing::FaultyStore};
    use crate::services::{object_store::bytes_stream, storage_service::testing::temp_storage};

    fn task(keys: &[&str]) -> ChunkTask {
        ChunkTask {
            job: JobKey::new("g1", "o1", ArchiveKind::Originals).unwrap(),
            run_id: "run-1".into(),
            partition: Partition {
                chunk_index: 2,
                keys: keys.iter().map(|k| k.to_string()).collect(),
            },
        }
    }

    #[tokio::test]
    async fn stages_every_key_in_order_and_records_result() {
        let (storage, _dir) = temp_storage().await;
        for k in ["src/a", "src/b", "src/c"] {
            storage.put(k, Some("image/jpeg".into()), bytes_stream(k)).await.unwrap();
        }
        let jobs = JobStore::new(storage.db.clone());
        let worker = ChunkWorker::new(Arc::new(storage.clone()), jobs.clone());
        let task = task(&["src/c", "src/a", "src/b"]);

        let result = worker.stage(&task).await.unwrap();
        assert_eq!(result.chunk_index, 2);
        assert_eq!(result.files_added, 3);

        let staged = storage
            .list(&chunk_prefix(&task.job, "run-1", 2))
            .await
            .unwrap();
        assert_eq!(staged.len(), 3);
        assert_eq!(staged[0].etag, format!("{:x}", md5::compute("src/c")));
        assert_eq!(staged[0].content_type.as_deref(), Some("image/jpeg"));
        assert_eq!(jobs.chunk_results("run-1").await.unwrap(), vec![result.clone()]);

        // Retrying the same chunk overwrites its slots.
        worker.stage(&task).await.unwrap();
        assert_eq!(
            storage.list(&chunk_prefix(&task.job, "run-1", 2)).await.unwrap().len(),
            3
        );
        assert_eq!(jobs.chunk_results("run-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn one_failed_copy_fails_the_chunk_without_a_result() {
        let (storage, _dir) = temp_storage().await;
        for k in ["src/a", "src/b"] {
            storage.put(k, None, bytes_stream(k)).await.unwrap();
        }
        let jobs = JobStore::new(storage.db.clone());
        let faulty = FaultyStore::new(storage.clone()).fail_get("src/b");
        let worker = ChunkWorker::new(Arc::new(faulty), jobs.clone());

        let err = worker.stage(&task(&["src/a", "src/b"])).await.unwrap_err();
        match err {
            PipelineError::ChunkCopyFailure {
                chunk_index,
                reason,
            } => {
                assert_eq!(chunk_index, 2);
                assert!(reason.contains("src/b"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(jobs.chunk_results("run-1").await.unwrap().is_empty());
    }
}
