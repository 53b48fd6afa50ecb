//! Router: decides how an archive request is served and dispatches it.
//!
//! 1. Build the manifest; an empty one is a no-op.
//! 2. Short-circuit when a READY archive has the same manifest hash.
//! 3. Tell the caller to poll if a live run already holds the record.
//! 4. Otherwise drop whatever the previous run staged, take the record
//!    for a new run and start either the
//!    single-invocation archiver (below the threshold) or the chunked
//!    fan-out (at or above it).

use super::{
    PipelineConfig, PipelineError, PipelineResult,
    archiver::SingleRun,
    manifest::{Manifest, ManifestSource, resolve_keys},
    merge::ChunkedRun,
    partition::partition,
    scratch,
    workflow::{Execution, ExecutionId, WorkflowEngine},
};
use crate::{
    models::zip_job::{JobKey, JobStatus, StatusView, ZipJob},
    services::{
        job_store::{JobStore, NewRun},
        object_store::ObjectStore,
    },
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Single,
    Chunked,
}

/// Keys below `threshold` take the single-invocation path.
pub fn choose_strategy(file_count: usize, threshold: usize) -> Strategy {
    if file_count < threshold {
        Strategy::Single
    } else {
        Strategy::Chunked
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum RouteOutcome {
    /// Nothing to package; no job was created.
    ManifestEmpty,
    /// An archive for this exact manifest already exists.
    #[serde(rename_all = "camelCase")]
    Ready {
        run_id: String,
        result_key: String,
        result_size: i64,
    },
    /// Another run is generating; poll the status.
    #[serde(rename_all = "camelCase")]
    InProgress { run_id: String },
    #[serde(rename_all = "camelCase")]
    Started {
        run_id: String,
        execution_id: ExecutionId,
        strategy: Strategy,
        worker_count: usize,
        file_count: usize,
    },
}

pub struct JobRouter {
    config: PipelineConfig,
    jobs: JobStore,
    store: Arc<dyn ObjectStore>,
    manifests: Arc<dyn ManifestSource>,
    engine: Arc<dyn WorkflowEngine>,
}

impl JobRouter {
    pub fn new(
        config: PipelineConfig,
        jobs: JobStore,
        store: Arc<dyn ObjectStore>,
        manifests: Arc<dyn ManifestSource>,
        engine: Arc<dyn WorkflowEngine>,
    ) -> Self {
        Self {
            config,
            jobs,
            store,
            manifests,
            engine,
        }
    }

    /// Request an archive for the object set the manifest source enumerates.
    pub async fn request(&self, job: &JobKey) -> PipelineResult<RouteOutcome> {
        let manifest = self.manifests.query(job).await?;
        self.route(job, manifest).await
    }

    /// Request an archive for a caller-supplied key list.
    pub async fn request_with_keys(
        &self,
        job: &JobKey,
        keys: Vec<String>,
    ) -> PipelineResult<RouteOutcome> {
        let manifest = resolve_keys(self.store.as_ref(), job, keys).await?;
        self.route(job, manifest).await
    }

    /// Status tracker read with the configured timeout applied.
    pub async fn status(&self, job: &JobKey) -> PipelineResult<StatusView> {
        Ok(self
            .jobs
            .status(job, Utc::now(), self.config.timeout())
            .await?)
    }

    async fn route(&self, job: &JobKey, manifest: Manifest) -> PipelineResult<RouteOutcome> {
        if manifest.is_empty() {
            debug!(%job, "empty manifest, nothing to archive");
            return Ok(RouteOutcome::ManifestEmpty);
        }
        let manifest_hash = manifest.hash();
        let now = Utc::now();
        let timeout = self.config.timeout();

        if let Some(current) = self.jobs.get(job).await? {
            if let Some(outcome) = self.reuse(&current, &manifest_hash).await {
                return Ok(outcome);
            }
            if current.is_in_flight(now, timeout) {
                debug!(%job, run_id = %current.run_id, "generation already in flight");
                return Ok(RouteOutcome::InProgress {
                    run_id: current.run_id,
                });
            }
            if current.status == JobStatus::Generating {
                let orphan = PipelineError::OrphanedJob {
                    run_id: current.run_id.clone(),
                };
                warn!(%job, error = %orphan, "superseding abandoned run");
            }
            if current.status != JobStatus::Ready {
                scratch::discard_best_effort(self.store.as_ref(), &self.jobs, job, &current.run_id)
                    .await;
            }
        }

        let file_count = manifest.len();
        let strategy = choose_strategy(file_count, self.config.chunk_threshold);
        let run_id = Uuid::new_v4().to_string();
        let (execution, worker_count) = match strategy {
            Strategy::Single => (
                Execution::Single(SingleRun {
                    job: job.clone(),
                    run_id: run_id.clone(),
                    manifest,
                }),
                0,
            ),
            Strategy::Chunked => {
                let partitions = partition(&manifest.keys(), self.config.target_chunk_size);
                let worker_count = partitions.len();
                (
                    Execution::Chunked(ChunkedRun {
                        job: job.clone(),
                        run_id: run_id.clone(),
                        manifest,
                        partitions,
                    }),
                    worker_count,
                )
            }
        };

        let acquired = self
            .jobs
            .begin_run(
                job,
                NewRun {
                    run_id: &run_id,
                    worker_count: worker_count as i64,
                    manifest_hash: &manifest_hash,
                },
                now,
                timeout,
            )
            .await?;
        if !acquired {
            // Lost a race with a concurrent request; report the winner.
            let run_id = self
                .jobs
                .get(job)
                .await?
                .map(|current| current.run_id)
                .unwrap_or_default();
            return Ok(RouteOutcome::InProgress { run_id });
        }

        let execution_id = match self.engine.start(execution).await {
            Ok(id) => id,
            Err(err) => {
                warn!(%job, %run_id, error = %err, "dispatch failed; discarding run");
                self.jobs.discard_run(job, &run_id).await?;
                return Err(match err {
                    PipelineError::DispatchFailure(_) => err,
                    other => PipelineError::DispatchFailure(other.to_string()),
                });
            }
        };

        info!(
            %job,
            %run_id,
            %execution_id,
            ?strategy,
            worker_count,
            file_count,
            "archive generation dispatched"
        );
        Ok(RouteOutcome::Started {
            run_id,
            execution_id,
            strategy,
            worker_count,
            file_count,
        })
    }

    /// A READY record for the same manifest whose artifact still exists.
    async fn reuse(&self, current: &ZipJob, manifest_hash: &str) -> Option<RouteOutcome> {
        if current.status != JobStatus::Ready || current.manifest_hash != manifest_hash {
            return None;
        }
        let result_key = current.result_key.clone()?;
        match self.store.head(&result_key).await {
            Ok(archive) => Some(RouteOutcome::Ready {
                run_id: current.run_id.clone(),
                result_key,
                result_size: archive.size_bytes,
            }),
            Err(err) => {
                warn!(%result_key, error = %err, "cached archive unavailable; regenerating");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::zip_job::ArchiveKind;
    use crate::pipeline::manifest::ManifestEntry;
    use crate::services::storage_service::testing::temp_storage;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records executions instead of running them.
    #[derive(Default)]
    struct RecordingEngine {
        started: Mutex<Vec<Execution>>,
        unavailable: bool,
    }

    #[async_trait]
    impl WorkflowEngine for RecordingEngine {
        async fn start(&self, execution: Execution) -> PipelineResult<ExecutionId> {
            if self.unavailable {
                return Err(PipelineError::DispatchFailure("engine unavailable".into()));
            }
            self.started.lock().unwrap().push(execution);
            Ok("exec".into())
        }
    }

    struct FixedManifest(Manifest);

    #[async_trait]
    impl ManifestSource for FixedManifest {
        async fn query(&self, _job: &JobKey) -> PipelineResult<Manifest> {
            Ok(self.0.clone())
        }
    }

    fn manifest(n: usize) -> Manifest {
        Manifest::new(
            "galleries/g1/originals/",
            (0..n)
                .map(|i| ManifestEntry {
                    key: format!("galleries/g1/originals/{i:04}.jpg"),
                    etag: "e".into(),
                })
                .collect(),
        )
    }

    fn job() -> JobKey {
        JobKey::new("g1", "o1", ArchiveKind::Originals).unwrap()
    }

    async fn router(
        n: usize,
        engine: Arc<RecordingEngine>,
    ) -> (JobRouter, JobStore, tempfile::TempDir) {
        let (storage, dir) = temp_storage().await;
        let jobs = JobStore::new(storage.db.clone());
        let router = JobRouter::new(
            PipelineConfig::default(),
            jobs.clone(),
            Arc::new(storage),
            Arc::new(FixedManifest(manifest(n))),
            engine,
        );
        (router, jobs, dir)
    }

    #[test]
    fn threshold_boundary() {
        assert_eq!(choose_strategy(99, 100), Strategy::Single);
        assert_eq!(choose_strategy(100, 100), Strategy::Chunked);
        assert_eq!(choose_strategy(101, 100), Strategy::Chunked);
        assert_eq!(choose_strategy(1, 1), Strategy::Chunked);
    }

    #[tokio::test]
    async fn below_threshold_takes_single_path() {
        let engine = Arc::new(RecordingEngine::default());
        let (router, _, _dir) = router(40, engine.clone()).await;

        let outcome = router.request(&job()).await.unwrap();
        assert!(matches!(
            outcome,
            RouteOutcome::Started {
                strategy: Strategy::Single,
                worker_count: 0,
                file_count: 40,
                ..
            }
        ));
        assert!(matches!(engine.started.lock().unwrap()[0], Execution::Single(_)));
    }

    #[tokio::test]
    async fn at_threshold_fans_out() {
        let engine = Arc::new(RecordingEngine::default());
        let (router, jobs, _dir) = router(100, engine.clone()).await;

        let outcome = router.request(&job()).await.unwrap();
        assert!(matches!(
            outcome,
            RouteOutcome::Started {
                strategy: Strategy::Chunked,
                worker_count: 2,
                ..
            }
        ));
        {
            let started = engine.started.lock().unwrap();
            let Execution::Chunked(run) = &started[0] else {
                panic!("expected chunked execution");
            };
            assert_eq!(run.partitions.len(), 2);
        }
        let record = jobs.get(&job()).await.unwrap().unwrap();
        assert_eq!(record.worker_count, 2);
        assert_eq!(record.status, JobStatus::Generating);
    }

    #[tokio::test]
    async fn second_request_while_generating_is_told_to_poll() {
        let engine = Arc::new(RecordingEngine::default());
        let (router, _, _dir) = router(10, engine.clone()).await;

        let RouteOutcome::Started { run_id, .. } = router.request(&job()).await.unwrap() else {
            panic!("expected a started run");
        };
        let second = router.request(&job()).await.unwrap();
        assert_eq!(second, RouteOutcome::InProgress { run_id });
        assert_eq!(engine.started.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_manifest_is_a_no_op() {
        let engine = Arc::new(RecordingEngine::default());
        let (router, jobs, _dir) = router(0, engine.clone()).await;

        assert_eq!(router.request(&job()).await.unwrap(), RouteOutcome::ManifestEmpty);
        assert!(engine.started.lock().unwrap().is_empty());
        assert!(jobs.get(&job()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dispatch_failure_leaves_no_record() {
        let engine = Arc::new(RecordingEngine {
            unavailable: true,
            ..Default::default()
        });
        let (router, jobs, _dir) = router(150, engine).await;

        let err = router.request(&job()).await.unwrap_err();
        assert!(matches!(err, PipelineError::DispatchFailure(_)));
        assert!(jobs.get(&job()).await.unwrap().is_none());
        assert_eq!(router.status(&job()).await.unwrap().status, JobStatus::None);
    }
}
