//! Single-invocation archiver for small manifests: streams the source
//! objects straight into the final ZIP with no scratch staging.

use super::{
    PipelineError, PipelineResult,
    layout::archive_key,
    manifest::Manifest,
    zip_stream::{ArchiveEntry, write_archive},
};
use crate::{
    models::zip_job::JobKey,
    services::{job_store::JobStore, object_store::ObjectStore},
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Instant};
use tracing::{info, warn};

/// Input of a single-invocation run.
#[derive(Debug, Clone)]
pub struct SingleRun {
    pub job: JobKey,
    pub run_id: String,
    pub manifest: Manifest,
}

/// A published archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveOutcome {
    pub result_key: String,
    pub result_size: i64,
    pub entries: usize,
}

#[derive(Clone)]
pub struct Archiver {
    store: Arc<dyn ObjectStore>,
    jobs: JobStore,
}

impl Archiver {
    pub fn new(store: Arc<dyn ObjectStore>, jobs: JobStore) -> Self {
        Self { store, jobs }
    }

    /// Build, publish and mark READY; on failure mark ERROR with the reason.
    pub async fn run(&self, run: &SingleRun) -> PipelineResult<ArchiveOutcome> {
        let started = Instant::now();
        let entries = run
            .manifest
            .entries()
            .iter()
            .map(|e| ArchiveEntry {
                name: run.manifest.entry_name(&e.key).to_string(),
                key: e.key.clone(),
            })
            .collect::<Vec<_>>();
        let entry_count = entries.len();
        let dest = archive_key(&run.job);

        let archive = match write_archive(self.store.clone(), entries, &dest).await {
            Ok(archive) => archive,
            Err(err) => {
                let reason = format!("archive generation failed: {err}");
                warn!(job = %run.job, run_id = %run.run_id, %reason, "single-invocation archive failed");
                self.jobs.mark_error(&run.job, &run.run_id, &reason).await?;
                return Err(PipelineError::MergeFailure(err.to_string()));
            }
        };

        self.jobs
            .mark_ready(
                &run.job,
                &run.run_id,
                &archive.key,
                archive.size_bytes,
                &run.manifest.hash(),
            )
            .await?;

        info!(
            job = %run.job,
            run_id = %run.run_id,
            entries = entry_count,
            size_bytes = archive.size_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "archive ready"
        );
        Ok(ArchiveOutcome {
            result_key: archive.key,
            result_size: archive.size_bytes,
            entries: entry_count,
        })
    }
}
