//! Scratch-area housekeeping for runs that will never merge.
//!
//! A run's staged copies live under its own prefix. They are removed by
//! the merger, by the failure handler, when the router supersedes an
//! abandoned record, and by the startup sweep for anything a crash left
//! behind.

use super::{
    PipelineResult,
    layout::{SCRATCH_ROOT, parse_scratch_key, scratch_prefix},
};
use crate::{
    models::zip_job::JobKey,
    services::{
        job_store::JobStore,
        object_store::{ObjectStore, delete_prefix},
    },
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Delete `run_id`'s staged objects and chunk reports.
pub async fn discard(
    store: &dyn ObjectStore,
    jobs: &JobStore,
    job: &JobKey,
    run_id: &str,
) -> PipelineResult<usize> {
    let removed = delete_prefix(store, &scratch_prefix(job, run_id)).await?;
    jobs.clear_chunk_results(run_id).await?;
    Ok(removed)
}

/// Like [`discard`], but failures are only logged.
pub async fn discard_best_effort(
    store: &dyn ObjectStore,
    jobs: &JobStore,
    job: &JobKey,
    run_id: &str,
) {
    match discard(store, jobs, job, run_id).await {
        Ok(0) => {}
        Ok(removed) => info!(%job, run_id, removed, "scratch area deleted"),
        Err(err) => warn!(%job, run_id, error = %err, "scratch cleanup failed"),
    }
}

/// Discard every scratch area whose run no longer holds its job record as
/// a live GENERATING run. Returns how many runs were swept.
pub async fn sweep(
    store: &dyn ObjectStore,
    jobs: &JobStore,
    now: DateTime<Utc>,
    timeout: chrono::Duration,
) -> PipelineResult<usize> {
    let mut runs = BTreeMap::new();
    for object in store.list(SCRATCH_ROOT).await? {
        match parse_scratch_key(&object.key) {
            Some((job, run_id)) => {
                runs.entry(scratch_prefix(&job, &run_id))
                    .or_insert((job, run_id));
            }
            None => warn!(key = %object.key, "unrecognised scratch object left in place"),
        }
    }

    let mut swept = 0;
    for (job, run_id) in runs.into_values() {
        let live = jobs
            .get(&job)
            .await?
            .is_some_and(|current| current.run_id == run_id && current.is_in_flight(now, timeout));
        if live {
            continue;
        }
        discard_best_effort(store, jobs, &job, &run_id).await;
        swept += 1;
    }
    Ok(swept)
}
