//! Merge/finalizer: joins the staged chunks of a run into the published
//! archive.
//!
//! Fails closed: unless every chunk in `[0, worker_count)` has reported a
//! complete result, no archive is written and the job goes to ERROR. Entry
//! order is chunk index, then position within the chunk, independent of
//! the order workers finished in.

use super::{
    PipelineError, PipelineResult,
    archiver::ArchiveOutcome,
    layout::{archive_key, staged_key},
    manifest::Manifest,
    scratch,
    zip_stream::{ArchiveEntry, write_archive},
};
use crate::{
    models::{
        chunk::{ChunkResult, Partition},
        zip_job::JobKey,
    },
    services::{job_store::JobStore, object_store::ObjectStore},
};
use std::{collections::HashMap, sync::Arc, time::Instant};
use tracing::{info, warn};

/// Input of a chunked run: the manifest and how it was split.
#[derive(Debug, Clone)]
pub struct ChunkedRun {
    pub job: JobKey,
    pub run_id: String,
    pub manifest: Manifest,
    pub partitions: Vec<Partition>,
}

impl ChunkedRun {
    pub fn worker_count(&self) -> usize {
        self.partitions.len()
    }
}

#[derive(Clone)]
pub struct Merger {
    store: Arc<dyn ObjectStore>,
    jobs: JobStore,
}

impl Merger {
    pub fn new(store: Arc<dyn ObjectStore>, jobs: JobStore) -> Self {
        Self { store, jobs }
    }

    pub async fn finalize(&self, run: &ChunkedRun) -> PipelineResult<ArchiveOutcome> {
        let started = Instant::now();

        let results = self.jobs.chunk_results(&run.run_id).await?;
        if let Err(reason) = verify_complete(&run.partitions, &results) {
            self.fail(run, &reason).await?;
            return Err(PipelineError::IncompleteChunks(reason));
        }

        let entries = merge_order(run);
        let entry_count = entries.len();
        let dest = archive_key(&run.job);
        let archive = match write_archive(self.store.clone(), entries, &dest).await {
            Ok(archive) => archive,
            Err(err) => {
                let reason = format!("archive merge failed: {err}");
                self.fail(run, &reason).await?;
                return Err(PipelineError::MergeFailure(err.to_string()));
            }
        };

        self.cleanup(run).await;
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
            chunks = run.worker_count(),
            entries = entry_count,
            size_bytes = archive.size_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "merged archive ready"
        );
        Ok(ArchiveOutcome {
            result_key: archive.key,
            result_size: archive.size_bytes,
            entries: entry_count,
        })
    }

    async fn fail(&self, run: &ChunkedRun, reason: &str) -> PipelineResult<()> {
        warn!(job = %run.job, run_id = %run.run_id, reason, "merge failed");
        self.jobs.mark_error(&run.job, &run.run_id, reason).await?;
        self.cleanup(run).await;
        Ok(())
    }

    /// Best-effort: a leftover scratch area is logged, not fatal.
    async fn cleanup(&self, run: &ChunkedRun) {
        scratch::discard_best_effort(self.store.as_ref(), &self.jobs, &run.job, &run.run_id).await;
    }
}

/// Every partition must have reported exactly as many files as it holds.
fn verify_complete(partitions: &[Partition], results: &[ChunkResult]) -> Result<(), String> {
    let reported: HashMap<i64, i64> = results
        .iter()
        .map(|r| (r.chunk_index, r.files_added))
        .collect();

    let mut missing = Vec::new();
    for partition in partitions {
        let expected = partition.keys.len() as i64;
        match reported.get(&i64::from(partition.chunk_index)) {
            Some(&files) if files == expected => {}
            Some(&files) => {
                return Err(format!(
                    "chunk {} staged {} of {} files",
                    partition.chunk_index, files, expected
                ));
            }
            None => missing.push(partition.chunk_index.to_string()),
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "chunk(s) {} of {} never reported",
            missing.join(", "),
            partitions.len()
        ))
    }
}

/// Chunk index order, then position within the chunk.
fn merge_order(run: &ChunkedRun) -> Vec<ArchiveEntry> {
    let mut partitions: Vec<&Partition> = run.partitions.iter().collect();
    partitions.sort_by_key(|p| p.chunk_index);
    partitions
        .into_iter()
        .flat_map(|p| {
            p.keys.iter().enumerate().map(move |(position, key)| ArchiveEntry {
                name: run.manifest.entry_name(key).to_string(),
                key: staged_key(&run.job, &run.run_id, p.chunk_index, position),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(sizes: &[usize]) -> Vec<Partition> {
        let mut n = 0;
        sizes
            .iter()
            .enumerate()
            .map(|(i, &len)| {
                let keys = (n..n + len).map(|k| format!("p/{k}")).collect();
                n += len;
                Partition {
                    chunk_index: i as u32,
                    keys,
                }
            })
            .collect()
    }

    fn reported(idx: i64, files: i64) -> ChunkResult {
        ChunkResult {
            chunk_index: idx,
            files_added: files,
            duration_ms: 1,
        }
    }

    #[test]
    fn complete_results_pass() {
        let p = parts(&[2, 2, 1]);
        let r = vec![reported(2, 1), reported(0, 2), reported(1, 2)];
        assert!(verify_complete(&p, &r).is_ok());
    }

    #[test]
    fn missing_chunk_is_named() {
        let p = parts(&[2, 2, 2, 2, 2]);
        let r = vec![reported(0, 2), reported(1, 2), reported(3, 2), reported(4, 2)];
        let reason = verify_complete(&p, &r).unwrap_err();
        assert_eq!(reason, "chunk(s) 2 of 5 never reported");
    }

    #[test]
    fn short_chunk_is_rejected() {
        let p = parts(&[3, 3]);
        let r = vec![reported(0, 3), reported(1, 2)];
        assert_eq!(
            verify_complete(&p, &r).unwrap_err(),
            "chunk 1 staged 2 of 3 files"
        );
    }

    #[test]
    fn merge_order_follows_chunk_index_not_vector_order() {
        use crate::models::zip_job::ArchiveKind;
        let mut partitions = parts(&[2, 1]);
        partitions.reverse();
        let run = ChunkedRun {
            job: JobKey::new("g", "o", ArchiveKind::Finals).unwrap(),
            run_id: "r".into(),
            manifest: Manifest::new("p/", vec![]),
            partitions,
        };
        let names: Vec<String> = merge_order(&run).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["0", "1", "2"]);
        assert_eq!(
            merge_order(&run)[2].key,
            "scratch/g/o/finals/r/chunk-00001/000000"
        );
    }
}
