//! Storage key layout for sources, scratch copies and finished archives.
//!
//! ```text
//! galleries/{gallery}/originals/{file}
//! galleries/{gallery}/finals/{order}/{file}
//! scratch/{gallery}/{order}/{kind}/{run}/chunk-{index:05}/{position:06}
//! archives/{gallery}/{order}/{kind}.zip
//! ```

use crate::models::zip_job::{ArchiveKind, JobKey};

/// Root of every run's staging area.
pub const SCRATCH_ROOT: &str = "scratch/";

/// Prefix under which the object set for `job` lives.
pub fn source_prefix(job: &JobKey) -> String {
    match job.kind {
        ArchiveKind::Originals => format!("galleries/{}/originals/", job.gallery_id),
        ArchiveKind::Finals => format!("galleries/{}/finals/{}/", job.gallery_id, job.order_id),
    }
}

/// Run-scoped staging area. Namespaced by run so concurrent or retried runs
/// never share scratch objects.
pub fn scratch_prefix(job: &JobKey, run_id: &str) -> String {
    format!(
        "{SCRATCH_ROOT}{}/{}/{}/{}/",
        job.gallery_id, job.order_id, job.kind, run_id
    )
}

/// Recover the job and run that own a scratch key. `None` for keys that do
/// not follow the scratch layout.
pub fn parse_scratch_key(key: &str) -> Option<(JobKey, String)> {
    let mut parts = key.strip_prefix(SCRATCH_ROOT)?.splitn(5, '/');
    let gallery_id = parts.next()?;
    let order_id = parts.next()?;
    let kind = ArchiveKind::parse(parts.next()?)?;
    let run_id = parts.next()?;
    parts.next()?;
    if run_id.is_empty() {
        return None;
    }
    let job = JobKey::new(gallery_id, order_id, kind).ok()?;
    Some((job, run_id.to_string()))
}

pub fn chunk_prefix(job: &JobKey, run_id: &str, chunk_index: u32) -> String {
    format!("{}chunk-{:05}/", scratch_prefix(job, run_id), chunk_index)
}

/// Slot for the `position`-th key of a chunk. Re-staging the same chunk
/// writes the same slots.
pub fn staged_key(job: &JobKey, run_id: &str, chunk_index: u32, position: usize) -> String {
    format!("{}{:06}", chunk_prefix(job, run_id, chunk_index), position)
}

/// Where the finished archive is published.
pub fn archive_key(job: &JobKey) -> String {
    format!(
        "archives/{}/{}/{}.zip",
        job.gallery_id, job.order_id, job.kind
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_by_job_and_run() {
        let job = JobKey::new("g1", "o9", ArchiveKind::Finals).unwrap();
        assert_eq!(source_prefix(&job), "galleries/g1/finals/o9/");
        assert_eq!(
            staged_key(&job, "run-a", 3, 17),
            "scratch/g1/o9/finals/run-a/chunk-00003/000017"
        );
        assert!(staged_key(&job, "run-a", 0, 0).starts_with(&scratch_prefix(&job, "run-a")));
        assert!(!staged_key(&job, "run-b", 0, 0).starts_with(&scratch_prefix(&job, "run-a")));
        assert_eq!(archive_key(&job), "archives/g1/o9/finals.zip");

        let originals = JobKey::new("g1", "o9", ArchiveKind::Originals).unwrap();
        assert_eq!(source_prefix(&originals), "galleries/g1/originals/");
    }

    #[test]
    fn scratch_keys_name_their_owner() {
        let job = JobKey::new("g1", "o9", ArchiveKind::Finals).unwrap();
        assert_eq!(
            parse_scratch_key(&staged_key(&job, "run-a", 2, 5)),
            Some((job, "run-a".to_string()))
        );
        assert_eq!(parse_scratch_key("scratch/g1/o9/finals/run-a"), None);
        assert_eq!(parse_scratch_key("scratch/g1/o9/thumbs/run-a/x"), None);
        assert_eq!(parse_scratch_key("archives/g1/o9/finals.zip"), None);
    }
}
