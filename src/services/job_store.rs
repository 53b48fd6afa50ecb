//! JobStore: the status tracker record, per-chunk results, and order
//! selections, all in SQLite.
//!
//! Only three writers touch `zip_jobs`: the router (`begin_run` /
//! `discard_run`), the merge/archiver (`mark_ready` / `mark_error`) and the
//! failure handler (`mark_error`). Terminal transitions are conditional on
//! the run still owning a GENERATING record, so they never reverse.

use crate::models::{
    chunk::ChunkResult,
    zip_job::{JobKey, JobStatus, StatusView, ZipJob},
};
use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::{debug, warn};

const JOB_COLUMNS: &str = "gallery_id, order_id, kind, run_id, worker_count, manifest_hash, \
     status, generating, generating_since_ms, result_key, result_size, error_reason, updated_at_ms";

/// Fields of a new run written by `begin_run`.
#[derive(Debug, Clone)]
pub struct NewRun<'a> {
    pub run_id: &'a str,
    pub worker_count: i64,
    pub manifest_hash: &'a str,
}

#[derive(Clone)]
pub struct JobStore {
    db: SqlitePool,
}

impl JobStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn get(&self, key: &JobKey) -> Result<Option<ZipJob>, sqlx::Error> {
        sqlx::query_as::<_, ZipJob>(&format!(
            "SELECT {JOB_COLUMNS} FROM zip_jobs WHERE gallery_id = ? AND order_id = ? AND kind = ?"
        ))
        .bind(&key.gallery_id)
        .bind(&key.order_id)
        .bind(key.kind)
        .fetch_optional(&self.db)
        .await
    }

    /// Create-or-supersede the record for a new GENERATING run.
    ///
    /// Succeeds when no record exists, the existing record is not generating,
    /// or its generating flag is older than `timeout`. Returns false when a
    /// live run already holds the record.
    pub async fn begin_run(
        &self,
        key: &JobKey,
        run: NewRun<'_>,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<bool, sqlx::Error> {
        let now_ms = now.timestamp_millis();
        let stale_before_ms = (now - timeout).timestamp_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO zip_jobs (
                gallery_id, order_id, kind, run_id, worker_count, manifest_hash,
                status, generating, generating_since_ms, result_key, result_size,
                error_reason, updated_at_ms
            ) VALUES (?, ?, ?, ?, ?, ?, 'GENERATING', 1, ?, NULL, NULL, NULL, ?)
            ON CONFLICT(gallery_id, order_id, kind) DO UPDATE SET
                run_id = excluded.run_id,
                worker_count = excluded.worker_count,
                manifest_hash = excluded.manifest_hash,
                status = 'GENERATING',
                generating = 1,
                generating_since_ms = excluded.generating_since_ms,
                result_key = NULL,
                result_size = NULL,
                error_reason = NULL,
                updated_at_ms = excluded.updated_at_ms
            WHERE zip_jobs.generating = 0
               OR zip_jobs.generating_since_ms IS NULL
               OR zip_jobs.generating_since_ms < ?
            "#,
        )
        .bind(&key.gallery_id)
        .bind(&key.order_id)
        .bind(key.kind)
        .bind(run.run_id)
        .bind(run.worker_count)
        .bind(run.manifest_hash)
        .bind(now_ms)
        .bind(now_ms)
        .bind(stale_before_ms)
        .execute(&self.db)
        .await?;

        let acquired = result.rows_affected() == 1;
        debug!(%key, run_id = run.run_id, acquired, "begin run");
        Ok(acquired)
    }

    /// Remove a GENERATING record that never got dispatched, so the key is
    /// back to a clean absent state.
    pub async fn discard_run(&self, key: &JobKey, run_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM zip_jobs
             WHERE gallery_id = ? AND order_id = ? AND kind = ? AND run_id = ?
               AND status = 'GENERATING'",
        )
        .bind(&key.gallery_id)
        .bind(&key.order_id)
        .bind(key.kind)
        .bind(run_id)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// GENERATING -> READY for the run that still owns the record.
    pub async fn mark_ready(
        &self,
        key: &JobKey,
        run_id: &str,
        result_key: &str,
        result_size: i64,
        manifest_hash: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE zip_jobs SET
                status = 'READY', generating = 0, generating_since_ms = NULL,
                result_key = ?, result_size = ?, manifest_hash = ?,
                error_reason = NULL, updated_at_ms = ?
             WHERE gallery_id = ? AND order_id = ? AND kind = ? AND run_id = ?
               AND status = 'GENERATING'",
        )
        .bind(result_key)
        .bind(result_size)
        .bind(manifest_hash)
        .bind(Utc::now().timestamp_millis())
        .bind(&key.gallery_id)
        .bind(&key.order_id)
        .bind(key.kind)
        .bind(run_id)
        .execute(&self.db)
        .await?;

        let applied = result.rows_affected() == 1;
        if !applied {
            warn!(%key, run_id, "READY transition ignored: run no longer owns the record");
        }
        Ok(applied)
    }

    /// GENERATING -> ERROR for the run that still owns the record.
    pub async fn mark_error(
        &self,
        key: &JobKey,
        run_id: &str,
        reason: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE zip_jobs SET
                status = 'ERROR', generating = 0, generating_since_ms = NULL,
                error_reason = ?, updated_at_ms = ?
             WHERE gallery_id = ? AND order_id = ? AND kind = ? AND run_id = ?
               AND status = 'GENERATING'",
        )
        .bind(reason)
        .bind(Utc::now().timestamp_millis())
        .bind(&key.gallery_id)
        .bind(&key.order_id)
        .bind(key.kind)
        .bind(run_id)
        .execute(&self.db)
        .await?;

        let applied = result.rows_affected() == 1;
        if !applied {
            debug!(%key, run_id, "ERROR transition ignored: run no longer owns the record");
        }
        Ok(applied)
    }

    /// Upsert so a retried chunk overwrites its previous report.
    pub async fn record_chunk_result(
        &self,
        run_id: &str,
        result: &ChunkResult,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO chunk_results (run_id, chunk_index, files_added, duration_ms, recorded_at_ms)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(run_id, chunk_index) DO UPDATE SET
                files_added = excluded.files_added,
                duration_ms = excluded.duration_ms,
                recorded_at_ms = excluded.recorded_at_ms",
        )
        .bind(run_id)
        .bind(result.chunk_index)
        .bind(result.files_added)
        .bind(result.duration_ms)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn chunk_results(&self, run_id: &str) -> Result<Vec<ChunkResult>, sqlx::Error> {
        sqlx::query_as::<_, ChunkResult>(
            "SELECT chunk_index, files_added, duration_ms FROM chunk_results
             WHERE run_id = ? ORDER BY chunk_index ASC",
        )
        .bind(run_id)
        .fetch_all(&self.db)
        .await
    }

    pub async fn clear_chunk_results(&self, run_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM chunk_results WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Read side of the status tracker. A GENERATING record whose flag is
    /// older than `timeout` is reported as ERROR, never as in progress.
    pub async fn status(
        &self,
        key: &JobKey,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Result<StatusView, sqlx::Error> {
        let Some(job) = self.get(key).await? else {
            return Ok(StatusView::none());
        };
        Ok(status_view(&job, now, timeout))
    }

    /// Replace the favorites an order scopes its originals archive to.
    pub async fn replace_selection(
        &self,
        gallery_id: &str,
        order_id: &str,
        keys: &[String],
    ) -> Result<(), sqlx::Error> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM order_selections WHERE gallery_id = ? AND order_id = ?")
            .bind(gallery_id)
            .bind(order_id)
            .execute(&mut *tx)
            .await?;
        for key in keys {
            sqlx::query(
                "INSERT OR IGNORE INTO order_selections (gallery_id, order_id, object_key)
                 VALUES (?, ?, ?)",
            )
            .bind(gallery_id)
            .bind(order_id)
            .bind(key)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    pub async fn selection(
        &self,
        gallery_id: &str,
        order_id: &str,
    ) -> Result<Vec<String>, sqlx::Error> {
        sqlx::query_scalar::<_, String>(
            "SELECT object_key FROM order_selections
             WHERE gallery_id = ? AND order_id = ? ORDER BY object_key ASC",
        )
        .bind(gallery_id)
        .bind(order_id)
        .fetch_all(&self.db)
        .await
    }
}

fn status_view(job: &ZipJob, now: DateTime<Utc>, timeout: Duration) -> StatusView {
    let updated_at = DateTime::<Utc>::from_timestamp_millis(job.updated_at_ms);
    let mut view = StatusView {
        status: job.status,
        run_id: Some(job.run_id.clone()),
        result_key: None,
        result_size: None,
        error_reason: None,
        updated_at,
    };
    match job.status {
        JobStatus::Generating if job.is_stale(now, timeout) => {
            view.status = JobStatus::Error;
            view.error_reason = Some("generation timed out".into());
        }
        JobStatus::Ready => {
            view.result_key = job.result_key.clone();
            view.result_size = job.result_size;
        }
        JobStatus::Error => view.error_reason = job.error_reason.clone(),
        JobStatus::Generating | JobStatus::None => {}
    }
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::memory_pool;
    use crate::models::zip_job::ArchiveKind;

    fn key() -> JobKey {
        JobKey::new("g1", "o1", ArchiveKind::Originals).unwrap()
    }

    fn run<'a>(run_id: &'a str) -> NewRun<'a> {
        NewRun {
            run_id,
            worker_count: 3,
            manifest_hash: "hash",
        }
    }

    #[tokio::test]
    async fn begin_run_refuses_while_live_run_holds_record() {
        let store = JobStore::new(memory_pool().await);
        let now = Utc::now();
        let timeout = Duration::minutes(15);

        assert!(store.begin_run(&key(), run("r1"), now, timeout).await.unwrap());
        assert!(!store.begin_run(&key(), run("r2"), now, timeout).await.unwrap());

        let job = store.get(&key()).await.unwrap().unwrap();
        assert_eq!(job.run_id, "r1");
        assert_eq!(job.status, JobStatus::Generating);
        assert!(job.generating);
    }

    #[tokio::test]
    async fn stale_run_is_superseded_and_reported_as_error() {
        let store = JobStore::new(memory_pool().await);
        let timeout = Duration::minutes(15);
        let started = Utc::now() - Duration::minutes(30);
        assert!(store.begin_run(&key(), run("old"), started, timeout).await.unwrap());

        let view = store.status(&key(), Utc::now(), timeout).await.unwrap();
        assert_eq!(view.status, JobStatus::Error);
        assert_eq!(view.error_reason.as_deref(), Some("generation timed out"));

        assert!(store.begin_run(&key(), run("new"), Utc::now(), timeout).await.unwrap());
        let view = store.status(&key(), Utc::now(), timeout).await.unwrap();
        assert_eq!(view.status, JobStatus::Generating);
        assert_eq!(view.run_id.as_deref(), Some("new"));

        // The orphaned run can no longer transition the record.
        assert!(!store.mark_ready(&key(), "old", "archives/x.zip", 1, "hash").await.unwrap());
    }

    #[tokio::test]
    async fn transitions_are_monotonic_within_a_run() {
        let store = JobStore::new(memory_pool().await);
        let timeout = Duration::minutes(15);
        store.begin_run(&key(), run("r1"), Utc::now(), timeout).await.unwrap();

        assert!(store.mark_ready(&key(), "r1", "archives/g1/o1/originals.zip", 42, "hash").await.unwrap());
        assert!(!store.mark_error(&key(), "r1", "late failure").await.unwrap());

        let view = store.status(&key(), Utc::now(), timeout).await.unwrap();
        assert_eq!(view.status, JobStatus::Ready);
        assert_eq!(view.result_key.as_deref(), Some("archives/g1/o1/originals.zip"));
        assert_eq!(view.result_size, Some(42));

        let job = store.get(&key()).await.unwrap().unwrap();
        assert!(!job.generating);
        assert!(job.generating_since_ms.is_none());
    }

    #[tokio::test]
    async fn discard_run_leaves_key_absent() {
        let store = JobStore::new(memory_pool().await);
        store.begin_run(&key(), run("r1"), Utc::now(), Duration::minutes(15)).await.unwrap();
        assert!(store.discard_run(&key(), "r1").await.unwrap());
        let view = store.status(&key(), Utc::now(), Duration::minutes(15)).await.unwrap();
        assert_eq!(view, StatusView::none());
    }

    #[tokio::test]
    async fn chunk_results_upsert_per_index() {
        let store = JobStore::new(memory_pool().await);
        let result = |idx, files| ChunkResult {
            chunk_index: idx,
            files_added: files,
            duration_ms: 5,
        };
        store.record_chunk_result("r1", &result(1, 10)).await.unwrap();
        store.record_chunk_result("r1", &result(0, 10)).await.unwrap();
        store.record_chunk_result("r1", &result(1, 12)).await.unwrap();
        store.record_chunk_result("r2", &result(0, 1)).await.unwrap();

        let results = store.chunk_results("r1").await.unwrap();
        assert_eq!(results, vec![result(0, 10), result(1, 12)]);

        store.clear_chunk_results("r1").await.unwrap();
        assert!(store.chunk_results("r1").await.unwrap().is_empty());
        assert_eq!(store.chunk_results("r2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn selection_replaces_previous_set() {
        let store = JobStore::new(memory_pool().await);
        store
            .replace_selection("g1", "o1", &["b".into(), "a".into()])
            .await
            .unwrap();
        store.replace_selection("g1", "o1", &["c".into()]).await.unwrap();
        assert_eq!(store.selection("g1", "o1").await.unwrap(), vec!["c".to_string()]);
        assert!(store.selection("g1", "o2").await.unwrap().is_empty());
    }
}
