//! Dead-letter queue for terminal events the failure handler could not
//! reconcile. Anything landing here is a job that may be stuck until an
//! operator intervenes, so every push raises an error-level alert.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::error;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub id: String,
    pub execution_id: String,
    /// The undelivered event as JSON.
    pub payload: String,
    pub reason: String,
    pub created_at_ms: i64,
}

#[derive(Clone)]
pub struct DeadLetterQueue {
    db: SqlitePool,
}

impl DeadLetterQueue {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn push<T: Serialize>(
        &self,
        execution_id: &str,
        event: &T,
        reason: &str,
    ) -> Result<DeadLetter, sqlx::Error> {
        let payload = serde_json::to_string(event)
            .unwrap_or_else(|err| format!("{{\"unserializable\":\"{}\"}}", err));
        let letter = DeadLetter {
            id: Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            payload,
            reason: reason.to_string(),
            created_at_ms: Utc::now().timestamp_millis(),
        };

        error!(
            alert = true,
            execution_id,
            reason,
            "terminal event dead-lettered; job may be stuck until reconciled"
        );

        sqlx::query(
            "INSERT INTO dead_letters (id, execution_id, payload, reason, created_at_ms)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&letter.id)
        .bind(&letter.execution_id)
        .bind(&letter.payload)
        .bind(&letter.reason)
        .bind(letter.created_at_ms)
        .execute(&self.db)
        .await?;

        Ok(letter)
    }

    /// Newest first.
    pub async fn list(&self) -> Result<Vec<DeadLetter>, sqlx::Error> {
        sqlx::query_as::<_, DeadLetter>(
            "SELECT id, execution_id, payload, reason, created_at_ms
             FROM dead_letters ORDER BY created_at_ms DESC, id DESC",
        )
        .fetch_all(&self.db)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::memory_pool;
    use serde_json::json;

    #[tokio::test]
    async fn push_persists_payload_and_reason() {
        let dlq = DeadLetterQueue::new(memory_pool().await);
        dlq.push("exec-1", &json!({"runId": "r1"}), "job store unavailable")
            .await
            .unwrap();

        let letters = dlq.list().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].execution_id, "exec-1");
        assert_eq!(letters[0].reason, "job store unavailable");
        let payload: serde_json::Value = serde_json::from_str(&letters[0].payload).unwrap();
        assert_eq!(payload["runId"], "r1");
        assert!(letters[0].created_at_ms > 0);
    }
}
