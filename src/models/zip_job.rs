//! The ZIP job record and its identity.
//!
//! One record exists per `(gallery_id, order_id, kind)`. Each generation
//! attempt overwrites it with a fresh `run_id`; the record is the status
//! tracker that API consumers poll.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Which object set an archive packages.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveKind {
    Originals,
    Finals,
}

impl ArchiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveKind::Originals => "originals",
            ArchiveKind::Finals => "finals",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "originals" => Some(ArchiveKind::Originals),
            "finals" => Some(ArchiveKind::Finals),
            _ => None,
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a job as seen by pollers. `None` means no record exists.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Generating,
    Ready,
    Error,
    None,
}

/// Composite identity of an archive: owning gallery, order and object set.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct JobKey {
    pub gallery_id: String,
    pub order_id: String,
    pub kind: ArchiveKind,
}

impl JobKey {
    /// Build a key, rejecting ids that could escape their storage prefix.
    pub fn new(
        gallery_id: impl Into<String>,
        order_id: impl Into<String>,
        kind: ArchiveKind,
    ) -> Result<Self, InvalidJobKey> {
        let gallery_id = gallery_id.into();
        let order_id = order_id.into();
        ensure_id_safe("gallery_id", &gallery_id)?;
        ensure_id_safe("order_id", &order_id)?;
        Ok(Self {
            gallery_id,
            order_id,
            kind,
        })
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.gallery_id, self.order_id, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {reason}")]
pub struct InvalidJobKey {
    pub field: &'static str,
    pub reason: &'static str,
}

fn ensure_id_safe(field: &'static str, value: &str) -> Result<(), InvalidJobKey> {
    if value.is_empty() {
        return Err(InvalidJobKey {
            field,
            reason: "must not be empty",
        });
    }
    if value.len() > 128 {
        return Err(InvalidJobKey {
            field,
            reason: "must be at most 128 bytes",
        });
    }
    if value.contains('/') || value.contains("..") {
        return Err(InvalidJobKey {
            field,
            reason: "must not contain `/` or `..`",
        });
    }
    if value.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
        return Err(InvalidJobKey {
            field,
            reason: "must not contain control characters or `\\`",
        });
    }
    Ok(())
}

/// Persisted job record.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ZipJob {
    pub gallery_id: String,
    pub order_id: String,
    pub kind: ArchiveKind,

    /// Token minted per generation attempt; embedded in scratch paths.
    pub run_id: String,

    /// Number of partitions chosen for this run (0 for the single-invocation path).
    pub worker_count: i64,

    /// MD5 fingerprint of the manifest this run packages.
    pub manifest_hash: String,

    pub status: JobStatus,

    /// In-flight marker. Cleared by every terminal transition.
    pub generating: bool,

    /// When the in-flight marker was set, as unix millis.
    pub generating_since_ms: Option<i64>,

    pub result_key: Option<String>,
    pub result_size: Option<i64>,
    pub error_reason: Option<String>,
    pub updated_at_ms: i64,
}

impl ZipJob {
    pub fn generating_since(&self) -> Option<DateTime<Utc>> {
        self.generating_since_ms
            .and_then(DateTime::<Utc>::from_timestamp_millis)
    }

    /// A generating flag older than `timeout` belongs to an abandoned run.
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        match (self.generating, self.generating_since()) {
            (true, Some(since)) => now - since > timeout,
            (true, None) => true,
            (false, _) => false,
        }
    }

    /// True while a live (non-stale) run holds the record.
    pub fn is_in_flight(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        self.status == JobStatus::Generating && self.generating && !self.is_stale(now, timeout)
    }
}

/// What pollers see for a `(gallery_id, order_id, kind)`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatusView {
    pub fn none() -> Self {
        Self {
            status: JobStatus::None,
            run_id: None,
            result_key: None,
            result_size: None,
            error_reason: None,
            updated_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(generating: bool, since: Option<DateTime<Utc>>) -> ZipJob {
        ZipJob {
            gallery_id: "g1".into(),
            order_id: "o1".into(),
            kind: ArchiveKind::Originals,
            run_id: "r1".into(),
            worker_count: 0,
            manifest_hash: "h".into(),
            status: if generating {
                JobStatus::Generating
            } else {
                JobStatus::Ready
            },
            generating,
            generating_since_ms: since.map(|t| t.timestamp_millis()),
            result_key: None,
            result_size: None,
            error_reason: None,
            updated_at_ms: 0,
        }
    }

    #[test]
    fn job_key_rejects_path_escapes() {
        assert!(JobKey::new("g1", "o1", ArchiveKind::Finals).is_ok());
        assert!(JobKey::new("", "o1", ArchiveKind::Finals).is_err());
        assert!(JobKey::new("g/1", "o1", ArchiveKind::Finals).is_err());
        assert!(JobKey::new("g1", "..", ArchiveKind::Finals).is_err());
        assert!(JobKey::new("g1", "o\n1", ArchiveKind::Finals).is_err());
    }

    #[test]
    fn generating_flag_goes_stale_after_timeout() {
        let now = Utc::now();
        let timeout = Duration::minutes(15);

        let fresh = job(true, Some(now - Duration::minutes(1)));
        assert!(fresh.is_in_flight(now, timeout));

        let stale = job(true, Some(now - Duration::minutes(16)));
        assert!(stale.is_stale(now, timeout));
        assert!(!stale.is_in_flight(now, timeout));

        let done = job(false, None);
        assert!(!done.is_stale(now, timeout));
        assert!(!done.is_in_flight(now, timeout));
    }
}
