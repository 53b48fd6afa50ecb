//! Manifests: the ordered key set one archive packages, and its fingerprint.

use super::{PipelineResult, layout::source_prefix};
use crate::{
    models::zip_job::{ArchiveKind, JobKey},
    services::{job_store::JobStore, object_store::ObjectStore},
};
use async_trait::async_trait;
use std::{collections::HashSet, sync::Arc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub key: String,
    /// Content fingerprint of the object, so a replaced file changes the hash.
    pub etag: String,
}

/// Sorted, de-duplicated set of objects plus the prefix entry names are
/// relative to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub prefix: String,
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(prefix: impl Into<String>, mut entries: Vec<ManifestEntry>) -> Self {
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries.dedup_by(|a, b| a.key == b.key);
        Self {
            prefix: prefix.into(),
            entries,
        }
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// MD5 hex over `key \t etag \n` lines in key order.
    pub fn hash(&self) -> String {
        let mut digest = md5::Context::new();
        for entry in &self.entries {
            digest.consume(entry.key.as_bytes());
            digest.consume(b"\t");
            digest.consume(entry.etag.as_bytes());
            digest.consume(b"\n");
        }
        format!("{:x}", digest.compute())
    }

    /// Archive entry name for `key`: the key relative to the manifest prefix.
    pub fn entry_name<'a>(&self, key: &'a str) -> &'a str {
        match key.strip_prefix(self.prefix.as_str()) {
            Some(rest) if !rest.is_empty() => rest,
            _ => key,
        }
    }
}

/// Enumerates the keys an archive should contain.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn query(&self, job: &JobKey) -> PipelineResult<Manifest>;
}

/// Lists the kind's prefix in object storage. Originals are scoped to the
/// order's selection when the client has made one.
pub struct StorageManifestSource {
    store: Arc<dyn ObjectStore>,
    jobs: JobStore,
}

impl StorageManifestSource {
    pub fn new(store: Arc<dyn ObjectStore>, jobs: JobStore) -> Self {
        Self { store, jobs }
    }
}

#[async_trait]
impl ManifestSource for StorageManifestSource {
    async fn query(&self, job: &JobKey) -> PipelineResult<Manifest> {
        let prefix = source_prefix(job);
        let mut entries = self
            .store
            .list(&prefix)
            .await?
            .into_iter()
            .map(|obj| ManifestEntry {
                key: obj.key,
                etag: obj.etag,
            })
            .collect::<Vec<_>>();

        if job.kind == ArchiveKind::Originals {
            let selection = self.jobs.selection(&job.gallery_id, &job.order_id).await?;
            if !selection.is_empty() {
                let selected: HashSet<String> = selection.into_iter().collect();
                entries.retain(|entry| selected.contains(&entry.key));
            }
        }

        Ok(Manifest::new(prefix, entries))
    }
}

/// Build a manifest from a caller-supplied key list, resolving each key's
/// etag. A missing key fails the request rather than silently shrinking
/// the archive.
pub async fn resolve_keys(
    store: &dyn ObjectStore,
    job: &JobKey,
    keys: Vec<String>,
) -> PipelineResult<Manifest> {
    let mut entries = Vec::with_capacity(keys.len());
    for key in keys {
        let obj = store.head(&key).await?;
        entries.push(ManifestEntry {
            key: obj.key,
            etag: obj.etag,
        });
    }
    Ok(Manifest::new(source_prefix(job), entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        object_store::{StorageError, bytes_stream},
        storage_service::testing::temp_storage,
    };
    use crate::pipeline::PipelineError;

    fn entry(key: &str, etag: &str) -> ManifestEntry {
        ManifestEntry {
            key: key.into(),
            etag: etag.into(),
        }
    }

    #[test]
    fn hash_ignores_input_order_but_tracks_content() {
        let a = Manifest::new("p/", vec![entry("p/2", "b"), entry("p/1", "a")]);
        let b = Manifest::new("p/", vec![entry("p/1", "a"), entry("p/2", "b")]);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.keys(), vec!["p/1".to_string(), "p/2".to_string()]);

        let changed = Manifest::new("p/", vec![entry("p/1", "a"), entry("p/2", "c")]);
        assert_ne!(a.hash(), changed.hash());

        let fewer = Manifest::new("p/", vec![entry("p/1", "a")]);
        assert_ne!(a.hash(), fewer.hash());
    }

    #[test]
    fn entry_names_are_relative_to_prefix() {
        let m = Manifest::new("galleries/g1/originals/", vec![]);
        assert_eq!(m.entry_name("galleries/g1/originals/day1/a.jpg"), "day1/a.jpg");
        assert_eq!(m.entry_name("elsewhere/b.jpg"), "elsewhere/b.jpg");
    }

    #[tokio::test]
    async fn originals_manifest_respects_order_selection() {
        let (storage, _dir) = temp_storage().await;
        for name in ["a.jpg", "b.jpg", "c.jpg"] {
            storage
                .put(&format!("galleries/g1/originals/{name}"), None, bytes_stream(name))
                .await
                .unwrap();
        }
        storage
            .put("galleries/g2/originals/x.jpg", None, bytes_stream("x"))
            .await
            .unwrap();
        let jobs = JobStore::new(storage.db.clone());
        let source = StorageManifestSource::new(Arc::new(storage.clone()), jobs.clone());
        let job = JobKey::new("g1", "o1", ArchiveKind::Originals).unwrap();

        assert_eq!(source.query(&job).await.unwrap().len(), 3);

        jobs.replace_selection(
            "g1",
            "o1",
            &[
                "galleries/g1/originals/c.jpg".into(),
                "galleries/g1/originals/a.jpg".into(),
            ],
        )
        .await
        .unwrap();
        let scoped = source.query(&job).await.unwrap();
        assert_eq!(
            scoped.keys(),
            vec![
                "galleries/g1/originals/a.jpg".to_string(),
                "galleries/g1/originals/c.jpg".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn resolve_keys_fails_on_missing_object() {
        let (storage, _dir) = temp_storage().await;
        storage
            .put("galleries/g1/finals/o1/a.jpg", None, bytes_stream("a"))
            .await
            .unwrap();
        let job = JobKey::new("g1", "o1", ArchiveKind::Finals).unwrap();

        let ok = resolve_keys(&storage, &job, vec!["galleries/g1/finals/o1/a.jpg".into()])
            .await
            .unwrap();
        assert_eq!(ok.entry_name(&ok.keys()[0]), "a.jpg");

        let err = resolve_keys(&storage, &job, vec!["galleries/g1/finals/o1/zz.jpg".into()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Storage(StorageError::ObjectNotFound(_))
        ));
    }
}
