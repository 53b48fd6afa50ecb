//! The object storage seam the pipeline consumes.
//!
//! `StorageService` is the production implementation; tests wrap it to
//! inject faults.

use crate::models::object::StoredObject;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::{io, pin::Pin};
use thiserror::Error;

/// Streaming object payload.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Metadata only.
    async fn head(&self, key: &str) -> StorageResult<StoredObject>;

    /// Metadata plus a streaming reader over the payload.
    async fn get(&self, key: &str) -> StorageResult<(StoredObject, ByteStream)>;

    /// Stream a payload into `key`, replacing any previous object.
    ///
    /// An `Err` item in `body` aborts the write; no object is left behind.
    async fn put(
        &self,
        key: &str,
        content_type: Option<String>,
        body: ByteStream,
    ) -> StorageResult<StoredObject>;

    /// All objects whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<StoredObject>>;

    /// Remove the given keys. Missing keys are skipped; returns how many existed.
    async fn delete(&self, keys: &[String]) -> StorageResult<usize>;
}

/// Wrap a single in-memory buffer as a `ByteStream`.
#[cfg(test)]
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Delete everything under `prefix`. Returns the number of objects removed.
pub async fn delete_prefix(store: &dyn ObjectStore, prefix: &str) -> StorageResult<usize> {
    let keys = store
        .list(prefix)
        .await?
        .into_iter()
        .map(|obj| obj.key)
        .collect::<Vec<_>>();
    if keys.is_empty() {
        return Ok(0);
    }
    store.delete(&keys).await
}
