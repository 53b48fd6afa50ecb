//! Fault injection for pipeline tests.

use crate::{
    models::object::StoredObject,
    services::{
        object_store::{ByteStream, ObjectStore, StorageError, StorageResult},
        storage_service::StorageService,
    },
};
use async_trait::async_trait;
use std::{collections::HashSet, io, time::Duration};

/// Wraps a real [`StorageService`] and fails or stalls selected calls.
#[derive(Clone)]
pub struct FaultyStore {
    inner: StorageService,
    failing_gets: HashSet<String>,
    failing_put_prefixes: Vec<String>,
    get_delay: Option<Duration>,
    list_fault: Option<ListFault>,
}

#[derive(Clone, Copy)]
enum ListFault {
    Error,
    Panic,
}

impl FaultyStore {
    pub fn new(inner: StorageService) -> Self {
        Self {
            inner,
            failing_gets: HashSet::new(),
            failing_put_prefixes: Vec::new(),
            get_delay: None,
            list_fault: None,
        }
    }

    /// Reads of `key` fail with an I/O error.
    pub fn fail_get(mut self, key: impl Into<String>) -> Self {
        self.failing_gets.insert(key.into());
        self
    }

    /// Writes under `prefix` fail without reading the body.
    pub fn fail_put_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.failing_put_prefixes.push(prefix.into());
        self
    }

    /// Listings fail with an I/O error.
    pub fn fail_list(mut self) -> Self {
        self.list_fault = Some(ListFault::Error);
        self
    }

    /// Listings panic, taking the calling task down.
    pub fn panic_on_list(mut self) -> Self {
        self.list_fault = Some(ListFault::Panic);
        self
    }

    /// Every read sleeps for `delay` first.
    pub fn delay_get(mut self, delay: Duration) -> Self {
        self.get_delay = Some(delay);
        self
    }
}

fn injected(what: &str) -> StorageError {
    StorageError::Io(io::Error::other(format!("injected fault: {what}")))
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn head(&self, key: &str) -> StorageResult<StoredObject> {
        self.inner.head(key).await
    }

    async fn get(&self, key: &str) -> StorageResult<(StoredObject, ByteStream)> {
        if let Some(delay) = self.get_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_gets.contains(key) {
            return Err(injected(key));
        }
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &str,
        content_type: Option<String>,
        body: ByteStream,
    ) -> StorageResult<StoredObject> {
        if self.failing_put_prefixes.iter().any(|p| key.starts_with(p)) {
            return Err(injected(key));
        }
        self.inner.put(key, content_type, body).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<StoredObject>> {
        match self.list_fault {
            Some(ListFault::Error) => return Err(injected(prefix)),
            Some(ListFault::Panic) => panic!("injected panic listing `{prefix}`"),
            None => {}
        }
        self.inner.list(prefix).await
    }

    async fn delete(&self, keys: &[String]) -> StorageResult<usize> {
        self.inner.delete(keys).await
    }
}
