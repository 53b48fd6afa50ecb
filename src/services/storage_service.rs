//! StorageService: the object store backing galleries, scratch copies and
//! finished archives. SQLite holds the metadata; payloads live on disk
//! sharded beneath `base_path/{shard}/{shard}/{key}`.

use super::object_store::{ByteStream, ObjectStore, StorageError, StorageResult};
use crate::models::object::StoredObject;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use md5::Context;
use sqlx::SqlitePool;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;

#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: SqlitePool,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

impl StorageService {
    pub fn new(db: SqlitePool, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Rejects keys that begin with `/`, contain `..`, or carry control bytes.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        let invalid = || StorageError::InvalidObjectKey(key.to_string());
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(invalid());
        }
        if key.starts_with('/') || key.ends_with('/') || key.contains("..") {
            return Err(invalid());
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }
        Ok(())
    }

    /// Two-level shard directories from MD5(key), keeping per-directory
    /// file counts low.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn fetch_object(&self, key: &str) -> StorageResult<StoredObject> {
        sqlx::query_as::<_, StoredObject>(
            "SELECT key, filename, content_type, size_bytes, etag, last_modified
             FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_one(&self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound(key.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    /// Stream bytes into a temp file beside the final path, computing size and
    /// MD5 on the way, then fsync and rename into place.
    async fn write_payload(
        &self,
        file_path: &Path,
        mut body: ByteStream,
    ) -> StorageResult<(i64, String)> {
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        let written: io::Result<()> = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                size_bytes += chunk.len() as i64;
                digest.consume(&chunk);
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(err) = written {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        if let Err(err) = fs::rename(&tmp_path, file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(file_path).await?;
                fs::rename(&tmp_path, file_path).await?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        }

        Ok((size_bytes, format!("{:x}", digest.compute())))
    }

    /// Remove empty directories from `start` upwards, stopping at `base_path`.
    async fn prune_empty_dirs(&self, start: &Path) {
        let stop = self.base_path.as_path();
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for StorageService {
    async fn head(&self, key: &str) -> StorageResult<StoredObject> {
        self.ensure_key_safe(key)?;
        self.fetch_object(key).await
    }

    /// Returns ObjectNotFound if metadata exists but the payload file is gone.
    async fn get(&self, key: &str) -> StorageResult<(StoredObject, ByteStream)> {
        self.ensure_key_safe(key)?;
        let object = self.fetch_object(key).await?;

        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound(key.to_string())
            } else {
                StorageError::Io(err)
            }
        })?;

        Ok((object, Box::pin(ReaderStream::new(file))))
    }

    async fn put(
        &self,
        key: &str,
        content_type: Option<String>,
        body: ByteStream,
    ) -> StorageResult<StoredObject> {
        self.ensure_key_safe(key)?;

        let file_path = self.object_path(key);
        let (size_bytes, etag) = self.write_payload(&file_path, body).await?;
        let filename = key.rsplit('/').next().unwrap_or(key).to_string();

        let upserted = sqlx::query_as::<_, StoredObject>(
            r#"
            INSERT INTO objects (key, filename, content_type, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                filename = excluded.filename,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            RETURNING key, filename, content_type, size_bytes, etag, last_modified
            "#,
        )
        .bind(key)
        .bind(&filename)
        .bind(content_type)
        .bind(size_bytes)
        .bind(&etag)
        .bind(Utc::now())
        .fetch_one(&self.db)
        .await;

        match upserted {
            Ok(obj) => {
                debug!(key, size_bytes, "stored object");
                Ok(obj)
            }
            Err(err) => {
                let _ = fs::remove_file(&file_path).await;
                Err(StorageError::Sqlx(err))
            }
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<StoredObject>> {
        // substr() rather than LIKE so `%` and `_` in keys match literally.
        let rows = sqlx::query_as::<_, StoredObject>(
            "SELECT key, filename, content_type, size_bytes, etag, last_modified
             FROM objects
             WHERE substr(key, 1, length(?)) = ?
             ORDER BY key ASC",
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn delete(&self, keys: &[String]) -> StorageResult<usize> {
        let mut removed = 0;
        for key in keys {
            self.ensure_key_safe(key)?;
            let result = sqlx::query("DELETE FROM objects WHERE key = ?")
                .bind(key)
                .execute(&self.db)
                .await?;
            if result.rows_affected() == 0 {
                continue;
            }
            removed += 1;

            let file_path = self.object_path(key);
            match fs::remove_file(&file_path).await {
                Ok(_) => debug!("removed physical file {}", file_path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("file {} already missing", file_path.display());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
            if let Some(parent) = file_path.parent() {
                self.prune_empty_dirs(parent).await;
            }
        }
        Ok(removed)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::temp_storage;
    use super::*;
    use crate::services::object_store::{bytes_stream, delete_prefix};
    use futures::TryStreamExt;

    async fn read_all(store: &StorageService, key: &str) -> Vec<u8> {
        let (_, stream) = store.get(key).await.expect("get");
        let chunks: Vec<bytes::Bytes> = stream.try_collect().await.expect("read");
        chunks.concat()
    }

    #[tokio::test]
    async fn put_then_get_round_trips_payload_and_etag() {
        let (store, _dir) = temp_storage().await;
        let obj = store
            .put(
                "galleries/g1/originals/a.jpg",
                Some("image/jpeg".into()),
                bytes_stream("hello"),
            )
            .await
            .expect("put");

        assert_eq!(obj.size_bytes, 5);
        assert_eq!(obj.filename, "a.jpg");
        assert_eq!(obj.etag, format!("{:x}", md5::compute("hello")));
        assert_eq!(read_all(&store, "galleries/g1/originals/a.jpg").await, b"hello");
    }

    #[tokio::test]
    async fn overwrite_replaces_payload() {
        let (store, _dir) = temp_storage().await;
        store.put("k/a", None, bytes_stream("one")).await.unwrap();
        let second = store.put("k/a", None, bytes_stream("second")).await.unwrap();
        assert_eq!(second.size_bytes, 6);
        assert_eq!(read_all(&store, "k/a").await, b"second");
        assert_eq!(store.list("k/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_stream_leaves_no_object() {
        let (store, _dir) = temp_storage().await;
        let body: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(bytes::Bytes::from_static(b"partial")),
            Err(io::Error::new(ErrorKind::BrokenPipe, "upstream gone")),
        ]));
        let err = store.put("k/broken", None, body).await.unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
        assert!(matches!(
            store.head("k/broken").await,
            Err(StorageError::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_matches_prefix_literally_and_sorted() {
        let (store, _dir) = temp_storage().await;
        for key in ["p_1/b", "p_1/a", "px1/c", "p_10/d"] {
            store.put(key, None, bytes_stream("x")).await.unwrap();
        }
        let keys: Vec<String> = store
            .list("p_1/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["p_1/a".to_string(), "p_1/b".to_string()]);
    }

    #[tokio::test]
    async fn delete_skips_missing_keys_and_prunes() {
        let (store, dir) = temp_storage().await;
        store.put("s/run/0", None, bytes_stream("x")).await.unwrap();
        store.put("s/run/1", None, bytes_stream("y")).await.unwrap();

        let removed = delete_prefix(&store, "s/run/").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.delete(&["s/run/0".to_string()]).await.unwrap(), 0);
        assert!(store.list("s/").await.unwrap().is_empty());

        let mut leftovers = std::fs::read_dir(dir.path()).unwrap();
        assert!(leftovers.next().is_none());
    }

    #[tokio::test]
    async fn rejects_unsafe_keys() {
        let (store, _dir) = temp_storage().await;
        for key in ["", "/abs", "a/../b", "trailing/", "bad\\key"] {
            assert!(matches!(
                store.put(key, None, bytes_stream("x")).await,
                Err(StorageError::InvalidObjectKey(_))
            ));
        }
    }
}
