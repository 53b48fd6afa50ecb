//! Streaming ZIP assembly.
//!
//! The archive is written by a blocking `zip::ZipWriter` in stream mode
//! whose sink is a bounded channel; the receiving end is handed to
//! `ObjectStore::put` as the upload body. Neither the archive nor any
//! single entry is buffered whole, in memory or on local disk.

use crate::{
    models::object::StoredObject,
    services::object_store::{ByteStream, ObjectStore, StorageError},
};
use bytes::{Bytes, BytesMut};
use std::{
    io::{self, Write},
    sync::Arc,
};
use thiserror::Error;
use tokio::{runtime::Handle, sync::mpsc, task::JoinError};
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::debug;
use zip::{CompressionMethod, ZipWriter, result::ZipError, write::SimpleFileOptions};

/// Upload chunk size handed to the storage layer.
const FLUSH_AT: usize = 256 * 1024;
/// Chunks in flight between the zip writer and the uploader.
const CHANNEL_DEPTH: usize = 8;
/// Entries at or above this size need ZIP64 headers.
const ZIP64_THRESHOLD: i64 = 0xFFFF_FFFF;

/// One archive entry: the name it gets inside the ZIP and the object that
/// supplies its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub key: String,
}

#[derive(Debug, Error)]
pub enum ArchiveWriteError {
    #[error("reading `{key}`: {source}")]
    Source { key: String, source: StorageError },
    #[error("zip encoding: {0}")]
    Zip(#[from] ZipError),
    #[error("streaming entry bytes: {0}")]
    Io(#[from] io::Error),
    #[error("uploading archive: {0}")]
    Upload(StorageError),
    #[error("archive writer task: {0}")]
    Task(#[from] JoinError),
}

impl ArchiveWriteError {
    /// The upload side dropped its end of the channel mid-write.
    fn is_closed_upload(&self) -> bool {
        let io_err = match self {
            ArchiveWriteError::Io(err) | ArchiveWriteError::Zip(ZipError::Io(err)) => err,
            _ => return false,
        };
        io_err.kind() == io::ErrorKind::BrokenPipe
    }
}

/// Stream `entries`, in order, into a ZIP stored at `dest_key`.
///
/// Entries are deflated independently with a fixed timestamp, so identical
/// inputs produce byte-identical archives. On any failure the upload is
/// aborted and no object is left at `dest_key`.
pub async fn write_archive(
    store: Arc<dyn ObjectStore>,
    entries: Vec<ArchiveEntry>,
    dest_key: &str,
) -> Result<StoredObject, ArchiveWriteError> {
    let (tx, mut rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_DEPTH);
    let abort_tx = tx.clone();
    let handle = Handle::current();
    let source = store.clone();
    let entry_count = entries.len();

    let writer = tokio::task::spawn_blocking(move || {
        let result = write_entries(&handle, source.as_ref(), &entries, ChannelWriter::new(tx));
        if let Err(err) = &result {
            // Poison the upload so the partial archive is discarded.
            let _ = abort_tx.blocking_send(Err(io::Error::other(err.to_string())));
        }
        result
    });

    let body: ByteStream = Box::pin(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)));
    let uploaded = store
        .put(dest_key, Some("application/zip".into()), body)
        .await;

    let written = writer.await?;
    let archive = match (uploaded, written) {
        (Ok(archive), Ok(())) => archive,
        // The store gave up first; the writer only saw the closed channel.
        (Err(err), Ok(())) => return Err(ArchiveWriteError::Upload(err)),
        (Err(err), Err(write_err)) if write_err.is_closed_upload() => {
            return Err(ArchiveWriteError::Upload(err));
        }
        (_, Err(write_err)) => return Err(write_err),
    };
    debug!(
        dest_key,
        entries = entry_count,
        size_bytes = archive.size_bytes,
        "archive uploaded"
    );
    Ok(archive)
}

fn write_entries(
    handle: &Handle,
    store: &dyn ObjectStore,
    entries: &[ArchiveEntry],
    sink: ChannelWriter,
) -> Result<(), ArchiveWriteError> {
    let mut zip = ZipWriter::new_stream(sink);
    for entry in entries {
        let (meta, stream) =
            handle
                .block_on(store.get(&entry.key))
                .map_err(|source| ArchiveWriteError::Source {
                    key: entry.key.clone(),
                    source,
                })?;

        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip::DateTime::default())
            .large_file(meta.size_bytes >= ZIP64_THRESHOLD);
        zip.start_file(entry.name.as_str(), options)?;

        let mut reader = SyncIoBridge::new_with_handle(StreamReader::new(stream), handle.clone());
        io::copy(&mut reader, &mut zip)?;
    }
    let mut sink = zip.finish()?;
    sink.flush()?;
    Ok(())
}

/// `io::Write` adapter that batches bytes and forwards them to the upload
/// channel. Must only be used off the async runtime (it blocks on send).
struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
    buf: BytesMut,
}

impl ChannelWriter {
    fn new(tx: mpsc::Sender<io::Result<Bytes>>) -> Self {
        Self {
            tx,
            buf: BytesMut::with_capacity(FLUSH_AT),
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.buf.split().freeze();
        self.tx.blocking_send(Ok(chunk)).map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "archive upload stopped reading")
        })
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= FLUSH_AT {
            self.send_buffered()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        let _ = self.send_buffered();
    }
}
