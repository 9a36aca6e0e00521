//! Archive reconstruction: streams a snapshot's manifest as a tar archive.
//!
//! A producer task fetches each blob in manifest order and pushes encoded
//! chunks through a bounded channel; the consumer sees a lazy, single-pass
//! [`ArchiveStream`]. Dropping the stream, whether fully consumed or not,
//! aborts the producer and releases any blob stream it holds.

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::{Stream, StreamExt};
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backend::{BlobBackend, StoreError};
use crate::error::SnapshotError;
use crate::types::{ArchiveFormat, ContentHash, ManifestEntry, Snapshot};

const TAR_BLOCK: u64 = 512;

/// Builds archives for committed snapshots.
#[derive(Clone)]
pub struct ArchiveReconstructor {
    backend: Arc<dyn BlobBackend>,
    format: ArchiveFormat,
    buffer: usize,
}

impl ArchiveReconstructor {
    pub fn new(backend: Arc<dyn BlobBackend>, format: ArchiveFormat, buffer: usize) -> Self {
        Self {
            backend,
            format,
            buffer: buffer.max(1),
        }
    }

    pub fn format(&self) -> ArchiveFormat {
        self.format
    }

    /// Starts producing the archive for `snapshot`. The producer runs ahead of
    /// the consumer by at most `buffer` encoded chunks.
    pub fn stream(&self, snapshot: &Snapshot) -> ArchiveStream {
        let (tx, rx) = mpsc::channel(self.buffer);
        let producer = Producer {
            backend: Arc::clone(&self.backend),
            manifest: snapshot.manifest.clone(),
            mtime: snapshot.created_at.timestamp().max(0) as u64,
            encoder: TarEncoder::new(self.format),
            tx,
        };
        let snapshot_id = snapshot.id;
        let handle = tokio::spawn(async move {
            producer.run(snapshot_id).await;
        });

        ArchiveStream {
            rx,
            staging: StagingGuard {
                producer: handle,
                snapshot_id,
            },
        }
    }
}

/// Lazy archive byte stream. Yields `IntegrityViolation` and ends if a blob
/// cannot be read back at its recorded size.
#[derive(Debug)]
pub struct ArchiveStream {
    rx: mpsc::Receiver<Result<Bytes, SnapshotError>>,
    staging: StagingGuard,
}

impl ArchiveStream {
    /// Drains the archive into `writer`, returning the number of bytes written.
    pub async fn write_to<W>(mut self, writer: &mut W) -> Result<u64, SnapshotError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut total = 0u64;
        while let Some(chunk) = self.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            total += chunk.len() as u64;
        }
        writer.flush().await?;
        Ok(total)
    }

    /// Snapshot this archive is being built from.
    pub fn snapshot_id(&self) -> Uuid {
        self.staging.snapshot_id
    }
}

impl Stream for ArchiveStream {
    type Item = Result<Bytes, SnapshotError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Owns the producer task; released exactly once when the stream is dropped.
#[derive(Debug)]
struct StagingGuard {
    producer: JoinHandle<()>,
    snapshot_id: Uuid,
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if !self.producer.is_finished() {
            debug!(snapshot = %self.snapshot_id, "archive consumer went away, aborting producer");
        }
        self.producer.abort();
        debug!(snapshot = %self.snapshot_id, "released archive staging");
    }
}

/// Why the producer stopped early.
enum Halt {
    Failed(SnapshotError),
    ConsumerGone,
}

impl From<SnapshotError> for Halt {
    fn from(err: SnapshotError) -> Self {
        Halt::Failed(err)
    }
}

impl From<io::Error> for Halt {
    fn from(err: io::Error) -> Self {
        Halt::Failed(SnapshotError::IoError(err))
    }
}

struct Producer {
    backend: Arc<dyn BlobBackend>,
    manifest: Vec<ManifestEntry>,
    mtime: u64,
    encoder: TarEncoder,
    tx: mpsc::Sender<Result<Bytes, SnapshotError>>,
}

impl Producer {
    async fn run(mut self, snapshot_id: Uuid) {
        let outcome = self.write_all_entries().await;
        match outcome {
            Ok(()) => debug!(snapshot = %snapshot_id, "archive fully produced"),
            Err(Halt::ConsumerGone) => {
                debug!(snapshot = %snapshot_id, "archive consumer closed early")
            }
            Err(Halt::Failed(err)) => {
                warn!(snapshot = %snapshot_id, "archive reconstruction failed: {}", err);
                let _ = self.tx.send(Err(err)).await;
            }
        }
    }

    async fn write_all_entries(&mut self) -> Result<(), Halt> {
        let manifest = std::mem::take(&mut self.manifest);
        for entry in &manifest {
            self.write_entry(entry).await?;
        }
        let trailer = std::mem::replace(&mut self.encoder, TarEncoder::new(ArchiveFormat::Tar))
            .finish()?;
        send(&self.tx, trailer).await
    }

    async fn write_entry(&mut self, entry: &ManifestEntry) -> Result<(), Halt> {
        let hash = ContentHash::parse(&entry.hash).map_err(|_| {
            SnapshotError::IntegrityViolation(format!(
                "manifest entry {} holds malformed hash {:?}",
                entry.path, entry.hash
            ))
        })?;
        let size = u64::try_from(entry.size).map_err(|_| {
            SnapshotError::IntegrityViolation(format!(
                "manifest entry {} holds negative size {}",
                entry.path, entry.size
            ))
        })?;

        let mut body = match self.backend.get_blob_stream(&hash).await {
            Ok(body) => body,
            Err(StoreError::NotFound(_)) => {
                return Err(SnapshotError::IntegrityViolation(format!(
                    "blob {} for {} is recorded but missing from the object store",
                    hash, entry.path
                ))
                .into())
            }
            Err(err) => return Err(SnapshotError::from(err).into()),
        };

        let header = self.encoder.entry_header(&entry.path, size, self.mtime)?;
        send(&self.tx, header).await?;

        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| {
                SnapshotError::BackendUnavailable(format!("reading blob {}: {}", hash, e))
            })?;
            written += chunk.len() as u64;
            if written > size {
                return Err(SnapshotError::IntegrityViolation(format!(
                    "blob {} for {} is longer than its recorded {} bytes",
                    hash, entry.path, size
                ))
                .into());
            }
            let encoded = self.encoder.data(chunk)?;
            send(&self.tx, encoded).await?;
        }
        if written != size {
            return Err(SnapshotError::IntegrityViolation(format!(
                "blob {} for {} ended after {} of {} bytes",
                hash, entry.path, written, size
            ))
            .into());
        }

        let padding = self.encoder.padding(size)?;
        send(&self.tx, padding).await
    }
}

async fn send(tx: &mpsc::Sender<Result<Bytes, SnapshotError>>, chunk: Bytes) -> Result<(), Halt> {
    if chunk.is_empty() {
        return Ok(());
    }
    tx.send(Ok(chunk)).await.map_err(|_| Halt::ConsumerGone)
}

/// Incremental tar writer. Headers come from `tar::Builder` (so long paths get
/// GNU long-name records); file bodies are passed through untouched and padded
/// to the block size here.
struct TarEncoder {
    headers: tar::Builder<Vec<u8>>,
    gzip: Option<GzEncoder<Vec<u8>>>,
}

impl TarEncoder {
    fn new(format: ArchiveFormat) -> Self {
        let gzip = match format {
            ArchiveFormat::Tar => None,
            ArchiveFormat::TarGz => Some(GzEncoder::new(Vec::new(), Compression::default())),
        };
        Self {
            headers: tar::Builder::new(Vec::new()),
            gzip,
        }
    }

    fn entry_header(&mut self, path: &str, size: u64, mtime: u64) -> io::Result<Bytes> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(size);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        // With an empty reader the builder emits only the header block(s).
        self.headers.append_data(&mut header, path, io::empty())?;
        let raw = std::mem::take(self.headers.get_mut());
        self.encode(&raw)
    }

    fn data(&mut self, chunk: Bytes) -> io::Result<Bytes> {
        match self.gzip {
            None => Ok(chunk),
            Some(_) => self.encode(&chunk),
        }
    }

    fn padding(&mut self, size: u64) -> io::Result<Bytes> {
        let pad = ((TAR_BLOCK - size % TAR_BLOCK) % TAR_BLOCK) as usize;
        self.encode(&vec![0u8; pad])
    }

    fn finish(self) -> io::Result<Bytes> {
        let TarEncoder { headers, gzip } = self;
        let trailer = headers.into_inner()?;
        match gzip {
            None => Ok(Bytes::from(trailer)),
            Some(mut gz) => {
                gz.write_all(&trailer)?;
                Ok(Bytes::from(gz.finish()?))
            }
        }
    }

    fn encode(&mut self, raw: &[u8]) -> io::Result<Bytes> {
        match self.gzip.as_mut() {
            None => Ok(Bytes::copy_from_slice(raw)),
            Some(gz) => {
                gz.write_all(raw)?;
                Ok(Bytes::from(std::mem::take(gz.get_mut())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BlobBody, LocalBackend};
    use crate::verify::hash_bytes;
    use chrono::Utc;
    use flate2::read::GzDecoder;
    use futures_util::stream;
    use std::io::Read;

    async fn store(backend: &LocalBackend, data: &'static [u8]) -> ContentHash {
        let hash = hash_bytes(data);
        let body: BlobBody = stream::iter(vec![Ok(Bytes::from_static(data))]).boxed();
        backend
            .put_blob(&hash, body, data.len() as u64)
            .await
            .unwrap();
        hash
    }

    fn snapshot(entries: Vec<(&str, &ContentHash, i64)>) -> Snapshot {
        Snapshot {
            id: Uuid::new_v4(),
            experiment_id: Uuid::new_v4(),
            manifest: entries
                .into_iter()
                .map(|(path, hash, size)| ManifestEntry {
                    path: path.to_string(),
                    hash: hash.to_string(),
                    size,
                })
                .collect(),
            created_at: Utc::now(),
        }
    }

    async fn collect(stream: ArchiveStream) -> Result<Vec<u8>, SnapshotError> {
        let mut out = Vec::new();
        stream.write_to(&mut out).await?;
        Ok(out)
    }

    fn entries(archive: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut archive = tar::Archive::new(archive);
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let mut e = e.unwrap();
                let path = e.path().unwrap().to_string_lossy().into_owned();
                let mut data = Vec::new();
                e.read_to_end(&mut data).unwrap();
                (path, data)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_archive_reproduces_manifest_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let a = store(&backend, b"hello").await;
        let b = store(&backend, b"").await;
        let long_path = format!("{}/deep.txt", "nested".repeat(30));

        let snap = snapshot(vec![
            ("z.txt", &a, 5),
            ("dir/empty.bin", &b, 0),
            (long_path.as_str(), &a, 5),
        ]);
        let reconstructor = ArchiveReconstructor::new(Arc::new(backend), ArchiveFormat::Tar, 2);
        let bytes = collect(reconstructor.stream(&snap)).await.unwrap();

        assert_eq!(
            entries(&bytes),
            vec![
                ("z.txt".to_string(), b"hello".to_vec()),
                ("dir/empty.bin".to_string(), Vec::new()),
                (long_path, b"hello".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_gzip_archive_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let a = store(&backend, b"compressed content").await;

        let snap = snapshot(vec![("a.txt", &a, 18)]);
        let reconstructor = ArchiveReconstructor::new(Arc::new(backend), ArchiveFormat::TarGz, 4);
        let gz = collect(reconstructor.stream(&snap)).await.unwrap();

        let mut tar_bytes = Vec::new();
        GzDecoder::new(&gz[..]).read_to_end(&mut tar_bytes).unwrap();
        assert_eq!(
            entries(&tar_bytes),
            vec![("a.txt".to_string(), b"compressed content".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_missing_blob_is_integrity_violation() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let a = store(&backend, b"hello").await;
        let ghost = hash_bytes(b"never stored");

        let snap = snapshot(vec![("a.txt", &a, 5), ("ghost.txt", &ghost, 12)]);
        let reconstructor = ArchiveReconstructor::new(Arc::new(backend), ArchiveFormat::Tar, 4);
        let err = collect(reconstructor.stream(&snap)).await.unwrap_err();
        assert!(matches!(err, SnapshotError::IntegrityViolation(_)));
    }

    #[tokio::test]
    async fn test_size_disagreement_is_integrity_violation() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let a = store(&backend, b"hello").await;

        let reconstructor = ArchiveReconstructor::new(Arc::new(backend), ArchiveFormat::Tar, 4);
        let longer = snapshot(vec![("a.txt", &a, 9)]);
        let err = collect(reconstructor.stream(&longer)).await.unwrap_err();
        assert!(matches!(err, SnapshotError::IntegrityViolation(_)));

        let shorter = snapshot(vec![("a.txt", &a, 3)]);
        let err = collect(reconstructor.stream(&shorter)).await.unwrap_err();
        assert!(matches!(err, SnapshotError::IntegrityViolation(_)));
    }
}
