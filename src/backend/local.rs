//! Filesystem-backed blob store.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{stream, StreamExt};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::debug;

use super::{BlobBackend, BlobBody, PutOutcome, StoreError};
use crate::types::ContentHash;

const READ_CHUNK: usize = 64 * 1024;
const STAGING_DIR: &str = ".staging";

/// Stores each blob as `<root>/<shard>/<leaf>`.
///
/// Writes land in `<root>/.staging` first and are renamed into place, so a
/// reader never observes a partial file.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn blob_path(&self, hash: &ContentHash) -> PathBuf {
        self.root.join(hash.object_key(""))
    }
}

/// Turns an open file into a [`BlobBody`] read in fixed-size chunks.
pub fn file_body(file: tokio::fs::File) -> BlobBody {
    stream::try_unfold(file, |mut file| async move {
        let mut buf = BytesMut::zeroed(READ_CHUNK);
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok::<_, io::Error>(None);
        }
        buf.truncate(n);
        Ok(Some((buf.freeze(), file)))
    })
    .boxed()
}

#[async_trait]
impl BlobBackend for LocalBackend {
    async fn ensure_bucket(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(self.root.join(STAGING_DIR)).await?;
        Ok(())
    }

    async fn blob_exists(&self, hash: &ContentHash) -> Result<bool, StoreError> {
        Ok(tokio::fs::try_exists(self.blob_path(hash)).await?)
    }

    async fn put_blob(
        &self,
        hash: &ContentHash,
        mut body: BlobBody,
        size: u64,
    ) -> Result<PutOutcome, StoreError> {
        let staging = self.root.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging).await?;

        // Removed on drop unless persisted, including when this future is cancelled.
        let temp = tempfile::NamedTempFile::new_in(&staging)?;
        let mut writer = BufWriter::new(tokio::fs::File::from_std(temp.as_file().try_clone()?));

        let mut written: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk: Bytes = chunk.map_err(StoreError::Body)?;
            written += chunk.len() as u64;
            if written > size {
                return Err(StoreError::Body(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("body exceeds declared size of {} bytes", size),
                )));
            }
            writer.write_all(&chunk).await?;
        }
        if written != size {
            return Err(StoreError::Body(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("body ended after {} of {} bytes", written, size),
            )));
        }
        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        drop(writer);

        let target = self.blob_path(hash);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let outcome = persist(temp, &target, size).await?;
        debug!(hash = %hash, bytes = size, ?outcome, "put blob in {}", self.root.display());
        Ok(outcome)
    }

    async fn get_blob_stream(&self, hash: &ContentHash) -> Result<BlobBody, StoreError> {
        let path = self.blob_path(hash);
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(file_body(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(hash.object_key("")))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }
}

/// Moves a finished temp file into place without replacing an existing object.
async fn persist(
    temp: tempfile::NamedTempFile,
    target: &Path,
    size: u64,
) -> Result<PutOutcome, StoreError> {
    match temp.persist_noclobber(target) {
        Ok(_) => Ok(PutOutcome::Stored),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
            // Dropping the error removes the temp file.
            drop(e);
            let existing = tokio::fs::metadata(target).await?.len();
            if existing != size {
                return Err(StoreError::Conflict(target.display().to_string()));
            }
            Ok(PutOutcome::AlreadyStored)
        }
        Err(e) => Err(StoreError::Io(e.error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;

    fn body(data: &'static [u8]) -> BlobBody {
        stream::iter(vec![Ok(Bytes::from_static(data))]).boxed()
    }

    fn hash(c: char) -> ContentHash {
        ContentHash::parse(&c.to_string().repeat(64)).unwrap()
    }

    #[tokio::test]
    async fn test_put_then_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        backend.ensure_bucket().await.unwrap();

        let h = hash('a');
        assert!(!backend.blob_exists(&h).await.unwrap());
        let outcome = backend.put_blob(&h, body(b"hello"), 5).await.unwrap();
        assert_eq!(outcome, PutOutcome::Stored);
        assert!(backend.blob_exists(&h).await.unwrap());

        let chunks: Vec<Bytes> = backend
            .get_blob_stream(&h)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.concat(), b"hello");
    }

    #[tokio::test]
    async fn test_short_body_leaves_nothing_visible() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());

        let h = hash('b');
        let err = backend.put_blob(&h, body(b"abc"), 10).await.unwrap_err();
        assert!(matches!(err, StoreError::Body(_)));
        assert!(!backend.blob_exists(&h).await.unwrap());

        let staged = std::fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count();
        assert_eq!(staged, 0);
    }

    #[tokio::test]
    async fn test_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let err = backend.get_blob_stream(&hash('c')).await.err().unwrap();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    async fn read_all(backend: &LocalBackend, h: &ContentHash) -> Vec<u8> {
        let chunks: Vec<Bytes> = backend
            .get_blob_stream(h)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_existing_object_is_never_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path());
        let h = hash('d');
        backend.put_blob(&h, body(b"hello"), 5).await.unwrap();

        let same_size = backend.put_blob(&h, body(b"jello"), 5).await.unwrap();
        assert_eq!(same_size, PutOutcome::AlreadyStored);

        let err = backend.put_blob(&h, body(b"HACKED"), 6).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        assert_eq!(read_all(&backend, &h).await, b"hello");
        let staged = std::fs::read_dir(dir.path().join(STAGING_DIR)).unwrap().count();
        assert_eq!(staged, 0);
    }
}
