//! Upload body verification and file hashing.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::backend::BlobBody;
use crate::error::SnapshotError;
use crate::types::ContentHash;

/// Wraps an upload body, failing it with `InvalidData` if it yields more or
/// fewer than `expected_size` bytes, or (when a digest is supplied) if the
/// bytes do not hash to it.
///
/// The failure surfaces as the stream's final item, so a backend consuming it
/// aborts before committing anything.
pub struct VerifyingStream {
    inner: BlobBody,
    expected_size: u64,
    seen: u64,
    digest: Option<(Sha256, ContentHash)>,
    done: bool,
}

impl VerifyingStream {
    pub fn new(inner: BlobBody, expected_size: u64, expected_hash: Option<ContentHash>) -> Self {
        Self {
            inner,
            expected_size,
            seen: 0,
            digest: expected_hash.map(|h| (Sha256::new(), h)),
            done: false,
        }
    }

    pub fn boxed(self) -> BlobBody {
        StreamExt::boxed(self)
    }

    fn finish(&mut self) -> Option<io::Error> {
        if self.seen != self.expected_size {
            return Some(invalid(format!(
                "body ended after {} of {} declared bytes",
                self.seen, self.expected_size
            )));
        }
        if let Some((hasher, expected)) = self.digest.take() {
            let actual = ContentHash::from_digest(&hasher.finalize());
            if actual != expected {
                return Some(invalid(format!(
                    "content hashes to {}, not {}",
                    actual, expected
                )));
            }
        }
        None
    }
}

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl Stream for VerifyingStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                this.seen += chunk.len() as u64;
                if this.seen > this.expected_size {
                    this.done = true;
                    return Poll::Ready(Some(Err(invalid(format!(
                        "body exceeds declared size of {} bytes",
                        this.expected_size
                    )))));
                }
                if let Some((hasher, _)) = this.digest.as_mut() {
                    hasher.update(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(this.finish().map(Err))
            }
        }
    }
}

/// Computes the SHA-256 content hash and size of a local file.
///
/// This function reads the file in chunks to avoid loading large files
/// entirely into memory. It runs in a blocking task to avoid blocking
/// the async runtime.
pub async fn compute_file_sha256(path: &Path) -> Result<(ContentHash, u64), SnapshotError> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        use std::io::Read;

        let file = std::fs::File::open(&path)?;
        let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 1024 * 1024];
        let mut size = 0u64;

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            size += n as u64;
        }

        Ok::<_, SnapshotError>((ContentHash::from_digest(&hasher.finalize()), size))
    })
    .await
    .map_err(|e| SnapshotError::IoError(io::Error::other(format!("Task join error: {}", e))))?
}

/// SHA-256 content hash of an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    ContentHash::from_digest(&Sha256::digest(data))
}
