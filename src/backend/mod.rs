//! Object store adapters holding blob bytes, addressed only by content hash.

mod local;
mod s3;

pub use local::{file_body, LocalBackend};
pub use s3::S3Backend;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::io;
use std::sync::Arc;
use thiserror::Error;

use crate::types::{BackendConfig, ContentHash, RetryPolicy};

/// A single-pass stream of blob bytes.
pub type BlobBody = BoxStream<'static, io::Result<Bytes>>;

/// Errors raised by object store adapters.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No object under this key.
    #[error("object not found: {0}")]
    NotFound(String),

    /// Store could not be reached or rejected the request transiently.
    #[error("object store unavailable: {0}")]
    Unavailable(String),

    /// The caller-supplied body failed while being read.
    #[error("upload body failed: {0}")]
    Body(io::Error),

    /// Backend settings are unusable.
    #[error("object store misconfigured: {0}")]
    Misconfigured(String),

    /// An object already stored under this key has a different size.
    #[error("object {0} already stored with different contents")]
    Conflict(String),

    /// Local I/O error (spool files, local backend).
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result of [`BlobBackend::put_blob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// This call wrote the object.
    Stored,
    /// An object of the same size was already there and was left untouched.
    AlreadyStored,
}

/// Capability set every blob store provides.
///
/// Implementations must never expose a partially written object: after a
/// failed or abandoned `put_blob`, `blob_exists` keeps returning `false`.
/// A stored object is never overwritten.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Creates the bucket (or root directory) if it does not exist yet.
    async fn ensure_bucket(&self) -> Result<(), StoreError>;

    /// Reports whether a complete object is stored for `hash`.
    async fn blob_exists(&self, hash: &ContentHash) -> Result<bool, StoreError>;

    /// Streams exactly `size` bytes from `body` under the key derived from `hash`.
    ///
    /// If an object already exists under that key it is kept as is: same size
    /// gives `AlreadyStored`, a different size gives `StoreError::Conflict`.
    async fn put_blob(
        &self,
        hash: &ContentHash,
        body: BlobBody,
        size: u64,
    ) -> Result<PutOutcome, StoreError>;

    /// Opens the stored bytes for `hash`.
    async fn get_blob_stream(&self, hash: &ContentHash) -> Result<BlobBody, StoreError>;
}

/// Builds the configured backend. Called once at startup.
pub async fn connect(
    config: &BackendConfig,
    retry: &RetryPolicy,
) -> Result<Arc<dyn BlobBackend>, StoreError> {
    let backend: Arc<dyn BlobBackend> = match config {
        BackendConfig::S3(settings) => Arc::new(S3Backend::aws(settings, retry.clone()).await),
        BackendConfig::Minio(settings) => {
            Arc::new(S3Backend::minio(settings, retry.clone()).await?)
        }
        BackendConfig::Local { root } => Arc::new(LocalBackend::new(root.clone())),
    };
    Ok(backend)
}
