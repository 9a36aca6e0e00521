//! SnapVault - content-addressed snapshot storage for experiment artifacts
//!
//! This library stores experiment snapshots as manifests over deduplicated,
//! SHA-256 addressed blobs. Blob bytes live in an S3-compatible object store
//! (or a local directory); the blob ledger, experiment registry and snapshot
//! rows live in SQLite.
//!
//! # Features
//!
//! - **Deduplicated Uploads**: Clients ask which hashes are missing and only upload those
//! - **Atomic Snapshots**: A snapshot and its reference counts commit together or not at all
//! - **Streaming Downloads**: Snapshots are rebuilt as tar (or tar.gz) archives on the fly
//! - **Multiple Backends**: AWS S3, MinIO and a local directory store
//! - **Automatic Retry**: Built-in retry logic for transient object store failures
//!
//! # Example
//!
//! ```no_run
//! use snapvault::{ManifestEntry, SnapshotManager, VaultConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = SnapshotManager::connect(&VaultConfig::default()).await?;
//!
//! let hash = "a".repeat(64);
//! let missing = manager.check_blobs(&[hash.clone()]).await?;
//! println!("{} blobs to upload", missing.len());
//!
//! let id = manager
//!     .create_snapshot(
//!         "resnet-sweep",
//!         vec![ManifestEntry { path: "weights.bin".into(), hash, size: 5 }],
//!     )
//!     .await?;
//!
//! let download = manager.prepare_download(id).await?;
//! let mut file = tokio::fs::File::create(&download.filename).await?;
//! download.archive.write_to(&mut file).await?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod backend;
pub mod db;
pub mod error;
pub mod extract;
pub mod manager;
pub mod types;
pub mod verify;

pub use archive::{ArchiveReconstructor, ArchiveStream};
pub use backend::{
    file_body, BlobBackend, BlobBody, LocalBackend, PutOutcome, S3Backend, StoreError,
};
pub use error::{ErrorKind, SnapshotError};
pub use manager::{DownloadHandle, SnapshotManager};
pub use types::{
    ArchiveFormat, BackendConfig, Blob, ContentHash, Experiment, ManifestEntry, RetryPolicy,
    S3Settings, Snapshot, UploadStatus, VaultConfig,
};
pub use verify::{compute_file_sha256, hash_bytes, VerifyingStream};
