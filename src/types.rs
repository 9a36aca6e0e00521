//! Data structures for snapshot operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::SnapshotError;

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

/// A validated content hash: 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(String);

impl ContentHash {
    /// Parses a client-supplied hash. Uppercase hex is normalized to lowercase.
    pub fn parse(raw: &str) -> Result<Self, SnapshotError> {
        if raw.len() != HASH_HEX_LEN {
            return Err(SnapshotError::Validation(format!(
                "hash must be {} hex characters, got {} characters",
                HASH_HEX_LEN,
                raw.len()
            )));
        }
        if !raw.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SnapshotError::Validation(format!(
                "hash {:?} contains non-hex characters",
                raw
            )));
        }
        Ok(ContentHash(raw.to_ascii_lowercase()))
    }

    /// Builds a hash from raw digest bytes.
    pub fn from_digest(digest: &[u8]) -> Self {
        ContentHash(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Sharded object key: `<prefix>/<first two chars>/<remainder>`.
    pub fn object_key(&self, prefix: &str) -> String {
        let (shard, leaf) = self.0.split_at(2);
        let prefix = prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{}/{}", shard, leaf)
        } else {
            format!("{}/{}/{}", prefix, shard, leaf)
        }
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One file in a snapshot manifest, as submitted by the client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Relative path inside the snapshot.
    pub path: String,
    /// Content hash of the file's bytes.
    pub hash: String,
    /// Size in bytes.
    pub size: i64,
}

/// A recorded blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub hash: ContentHash,
    pub size: u64,
    pub reference_count: u64,
    pub created_at: DateTime<Utc>,
}

/// A named grouping of snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Experiment {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A committed snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub experiment_id: Uuid,
    pub manifest: Vec<ManifestEntry>,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// Sum of all manifest entry sizes.
    pub fn total_size(&self) -> u64 {
        self.manifest.iter().map(|e| e.size.max(0) as u64).sum()
    }
}

/// Outcome of [`crate::SnapshotManager::upload_blob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// Bytes were written and the blob recorded.
    Stored,
    /// The blob was already recorded; the body was not read.
    AlreadyPresent,
}

/// Archive encoding used for downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
pub enum ArchiveFormat {
    /// Plain POSIX tar.
    #[default]
    Tar,
    /// Gzip-compressed tar.
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }
}

/// Retry policy for transient object store failures.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// Delay between attempts in milliseconds.
    pub interval_ms: u64,
    /// Maximum number of retries after the first attempt.
    pub max_retries: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 500,
            max_retries: 3,
        }
    }
}

/// Connection settings for S3-compatible stores.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Settings {
    /// Bucket holding all blobs.
    pub bucket: String,
    /// Region name (MinIO accepts any value).
    pub region: String,
    /// Custom endpoint, required for MinIO (e.g. `http://localhost:9000`).
    pub endpoint: Option<String>,
    /// Static credentials; the default AWS provider chain is used when absent.
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Optional key prefix inside the bucket.
    pub key_prefix: String,
}

/// Which object store holds blob bytes.
#[derive(Debug, Clone, Deserialize)]
pub enum BackendConfig {
    /// Amazon S3 (virtual-hosted addressing).
    S3(S3Settings),
    /// MinIO or another S3-compatible server (path-style addressing).
    Minio(S3Settings),
    /// Local directory, for development and tests.
    Local { root: PathBuf },
}

/// Configuration for a [`crate::SnapshotManager`].
///
/// Built once at startup and passed by reference into every constructor.
///
/// # Example
///
/// ```
/// use snapvault::{BackendConfig, VaultConfig};
///
/// let config = VaultConfig {
///     database_url: "sqlite://vault.db".to_string(),
///     backend: BackendConfig::Local { root: ".blobs".into() },
///     verify_uploads: true,
///     ..VaultConfig::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// SQLite connection string for the ledger (e.g. `sqlite://vault.db`).
    pub database_url: String,
    /// Maximum number of pooled database connections (default: 4).
    pub max_db_connections: u32,
    /// Object store holding blob bytes.
    pub backend: BackendConfig,
    /// Retry policy for transient object store failures.
    pub retry: RetryPolicy,
    /// Recompute SHA-256 during upload and reject mismatching digests (default: false).
    ///
    /// When disabled the claimed hash is trusted as-is; only the size is enforced.
    pub verify_uploads: bool,
    /// Encoding for reconstructed archives.
    pub archive_format: ArchiveFormat,
    /// Number of encoded chunks buffered between the archive producer and its consumer.
    pub download_buffer: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://snapvault.db".to_string(),
            max_db_connections: 4,
            backend: BackendConfig::Local {
                root: PathBuf::from(".snapvault-blobs"),
            },
            retry: RetryPolicy::default(),
            verify_uploads: false,
            archive_format: ArchiveFormat::Tar,
            download_buffer: 16,
        }
    }
}
