//! Snapshot manager: blob ingestion, snapshot commit and download preparation.

use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::HashSet;
use std::path::{Component, Path};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::archive::{ArchiveReconstructor, ArchiveStream};
use crate::backend::{self, BlobBackend, BlobBody, PutOutcome};
use crate::db::{self, experiments, ledger, snapshots};
use crate::error::SnapshotError;
use crate::types::{
    Blob, ContentHash, Experiment, ManifestEntry, Snapshot, UploadStatus, VaultConfig,
};
use crate::verify::VerifyingStream;

const MAX_EXPERIMENT_NAME: usize = 255;

/// A prepared download: suggested filename plus the lazily built archive.
#[derive(Debug)]
pub struct DownloadHandle {
    pub filename: String,
    pub archive: ArchiveStream,
}

/// Orchestrates the ledger, the experiment registry and the object store.
///
/// Cheap to clone; every clone shares the same pool and backend.
#[derive(Clone)]
pub struct SnapshotManager {
    pool: SqlitePool,
    backend: Arc<dyn BlobBackend>,
    reconstructor: ArchiveReconstructor,
    verify_uploads: bool,
}

impl SnapshotManager {
    /// Assembles a manager from already-initialised parts.
    pub fn new(pool: SqlitePool, backend: Arc<dyn BlobBackend>, config: &VaultConfig) -> Self {
        let reconstructor = ArchiveReconstructor::new(
            Arc::clone(&backend),
            config.archive_format,
            config.download_buffer,
        );
        Self {
            pool,
            backend,
            reconstructor,
            verify_uploads: config.verify_uploads,
        }
    }

    /// Opens the ledger, connects the configured backend and ensures its bucket exists.
    pub async fn connect(config: &VaultConfig) -> Result<Self, SnapshotError> {
        let pool = db::connect(&config.database_url, config.max_db_connections).await?;
        let backend = backend::connect(&config.backend, &config.retry).await?;
        backend.ensure_bucket().await?;
        info!("Snapshot manager ready");
        Ok(Self::new(pool, backend, config))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn backend(&self) -> &Arc<dyn BlobBackend> {
        &self.backend
    }

    /// Returns the hashes with no stored blob. Has no side effects.
    pub async fn check_blobs(&self, hashes: &[String]) -> Result<Vec<String>, SnapshotError> {
        let parsed = parse_hashes(hashes)?;
        let missing = ledger::find_missing(&self.pool, &parsed).await?;
        debug!(
            requested = hashes.len(),
            missing = missing.len(),
            "checked blobs"
        );
        Ok(missing.into_iter().map(|h| h.to_string()).collect())
    }

    /// Stores a blob unless it is already recorded.
    ///
    /// Bytes go to the object store first; the ledger row is written only
    /// after the store confirms, so an abandoned upload is never visible.
    pub async fn upload_blob(
        &self,
        hash: &str,
        body: BlobBody,
        declared_size: i64,
    ) -> Result<UploadStatus, SnapshotError> {
        let hash = ContentHash::parse(hash)?;
        let size = u64::try_from(declared_size).map_err(|_| {
            SnapshotError::Validation(format!("size must be non-negative, got {}", declared_size))
        })?;

        if let Some(existing) = ledger::get(&self.pool, &hash).await? {
            if existing.size != size {
                return Err(SnapshotError::Conflict(format!(
                    "blob {} is recorded with size {}, upload declares {}",
                    hash, existing.size, size
                )));
            }
            debug!(hash = %hash, "blob already present, skipping transfer");
            return Ok(UploadStatus::AlreadyPresent);
        }

        let expected = self.verify_uploads.then(|| hash.clone());
        let verified = VerifyingStream::new(body, size, expected).boxed();
        // An object already in the store is kept; a size clash surfaces as Conflict.
        if self.backend.put_blob(&hash, verified, size).await? == PutOutcome::AlreadyStored {
            debug!(hash = %hash, "object store already held blob, recording it");
        }

        match ledger::record_new_blob(&self.pool, &hash, size).await? {
            ledger::RecordOutcome::Inserted => {
                info!(hash = %hash, bytes = size, "stored new blob");
            }
            ledger::RecordOutcome::AlreadyRecorded => {
                debug!(hash = %hash, "concurrent upload recorded blob first");
            }
        }
        Ok(UploadStatus::Stored)
    }

    /// Commits a snapshot of `manifest` under `experiment_name`.
    ///
    /// Either the snapshot row and every reference-count increment commit
    /// together, or nothing changes.
    pub async fn create_snapshot(
        &self,
        experiment_name: &str,
        manifest: Vec<ManifestEntry>,
    ) -> Result<Uuid, SnapshotError> {
        validate_experiment_name(experiment_name)?;
        let hashes = validate_manifest(&manifest)?;
        let manifest: Vec<ManifestEntry> = manifest
            .into_iter()
            .zip(&hashes)
            .map(|(entry, hash)| ManifestEntry {
                hash: hash.to_string(),
                ..entry
            })
            .collect();

        // Sizes never change once recorded, so checking outside the
        // transaction is authoritative and keeps rejected manifests from
        // creating the experiment.
        let recorded = {
            let mut conn = self.pool.acquire().await?;
            ledger::sizes_of(&mut conn, &hashes).await?
        };
        let mut missing: Vec<String> = Vec::new();
        for hash in &hashes {
            if !recorded.contains_key(hash.as_str())
                && !missing.iter().any(|m| m == hash.as_str())
            {
                missing.push(hash.to_string());
            }
        }
        if !missing.is_empty() {
            warn!(
                experiment = experiment_name,
                missing = missing.len(),
                "rejecting snapshot with unstored blobs"
            );
            return Err(SnapshotError::MissingBlobs(missing));
        }
        for entry in &manifest {
            let size = recorded.get(&entry.hash).copied().unwrap_or_default();
            if size != entry.size as u64 {
                return Err(SnapshotError::Validation(format!(
                    "{} declares size {} but blob {} is recorded with size {}",
                    entry.path, entry.size, entry.hash, size
                )));
            }
        }

        let experiment = experiments::get_or_create(&self.pool, experiment_name).await?;
        let snapshot = Snapshot {
            id: Uuid::new_v4(),
            experiment_id: experiment.id,
            manifest,
            created_at: Utc::now(),
        };

        // Write first so SQLite takes the write lock before any read.
        let mut tx = self.pool.begin().await?;
        snapshots::insert(&mut tx, &snapshot).await?;

        let unresolved = ledger::increment_ref_counts(&mut tx, &hashes).await?;
        if !unresolved.is_empty() {
            tx.rollback().await?;
            return Err(SnapshotError::MissingBlobs(
                unresolved.into_iter().map(|h| h.to_string()).collect(),
            ));
        }

        tx.commit().await?;
        info!(
            snapshot = %snapshot.id,
            experiment = %experiment.name,
            files = snapshot.manifest.len(),
            bytes = snapshot.total_size(),
            "committed snapshot"
        );
        Ok(snapshot.id)
    }

    /// Starts reconstructing the archive for a snapshot.
    pub async fn prepare_download(
        &self,
        snapshot_id: Uuid,
    ) -> Result<DownloadHandle, SnapshotError> {
        let snapshot = self.get_snapshot(snapshot_id).await?;
        let filename = format!(
            "snapshot-{}.{}",
            snapshot.id,
            self.reconstructor.format().extension()
        );
        info!(snapshot = %snapshot.id, files = snapshot.manifest.len(), "preparing download");
        Ok(DownloadHandle {
            filename,
            archive: self.reconstructor.stream(&snapshot),
        })
    }

    /// Fetch a committed snapshot.
    pub async fn get_snapshot(&self, snapshot_id: Uuid) -> Result<Snapshot, SnapshotError> {
        snapshots::get_by_id(&self.pool, snapshot_id)
            .await?
            .ok_or_else(|| SnapshotError::NotFound(format!("snapshot {}", snapshot_id)))
    }

    /// Snapshots of an experiment, newest first.
    pub async fn list_snapshots(
        &self,
        experiment_name: &str,
    ) -> Result<(Experiment, Vec<Snapshot>), SnapshotError> {
        let experiment = experiments::get_by_name(&self.pool, experiment_name)
            .await?
            .ok_or_else(|| SnapshotError::NotFound(format!("experiment {}", experiment_name)))?;
        let snapshots = snapshots::list_by_experiment(&self.pool, experiment.id).await?;
        Ok((experiment, snapshots))
    }

    /// Ledger record for a hash.
    pub async fn blob(&self, hash: &str) -> Result<Option<Blob>, SnapshotError> {
        let hash = ContentHash::parse(hash)?;
        ledger::get(&self.pool, &hash).await
    }
}

fn parse_hashes(raw: &[String]) -> Result<Vec<ContentHash>, SnapshotError> {
    raw.iter().map(|h| ContentHash::parse(h)).collect()
}

fn validate_experiment_name(name: &str) -> Result<(), SnapshotError> {
    if name.trim().is_empty() {
        return Err(SnapshotError::Validation(
            "experiment name must not be blank".to_string(),
        ));
    }
    if name.len() > MAX_EXPERIMENT_NAME {
        return Err(SnapshotError::Validation(format!(
            "experiment name exceeds {} bytes",
            MAX_EXPERIMENT_NAME
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(SnapshotError::Validation(
            "experiment name contains control characters".to_string(),
        ));
    }
    Ok(())
}

/// Checks a manifest and returns its hashes in manifest order.
fn validate_manifest(manifest: &[ManifestEntry]) -> Result<Vec<ContentHash>, SnapshotError> {
    if manifest.is_empty() {
        return Err(SnapshotError::Validation(
            "manifest must list at least one file".to_string(),
        ));
    }

    let mut paths = HashSet::with_capacity(manifest.len());
    let mut hashes = Vec::with_capacity(manifest.len());
    for entry in manifest {
        validate_path(&entry.path)?;
        if !paths.insert(entry.path.as_str()) {
            return Err(SnapshotError::Validation(format!(
                "duplicate manifest path {}",
                entry.path
            )));
        }
        if entry.size < 0 {
            return Err(SnapshotError::Validation(format!(
                "{} has negative size {}",
                entry.path, entry.size
            )));
        }
        hashes.push(ContentHash::parse(&entry.hash)?);
    }
    Ok(hashes)
}

/// Accepts only normalized relative paths that stay under the archive root.
pub(crate) fn validate_path(path: &str) -> Result<(), SnapshotError> {
    let reject = |why: &str| {
        Err(SnapshotError::Validation(format!(
            "invalid manifest path {:?}: {}",
            path, why
        )))
    };

    if path.is_empty() {
        return reject("empty");
    }
    if path.contains('\0') {
        return reject("contains NUL");
    }
    if path.contains('\\') {
        return reject("contains a backslash");
    }
    if path.starts_with('/') {
        return reject("absolute");
    }
    if path.split('/').any(|part| part.is_empty() || part == ".") {
        return reject("empty or '.' component");
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) => {}
            Component::ParentDir => return reject("escapes the snapshot root"),
            _ => return reject("not a plain relative path"),
        }
    }
    Ok(())
}
