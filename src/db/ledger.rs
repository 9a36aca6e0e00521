//! Blob ledger: hash → size and reference count.
//!
//! Inserts are conflict-safe and reference counts only ever move through
//! relative `reference_count + 1` updates, so concurrent uploads and snapshot
//! commits never lose an increment.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::collections::{HashMap, HashSet};

use super::BIND_CHUNK;
use crate::error::SnapshotError;
use crate::types::{Blob, ContentHash};

/// Result of [`record_new_blob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// This call created the row.
    Inserted,
    /// An identical row already existed; nothing changed.
    AlreadyRecorded,
}

/// Returns the hashes in `hashes` with no ledger row, in input order, without duplicates.
pub async fn find_missing(
    pool: &SqlitePool,
    hashes: &[ContentHash],
) -> Result<Vec<ContentHash>, SnapshotError> {
    let mut unique: Vec<&ContentHash> = Vec::with_capacity(hashes.len());
    let mut seen = HashSet::new();
    for hash in hashes {
        if seen.insert(hash) {
            unique.push(hash);
        }
    }

    let mut present: HashSet<String> = HashSet::new();
    for chunk in unique.chunks(BIND_CHUNK) {
        let mut query = QueryBuilder::<Sqlite>::new("SELECT hash FROM blobs WHERE hash IN (");
        let mut separated = query.separated(", ");
        for hash in chunk {
            separated.push_bind(hash.as_str());
        }
        separated.push_unseparated(")");

        let rows: Vec<(String,)> = query.build_query_as().fetch_all(pool).await?;
        present.extend(rows.into_iter().map(|(h,)| h));
    }

    Ok(unique
        .into_iter()
        .filter(|h| !present.contains(h.as_str()))
        .cloned()
        .collect())
}

/// Records a newly stored blob with a reference count of zero.
///
/// A concurrent writer that lost the insert race gets `AlreadyRecorded`; a
/// row for the same hash with a different size is a permanent `Conflict`.
pub async fn record_new_blob(
    pool: &SqlitePool,
    hash: &ContentHash,
    size: u64,
) -> Result<RecordOutcome, SnapshotError> {
    let size = to_db_size(size)?;
    let result = sqlx::query(
        "INSERT INTO blobs (hash, size, reference_count, created_at)
         VALUES (?, ?, 0, ?)
         ON CONFLICT (hash) DO NOTHING",
    )
    .bind(hash.as_str())
    .bind(size)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        return Ok(RecordOutcome::Inserted);
    }

    let recorded: i64 = sqlx::query_scalar("SELECT size FROM blobs WHERE hash = ?")
        .bind(hash.as_str())
        .fetch_one(pool)
        .await?;
    if recorded != size {
        return Err(SnapshotError::Conflict(format!(
            "blob {} already recorded with size {}, not {}",
            hash, recorded, size
        )));
    }
    Ok(RecordOutcome::AlreadyRecorded)
}

/// Adds one reference per entry in `hashes`, inside the caller's transaction.
///
/// A hash listed twice is incremented twice. Returns the hashes that matched
/// no row; callers must roll back when this is non-empty.
pub async fn increment_ref_counts(
    conn: &mut SqliteConnection,
    hashes: &[ContentHash],
) -> Result<Vec<ContentHash>, SnapshotError> {
    let mut missing = Vec::new();
    for hash in hashes {
        let result =
            sqlx::query("UPDATE blobs SET reference_count = reference_count + 1 WHERE hash = ?")
                .bind(hash.as_str())
                .execute(&mut *conn)
                .await?;
        if result.rows_affected() == 0 && !missing.contains(hash) {
            missing.push(hash.clone());
        }
    }
    Ok(missing)
}

/// Recorded sizes for the given hashes. Hashes without a row are omitted.
pub async fn sizes_of(
    conn: &mut SqliteConnection,
    hashes: &[ContentHash],
) -> Result<HashMap<String, u64>, SnapshotError> {
    let mut sizes = HashMap::new();
    for chunk in hashes.chunks(BIND_CHUNK) {
        let mut query =
            QueryBuilder::<Sqlite>::new("SELECT hash, size FROM blobs WHERE hash IN (");
        let mut separated = query.separated(", ");
        for hash in chunk {
            separated.push_bind(hash.as_str());
        }
        separated.push_unseparated(")");

        let rows: Vec<(String, i64)> = query.build_query_as().fetch_all(&mut *conn).await?;
        sizes.extend(rows.into_iter().map(|(h, s)| (h, s.max(0) as u64)));
    }
    Ok(sizes)
}

/// Fetch a blob by hash.
pub async fn get(pool: &SqlitePool, hash: &ContentHash) -> Result<Option<Blob>, SnapshotError> {
    let row = sqlx::query_as::<_, BlobRow>(
        "SELECT hash, size, reference_count, created_at FROM blobs WHERE hash = ?",
    )
    .bind(hash.as_str())
    .fetch_optional(pool)
    .await?;

    row.map(BlobRow::into_blob).transpose()
}

fn to_db_size(size: u64) -> Result<i64, SnapshotError> {
    i64::try_from(size)
        .map_err(|_| SnapshotError::Validation(format!("size {} is out of range", size)))
}

/// Internal row type for SQLx mapping.
#[derive(sqlx::FromRow)]
struct BlobRow {
    hash: String,
    size: i64,
    reference_count: i64,
    created_at: DateTime<Utc>,
}

impl BlobRow {
    fn into_blob(self) -> Result<Blob, SnapshotError> {
        let hash = ContentHash::parse(&self.hash).map_err(|_| {
            SnapshotError::IntegrityViolation(format!(
                "ledger holds malformed hash {:?}",
                self.hash
            ))
        })?;
        Ok(Blob {
            hash,
            size: self.size.max(0) as u64,
            reference_count: self.reference_count.max(0) as u64,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn hash(c: char) -> ContentHash {
        ContentHash::parse(&c.to_string().repeat(64)).unwrap()
    }

    #[tokio::test]
    async fn test_find_missing_preserves_order_and_dedups() {
        let (_dir, pool) = test_pool().await;
        record_new_blob(&pool, &hash('b'), 3).await.unwrap();

        let missing = find_missing(&pool, &[hash('c'), hash('b'), hash('a'), hash('c')])
            .await
            .unwrap();
        assert_eq!(missing, vec![hash('c'), hash('a')]);
    }

    #[tokio::test]
    async fn test_find_missing_empty_input() {
        let (_dir, pool) = test_pool().await;
        assert!(find_missing(&pool, &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_is_idempotent_for_same_size() {
        let (_dir, pool) = test_pool().await;
        let h = hash('a');
        assert_eq!(
            record_new_blob(&pool, &h, 5).await.unwrap(),
            RecordOutcome::Inserted
        );
        assert_eq!(
            record_new_blob(&pool, &h, 5).await.unwrap(),
            RecordOutcome::AlreadyRecorded
        );

        let blob = get(&pool, &h).await.unwrap().unwrap();
        assert_eq!(blob.size, 5);
        assert_eq!(blob.reference_count, 0);
    }

    #[tokio::test]
    async fn test_record_with_different_size_conflicts() {
        let (_dir, pool) = test_pool().await;
        let h = hash('a');
        record_new_blob(&pool, &h, 5).await.unwrap();

        let err = record_new_blob(&pool, &h, 6).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Conflict(_)));
        assert_eq!(get(&pool, &h).await.unwrap().unwrap().size, 5);
    }

    #[tokio::test]
    async fn test_increment_counts_each_entry() {
        let (_dir, pool) = test_pool().await;
        let h = hash('a');
        record_new_blob(&pool, &h, 1).await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        let missing = increment_ref_counts(&mut tx, &[h.clone(), h.clone(), hash('f')])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(missing, vec![hash('f')]);
        assert_eq!(get(&pool, &h).await.unwrap().unwrap().reference_count, 2);
    }

    #[tokio::test]
    async fn test_rolled_back_increment_leaves_count() {
        let (_dir, pool) = test_pool().await;
        let h = hash('a');
        record_new_blob(&pool, &h, 1).await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        increment_ref_counts(&mut tx, &[h.clone()]).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(get(&pool, &h).await.unwrap().unwrap().reference_count, 0);
    }
}
