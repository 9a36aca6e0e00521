//! Snapshot persistence operations.

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use super::experiments::parse_id;
use crate::error::SnapshotError;
use crate::types::{ManifestEntry, Snapshot};

/// Insert a snapshot row. Must run inside the transaction that increments
/// the reference counts of its manifest.
pub async fn insert(conn: &mut SqliteConnection, snapshot: &Snapshot) -> Result<(), SnapshotError> {
    sqlx::query(
        "INSERT INTO snapshots (id, experiment_id, manifest, file_count, total_size, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(snapshot.id.to_string())
    .bind(snapshot.experiment_id.to_string())
    .bind(Json(&snapshot.manifest))
    .bind(snapshot.manifest.len() as i64)
    .bind(i64::try_from(snapshot.total_size()).unwrap_or(i64::MAX))
    .bind(snapshot.created_at)
    .execute(conn)
    .await?;

    Ok(())
}

/// Fetch a snapshot by ID.
pub async fn get_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Snapshot>, SnapshotError> {
    let row = sqlx::query_as::<_, SnapshotRow>(
        "SELECT id, experiment_id, manifest, created_at FROM snapshots WHERE id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;

    row.map(SnapshotRow::into_snapshot).transpose()
}

/// List snapshots of an experiment, newest first.
pub async fn list_by_experiment(
    pool: &SqlitePool,
    experiment_id: Uuid,
) -> Result<Vec<Snapshot>, SnapshotError> {
    let rows = sqlx::query_as::<_, SnapshotRow>(
        "SELECT id, experiment_id, manifest, created_at
         FROM snapshots WHERE experiment_id = ? ORDER BY created_at DESC, id",
    )
    .bind(experiment_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(SnapshotRow::into_snapshot).collect()
}

/// Internal row type for SQLx mapping.
#[derive(sqlx::FromRow)]
struct SnapshotRow {
    id: String,
    experiment_id: String,
    manifest: Json<Vec<ManifestEntry>>,
    created_at: DateTime<Utc>,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<Snapshot, SnapshotError> {
        Ok(Snapshot {
            id: parse_id(&self.id)?,
            experiment_id: parse_id(&self.experiment_id)?,
            manifest: self.manifest.0,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{experiments, test_pool};
    use chrono::Duration;

    fn entry(path: &str, c: char, size: i64) -> ManifestEntry {
        ManifestEntry {
            path: path.to_string(),
            hash: c.to_string().repeat(64),
            size,
        }
    }

    #[tokio::test]
    async fn test_insert_then_get_preserves_manifest_order() {
        let (_dir, pool) = test_pool().await;
        let exp = experiments::get_or_create(&pool, "exp").await.unwrap();
        let snapshot = Snapshot {
            id: Uuid::new_v4(),
            experiment_id: exp.id,
            manifest: vec![entry("z.txt", 'a', 3), entry("a/b.txt", 'b', 0)],
            created_at: Utc::now(),
        };

        let mut conn = pool.acquire().await.unwrap();
        insert(&mut conn, &snapshot).await.unwrap();
        drop(conn);

        let loaded = get_by_id(&pool, snapshot.id).await.unwrap().unwrap();
        assert_eq!(loaded.experiment_id, exp.id);
        assert_eq!(loaded.manifest, snapshot.manifest);
        assert!(get_by_id(&pool, Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_is_newest_first() {
        let (_dir, pool) = test_pool().await;
        let exp = experiments::get_or_create(&pool, "exp").await.unwrap();
        let other = experiments::get_or_create(&pool, "other").await.unwrap();
        let now = Utc::now();

        let mut conn = pool.acquire().await.unwrap();
        let mut ids = Vec::new();
        for (offset, experiment_id) in [(0, exp.id), (1, exp.id), (2, other.id)] {
            let snapshot = Snapshot {
                id: Uuid::new_v4(),
                experiment_id,
                manifest: vec![entry("f", 'c', 1)],
                created_at: now + Duration::seconds(offset),
            };
            insert(&mut conn, &snapshot).await.unwrap();
            ids.push(snapshot.id);
        }
        drop(conn);

        let listed: Vec<Uuid> = list_by_experiment(&pool, exp.id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(listed, vec![ids[1], ids[0]]);
    }
}
