//! Experiment registry: unique name → stable id.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use crate::error::SnapshotError;
use crate::types::Experiment;

/// Returns the experiment named `name`, creating it if needed.
///
/// Concurrent callers with the same name converge on one row: whoever loses
/// the unique-name race re-reads the winner's row instead of failing.
pub async fn get_or_create(pool: &SqlitePool, name: &str) -> Result<Experiment, SnapshotError> {
    if let Some(existing) = get_by_name(pool, name).await? {
        return Ok(existing);
    }

    let experiment = Experiment {
        id: Uuid::new_v4(),
        name: name.to_string(),
        created_at: Utc::now(),
    };
    let inserted = sqlx::query("INSERT INTO experiments (id, name, created_at) VALUES (?, ?, ?)")
        .bind(experiment.id.to_string())
        .bind(&experiment.name)
        .bind(experiment.created_at)
        .execute(pool)
        .await;

    match inserted {
        Ok(_) => {
            debug!(experiment = %experiment.id, "created experiment {}", name);
            Ok(experiment)
        }
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            debug!("experiment {} created concurrently, re-fetching", name);
            get_by_name(pool, name).await?.ok_or_else(|| {
                SnapshotError::BackendUnavailable(format!(
                    "experiment {} vanished after a unique-name conflict",
                    name
                ))
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// Fetch an experiment by name.
pub async fn get_by_name(
    pool: &SqlitePool,
    name: &str,
) -> Result<Option<Experiment>, SnapshotError> {
    let row = sqlx::query_as::<_, ExperimentRow>(
        "SELECT id, name, created_at FROM experiments WHERE name = ?",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;

    row.map(ExperimentRow::into_experiment).transpose()
}

/// Internal row type for SQLx mapping.
#[derive(sqlx::FromRow)]
struct ExperimentRow {
    id: String,
    name: String,
    created_at: DateTime<Utc>,
}

impl ExperimentRow {
    fn into_experiment(self) -> Result<Experiment, SnapshotError> {
        Ok(Experiment {
            id: parse_id(&self.id)?,
            name: self.name,
            created_at: self.created_at,
        })
    }
}

pub(crate) fn parse_id(raw: &str) -> Result<Uuid, SnapshotError> {
    Uuid::parse_str(raw)
        .map_err(|e| SnapshotError::IntegrityViolation(format!("malformed id {:?}: {}", raw, e)))
}
