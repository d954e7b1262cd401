//! Run History Repository
//!
//! Persists pipeline run snapshots and reads them back as summaries.

use conveyor_core::domain::pipeline::PipelineRun;
use conveyor_core::dto::pipeline::PipelineSummary;
use sqlx::PgPool;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Insert or replace the snapshot of a run
///
/// A row that already holds a finished run is never overwritten.
pub async fn save(pool: &PgPool, run: &PipelineRun) -> Result<(), sqlx::Error> {
    let snapshot = serde_json::to_value(run).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

    sqlx::query(
        r#"
        INSERT INTO pipeline_runs (id, name, status, created_at, started_at, completed_at, snapshot)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (id) DO UPDATE
        SET status = EXCLUDED.status,
            started_at = EXCLUDED.started_at,
            completed_at = EXCLUDED.completed_at,
            snapshot = EXCLUDED.snapshot
        WHERE pipeline_runs.completed_at IS NULL
        "#,
    )
    .bind(run.id)
    .bind(&run.name)
    .bind(run.status.to_string())
    .bind(run.created_at)
    .bind(run.started_at)
    .bind(run.completed_at)
    .bind(snapshot)
    .execute(pool)
    .await?;

    Ok(())
}

/// Runs of the pipeline named `name`, newest first
pub async fn find_by_name(pool: &PgPool, name: &str) -> Result<Vec<PipelineSummary>, sqlx::Error> {
    let rows = sqlx::query_as::<_, RunRow>(
        r#"
        SELECT id, snapshot
        FROM pipeline_runs
        WHERE name = $1
        ORDER BY created_at DESC
        "#,
    )
    .bind(name)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().filter_map(RunRow::into_summary).collect())
}

/// Spawns the write-behind task and returns its inbox
///
/// Writes are applied in order. A failed write is logged and dropped; the
/// next status change of the same run rewrites the full snapshot.
pub fn spawn_writer(pool: PgPool) -> mpsc::UnboundedSender<PipelineRun> {
    let (tx, mut rx) = mpsc::unbounded_channel::<PipelineRun>();

    tokio::spawn(async move {
        while let Some(run) = rx.recv().await {
            if let Err(e) = save(&pool, &run).await {
                tracing::error!("Failed to persist run {}: {}", run.id, e);
            }
        }
        tracing::debug!("Run history writer stopped");
    });

    tx
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    snapshot: serde_json::Value,
}

impl RunRow {
    fn into_summary(self) -> Option<PipelineSummary> {
        match serde_json::from_value::<PipelineRun>(self.snapshot) {
            Ok(run) => Some(PipelineSummary::from(&run)),
            Err(e) => {
                tracing::warn!("Skipping unreadable snapshot of run {}: {}", self.id, e);
                None
            }
        }
    }
}
