/// Specialist performance metrics
///
/// Durable mirror of the registry's per-specialist counters so performance
/// learning survives a restart.
use anyhow::{anyhow, Context, Result};
use sdk::{Capability, SpecialistKind};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use super::now_millis;

/// Persisted specialist record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecialistMetrics {
    pub specialist_id: String,
    pub kind: SpecialistKind,
    pub capabilities: Vec<Capability>,
    pub max_load: u32,
    pub performance_score: f64,
    pub total_tasks: i64,
    pub successful_tasks: i64,
    pub failed_tasks: i64,
    pub total_execution_time_ms: i64,
    pub average_execution_time_ms: f64,
    pub success_rate: f64,
    pub last_task_at: Option<i64>,
}

const SELECT_COLUMNS: &str = "SELECT specialist_id, specialist_kind, capabilities, max_load, \
     performance_score, total_tasks, successful_tasks, failed_tasks, total_execution_time_ms, \
     average_execution_time_ms, success_rate, last_task_at FROM specialist_metrics";

fn row_to_metrics(row: &SqliteRow) -> Result<SpecialistMetrics> {
    let kind: String = row.get("specialist_kind");
    let capabilities: String = row.get("capabilities");
    let max_load: i64 = row.get("max_load");

    Ok(SpecialistMetrics {
        specialist_id: row.get("specialist_id"),
        kind: kind.parse::<SpecialistKind>().map_err(|e| anyhow!(e))?,
        capabilities: serde_json::from_str(&capabilities)
            .context("Corrupt specialist capabilities column")?,
        max_load: u32::try_from(max_load).context("max_load out of range")?,
        performance_score: row.get("performance_score"),
        total_tasks: row.get("total_tasks"),
        successful_tasks: row.get("successful_tasks"),
        failed_tasks: row.get("failed_tasks"),
        total_execution_time_ms: row.get("total_execution_time_ms"),
        average_execution_time_ms: row.get("average_execution_time_ms"),
        success_rate: row.get("success_rate"),
        last_task_at: row.get("last_task_at"),
    })
}

/// Specialist metrics repository
#[derive(Clone)]
pub struct MetricsRepository {
    pool: SqlitePool,
}

impl MetricsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a specialist's metrics
    pub async fn save_specialist_metrics(&self, metrics: &SpecialistMetrics) -> Result<()> {
        sqlx::query(
            "INSERT INTO specialist_metrics (specialist_id, specialist_kind, capabilities, max_load, \
             performance_score, total_tasks, successful_tasks, failed_tasks, \
             total_execution_time_ms, average_execution_time_ms, success_rate, last_task_at, \
             updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(specialist_id) DO UPDATE SET \
             specialist_kind = excluded.specialist_kind, capabilities = excluded.capabilities, \
             max_load = excluded.max_load, performance_score = excluded.performance_score, \
             total_tasks = excluded.total_tasks, successful_tasks = excluded.successful_tasks, \
             failed_tasks = excluded.failed_tasks, \
             total_execution_time_ms = excluded.total_execution_time_ms, \
             average_execution_time_ms = excluded.average_execution_time_ms, \
             success_rate = excluded.success_rate, last_task_at = excluded.last_task_at, \
             updated_at = excluded.updated_at",
        )
        .bind(&metrics.specialist_id)
        .bind(metrics.kind.as_str())
        .bind(serde_json::to_string(&metrics.capabilities)?)
        .bind(i64::from(metrics.max_load))
        .bind(metrics.performance_score)
        .bind(metrics.total_tasks)
        .bind(metrics.successful_tasks)
        .bind(metrics.failed_tasks)
        .bind(metrics.total_execution_time_ms)
        .bind(metrics.average_execution_time_ms)
        .bind(metrics.success_rate)
        .bind(metrics.last_task_at)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .context("Failed to save specialist metrics")?;

        Ok(())
    }

    pub async fn get_specialist_metrics(
        &self,
        specialist_id: &str,
    ) -> Result<Option<SpecialistMetrics>> {
        let row = sqlx::query(&format!("{} WHERE specialist_id = ?", SELECT_COLUMNS))
            .bind(specialist_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch specialist metrics")?;

        row.as_ref().map(row_to_metrics).transpose()
    }

    /// Fold one delegation result into the stored counters
    ///
    /// Returns false when the specialist has no metrics row yet.
    pub async fn record_specialist_result(
        &self,
        specialist_id: &str,
        success: bool,
        execution_time_ms: i64,
        performance_score: Option<f64>,
    ) -> Result<bool> {
        let now = now_millis();
        let succeeded = i64::from(success);
        let failed = i64::from(!success);

        let result = sqlx::query(
            "UPDATE specialist_metrics SET \
             total_tasks = total_tasks + 1, \
             successful_tasks = successful_tasks + ?, \
             failed_tasks = failed_tasks + ?, \
             total_execution_time_ms = total_execution_time_ms + ?, \
             average_execution_time_ms = CAST(total_execution_time_ms + ? AS REAL) / (total_tasks + 1), \
             success_rate = CAST(successful_tasks + ? AS REAL) / (total_tasks + 1), \
             performance_score = COALESCE(?, performance_score), \
             last_task_at = ?, updated_at = ? \
             WHERE specialist_id = ?",
        )
        .bind(succeeded)
        .bind(failed)
        .bind(execution_time_ms)
        .bind(execution_time_ms)
        .bind(succeeded)
        .bind(performance_score)
        .bind(now)
        .bind(now)
        .bind(specialist_id)
        .execute(&self.pool)
        .await
        .context("Failed to record specialist result")?;

        Ok(result.rows_affected() > 0)
    }

    /// Best specialists by success rate, then by experience
    pub async fn get_top_specialists(&self, limit: i64) -> Result<Vec<SpecialistMetrics>> {
        let rows = sqlx::query(&format!(
            "{} ORDER BY success_rate DESC, total_tasks DESC, specialist_id ASC LIMIT ?",
            SELECT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch top specialists")?;

        rows.iter().map(row_to_metrics).collect()
    }

    pub async fn list_specialist_metrics(&self) -> Result<Vec<SpecialistMetrics>> {
        let rows = sqlx::query(&format!("{} ORDER BY specialist_id ASC", SELECT_COLUMNS))
            .fetch_all(&self.pool)
            .await
            .context("Failed to list specialist metrics")?;

        rows.iter().map(row_to_metrics).collect()
    }

    pub async fn count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM specialist_metrics")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count specialist metrics")
    }
}
