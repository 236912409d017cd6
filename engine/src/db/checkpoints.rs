/// Durable task checkpoints
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use super::now_millis;

/// What a checkpoint marks in the life of a task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    TaskStart,
    TaskProgress,
    DelegationStart,
    DelegationComplete,
    SpecialistAssigned,
    SpecialistResult,
    TaskComplete,
    Error,
}

impl CheckpointType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointType::TaskStart => "task_start",
            CheckpointType::TaskProgress => "task_progress",
            CheckpointType::DelegationStart => "delegation_start",
            CheckpointType::DelegationComplete => "delegation_complete",
            CheckpointType::SpecialistAssigned => "specialist_assigned",
            CheckpointType::SpecialistResult => "specialist_result",
            CheckpointType::TaskComplete => "task_complete",
            CheckpointType::Error => "error",
        }
    }
}

impl FromStr for CheckpointType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "task_start" => CheckpointType::TaskStart,
            "task_progress" => CheckpointType::TaskProgress,
            "delegation_start" => CheckpointType::DelegationStart,
            "delegation_complete" => CheckpointType::DelegationComplete,
            "specialist_assigned" => CheckpointType::SpecialistAssigned,
            "specialist_result" => CheckpointType::SpecialistResult,
            "task_complete" => CheckpointType::TaskComplete,
            "error" => CheckpointType::Error,
            other => return Err(anyhow!("unknown checkpoint type '{}'", other)),
        })
    }
}

/// Checkpoint record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub task_id: String,
    pub checkpoint_type: CheckpointType,
    pub state_snapshot: serde_json::Value,
    pub message: String,
    pub created_at: i64,
}

fn row_to_checkpoint(row: &SqliteRow) -> Result<Checkpoint> {
    let checkpoint_type: String = row.get("checkpoint_type");
    let snapshot: String = row.get("state_snapshot");

    Ok(Checkpoint {
        checkpoint_id: row.get("checkpoint_id"),
        task_id: row.get("task_id"),
        checkpoint_type: checkpoint_type.parse()?,
        state_snapshot: serde_json::from_str(&snapshot).context("Corrupt checkpoint snapshot")?,
        message: row.get("message"),
        created_at: row.get("created_at"),
    })
}

/// Checkpoint repository
#[derive(Clone)]
pub struct CheckpointRepository {
    pool: SqlitePool,
}

impl CheckpointRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a checkpoint and stamp the task's `last_checkpoint_at`
    ///
    /// Fails when the task row does not exist.
    pub async fn create_checkpoint(
        &self,
        task_id: &str,
        checkpoint_type: CheckpointType,
        state_snapshot: serde_json::Value,
        message: &str,
    ) -> Result<Checkpoint> {
        let now = now_millis();
        let checkpoint_id = format!("ckpt_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);

        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin checkpoint")?;

        sqlx::query(
            "INSERT INTO state_checkpoints (checkpoint_id, task_id, checkpoint_type, \
             state_snapshot, message, created_at, seq) \
             VALUES (?, ?, ?, ?, ?, ?, \
             (SELECT COALESCE(MAX(seq), 0) + 1 FROM state_checkpoints WHERE task_id = ?))",
        )
        .bind(&checkpoint_id)
        .bind(task_id)
        .bind(checkpoint_type.as_str())
        .bind(serde_json::to_string(&state_snapshot)?)
        .bind(message)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("Failed to create checkpoint")?;

        sqlx::query(
            "UPDATE task_executions SET last_checkpoint_at = ?, updated_at = ? WHERE task_id = ?",
        )
        .bind(now)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("Failed to stamp checkpoint time")?;

        tx.commit().await.context("Failed to commit checkpoint")?;

        Ok(Checkpoint {
            checkpoint_id,
            task_id: task_id.to_string(),
            checkpoint_type,
            state_snapshot,
            message: message.to_string(),
            created_at: now,
        })
    }

    /// Checkpoints for a task, newest first
    pub async fn get_checkpoints(&self, task_id: &str, limit: i64) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            "SELECT checkpoint_id, task_id, checkpoint_type, state_snapshot, message, created_at \
             FROM state_checkpoints WHERE task_id = ? ORDER BY seq DESC LIMIT ?",
        )
        .bind(task_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch checkpoints")?;

        rows.iter().map(row_to_checkpoint).collect()
    }

    pub async fn get_latest_checkpoint(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.get_checkpoints(task_id, 1).await?.into_iter().next())
    }

    pub async fn count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM state_checkpoints")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count checkpoints")
    }
}
