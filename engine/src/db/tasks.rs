/// Task state persistence
///
/// A `TaskState` is the durable projection of an orchestrator task. Writes are
/// idempotent upserts keyed by task id so a re-driven task simply overwrites
/// its previous row.
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::now_millis;

/// Task status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Paused,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
        TaskStatus::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
        }
    }

    /// Completed, failed, cancelled and timed-out tasks never run again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Running | TaskStatus::Paused
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        TaskStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow!("unknown task status '{}'", s))
    }
}

/// Persisted task record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskState {
    pub task_id: String,
    pub owner_id: String,
    pub room_id: Option<i64>,
    pub status: TaskStatus,
    pub prompt: String,
    pub context: serde_json::Value,
    pub delegations: Vec<serde_json::Value>,
    pub results: Vec<serde_json::Value>,
    pub errors: Vec<String>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub last_checkpoint_at: Option<i64>,
    pub metadata: serde_json::Value,
}

impl TaskState {
    /// A fresh PENDING record with empty collections
    pub fn new(
        task_id: impl Into<String>,
        owner_id: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            owner_id: owner_id.into(),
            room_id: None,
            status: TaskStatus::Pending,
            prompt: prompt.into(),
            context: serde_json::json!({}),
            delegations: Vec::new(),
            results: Vec::new(),
            errors: Vec::new(),
            started_at: None,
            completed_at: None,
            last_checkpoint_at: None,
            metadata: serde_json::json!({}),
        }
    }
}

const SELECT_COLUMNS: &str = "SELECT task_id, owner_id, room_id, status, prompt, context, \
     delegations, results, errors, metadata, started_at, completed_at, last_checkpoint_at \
     FROM task_executions";

fn row_to_state(row: &SqliteRow) -> Result<TaskState> {
    let status: String = row.get("status");
    let context: String = row.get("context");
    let delegations: String = row.get("delegations");
    let results: String = row.get("results");
    let errors: String = row.get("errors");
    let metadata: String = row.get("metadata");

    Ok(TaskState {
        task_id: row.get("task_id"),
        owner_id: row.get("owner_id"),
        room_id: row.get("room_id"),
        status: status.parse()?,
        prompt: row.get("prompt"),
        context: serde_json::from_str(&context).context("Corrupt task context column")?,
        delegations: serde_json::from_str(&delegations)
            .context("Corrupt task delegations column")?,
        results: serde_json::from_str(&results).context("Corrupt task results column")?,
        errors: serde_json::from_str(&errors).context("Corrupt task errors column")?,
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        last_checkpoint_at: row.get("last_checkpoint_at"),
        metadata: serde_json::from_str(&metadata).context("Corrupt task metadata column")?,
    })
}

/// Task repository for database operations
#[derive(Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
}

impl TaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace the full state of a task
    ///
    /// A missing `last_checkpoint_at` keeps the stored stamp.
    pub async fn save_task_state(&self, state: &TaskState) -> Result<()> {
        let now = now_millis();

        sqlx::query(
            "INSERT INTO task_executions (task_id, owner_id, room_id, status, prompt, context, \
             delegations, results, errors, metadata, started_at, completed_at, last_checkpoint_at, \
             created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(task_id) DO UPDATE SET \
             owner_id = excluded.owner_id, room_id = excluded.room_id, status = excluded.status, \
             prompt = excluded.prompt, context = excluded.context, \
             delegations = excluded.delegations, results = excluded.results, \
             errors = excluded.errors, metadata = excluded.metadata, \
             started_at = excluded.started_at, completed_at = excluded.completed_at, \
             last_checkpoint_at = COALESCE(excluded.last_checkpoint_at, task_executions.last_checkpoint_at), \
             updated_at = excluded.updated_at",
        )
        .bind(&state.task_id)
        .bind(&state.owner_id)
        .bind(state.room_id)
        .bind(state.status.as_str())
        .bind(&state.prompt)
        .bind(serde_json::to_string(&state.context)?)
        .bind(serde_json::to_string(&state.delegations)?)
        .bind(serde_json::to_string(&state.results)?)
        .bind(serde_json::to_string(&state.errors)?)
        .bind(serde_json::to_string(&state.metadata)?)
        .bind(state.started_at)
        .bind(state.completed_at)
        .bind(state.last_checkpoint_at)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to save task state")?;

        Ok(())
    }

    pub async fn get_task_state(&self, task_id: &str) -> Result<Option<TaskState>> {
        let row = sqlx::query(&format!("{} WHERE task_id = ?", SELECT_COLUMNS))
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch task state")?;

        row.as_ref().map(row_to_state).transpose()
    }

    /// Update the status of a task, appending `error` to its error list
    ///
    /// The completion timestamp is only set for terminal statuses. Returns
    /// false when no task with that id exists.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let now = now_millis();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin status update")?;

        let errors: Option<String> =
            sqlx::query_scalar("SELECT errors FROM task_executions WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(&mut *tx)
                .await
                .context("Failed to read task errors")?;

        let Some(errors) = errors else {
            return Ok(false);
        };

        let mut errors: Vec<String> =
            serde_json::from_str(&errors).context("Corrupt task errors column")?;
        if let Some(error) = error {
            errors.push(error.to_string());
        }
        let completed_at = status.is_terminal().then_some(now);

        sqlx::query(
            "UPDATE task_executions SET status = ?, errors = ?, \
             completed_at = COALESCE(?, completed_at), updated_at = ? WHERE task_id = ?",
        )
        .bind(status.as_str())
        .bind(serde_json::to_string(&errors)?)
        .bind(completed_at)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .context("Failed to update task status")?;

        tx.commit().await.context("Failed to commit status update")?;
        Ok(true)
    }

    /// Tasks that are pending, running or paused, optionally for one owner
    pub async fn get_active_tasks(&self, owner_id: Option<&str>) -> Result<Vec<TaskState>> {
        let rows = match owner_id {
            Some(owner) => {
                sqlx::query(&format!(
                    "{} WHERE status IN ('pending', 'running', 'paused') AND owner_id = ? \
                     ORDER BY created_at ASC, rowid ASC",
                    SELECT_COLUMNS
                ))
                .bind(owner)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "{} WHERE status IN ('pending', 'running', 'paused') ORDER BY created_at ASC, rowid ASC",
                    SELECT_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to fetch active tasks")?;

        rows.iter().map(row_to_state).collect()
    }

    /// Tasks an owner left running or pending, oldest first
    pub async fn recover_interrupted_tasks(&self, owner_id: &str) -> Result<Vec<TaskState>> {
        let rows = sqlx::query(&format!(
            "{} WHERE status IN ('running', 'pending') AND owner_id = ? \
             ORDER BY COALESCE(started_at, created_at) ASC, rowid ASC",
            SELECT_COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch interrupted tasks")?;

        rows.iter().map(row_to_state).collect()
    }

    /// Most recently updated tasks
    pub async fn get_recent_tasks(&self, limit: i64) -> Result<Vec<TaskState>> {
        let rows = sqlx::query(&format!(
            "{} ORDER BY updated_at DESC, rowid DESC LIMIT ?",
            SELECT_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch recent tasks")?;

        rows.iter().map(row_to_state).collect()
    }

    pub async fn count_by_status(&self) -> Result<BTreeMap<String, i64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM task_executions GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .context("Failed to count tasks")?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("status"), r.get::<i64, _>("n")))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use tempfile::TempDir;

    async fn repo() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("state.db")).await.unwrap();
        (temp_dir, db)
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in TaskStatus::ALL {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }

    #[tokio::test]
    async fn test_save_then_get() {
        let (_dir, db) = repo().await;
        let tasks = db.tasks();

        let mut state = TaskState::new("t-1", "kommandant_7", "Analysér dette dokument");
        state.room_id = Some(7);
        state.metadata = serde_json::json!({"source": "test"});
        state.errors.push("first".to_string());
        tasks.save_task_state(&state).await.unwrap();

        let loaded = tasks.get_task_state("t-1").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(tasks.get_task_state("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_status_appends_error_and_stamps_terminal() {
        let (_dir, db) = repo().await;
        let tasks = db.tasks();
        tasks
            .save_task_state(&TaskState::new("t-2", "o", "p"))
            .await
            .unwrap();

        assert!(tasks
            .update_task_status("t-2", TaskStatus::Running, None)
            .await
            .unwrap());
        let running = tasks.get_task_state("t-2").await.unwrap().unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert!(running.completed_at.is_none());

        tasks
            .update_task_status("t-2", TaskStatus::Failed, Some("specialist down"))
            .await
            .unwrap();
        let failed = tasks.get_task_state("t-2").await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.completed_at.is_some());
        assert_eq!(failed.errors, vec!["specialist down".to_string()]);

        assert!(!tasks
            .update_task_status("nope", TaskStatus::Failed, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_active_tasks_filter_by_owner() {
        let (_dir, db) = repo().await;
        let tasks = db.tasks();

        for (id, owner, status) in [
            ("a", "o1", TaskStatus::Pending),
            ("b", "o1", TaskStatus::Completed),
            ("c", "o2", TaskStatus::Paused),
        ] {
            let mut state = TaskState::new(id, owner, "p");
            state.status = status;
            tasks.save_task_state(&state).await.unwrap();
        }

        let all: Vec<String> = tasks
            .get_active_tasks(None)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(all, vec!["a".to_string(), "c".to_string()]);

        let mine = tasks.get_active_tasks(Some("o1")).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].task_id, "a");
    }

    #[tokio::test]
    async fn test_recover_orders_oldest_first() {
        let (_dir, db) = repo().await;
        let tasks = db.tasks();

        let mut late = TaskState::new("late", "o", "p");
        late.status = TaskStatus::Running;
        late.started_at = Some(2_000);
        let mut early = TaskState::new("early", "o", "p");
        early.status = TaskStatus::Running;
        early.started_at = Some(1_000);
        let mut paused = TaskState::new("paused", "o", "p");
        paused.status = TaskStatus::Paused;

        tasks.save_task_state(&late).await.unwrap();
        tasks.save_task_state(&early).await.unwrap();
        tasks.save_task_state(&paused).await.unwrap();

        let ids: Vec<String> = tasks
            .recover_interrupted_tasks("o")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.task_id)
            .collect();
        assert_eq!(ids, vec!["early".to_string(), "late".to_string()]);
    }
}
