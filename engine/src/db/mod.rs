/// Database module for SQLite persistence
///
/// Durable state for the orchestrator: task executions, checkpoints,
/// specialist metrics, learned confidence, experiences and the audit trail.
/// Uses sqlx with WAL mode so a fresh process can recover what a crashed one
/// left behind.
use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

pub mod audit;
pub mod checkpoints;
pub mod learning;
pub mod metrics;
pub mod tasks;

pub use audit::AuditRepository;
pub use checkpoints::{Checkpoint, CheckpointRepository, CheckpointType};
pub use learning::LearningRepository;
pub use metrics::{MetricsRepository, SpecialistMetrics};
pub use tasks::{TaskRepository, TaskState, TaskStatus};

use crate::conductor::audit::AuditEntry;
use crate::conductor::types::Experience;

/// Current time as unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `db_path`
    ///
    /// Enables WAL and foreign keys, then runs migrations. SQLite replays an
    /// existing WAL on open, which is how state survives an unclean shutdown.
    pub async fn new(db_path: &Path) -> Result<Self> {
        info!("Initializing database at: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let connection_string = format!("sqlite:{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;

        debug!("Database connection established");

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::raw_sql(include_str!("../../migrations/001_initial.sql"))
            .execute(&self.pool)
            .await
            .context("Failed to execute migration 001_initial.sql")?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Checkpoint the WAL into the main database file
    pub async fn flush_wal(&self) -> Result<()> {
        info!("Flushing WAL to disk");

        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .context("Failed to flush WAL")?;

        debug!("WAL flushed successfully");
        Ok(())
    }

    /// Flush the WAL and close every connection in the pool
    pub async fn close(&self) -> Result<()> {
        info!("Closing database connection");

        self.flush_wal().await?;
        self.pool.close().await;

        info!("Database connection closed");
        Ok(())
    }

    pub fn tasks(&self) -> TaskRepository {
        TaskRepository::new(self.pool.clone())
    }

    pub fn checkpoints(&self) -> CheckpointRepository {
        CheckpointRepository::new(self.pool.clone())
    }

    pub fn metrics(&self) -> MetricsRepository {
        MetricsRepository::new(self.pool.clone())
    }

    pub fn learning(&self) -> LearningRepository {
        LearningRepository::new(self.pool.clone())
    }

    pub fn audit(&self) -> AuditRepository {
        AuditRepository::new(self.pool.clone())
    }
}

/// Store-wide counters
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StateStats {
    pub tasks_by_status: BTreeMap<String, i64>,
    pub total_tasks: i64,
    pub checkpoints: i64,
    pub specialists_tracked: i64,
    pub experiences: i64,
    pub audit_entries: i64,
}

/// Facade over the repositories, shared by every orchestrator component
///
/// Cheap to clone. Two managers opened on the same file see the same state,
/// which is what restart recovery relies on.
#[derive(Clone)]
pub struct StateManager {
    db: Arc<Database>,
}

impl StateManager {
    pub fn new(db: Database) -> Self {
        Self { db: Arc::new(db) }
    }

    /// Open the database at `path` and wrap it
    pub async fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Database::new(path).await?))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn close(&self) -> Result<()> {
        self.db.close().await
    }

    pub async fn save_task_state(&self, state: &TaskState) -> Result<()> {
        self.db.tasks().save_task_state(state).await
    }

    pub async fn get_task_state(&self, task_id: &str) -> Result<Option<TaskState>> {
        self.db.tasks().get_task_state(task_id).await
    }

    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        self.db
            .tasks()
            .update_task_status(task_id, status, error)
            .await
    }

    pub async fn get_active_tasks(&self, owner_id: Option<&str>) -> Result<Vec<TaskState>> {
        self.db.tasks().get_active_tasks(owner_id).await
    }

    pub async fn recover_interrupted_tasks(&self, owner_id: &str) -> Result<Vec<TaskState>> {
        let tasks = self.db.tasks().recover_interrupted_tasks(owner_id).await?;
        if !tasks.is_empty() {
            info!(
                "Found {} interrupted task(s) for {}",
                tasks.len(),
                owner_id
            );
        }
        Ok(tasks)
    }

    pub async fn get_recent_tasks(&self, limit: i64) -> Result<Vec<TaskState>> {
        self.db.tasks().get_recent_tasks(limit).await
    }

    pub async fn create_checkpoint(
        &self,
        task_id: &str,
        checkpoint_type: CheckpointType,
        state_snapshot: serde_json::Value,
        message: &str,
    ) -> Result<Checkpoint> {
        self.db
            .checkpoints()
            .create_checkpoint(task_id, checkpoint_type, state_snapshot, message)
            .await
    }

    pub async fn get_checkpoints(&self, task_id: &str, limit: i64) -> Result<Vec<Checkpoint>> {
        self.db.checkpoints().get_checkpoints(task_id, limit).await
    }

    pub async fn get_latest_checkpoint(&self, task_id: &str) -> Result<Option<Checkpoint>> {
        self.db.checkpoints().get_latest_checkpoint(task_id).await
    }

    pub async fn save_specialist_metrics(&self, metrics: &SpecialistMetrics) -> Result<()> {
        self.db.metrics().save_specialist_metrics(metrics).await
    }

    pub async fn get_specialist_metrics(
        &self,
        specialist_id: &str,
    ) -> Result<Option<SpecialistMetrics>> {
        self.db.metrics().get_specialist_metrics(specialist_id).await
    }

    pub async fn record_specialist_result(
        &self,
        specialist_id: &str,
        success: bool,
        execution_time_ms: i64,
        performance_score: Option<f64>,
    ) -> Result<bool> {
        self.db
            .metrics()
            .record_specialist_result(specialist_id, success, execution_time_ms, performance_score)
            .await
    }

    pub async fn get_top_specialists(&self, limit: i64) -> Result<Vec<SpecialistMetrics>> {
        self.db.metrics().get_top_specialists(limit).await
    }

    pub async fn list_specialist_metrics(&self) -> Result<Vec<SpecialistMetrics>> {
        self.db.metrics().list_specialist_metrics().await
    }

    pub async fn save_confidence(&self, owner_id: &str, signature: &str, value: f64) -> Result<()> {
        self.db
            .learning()
            .save_confidence(owner_id, signature, value)
            .await
    }

    pub async fn load_confidences(&self, owner_id: &str) -> Result<HashMap<String, f64>> {
        self.db.learning().load_confidences(owner_id).await
    }

    pub async fn append_experience(&self, owner_id: &str, experience: &Experience) -> Result<()> {
        self.db
            .learning()
            .append_experience(owner_id, experience)
            .await
    }

    pub async fn get_experiences(&self, owner_id: &str, limit: i64) -> Result<Vec<Experience>> {
        self.db.learning().get_experiences(owner_id, limit).await
    }

    pub async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.db.audit().append_audit(entry).await
    }

    pub async fn recent_audit(&self, actor: Option<&str>, limit: i64) -> Result<Vec<AuditEntry>> {
        self.db.audit().recent_audit(actor, limit).await
    }

    pub async fn stats(&self) -> Result<StateStats> {
        let tasks_by_status = self.db.tasks().count_by_status().await?;
        let total_tasks = tasks_by_status.values().sum();

        Ok(StateStats {
            tasks_by_status,
            total_tasks,
            checkpoints: self.db.checkpoints().count().await?,
            specialists_tracked: self.db.metrics().count().await?,
            experiences: self.db.learning().count_experiences().await?,
            audit_entries: self.db.audit().count().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_database_creation() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let db = Database::new(&db_path).await.unwrap();
        assert!(db_path.exists());

        let result = sqlx::query("SELECT 1").fetch_one(db.pool()).await;
        assert!(result.is_ok());

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(db.pool())
                .await
                .unwrap();

        for table in [
            "audit_log",
            "experiences",
            "specialist_metrics",
            "state_checkpoints",
            "task_executions",
            "task_type_confidence",
        ] {
            assert!(tables.contains(&table.to_string()), "{} missing", table);
        }

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        Database::new(&db_path).await.unwrap().close().await.unwrap();
        let reopened = Database::new(&db_path).await;
        assert!(reopened.is_ok());
    }

    #[tokio::test]
    async fn test_wal_mode_and_foreign_keys() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();

        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");

        let foreign_keys: i32 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(foreign_keys, 1);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_counts_rows() {
        let temp_dir = TempDir::new().unwrap();
        let state = StateManager::open(&temp_dir.path().join("test.db"))
            .await
            .unwrap();

        let mut done = TaskState::new("t2", "o", "p");
        done.status = TaskStatus::Completed;
        state
            .save_task_state(&TaskState::new("t1", "o", "p"))
            .await
            .unwrap();
        state.save_task_state(&done).await.unwrap();
        state
            .create_checkpoint("t1", CheckpointType::TaskStart, serde_json::json!({}), "start")
            .await
            .unwrap();

        let stats = state.stats().await.unwrap();
        assert_eq!(stats.total_tasks, 2);
        assert_eq!(stats.tasks_by_status.get("pending"), Some(&1));
        assert_eq!(stats.tasks_by_status.get("completed"), Some(&1));
        assert_eq!(stats.checkpoints, 1);
        assert_eq!(stats.specialists_tracked, 0);
    }
}
