/// Learned confidence and experience history
use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

use super::now_millis;
use crate::conductor::types::{Experience, MAX_CONFIDENCE, MIN_CONFIDENCE};

fn row_to_experience(row: &SqliteRow) -> Result<Experience> {
    let outcome: String = row.get("outcome");
    let strategy: String = row.get("strategy");
    let specialists: String = row.get("specialists_used");
    let success_factors: String = row.get("success_factors");
    let failure_factors: String = row.get("failure_factors");
    let lessons: String = row.get("lessons_learned");

    Ok(Experience {
        experience_id: row.get("experience_id"),
        task_id: row.get("task_id"),
        signature: row.get("signature"),
        outcome: outcome.parse()?,
        duration_ms: row.get("duration_ms"),
        specialists_used: serde_json::from_str(&specialists)?,
        strategy: strategy.parse()?,
        success_factors: serde_json::from_str(&success_factors)?,
        failure_factors: serde_json::from_str(&failure_factors)?,
        lessons_learned: serde_json::from_str(&lessons)?,
        confidence_delta: row.get("confidence_delta"),
        created_at: row.get("created_at"),
    })
}

/// Repository for the learning loop's durable state
#[derive(Clone)]
pub struct LearningRepository {
    pool: SqlitePool,
}

impl LearningRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store the confidence for a capability signature, clamped to the valid range
    pub async fn save_confidence(&self, owner_id: &str, signature: &str, value: f64) -> Result<()> {
        let value = value.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE);

        sqlx::query(
            "INSERT INTO task_type_confidence (owner_id, signature, confidence, updated_at) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(owner_id, signature) DO UPDATE SET \
             confidence = excluded.confidence, updated_at = excluded.updated_at",
        )
        .bind(owner_id)
        .bind(signature)
        .bind(value)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .context("Failed to save confidence")?;

        Ok(())
    }

    pub async fn load_confidences(&self, owner_id: &str) -> Result<HashMap<String, f64>> {
        let rows = sqlx::query(
            "SELECT signature, confidence FROM task_type_confidence WHERE owner_id = ?",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load confidences")?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("signature"), r.get::<f64, _>("confidence")))
            .collect())
    }

    pub async fn append_experience(&self, owner_id: &str, experience: &Experience) -> Result<()> {
        sqlx::query(
            "INSERT INTO experiences (experience_id, owner_id, task_id, signature, outcome, \
             duration_ms, specialists_used, strategy, success_factors, failure_factors, \
             lessons_learned, confidence_delta, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&experience.experience_id)
        .bind(owner_id)
        .bind(&experience.task_id)
        .bind(&experience.signature)
        .bind(experience.outcome.as_str())
        .bind(experience.duration_ms)
        .bind(serde_json::to_string(&experience.specialists_used)?)
        .bind(experience.strategy.as_str())
        .bind(serde_json::to_string(&experience.success_factors)?)
        .bind(serde_json::to_string(&experience.failure_factors)?)
        .bind(serde_json::to_string(&experience.lessons_learned)?)
        .bind(experience.confidence_delta)
        .bind(experience.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to append experience")?;

        Ok(())
    }

    /// Most recent experiences for an owner, newest first
    pub async fn get_experiences(&self, owner_id: &str, limit: i64) -> Result<Vec<Experience>> {
        let rows = sqlx::query(
            "SELECT experience_id, task_id, signature, outcome, duration_ms, specialists_used, \
             strategy, success_factors, failure_factors, lessons_learned, confidence_delta, \
             created_at FROM experiences WHERE owner_id = ? \
             ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(owner_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch experiences")?;

        rows.iter().map(row_to_experience).collect()
    }

    pub async fn count_experiences(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM experiences")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count experiences")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::types::{DelegationStrategy, TaskOutcome};
    use crate::db::Database;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_confidence_is_clamped_and_scoped_by_owner() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("state.db")).await.unwrap();
        let repo = db.learning();

        repo.save_confidence("a", "research", 2.0).await.unwrap();
        repo.save_confidence("a", "document_analysis", -1.0)
            .await
            .unwrap();
        repo.save_confidence("b", "research", 0.5).await.unwrap();

        let a = repo.load_confidences("a").await.unwrap();
        assert_eq!(a.len(), 2);
        assert!((a["research"] - MAX_CONFIDENCE).abs() < 1e-9);
        assert!((a["document_analysis"] - MIN_CONFIDENCE).abs() < 1e-9);
        assert!((repo.load_confidences("b").await.unwrap()["research"] - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_experiences_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("state.db")).await.unwrap();
        let repo = db.learning();

        let experience = Experience {
            experience_id: "exp_1".to_string(),
            task_id: "t".to_string(),
            signature: "research".to_string(),
            outcome: TaskOutcome::Success,
            duration_ms: 1200,
            specialists_used: vec!["research-specialist_default".to_string()],
            strategy: DelegationStrategy::Single,
            success_factors: vec!["Strategy single worked well".to_string()],
            failure_factors: Vec::new(),
            lessons_learned: Vec::new(),
            confidence_delta: 0.05,
            created_at: 42,
        };
        repo.append_experience("o", &experience).await.unwrap();

        let loaded = repo.get_experiences("o", 10).await.unwrap();
        assert_eq!(loaded, vec![experience]);
        assert!(repo.get_experiences("other", 10).await.unwrap().is_empty());
        assert_eq!(repo.count_experiences().await.unwrap(), 1);
    }
}
