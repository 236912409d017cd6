/// Durable audit trail
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::conductor::audit::{AuditEntry, AuditSink};

#[derive(Clone)]
pub struct AuditRepository {
    pool: SqlitePool,
}

impl AuditRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO audit_log (entry_id, timestamp, action, actor, target, details, \
             outcome, severity) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.entry_id)
        .bind(entry.timestamp)
        .bind(&entry.action)
        .bind(&entry.actor)
        .bind(&entry.target)
        .bind(serde_json::to_string(&entry.details)?)
        .bind(&entry.outcome)
        .bind(entry.severity.as_str())
        .execute(&self.pool)
        .await
        .context("Failed to append audit entry")?;

        Ok(())
    }

    /// Newest entries first, optionally for one actor
    pub async fn recent_audit(&self, actor: Option<&str>, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows = match actor {
            Some(actor) => {
                sqlx::query(
                    "SELECT entry_id, timestamp, action, actor, target, details, outcome, severity \
                     FROM audit_log WHERE actor = ? ORDER BY timestamp DESC, rowid DESC LIMIT ?",
                )
                .bind(actor)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT entry_id, timestamp, action, actor, target, details, outcome, severity \
                     FROM audit_log ORDER BY timestamp DESC, rowid DESC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to fetch audit entries")?;

        rows.into_iter()
            .map(|r| {
                let details: String = r.get("details");
                let severity: String = r.get("severity");
                Ok(AuditEntry {
                    entry_id: r.get("entry_id"),
                    timestamp: r.get("timestamp"),
                    action: r.get("action"),
                    actor: r.get("actor"),
                    target: r.get("target"),
                    details: serde_json::from_str(&details).context("Corrupt audit details")?,
                    outcome: r.get("outcome"),
                    severity: severity.parse()?,
                })
            })
            .collect()
    }

    pub async fn count(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM audit_log")
            .fetch_one(&self.pool)
            .await
            .context("Failed to count audit entries")
    }
}

#[async_trait]
impl AuditSink for AuditRepository {
    async fn write(&self, entry: &AuditEntry) -> Result<()> {
        self.append_audit(entry).await
    }
}
