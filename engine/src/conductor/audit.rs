//! Append-only audit trail of orchestrator actions
//!
//! Entries land synchronously in a bounded in-memory ring buffer. When a
//! writer is attached, each entry is also forwarded to a background task
//! that mirrors it into a durable sink and onto the message bus.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::db::now_millis;
use crate::message_bus::{Event, MessageBus};

use super::types::short_id;

pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

const WRITER_QUEUE_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Info => "info",
            AuditSeverity::Warning => "warning",
            AuditSeverity::Error => "error",
            AuditSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for AuditSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditSeverity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "info" => Ok(AuditSeverity::Info),
            "warning" => Ok(AuditSeverity::Warning),
            "error" => Ok(AuditSeverity::Error),
            "critical" => Ok(AuditSeverity::Critical),
            other => Err(anyhow::anyhow!("unknown audit severity '{}'", other)),
        }
    }
}

/// Immutable audit record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub entry_id: String,
    pub timestamp: i64,
    pub action: String,
    pub actor: String,
    pub target: String,
    pub details: Value,
    pub outcome: String,
    pub severity: AuditSeverity,
}

/// Durable destination for audit entries
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write(&self, entry: &AuditEntry) -> anyhow::Result<()>;
}

enum WriterCommand {
    Entry(AuditEntry),
    Flush(oneshot::Sender<()>),
}

pub struct AuditLog {
    buffer: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
    writer: Option<mpsc::Sender<WriterCommand>>,
}

impl AuditLog {
    /// In-memory audit log without a durable mirror
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            writer: None,
        }
    }

    /// Audit log mirrored by a background writer task
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_writer(
        capacity: usize,
        sink: Option<Arc<dyn AuditSink>>,
        bus: Option<Arc<MessageBus>>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(WRITER_QUEUE_SIZE);
        tokio::spawn(run_writer(rx, sink, bus));

        let mut log = Self::new(capacity);
        log.writer = Some(tx);
        log
    }

    /// Record an action and return the stored entry
    pub fn record(
        &self,
        action: &str,
        actor: &str,
        target: &str,
        details: Value,
        outcome: &str,
        severity: AuditSeverity,
    ) -> AuditEntry {
        let entry = AuditEntry {
            entry_id: short_id("audit", 12),
            timestamp: now_millis(),
            action: action.to_string(),
            actor: actor.to_string(),
            target: target.to_string(),
            details,
            outcome: outcome.to_string(),
            severity,
        };

        {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            if buffer.len() >= self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(entry.clone());
        }

        if severity >= AuditSeverity::Error {
            warn!(
                "AUDIT [{}] {} {} -> {}: {} {}",
                severity, actor, action, target, outcome, entry.details
            );
        } else {
            debug!("AUDIT {} {} -> {}: {}", actor, action, target, outcome);
        }

        if let Some(writer) = &self.writer {
            match writer.try_send(WriterCommand::Entry(entry.clone())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("Audit writer queue full, entry {} not mirrored", entry.entry_id)
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Audit writer stopped, entry {} not mirrored", entry.entry_id)
                }
            }
        }

        entry
    }

    /// The newest `limit` entries in chronological order
    pub fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        let buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let skip = buffer.len().saturating_sub(limit);
        buffer.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait until every entry recorded so far has been mirrored
    pub async fn flush(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        if writer.send(WriterCommand::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_writer(
    mut rx: mpsc::Receiver<WriterCommand>,
    sink: Option<Arc<dyn AuditSink>>,
    bus: Option<Arc<MessageBus>>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Entry(entry) => {
                if let Some(sink) = &sink {
                    if let Err(e) = sink.write(&entry).await {
                        warn!("Failed to persist audit entry {}: {:#}", entry.entry_id, e);
                    }
                }
                if let Some(bus) = &bus {
                    bus.publish(Event::AuditRecorded {
                        action: entry.action,
                        actor: entry.actor,
                        target: entry.target,
                        severity: entry.severity.to_string(),
                    })
                    .await;
                }
            }
            WriterCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Audit writer stopped");
}
