//! In-process specialist channel
//!
//! `LocalSpecialistChannel` routes delegations to handlers registered in the
//! same process. The CLI uses it with simulated specialists; tests use it with
//! stubs that sleep, fail or count calls.

use async_trait::async_trait;
use sdk::{EngineError, SpecialistChannel, SpecialistRequest, SpecialistResponse};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

/// Something that can answer a delegation
#[async_trait]
pub trait SpecialistHandler: Send + Sync {
    async fn handle(&self, specialist_id: &str, request: SpecialistRequest) -> SpecialistResponse;
}

/// Routes requests by specialist id
///
/// Ids without a handler go to the fallback handler when one is set, and
/// fail with `DelegationSend` otherwise.
#[derive(Default)]
pub struct LocalSpecialistChannel {
    handlers: RwLock<HashMap<String, Arc<dyn SpecialistHandler>>>,
    fallback: Option<Arc<dyn SpecialistHandler>>,
}

impl LocalSpecialistChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel that answers every id with `handler` unless overridden
    pub fn with_fallback(handler: Arc<dyn SpecialistHandler>) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            fallback: Some(handler),
        }
    }

    pub fn register(&self, specialist_id: &str, handler: Arc<dyn SpecialistHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(specialist_id.to_string(), handler);
    }

    pub fn remove(&self, specialist_id: &str) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(specialist_id)
            .is_some()
    }

    fn handler_for(&self, specialist_id: &str) -> Option<Arc<dyn SpecialistHandler>> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers
            .get(specialist_id)
            .cloned()
            .or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl SpecialistChannel for LocalSpecialistChannel {
    async fn invoke(
        &self,
        specialist_id: &str,
        request: SpecialistRequest,
    ) -> Result<SpecialistResponse, EngineError> {
        let handler = self
            .handler_for(specialist_id)
            .ok_or_else(|| EngineError::DelegationSend {
                specialist_id: specialist_id.to_string(),
                reason: "no handler registered".to_string(),
            })?;

        debug!(
            "Routing delegation {} to {}",
            request.delegation_id, specialist_id
        );
        Ok(handler.handle(specialist_id, request).await)
    }
}

/// Stand-in specialist that acknowledges every delegation
#[derive(Debug, Clone)]
pub struct SimulatedSpecialist {
    latency: Duration,
    confidence: Option<f64>,
    failure: Option<String>,
}

impl Default for SimulatedSpecialist {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            confidence: Some(0.8),
            failure: None,
        }
    }
}

impl SimulatedSpecialist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_confidence(mut self, confidence: Option<f64>) -> Self {
        self.confidence = confidence;
        self
    }

    /// Answer every request with `success = false`
    pub fn failing(mut self, error: impl Into<String>) -> Self {
        self.failure = Some(error.into());
        self
    }
}

#[async_trait]
impl SpecialistHandler for SimulatedSpecialist {
    async fn handle(&self, specialist_id: &str, request: SpecialistRequest) -> SpecialistResponse {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(error) = &self.failure {
            return SpecialistResponse::failed(error.clone());
        }
        SpecialistResponse::ok(
            json!({
                "specialist_id": specialist_id,
                "delegation_id": request.delegation_id,
                "summary": format!("{} handled task {}", specialist_id, request.task_id),
                "input": request.input,
            }),
            self.confidence,
        )
    }
}
