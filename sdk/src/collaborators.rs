//! Collaborator interfaces
//!
//! The orchestrator talks to everything outside its own process through the
//! narrow traits in this module. Implementations are injected at construction
//! time through [`Collaborators`]; any of them may be absent.

use crate::errors::EngineError;
use crate::types::{SpecialistDescriptor, SpecialistRequest, SpecialistResponse};
use async_trait::async_trait;
use std::sync::Arc;

/// Request/response channel to specialist workers, routed by specialist id.
///
/// Delivery is at-least-once: a specialist may see the same delegation id
/// more than once. Implementations report transport problems as
/// `EngineError::DelegationSend`; a specialist that answered with
/// `success = false` is a normal `Ok` response.
#[async_trait]
pub trait SpecialistChannel: Send + Sync {
    async fn invoke(
        &self,
        specialist_id: &str,
        request: SpecialistRequest,
    ) -> Result<SpecialistResponse, EngineError>;
}

/// Link to the external event bus the orchestrator subscribes through
#[async_trait]
pub trait EventBusLink: Send + Sync {
    /// Subscribe to responses addressed to this orchestrator
    async fn connect(&self, orchestrator_id: &str) -> Result<(), EngineError>;

    /// Drop the subscription
    async fn disconnect(&self, orchestrator_id: &str) -> Result<(), EngineError>;
}

/// Periodic specialist capability discovery
#[async_trait]
pub trait SpecialistDiscovery: Send + Sync {
    async fn discover(&self) -> Result<Vec<SpecialistDescriptor>, EngineError>;
}

/// External task registry (control panel) kept informed of task progress
#[async_trait]
pub trait TaskRegistry: Send + Sync {
    /// Announce the orchestrator itself
    async fn register_orchestrator(
        &self,
        orchestrator_id: &str,
        name: &str,
    ) -> Result<(), EngineError>;

    /// Report a newly received task
    async fn create_task(
        &self,
        task_id: &str,
        context_id: &str,
        prompt: &str,
        metadata: &serde_json::Value,
    ) -> Result<(), EngineError>;

    /// Report task status and fractional progress (0.0 - 1.0)
    async fn update_task(
        &self,
        task_id: &str,
        status: &str,
        progress: f64,
    ) -> Result<(), EngineError>;

    /// Report the orchestrator's own status (idle, busy, stopped, error)
    async fn update_orchestrator_status(
        &self,
        orchestrator_id: &str,
        status: &str,
    ) -> Result<(), EngineError>;
}

/// Set of external collaborators handed to an orchestrator.
///
/// All collaborators are optional. The orchestrator treats every call on
/// them as best-effort.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub event_bus: Option<Arc<dyn EventBusLink>>,
    pub discovery: Option<Arc<dyn SpecialistDiscovery>>,
    pub task_registry: Option<Arc<dyn TaskRegistry>>,
}

impl Collaborators {
    /// Create an empty collaborator set
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_bus(mut self, event_bus: Arc<dyn EventBusLink>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn SpecialistDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_task_registry(mut self, task_registry: Arc<dyn TaskRegistry>) -> Self {
        self.task_registry = Some(task_registry);
        self
    }
}
