//! Orchestrator context
//!
//! Everything one orchestrator instance works with, built once per room from
//! the configuration and handed to `Orchestrator::new`. Nothing in here is
//! global; two rooms get two independent contexts that only meet in the state
//! store.

use sdk::{Collaborators, EngineError, SpecialistChannel};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;
use crate::db::StateManager;
use crate::message_bus::MessageBus;

use super::analyzer::TaskAnalyzer;
use super::audit::{AuditLog, AuditSink};
use super::executor::DelegationEngine;
use super::learning::LearningLoop;
use super::planner::TaskPlanner;
use super::registry::SpecialistRegistry;

/// Settings the orchestrator consults while handling tasks
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub name: String,
    pub max_prompt_length: usize,
    pub auto_learn: bool,
}

pub struct OrchestratorContext {
    pub orchestrator_id: String,
    pub room_id: i64,
    pub settings: OrchestratorSettings,
    pub registry: SpecialistRegistry,
    pub analyzer: TaskAnalyzer,
    pub planner: TaskPlanner,
    pub engine: DelegationEngine,
    pub learning: LearningLoop,
    pub audit: AuditLog,
    pub state: StateManager,
    pub bus: Arc<MessageBus>,
    pub collaborators: Collaborators,
}

impl OrchestratorContext {
    /// Build the context for the room named in `config`
    ///
    /// Registers the default specialists (when enabled) and every specialist
    /// listed in the configuration. Must be called inside a tokio runtime
    /// because the audit writer is spawned here.
    pub fn build(
        config: &Config,
        state: StateManager,
        channel: Arc<dyn SpecialistChannel>,
        collaborators: Collaborators,
    ) -> Result<Self, EngineError> {
        let orchestrator_id = config.orchestrator.orchestrator_id();
        let bus = Arc::new(MessageBus::new());

        let registry = SpecialistRegistry::new();
        if config.registry.register_defaults {
            registry.register_defaults(config.registry.default_max_load)?;
        }
        for specialist in &config.specialists {
            registry.register_specialist(
                &specialist.id,
                specialist.kind,
                &specialist.capabilities,
                specialist
                    .max_load
                    .unwrap_or(config.registry.default_max_load),
            )?;
            debug!("Registered configured specialist {}", specialist.id);
        }

        let engine = DelegationEngine::new(registry.clone(), channel)
            .with_state(state.clone())
            .with_bus(Arc::clone(&bus))
            .with_timeout(config.orchestrator.delegation_timeout());

        let sink: Arc<dyn AuditSink> = Arc::new(state.database().audit());
        let audit = AuditLog::with_writer(
            config.orchestrator.audit_capacity,
            Some(sink),
            Some(Arc::clone(&bus)),
        );

        info!(
            "Built context for {} with {} specialist(s)",
            orchestrator_id,
            registry.len()
        );

        Ok(Self {
            learning: LearningLoop::with_state(orchestrator_id.clone(), state.clone()),
            orchestrator_id,
            room_id: config.orchestrator.room_id,
            settings: OrchestratorSettings {
                name: config.orchestrator.name.clone(),
                max_prompt_length: config.orchestrator.max_prompt_length,
                auto_learn: config.orchestrator.auto_learn,
            },
            planner: TaskPlanner::new(registry.clone(), config.registry.prefer_performance),
            analyzer: TaskAnalyzer::new(config.analyzer.settings()),
            registry,
            engine,
            audit,
            state,
            bus,
            collaborators,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::channel::LocalSpecialistChannel;
    use crate::config::SpecialistConfig;
    use sdk::SpecialistKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_build_registers_defaults_and_configured_specialists() {
        let temp_dir = TempDir::new().unwrap();
        let state = StateManager::open(&temp_dir.path().join("ctx.db"))
            .await
            .unwrap();

        let mut config = Config::default();
        config.orchestrator.room_id = 7;
        config.specialists.push(SpecialistConfig {
            id: "scholar".to_string(),
            kind: SpecialistKind::ResearchSpecialist,
            capabilities: Vec::new(),
            max_load: Some(2),
        });

        let ctx = OrchestratorContext::build(
            &config,
            state,
            Arc::new(LocalSpecialistChannel::new()),
            Collaborators::new(),
        )
        .unwrap();

        assert_eq!(ctx.orchestrator_id, "kommandant_7");
        assert_eq!(ctx.registry.len(), SpecialistKind::ALL.len() + 1);
        assert_eq!(ctx.registry.get("scholar").unwrap().max_load, 2);
        assert_eq!(ctx.engine.timeout().as_secs(), 60);
    }

    #[tokio::test]
    async fn test_build_without_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let state = StateManager::open(&temp_dir.path().join("ctx.db"))
            .await
            .unwrap();

        let mut config = Config::default();
        config.registry.register_defaults = false;

        let ctx = OrchestratorContext::build(
            &config,
            state,
            Arc::new(LocalSpecialistChannel::new()),
            Collaborators::new(),
        )
        .unwrap();
        assert!(ctx.registry.is_empty());
    }
}
