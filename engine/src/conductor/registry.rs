//! Specialist registry and selection
//!
//! Tracks every known specialist with its capability set, current load and
//! performance history, and answers "which specialist should handle
//! capability X". Load is the only state shared between concurrent
//! delegations; `acquire` hands out a guard that gives the slot back when it
//! goes out of scope.

use sdk::{Capability, EngineError, SpecialistDescriptor, SpecialistKind};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::db::{now_millis, SpecialistMetrics};

use super::types::MERGER_ID;

pub const DEFAULT_MAX_LOAD: u32 = 5;
pub const INITIAL_PERFORMANCE: f64 = 0.8;

/// Weight of the previous score in the performance moving average
const PERFORMANCE_DECAY: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Available,
    Busy,
    Overloaded,
    Offline,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::Available => "available",
            Availability::Busy => "busy",
            Availability::Overloaded => "overloaded",
            Availability::Offline => "offline",
        }
    }
}

/// Runtime view of one specialist
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecialistInfo {
    pub id: String,
    pub kind: SpecialistKind,
    pub capabilities: Vec<Capability>,
    pub current_load: u32,
    pub max_load: u32,
    pub performance_score: f64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_execution_time_ms: i64,
    pub last_task_at: Option<i64>,
    pub availability: Availability,
    pub registration_seq: u64,
}

impl SpecialistInfo {
    fn refresh_availability(&mut self) {
        if self.availability == Availability::Offline {
            return;
        }
        self.availability = if self.current_load == 0 {
            Availability::Available
        } else if self.current_load < self.max_load {
            Availability::Busy
        } else {
            Availability::Overloaded
        };
    }

    fn accepts_work(&self) -> bool {
        matches!(
            self.availability,
            Availability::Available | Availability::Busy
        ) && self.current_load < self.max_load
    }

    pub fn total_tasks(&self) -> u64 {
        self.success_count + self.failure_count
    }

    pub fn to_metrics(&self) -> SpecialistMetrics {
        let total = self.total_tasks();
        let (success_rate, average) = if total == 0 {
            (1.0, 0.0)
        } else {
            (
                self.success_count as f64 / total as f64,
                self.total_execution_time_ms as f64 / total as f64,
            )
        };

        SpecialistMetrics {
            specialist_id: self.id.clone(),
            kind: self.kind,
            capabilities: self.capabilities.clone(),
            max_load: self.max_load,
            performance_score: self.performance_score,
            total_tasks: total as i64,
            successful_tasks: self.success_count as i64,
            failed_tasks: self.failure_count as i64,
            total_execution_time_ms: self.total_execution_time_ms,
            average_execution_time_ms: average,
            success_rate,
            last_task_at: self.last_task_at,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    specialists: HashMap<String, SpecialistInfo>,
    by_capability: HashMap<Capability, Vec<String>>,
    next_seq: u64,
}

impl RegistryInner {
    fn index(&mut self, id: &str, capabilities: &[Capability]) {
        for ids in self.by_capability.values_mut() {
            ids.retain(|existing| existing != id);
        }
        for cap in capabilities {
            self.by_capability
                .entry(*cap)
                .or_default()
                .push(id.to_string());
        }
    }

    /// Capability matches in registration order, falling back to the capability's kind
    fn candidates(&self, capability: Capability) -> Vec<&SpecialistInfo> {
        let mut found: Vec<&SpecialistInfo> = self
            .by_capability
            .get(&capability)
            .map(|ids| ids.iter().filter_map(|id| self.specialists.get(id)).collect())
            .unwrap_or_default();

        if found.is_empty() {
            if let Some(kind) = capability.specialist_kind() {
                found = self
                    .specialists
                    .values()
                    .filter(|s| s.kind == kind)
                    .collect();
            }
        }

        found.sort_by_key(|s| s.registration_seq);
        found
    }
}

/// Registry of specialists for one orchestrator
#[derive(Clone, Default)]
pub struct SpecialistRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SpecialistRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register or redefine a specialist
    ///
    /// An empty capability list registers every capability of the kind.
    /// Redefining keeps the registration order, load and history.
    pub fn register_specialist(
        &self,
        id: &str,
        kind: SpecialistKind,
        capabilities: &[Capability],
        max_load: u32,
    ) -> Result<(), EngineError> {
        let invalid = |reason: String| EngineError::InvalidRegistration {
            id: id.to_string(),
            reason,
        };

        if id.trim().is_empty() {
            return Err(invalid("id must not be empty".to_string()));
        }
        if id == MERGER_ID {
            return Err(invalid(format!("'{}' is reserved", MERGER_ID)));
        }
        if max_load == 0 {
            return Err(invalid("max_load must be at least 1".to_string()));
        }
        if let Some(cap) = capabilities.iter().find(|c| !kind.supports(**c)) {
            return Err(invalid(format!(
                "capability {} is not provided by {}",
                cap, kind
            )));
        }

        let source = if capabilities.is_empty() {
            kind.capabilities()
        } else {
            capabilities
        };
        let mut unique: Vec<Capability> = Vec::with_capacity(source.len());
        for cap in source {
            if !unique.contains(cap) {
                unique.push(*cap);
            }
        }
        let capabilities = unique;

        let mut inner = self.lock();
        inner.index(id, &capabilities);

        if let Some(existing) = inner.specialists.get_mut(id) {
            existing.kind = kind;
            existing.capabilities = capabilities;
            existing.max_load = max_load;
            existing.refresh_availability();
            debug!("Redefined specialist {}", id);
            return Ok(());
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.specialists.insert(
            id.to_string(),
            SpecialistInfo {
                id: id.to_string(),
                kind,
                capabilities,
                current_load: 0,
                max_load,
                performance_score: INITIAL_PERFORMANCE,
                success_count: 0,
                failure_count: 0,
                total_execution_time_ms: 0,
                last_task_at: None,
                availability: Availability::Available,
                registration_seq: seq,
            },
        );
        info!("Registered specialist {} ({})", id, kind);
        Ok(())
    }

    pub fn register_descriptor(&self, descriptor: &SpecialistDescriptor) -> Result<(), EngineError> {
        self.register_specialist(
            &descriptor.id,
            descriptor.kind,
            &descriptor.capabilities,
            descriptor.max_load,
        )
    }

    /// One `<kind>_default` specialist per kind, covering all its capabilities
    pub fn register_defaults(&self, max_load: u32) -> Result<(), EngineError> {
        for kind in SpecialistKind::ALL {
            self.register_specialist(&format!("{}_default", kind), kind, &[], max_load)?;
        }
        Ok(())
    }

    /// Pick a specialist for a capability
    ///
    /// Among specialists that accept work, ranks by performance then load
    /// (or by load alone), ties going to the earliest registered. When none
    /// accepts work, the first capability match is returned anyway.
    pub fn select_specialist(
        &self,
        capability: Capability,
        prefer_performance: bool,
    ) -> Option<String> {
        let inner = self.lock();
        let candidates = inner.candidates(capability);

        let mut available: Vec<&SpecialistInfo> =
            candidates.iter().copied().filter(|s| s.accepts_work()).collect();

        if available.is_empty() {
            let fallback = candidates.first().map(|s| s.id.clone());
            if let Some(id) = &fallback {
                warn!(
                    "No available specialist for {}, falling back to {}",
                    capability, id
                );
            }
            return fallback;
        }

        if prefer_performance {
            available.sort_by(|a, b| {
                b.performance_score
                    .partial_cmp(&a.performance_score)
                    .unwrap_or(Ordering::Equal)
                    .then(a.current_load.cmp(&b.current_load))
            });
        } else {
            available.sort_by_key(|s| s.current_load);
        }

        available.first().map(|s| s.id.clone())
    }

    /// Capability to specialist assignments, skipping capabilities nobody covers
    pub fn select_specialists_for_capabilities(
        &self,
        capabilities: &[Capability],
        prefer_performance: bool,
    ) -> Vec<(Capability, String)> {
        capabilities
            .iter()
            .filter_map(|cap| {
                self.select_specialist(*cap, prefer_performance)
                    .map(|id| (*cap, id))
            })
            .collect()
    }

    /// Adjust load by `delta`, never below zero, and return the new load
    pub fn update_load(&self, id: &str, delta: i64) -> Result<u32, EngineError> {
        let mut inner = self.lock();
        let info = inner
            .specialists
            .get_mut(id)
            .ok_or_else(|| EngineError::SpecialistNotFound(id.to_string()))?;

        let next = (i64::from(info.current_load) + delta).max(0);
        info.current_load = u32::try_from(next).unwrap_or(u32::MAX);
        info.refresh_availability();
        Ok(info.current_load)
    }

    /// Take one load slot, released when the guard drops
    pub fn acquire(&self, id: &str) -> Result<LoadGuard, EngineError> {
        self.update_load(id, 1)?;
        Ok(LoadGuard {
            registry: self.clone(),
            id: id.to_string(),
        })
    }

    /// Fold a delegation result into the specialist's history
    ///
    /// Returns the new performance score.
    pub fn record_result(&self, id: &str, success: bool, duration_ms: i64) -> Option<f64> {
        let mut inner = self.lock();
        let info = inner.specialists.get_mut(id)?;

        if success {
            info.success_count += 1;
        } else {
            info.failure_count += 1;
        }
        info.total_execution_time_ms += duration_ms.max(0);
        info.last_task_at = Some(now_millis());

        let signal = if success { 1.0 } else { 0.0 };
        info.performance_score =
            PERFORMANCE_DECAY * info.performance_score + (1.0 - PERFORMANCE_DECAY) * signal;
        Some(info.performance_score)
    }

    pub fn set_offline(&self, id: &str) -> Result<(), EngineError> {
        let mut inner = self.lock();
        let info = inner
            .specialists
            .get_mut(id)
            .ok_or_else(|| EngineError::SpecialistNotFound(id.to_string()))?;
        info.availability = Availability::Offline;
        Ok(())
    }

    pub fn set_online(&self, id: &str) -> Result<(), EngineError> {
        let mut inner = self.lock();
        let info = inner
            .specialists
            .get_mut(id)
            .ok_or_else(|| EngineError::SpecialistNotFound(id.to_string()))?;
        info.availability = Availability::Available;
        info.refresh_availability();
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<SpecialistInfo> {
        self.lock().specialists.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().specialists.contains_key(id)
    }

    /// All specialists in registration order
    pub fn list(&self) -> Vec<SpecialistInfo> {
        let mut all: Vec<SpecialistInfo> = self.lock().specialists.values().cloned().collect();
        all.sort_by_key(|s| s.registration_seq);
        all
    }

    pub fn len(&self) -> usize {
        self.lock().specialists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self, id: &str) -> Option<SpecialistMetrics> {
        self.lock().specialists.get(id).map(SpecialistInfo::to_metrics)
    }

    pub fn snapshot_metrics(&self) -> Vec<SpecialistMetrics> {
        self.list().iter().map(SpecialistInfo::to_metrics).collect()
    }

    /// Reload history from persisted metrics
    ///
    /// Unknown specialists are registered from the stored definition. Returns
    /// how many records were applied.
    pub fn restore_metrics(&self, stored: &[SpecialistMetrics]) -> usize {
        let mut applied = 0;
        for metrics in stored {
            if !self.contains(&metrics.specialist_id) {
                if let Err(e) = self.register_specialist(
                    &metrics.specialist_id,
                    metrics.kind,
                    &metrics.capabilities,
                    metrics.max_load.max(1),
                ) {
                    warn!("Skipping stored specialist {}: {}", metrics.specialist_id, e);
                    continue;
                }
            }

            let mut inner = self.lock();
            if let Some(info) = inner.specialists.get_mut(&metrics.specialist_id) {
                info.performance_score = metrics.performance_score.clamp(0.0, 1.0);
                info.success_count = u64::try_from(metrics.successful_tasks).unwrap_or(0);
                info.failure_count = u64::try_from(metrics.failed_tasks).unwrap_or(0);
                info.total_execution_time_ms = metrics.total_execution_time_ms.max(0);
                info.last_task_at = metrics.last_task_at;
                applied += 1;
            }
        }
        applied
    }
}

/// Holds one load slot on a specialist
#[must_use = "the load slot is released as soon as the guard is dropped"]
pub struct LoadGuard {
    registry: SpecialistRegistry,
    id: String,
}

impl LoadGuard {
    pub fn specialist_id(&self) -> &str {
        &self.id
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        if let Err(e) = self.registry.update_load(&self.id, -1) {
            debug!("Load release for {} skipped: {}", self.id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registration_validates_kind_table() {
        let registry = SpecialistRegistry::new();

        let err = registry
            .register_specialist(
                "doc",
                SpecialistKind::DocumentSpecialist,
                &[Capability::Research],
                5,
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRegistration { .. }));

        assert!(registry
            .register_specialist("doc", SpecialistKind::DocumentSpecialist, &[], 0)
            .is_err());
        assert!(registry
            .register_specialist(MERGER_ID, SpecialistKind::DocumentSpecialist, &[], 1)
            .is_err());

        registry
            .register_specialist("doc", SpecialistKind::DocumentSpecialist, &[], 5)
            .unwrap();
        assert_eq!(
            registry.get("doc").unwrap().capabilities,
            SpecialistKind::DocumentSpecialist.capabilities().to_vec()
        );
    }

    #[test]
    fn test_overloaded_then_available() {
        let registry = SpecialistRegistry::new();
        registry
            .register_specialist("r", SpecialistKind::ResearchSpecialist, &[], 2)
            .unwrap();

        registry.update_load("r", 1).unwrap();
        assert_eq!(registry.get("r").unwrap().availability, Availability::Busy);
        registry.update_load("r", 1).unwrap();
        assert_eq!(
            registry.get("r").unwrap().availability,
            Availability::Overloaded
        );

        registry.update_load("r", -1).unwrap();
        registry.update_load("r", -1).unwrap();
        let info = registry.get("r").unwrap();
        assert_eq!(info.current_load, 0);
        assert_eq!(info.availability, Availability::Available);
    }

    #[test]
    fn test_update_load_clamps_at_zero() {
        let registry = SpecialistRegistry::new();
        registry
            .register_specialist("r", SpecialistKind::ResearchSpecialist, &[], 2)
            .unwrap();

        assert_eq!(registry.update_load("r", -5).unwrap(), 0);
        assert!(registry.update_load("ghost", 1).is_err());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let registry = SpecialistRegistry::new();
        registry
            .register_specialist("r", SpecialistKind::ResearchSpecialist, &[], 3)
            .unwrap();

        {
            let _a = registry.acquire("r").unwrap();
            let _b = registry.acquire("r").unwrap();
            assert_eq!(registry.get("r").unwrap().current_load, 2);
        }
        assert_eq!(registry.get("r").unwrap().current_load, 0);
    }

    #[test]
    fn test_selection_prefers_performance_then_load() {
        let registry = SpecialistRegistry::new();
        for id in ["a", "b", "c"] {
            registry
                .register_specialist(id, SpecialistKind::ResearchSpecialist, &[], 5)
                .unwrap();
        }

        // Equal scores and loads: earliest registration wins
        assert_eq!(
            registry.select_specialist(Capability::Research, true),
            Some("a".to_string())
        );

        registry.update_load("a", 2).unwrap();
        assert_eq!(
            registry.select_specialist(Capability::Research, true),
            Some("b".to_string())
        );

        registry.record_result("c", true, 10);
        assert_eq!(
            registry.select_specialist(Capability::Research, true),
            Some("c".to_string())
        );
        assert_eq!(
            registry.select_specialist(Capability::Research, false),
            Some("b".to_string())
        );
    }

    #[test]
    fn test_selection_falls_back_when_exhausted() {
        let registry = SpecialistRegistry::new();
        registry
            .register_specialist("only", SpecialistKind::CreativeSynthesizer, &[], 1)
            .unwrap();
        registry.update_load("only", 1).unwrap();

        assert_eq!(
            registry.select_specialist(Capability::CreativeWriting, true),
            Some("only".to_string())
        );
        assert_eq!(registry.select_specialist(Capability::Research, true), None);
    }

    #[test]
    fn test_selection_falls_back_to_kind() {
        let registry = SpecialistRegistry::new();
        registry
            .register_specialist(
                "ocr-only",
                SpecialistKind::DocumentSpecialist,
                &[Capability::Ocr],
                5,
            )
            .unwrap();

        assert_eq!(
            registry.select_specialist(Capability::DocumentSummary, true),
            Some("ocr-only".to_string())
        );
    }

    #[test]
    fn test_offline_is_sticky_until_online() {
        let registry = SpecialistRegistry::new();
        registry
            .register_specialist("k", SpecialistKind::KnowledgeArchitect, &[], 5)
            .unwrap();
        registry
            .register_specialist("k2", SpecialistKind::KnowledgeArchitect, &[], 5)
            .unwrap();

        registry.set_offline("k").unwrap();
        registry.update_load("k", 1).unwrap();
        registry.update_load("k", -1).unwrap();
        assert_eq!(registry.get("k").unwrap().availability, Availability::Offline);
        assert_eq!(
            registry.select_specialist(Capability::Education, true),
            Some("k2".to_string())
        );

        registry.set_online("k").unwrap();
        assert_eq!(
            registry.get("k").unwrap().availability,
            Availability::Available
        );
    }

    #[test]
    fn test_record_result_moves_performance() {
        let registry = SpecialistRegistry::new();
        registry
            .register_specialist("q", SpecialistKind::QualityAssurance, &[], 5)
            .unwrap();

        let after_success = registry.record_result("q", true, 100).unwrap();
        assert!((after_success - 0.82).abs() < 1e-9);
        let after_failure = registry.record_result("q", false, 100).unwrap();
        assert!((after_failure - 0.738).abs() < 1e-9);

        let metrics = registry.metrics("q").unwrap();
        assert_eq!(metrics.total_tasks, 2);
        assert!((metrics.success_rate - 0.5).abs() < 1e-9);
        assert!((metrics.average_execution_time_ms - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_reregistration_keeps_order_and_history() {
        let registry = SpecialistRegistry::new();
        registry
            .register_specialist("first", SpecialistKind::ToolExplorer, &[], 5)
            .unwrap();
        registry
            .register_specialist("second", SpecialistKind::ToolExplorer, &[], 5)
            .unwrap();
        registry.record_result("first", true, 5);

        registry
            .register_specialist(
                "first",
                SpecialistKind::ToolExplorer,
                &[Capability::ToolDiscovery],
                3,
            )
            .unwrap();

        let ids: Vec<String> = registry.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["first", "second"]);
        let first = registry.get("first").unwrap();
        assert_eq!(first.max_load, 3);
        assert_eq!(first.success_count, 1);
        assert_eq!(
            registry.select_specialist(Capability::ToolIntegration, false),
            Some("second".to_string())
        );
    }

    #[test]
    fn test_restore_metrics_registers_unknown() {
        let registry = SpecialistRegistry::new();
        let stored = SpecialistMetrics {
            specialist_id: "restored".to_string(),
            kind: SpecialistKind::VirtualWorldBuilder,
            capabilities: vec![Capability::Simulation],
            max_load: 4,
            performance_score: 0.6,
            total_tasks: 3,
            successful_tasks: 2,
            failed_tasks: 1,
            total_execution_time_ms: 300,
            average_execution_time_ms: 100.0,
            success_rate: 2.0 / 3.0,
            last_task_at: Some(1),
        };

        assert_eq!(registry.restore_metrics(&[stored]), 1);
        let info = registry.get("restored").unwrap();
        assert_eq!(info.max_load, 4);
        assert_eq!(info.success_count, 2);
        assert!((info.performance_score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_register_defaults() {
        let registry = SpecialistRegistry::new();
        registry.register_defaults(DEFAULT_MAX_LOAD).unwrap();
        assert_eq!(registry.len(), SpecialistKind::ALL.len());
        assert_eq!(
            registry.select_specialist(Capability::WebSearch, true),
            Some("research-specialist_default".to_string())
        );
    }
}
