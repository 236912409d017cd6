//! Learning loop
//!
//! Turns each finished execution into an `Experience` and nudges the learned
//! confidence for the task's capability signature up or down.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::db::{now_millis, StateManager};

use super::types::{
    short_id, AggregateResult, Experience, TaskAnalysis, TaskOutcome, DEFAULT_CONFIDENCE,
    MAX_CONFIDENCE, MIN_CONFIDENCE,
};

/// Experiences kept in memory; older ones stay in the store only
const MAX_EXPERIENCES_IN_MEMORY: usize = 1000;

pub struct LearningLoop {
    owner_id: String,
    confidences: Mutex<HashMap<String, f64>>,
    experiences: Mutex<VecDeque<Experience>>,
    state: Option<StateManager>,
}

impl LearningLoop {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            confidences: Mutex::new(HashMap::new()),
            experiences: Mutex::new(VecDeque::new()),
            state: None,
        }
    }

    /// Learning loop that persists confidence and experiences
    pub fn with_state(owner_id: impl Into<String>, state: StateManager) -> Self {
        let mut learning = Self::new(owner_id);
        learning.state = Some(state);
        learning
    }

    /// Learned confidence for a capability signature, 0.7 when unknown
    pub fn confidence_for(&self, signature: &str) -> f64 {
        self.confidences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(signature)
            .copied()
            .unwrap_or(DEFAULT_CONFIDENCE)
    }

    /// Set a confidence directly, clamped to the valid range
    pub fn set_confidence(&self, signature: &str, value: f64) -> f64 {
        let value = value.clamp(MIN_CONFIDENCE, MAX_CONFIDENCE);
        self.confidences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(signature.to_string(), value);
        value
    }

    pub fn confidences(&self) -> HashMap<String, f64> {
        self.confidences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Reload learned confidences for this owner. Returns how many were loaded.
    pub async fn restore(&self) -> anyhow::Result<usize> {
        let Some(state) = &self.state else {
            return Ok(0);
        };
        let stored = state.load_confidences(&self.owner_id).await?;
        let count = stored.len();
        for (signature, value) in stored {
            self.set_confidence(&signature, value);
        }
        Ok(count)
    }

    /// Record the outcome of one execution
    pub async fn learn(
        &self,
        task_id: &str,
        analysis: &TaskAnalysis,
        aggregate: &AggregateResult,
        duration_ms: i64,
    ) -> Experience {
        let outcome = aggregate.outcome();
        let signature = analysis.signature();
        let mut success_factors = Vec::new();
        let mut failure_factors = Vec::new();
        let mut lessons = Vec::new();

        match outcome {
            TaskOutcome::Success => {
                success_factors.push(format!("Strategy {} worked well", analysis.strategy));
                for specialist in aggregate.successful_specialists() {
                    success_factors.push(format!("Specialist {} performed well", specialist));
                }
            }
            TaskOutcome::Failure | TaskOutcome::Timeout => {
                for specialist in aggregate.failed_specialists() {
                    failure_factors.push(format!("Specialist {} failed", specialist));
                }
                if let Some(error) = aggregate.error_summary() {
                    let short: String = error.chars().take(50).collect();
                    failure_factors.push(format!("Error: {}", short));
                }
                lessons.push("Consider alternative specialists for this task type".to_string());
            }
            TaskOutcome::RequiresHuman => {
                lessons.push("No specialist covered this task type".to_string());
            }
            _ => {
                lessons.push("Partial success - review delegation strategy".to_string());
            }
        }

        let delta = outcome.confidence_delta();
        let updated = self.set_confidence(&signature, self.confidence_for(&signature) + delta);

        let experience = Experience {
            experience_id: short_id("exp", 12),
            task_id: task_id.to_string(),
            signature: signature.clone(),
            outcome,
            duration_ms,
            specialists_used: aggregate.specialists_used(),
            strategy: analysis.strategy,
            success_factors,
            failure_factors,
            lessons_learned: lessons,
            confidence_delta: delta,
            created_at: now_millis(),
        };

        {
            let mut experiences = self.experiences.lock().unwrap_or_else(|e| e.into_inner());
            if experiences.len() >= MAX_EXPERIENCES_IN_MEMORY {
                experiences.pop_front();
            }
            experiences.push_back(experience.clone());
        }

        if let Some(state) = &self.state {
            if let Err(e) = state.save_confidence(&self.owner_id, &signature, updated).await {
                warn!("Failed to persist confidence for {}: {:#}", signature, e);
            }
            if let Err(e) = state.append_experience(&self.owner_id, &experience).await {
                warn!(
                    "Failed to persist experience {}: {:#}",
                    experience.experience_id, e
                );
            }
        }

        debug!(
            "Learned from task {}: {} (confidence {} -> {:.2})",
            task_id, outcome, signature, updated
        );
        experience
    }

    /// The newest `limit` experiences, oldest first
    pub fn experiences(&self, limit: usize) -> Vec<Experience> {
        let experiences = self.experiences.lock().unwrap_or_else(|e| e.into_inner());
        let skip = experiences.len().saturating_sub(limit);
        experiences.iter().skip(skip).cloned().collect()
    }

    pub fn experience_count(&self) -> usize {
        self.experiences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::types::{
        DelegationStatus, DelegationStrategy, StepFailure, StepResult,
    };
    use sdk::{Capability, SpecialistKind};
    use serde_json::json;

    fn analysis() -> TaskAnalysis {
        TaskAnalysis {
            task_id: "t".to_string(),
            required_capabilities: vec![Capability::Research],
            complexity: 0.6,
            recommended_specialists: vec![SpecialistKind::ResearchSpecialist],
            strategy: DelegationStrategy::Single,
            estimated_duration_secs: 16,
            confidence: 0.7,
            notes: Vec::new(),
        }
    }

    fn aggregate(ok: usize, failed: DelegationStatus, failures: usize) -> AggregateResult {
        let total = ok + failures;
        AggregateResult {
            plan_id: "plan_x".to_string(),
            task_id: "t".to_string(),
            success: AggregateResult::compute_success(total, failures),
            total_steps: total,
            results: (0..ok)
                .map(|i| StepResult {
                    step_id: format!("ok{}", i),
                    specialist_id: format!("s{}", i),
                    capability: Capability::Research,
                    output: json!("done"),
                    confidence: 0.8,
                })
                .collect(),
            failures: (0..failures)
                .map(|i| StepFailure {
                    step_id: format!("bad{}", i),
                    specialist_id: format!("f{}", i),
                    status: failed,
                    error: "boom".to_string(),
                })
                .collect(),
            delegations: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_success_raises_confidence() {
        let learning = LearningLoop::new("o");
        let experience = learning
            .learn("t", &analysis(), &aggregate(1, DelegationStatus::Failed, 0), 100)
            .await;

        assert_eq!(experience.outcome, TaskOutcome::Success);
        assert!((experience.confidence_delta - 0.05).abs() < 1e-9);
        assert!((learning.confidence_for("research") - 0.75).abs() < 1e-9);
        assert!(experience
            .success_factors
            .iter()
            .any(|f| f.contains("Specialist s0")));
    }

    #[tokio::test]
    async fn test_timeout_lowers_confidence() {
        let learning = LearningLoop::new("o");
        let experience = learning
            .learn("t", &analysis(), &aggregate(0, DelegationStatus::Timeout, 1), 100)
            .await;

        assert_eq!(experience.outcome, TaskOutcome::Timeout);
        assert!((learning.confidence_for("research") - 0.65).abs() < 1e-9);
        assert_eq!(
            experience.lessons_learned,
            vec!["Consider alternative specialists for this task type".to_string()]
        );
    }

    #[tokio::test]
    async fn test_partial_success_is_neutral() {
        let learning = LearningLoop::new("o");
        let experience = learning
            .learn("t", &analysis(), &aggregate(1, DelegationStatus::Failed, 1), 100)
            .await;

        assert_eq!(experience.outcome, TaskOutcome::PartialSuccess);
        assert_eq!(experience.confidence_delta, 0.0);
        assert!((learning.confidence_for("research") - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_confidence_never_leaves_bounds() {
        let learning = LearningLoop::new("o");
        for _ in 0..40 {
            learning
                .learn("t", &analysis(), &aggregate(1, DelegationStatus::Failed, 0), 1)
                .await;
        }
        assert!((learning.confidence_for("research") - MAX_CONFIDENCE).abs() < 1e-9);

        for _ in 0..40 {
            learning
                .learn("t", &analysis(), &aggregate(0, DelegationStatus::Failed, 1), 1)
                .await;
        }
        assert!((learning.confidence_for("research") - MIN_CONFIDENCE).abs() < 1e-9);
        assert_eq!(learning.experience_count(), 80);
        assert_eq!(learning.experiences(5).len(), 5);
    }
}
