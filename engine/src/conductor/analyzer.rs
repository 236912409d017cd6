//! Prompt analysis
//!
//! Keyword matching over the lower-cased prompt decides which capabilities a
//! task needs, how complex it is and how it should be split. No model is
//! involved; the same prompt always yields the same analysis apart from the
//! learned confidence.

use sdk::{Capability, SpecialistKind};
use tracing::{debug, warn};

use super::learning::LearningLoop;
use super::types::{DelegationStrategy, Task, TaskAnalysis};

/// Metadata key that forces a delegation strategy
pub const STRATEGY_OVERRIDE_KEY: &str = "delegation_strategy";

const DOCUMENT_KEYWORDS: &[&str] = &["dokument", "document", "pdf", "analyse", "summary", "opsummer"];
const SUMMARY_KEYWORDS: &[&str] = &["opsummer", "summary"];
const RESEARCH_KEYWORDS: &[&str] = &["søg", "search", "find", "research", "undersøg"];
const CREATIVE_KEYWORDS: &[&str] = &["skriv", "write", "create", "opret", "kreativ"];
const KNOWLEDGE_KEYWORDS: &[&str] = &["lær", "learn", "forklar", "explain", "viden"];

#[derive(Debug, Clone)]
pub struct AnalyzerSettings {
    pub base_complexity: f64,
    pub base_duration_secs: u64,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            base_complexity: 0.5,
            base_duration_secs: 10,
        }
    }
}

fn mentions(prompt: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| prompt.contains(kw))
}

#[derive(Debug, Clone, Default)]
pub struct TaskAnalyzer {
    settings: AnalyzerSettings,
}

impl TaskAnalyzer {
    pub fn new(settings: AnalyzerSettings) -> Self {
        Self { settings }
    }

    pub fn analyze(&self, task: &Task, learning: &LearningLoop) -> TaskAnalysis {
        let prompt = task.prompt.to_lowercase();
        let mut capabilities: Vec<Capability> = Vec::new();
        let mut complexity = self.settings.base_complexity;
        let mut notes = Vec::new();

        if mentions(&prompt, DOCUMENT_KEYWORDS) {
            capabilities.push(Capability::DocumentAnalysis);
            if mentions(&prompt, SUMMARY_KEYWORDS) {
                capabilities.push(Capability::DocumentSummary);
            }
        }
        if mentions(&prompt, RESEARCH_KEYWORDS) {
            capabilities.push(Capability::Research);
            complexity += 0.1;
        }
        if mentions(&prompt, CREATIVE_KEYWORDS) {
            capabilities.push(Capability::CreativeWriting);
            complexity += 0.1;
        }
        if mentions(&prompt, KNOWLEDGE_KEYWORDS) {
            capabilities.push(Capability::KnowledgeExtraction);
        }

        if capabilities.is_empty() {
            debug!(
                "No capability keywords in task {}, defaulting to document analysis",
                task.task_id
            );
            notes.push("No capability keywords matched, using document analysis".to_string());
            capabilities.push(Capability::DocumentAnalysis);
        }

        let mut kinds: Vec<SpecialistKind> = Vec::new();
        for kind in capabilities.iter().filter_map(|c| c.specialist_kind()) {
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }

        let mut strategy = match kinds.len() {
            0 | 1 => DelegationStrategy::Single,
            2 => {
                complexity += 0.1;
                DelegationStrategy::Sequential
            }
            _ => {
                complexity += 0.2;
                DelegationStrategy::Parallel
            }
        };

        if let Some(raw) = task.metadata_str(STRATEGY_OVERRIDE_KEY) {
            match raw.parse::<DelegationStrategy>() {
                Ok(forced) => {
                    notes.push(format!("Strategy {} requested by caller", forced));
                    strategy = forced;
                }
                Err(e) => {
                    warn!("Ignoring strategy override on task {}: {}", task.task_id, e);
                    notes.push(format!("Ignored strategy override '{}'", raw));
                }
            }
        }

        // Duration uses the complexity before it is capped
        let estimated_duration_secs = (self.settings.base_duration_secs as f64
            * (1.0 + complexity)
            * kinds.len() as f64) as u64;

        let signature = super::types::capability_signature(&capabilities);
        let confidence = learning.confidence_for(&signature);
        notes.push(format!("Identified {} capabilities", capabilities.len()));

        TaskAnalysis {
            task_id: task.task_id.clone(),
            required_capabilities: capabilities,
            complexity: complexity.min(1.0),
            recommended_specialists: kinds,
            strategy,
            estimated_duration_secs,
            confidence,
            notes,
        }
    }
}
