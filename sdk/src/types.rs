//! Specialist vocabulary and wire types
//!
//! Capabilities and specialist kinds form a closed set. Every capability maps
//! to exactly one kind through a static table, and a kind lists the
//! capabilities it may be registered with.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A capability a specialist can provide
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    DocumentAnalysis,
    DocumentSummary,
    Ocr,
    PdfProcessing,
    ToolDiscovery,
    ToolIntegration,
    CreativeWriting,
    ContentSynthesis,
    KnowledgeExtraction,
    Education,
    WorldBuilding,
    Simulation,
    QualityAssurance,
    SelfCorrection,
    Research,
    WebSearch,
    /// Synthetic capability of the in-engine merge step. No specialist kind
    /// provides it.
    MergeResults,
}

impl Capability {
    pub const ALL: [Capability; 17] = [
        Capability::DocumentAnalysis,
        Capability::DocumentSummary,
        Capability::Ocr,
        Capability::PdfProcessing,
        Capability::ToolDiscovery,
        Capability::ToolIntegration,
        Capability::CreativeWriting,
        Capability::ContentSynthesis,
        Capability::KnowledgeExtraction,
        Capability::Education,
        Capability::WorldBuilding,
        Capability::Simulation,
        Capability::QualityAssurance,
        Capability::SelfCorrection,
        Capability::Research,
        Capability::WebSearch,
        Capability::MergeResults,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::DocumentAnalysis => "document_analysis",
            Capability::DocumentSummary => "document_summary",
            Capability::Ocr => "ocr",
            Capability::PdfProcessing => "pdf_processing",
            Capability::ToolDiscovery => "tool_discovery",
            Capability::ToolIntegration => "tool_integration",
            Capability::CreativeWriting => "creative_writing",
            Capability::ContentSynthesis => "content_synthesis",
            Capability::KnowledgeExtraction => "knowledge_extraction",
            Capability::Education => "education",
            Capability::WorldBuilding => "world_building",
            Capability::Simulation => "simulation",
            Capability::QualityAssurance => "quality_assurance",
            Capability::SelfCorrection => "self_correction",
            Capability::Research => "research",
            Capability::WebSearch => "web_search",
            Capability::MergeResults => "merge_results",
        }
    }

    /// The specialist kind responsible for this capability
    pub fn specialist_kind(&self) -> Option<SpecialistKind> {
        match self {
            Capability::DocumentAnalysis
            | Capability::DocumentSummary
            | Capability::Ocr
            | Capability::PdfProcessing => Some(SpecialistKind::DocumentSpecialist),
            Capability::ToolDiscovery | Capability::ToolIntegration => {
                Some(SpecialistKind::ToolExplorer)
            }
            Capability::CreativeWriting | Capability::ContentSynthesis => {
                Some(SpecialistKind::CreativeSynthesizer)
            }
            Capability::KnowledgeExtraction | Capability::Education => {
                Some(SpecialistKind::KnowledgeArchitect)
            }
            Capability::WorldBuilding | Capability::Simulation => {
                Some(SpecialistKind::VirtualWorldBuilder)
            }
            Capability::QualityAssurance | Capability::SelfCorrection => {
                Some(SpecialistKind::QualityAssurance)
            }
            Capability::Research | Capability::WebSearch => {
                Some(SpecialistKind::ResearchSpecialist)
            }
            Capability::MergeResults => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown capability '{}'", s))
    }
}

/// The kind of a specialist worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpecialistKind {
    DocumentSpecialist,
    ToolExplorer,
    CreativeSynthesizer,
    KnowledgeArchitect,
    VirtualWorldBuilder,
    QualityAssurance,
    ResearchSpecialist,
}

impl SpecialistKind {
    pub const ALL: [SpecialistKind; 7] = [
        SpecialistKind::DocumentSpecialist,
        SpecialistKind::ToolExplorer,
        SpecialistKind::CreativeSynthesizer,
        SpecialistKind::KnowledgeArchitect,
        SpecialistKind::VirtualWorldBuilder,
        SpecialistKind::QualityAssurance,
        SpecialistKind::ResearchSpecialist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SpecialistKind::DocumentSpecialist => "document-specialist",
            SpecialistKind::ToolExplorer => "tool-explorer",
            SpecialistKind::CreativeSynthesizer => "creative-synthesizer",
            SpecialistKind::KnowledgeArchitect => "knowledge-architect",
            SpecialistKind::VirtualWorldBuilder => "virtual-world-builder",
            SpecialistKind::QualityAssurance => "quality-assurance",
            SpecialistKind::ResearchSpecialist => "research-specialist",
        }
    }

    /// Capabilities a specialist of this kind may be registered with
    pub fn capabilities(&self) -> &'static [Capability] {
        match self {
            SpecialistKind::DocumentSpecialist => &[
                Capability::DocumentAnalysis,
                Capability::DocumentSummary,
                Capability::Ocr,
                Capability::PdfProcessing,
            ],
            SpecialistKind::ToolExplorer => {
                &[Capability::ToolDiscovery, Capability::ToolIntegration]
            }
            SpecialistKind::CreativeSynthesizer => {
                &[Capability::CreativeWriting, Capability::ContentSynthesis]
            }
            SpecialistKind::KnowledgeArchitect => {
                &[Capability::KnowledgeExtraction, Capability::Education]
            }
            SpecialistKind::VirtualWorldBuilder => {
                &[Capability::WorldBuilding, Capability::Simulation]
            }
            SpecialistKind::QualityAssurance => {
                &[Capability::QualityAssurance, Capability::SelfCorrection]
            }
            SpecialistKind::ResearchSpecialist => &[Capability::Research, Capability::WebSearch],
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

impl fmt::Display for SpecialistKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpecialistKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SpecialistKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown specialist kind '{}'", s))
    }
}

/// Request sent to a specialist for one delegation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialistRequest {
    pub delegation_id: String,
    pub task_id: String,
    pub input: serde_json::Value,
}

/// Response returned by a specialist
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecialistResponse {
    pub success: bool,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SpecialistResponse {
    /// Create a successful response
    pub fn ok(output: serde_json::Value, confidence: Option<f64>) -> Self {
        Self {
            success: true,
            output,
            confidence,
            error: None,
        }
    }

    /// Create a failed response
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            confidence: None,
            error: Some(error.into()),
        }
    }
}

/// A specialist announced by the discovery service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecialistDescriptor {
    pub id: String,
    pub kind: SpecialistKind,
    pub capabilities: Vec<Capability>,
    #[serde(default = "default_max_load")]
    pub max_load: u32,
}

fn default_max_load() -> u32 {
    5
}
