//! Kommandant SDK
//!
//! Shared library providing the error type, the specialist vocabulary and the
//! collaborator traits. This crate is used by the engine and by anything that
//! implements a specialist channel or a collaborator.

/// Collaborator traits (specialist channel, event bus, discovery, task registry)
pub mod collaborators;

/// Error types and handling
pub mod errors;

/// Capability, specialist kind and wire types
pub mod types;

// Re-export commonly used types
pub use collaborators::{
    Collaborators, EventBusLink, SpecialistChannel, SpecialistDiscovery, TaskRegistry,
};
pub use errors::{EngineError, OrchestratorErrorExt};
pub use types::{
    Capability, SpecialistDescriptor, SpecialistKind, SpecialistRequest, SpecialistResponse,
};
