//! Error types and handling
//!
//! This module provides the error types used throughout the Kommandant engine.
//! All errors implement the `OrchestratorErrorExt` trait which provides
//! user-friendly hints and indicates whether errors are recoverable.
//!
//! Two failure kinds from the delegation taxonomy never appear here because
//! they are absorbed where they happen: a prompt that matches no capability
//! keyword degrades to a default capability, and an exhausted specialist pool
//! degrades to the first capability match. Both are logged, not raised.

use thiserror::Error;

/// Trait for Kommandant error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information. All engine errors implement this trait.
pub trait OrchestratorErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to hand back to callers of the orchestrator and does
    /// not contain prompts, payloads or internal identifiers.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried (the orchestrator tolerates
    /// re-execution of a task id). Non-recoverable errors need an operator.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Error Categories
///
/// - **Configuration**: Invalid or missing configuration
/// - **Database**: SQLite operation failures
/// - **Validation**: Rejected task input or specialist registration
/// - **Delegation**: Specialist timeouts, failures and send failures
/// - **Plan**: Majority of plan steps failed
/// - **Orchestrator**: Unexpected faults caught at the orchestrator boundary
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, OrchestratorErrorExt};
///
/// let error = EngineError::DelegationTimeout {
///     specialist_id: "research-specialist_default".to_string(),
///     timeout_secs: 60,
/// };
/// println!("Hint: {}", error.user_hint());
/// assert!(error.is_recoverable());
///
/// let fatal_error = EngineError::InvalidTransition {
///     from: "stopped".to_string(),
///     to: "idle".to_string(),
/// };
/// assert!(!fatal_error.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    // Input validation
    #[error("Validation error: {0}")]
    Validation(String),

    // Task lookup
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task already running: {0}")]
    TaskAlreadyRunning(String),

    // Specialist registry errors
    #[error("Specialist not found: {0}")]
    SpecialistNotFound(String),

    #[error("Invalid specialist registration for {id}: {reason}")]
    InvalidRegistration { id: String, reason: String },

    // State machine
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // Delegation errors
    #[error("Delegation to {specialist_id} timed out after {timeout_secs}s")]
    DelegationTimeout {
        specialist_id: String,
        timeout_secs: u64,
    },

    #[error("Specialist {specialist_id} reported failure: {reason}")]
    DelegationFailure {
        specialist_id: String,
        reason: String,
    },

    #[error("Failed to send delegation to {specialist_id}: {reason}")]
    DelegationSend {
        specialist_id: String,
        reason: String,
    },

    // Plan errors
    #[error("Plan failed: {failed} of {total} steps failed")]
    PlanTotalFailure { failed: usize, total: usize },

    // Orchestrator boundary
    #[error("Orchestrator fault: {0}")]
    OrchestratorFault(String),

    // External collaborators (event bus, discovery, task registry)
    #[error("Collaborator unavailable: {0}")]
    Collaborator(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",
            Self::Database(_) => "State store operation failed. Try again shortly",
            Self::Validation(_) => "The request was rejected. Check the task fields",

            Self::TaskNotFound(_) => "Unknown task. Submit it with receive_task first",
            Self::TaskAlreadyRunning(_) => "The task is already executing",

            Self::SpecialistNotFound(_) => "No specialist is registered under that id",
            Self::InvalidRegistration { .. } => {
                "Specialist capabilities do not match its declared kind"
            }

            Self::InvalidTransition { .. } => "The orchestrator cannot do that in its current state",

            Self::DelegationTimeout { .. } => "A specialist took too long to respond. Try again",
            Self::DelegationFailure { .. } => "A specialist could not complete its part",
            Self::DelegationSend { .. } => "A specialist could not be reached",

            Self::PlanTotalFailure { .. } => "Most specialists failed. Try rephrasing the task",

            Self::OrchestratorFault(_) => "The orchestrator hit an internal error",
            Self::Collaborator(_) => "An external service is unavailable",

            Self::Serialization(_) => "Malformed payload",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Non-recoverable errors
            Self::Config(_) | Self::InvalidRegistration { .. } | Self::InvalidTransition { .. } => {
                false
            }

            // All other errors are potentially recoverable
            _ => true,
        }
    }
}
