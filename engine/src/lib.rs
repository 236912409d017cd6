//! Kommandant Engine Library
//!
//! This library provides the core functionality of the Kommandant
//! orchestration engine. It is used by both the main binary and
//! integration tests.

/// Configuration management module
pub mod config;

/// State store persistence module
pub mod db;

/// Message bus for orchestrator events
pub mod message_bus;

/// Conductor orchestration module
pub mod conductor;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
