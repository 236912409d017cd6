//! CLI interface for Kommandant
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags for driving an orchestrator
//! instance against the local state store.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Kommandant task orchestrator
///
/// Receives tasks, splits them across specialists, executes the plan and
/// learns from the outcome. State lives in a local SQLite store so
/// interrupted tasks can be recovered.
#[derive(Parser, Debug)]
#[command(name = "kommandant")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Receive and execute a task immediately
    Run {
        /// The task prompt
        prompt: String,

        /// Task id (generated when omitted)
        #[arg(long)]
        task_id: Option<String>,

        /// Conversation or session the task belongs to
        #[arg(long, default_value = "cli")]
        context: String,

        /// Priority name or level (critical, high, normal, low, background or 1-5)
        #[arg(short, long, default_value = "normal")]
        priority: String,

        /// Force a delegation strategy (single, parallel, sequential, collaborative)
        #[arg(long)]
        strategy: Option<String>,
    },

    /// Find tasks left pending or running by a previous process
    Recover {
        /// Execute the recovered tasks
        #[arg(long)]
        execute: bool,
    },

    /// Show state store statistics and learned confidence
    Status,

    /// List specialists and their performance
    Specialists,

    /// Show recent task history
    History {
        /// Number of tasks to show (default: 10)
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show recent audit entries
    Audit {
        /// Number of entries to show (default: 20)
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Only entries recorded by this actor
        #[arg(long)]
        actor: Option<String>,
    },

    /// Show checkpoints recorded for a task
    Checkpoints {
        /// Task ID
        task_id: String,

        /// Number of checkpoints to show (default: 20)
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Cancel a task that has not run yet
    Cancel {
        /// Task ID to cancel
        task_id: String,
    },
}
