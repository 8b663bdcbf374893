//! CLI interface for Foreman
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags for driving the goal pipeline.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Foreman Goal Engine
///
/// An autonomous delivery pipeline: point it at a quantified goal and it
/// plans tasks, runs them through model-backed agents, quality-gates the
/// output, and folds accepted results into durable deliverables.
#[derive(Parser, Debug)]
#[command(name = "foreman")]
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
    /// Create a workspace with its goals and agents
    Init {
        /// Workspace name, unique across the engine
        #[arg(long)]
        name: String,

        /// Mission statement giving agents their shared context
        #[arg(long, default_value = "")]
        mission: String,

        /// Goal spec, repeatable (e.g. --goal qualified_leads=50:leads)
        #[arg(long = "goal", value_name = "METRIC=TARGET[:UNIT]")]
        goals: Vec<String>,

        /// Agent spec, repeatable (e.g. --agent Mira:researcher:senior)
        #[arg(long = "agent", value_name = "NAME:ROLE[:SENIORITY]")]
        agents: Vec<String>,

        /// Optional spend budget for the workspace
        #[arg(long)]
        budget: Option<f64>,
    },

    /// Run one plan-execute-aggregate cycle for a workspace
    Cycle {
        /// Workspace id or name
        workspace: String,
    },

    /// Run the orchestrator loop over every workspace until Ctrl-C
    Run,

    /// Show workspace status, or all workspaces when none is given
    Status {
        /// Workspace id or name
        workspace: Option<String>,
    },

    /// List deliverables for a workspace
    Deliverables {
        /// Workspace id or name
        workspace: String,

        /// Only show deliverables attached to this goal
        #[arg(long, value_name = "GOAL_ID")]
        goal: Option<String>,

        /// Print full deliverable content instead of a summary
        #[arg(long)]
        full: bool,
    },

    /// Force aggregation for a workspace, skipping batch and cooldown gates
    Aggregate {
        /// Workspace id or name
        workspace: String,
    },

    /// List banked insights for a workspace
    Insights {
        /// Workspace id or name
        workspace: String,

        /// Number of insights to show (default: 20)
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Show recent task executions for a workspace
    History {
        /// Workspace id or name
        workspace: String,

        /// Number of executions to show (default: 10)
        #[arg(short, long, default_value = "10")]
        limit: i64,
    },

    /// Cancel a task that has not finished
    Cancel {
        /// Task ID to cancel
        task_id: String,
    },

    /// Run system diagnostics
    Doctor,
}
