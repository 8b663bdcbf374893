//! Shared pipeline data types
//!
//! Types that flow between the planner, executor, quality gate, asset
//! extractor, and aggregator. Persistence records live in `crate::db`;
//! these are the in-flight shapes.

use crate::db::tasks::TaskStatus;
use serde::{Deserialize, Serialize};

/// A task candidate produced by planning, not yet persisted
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDraft {
    pub name: String,
    pub description: String,
    pub role: String,
    pub priority: i64,
    /// Chains this draft behind the previous one in the same batch
    pub depends_on_prior: bool,
}

/// Verdict of the quality gate over one task output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityVerdict {
    /// Output counts toward the goal
    Accept,
    /// Usable but below the bar, worth one more pass
    Enhance,
    /// Not usable as-is
    Reject,
}

impl QualityVerdict {
    pub fn as_str(&self) -> &str {
        match self {
            QualityVerdict::Accept => "accept",
            QualityVerdict::Enhance => "enhance",
            QualityVerdict::Reject => "reject",
        }
    }
}

/// Outcome of a quality evaluation
#[derive(Debug, Clone)]
pub struct QualityReport {
    pub verdict: QualityVerdict,
    pub score: f64,
    /// Human-readable findings, fed back to the agent on revision
    pub reasons: Vec<String>,
}

/// Kind of work product recoverable from a task result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    ContactList,
    MessageSequence,
    Document,
    StructuredTable,
    GenericContent,
}

impl AssetKind {
    /// Stable slug used in asset descriptors and deliverable kinds
    pub fn slug(&self) -> &'static str {
        match self {
            AssetKind::ContactList => "contact-list",
            AssetKind::MessageSequence => "message-sequence",
            AssetKind::Document => "document",
            AssetKind::StructuredTable => "structured-table",
            AssetKind::GenericContent => "generic-content",
        }
    }

    /// Human-readable name used when composing deliverable titles
    pub fn display_name(&self) -> &'static str {
        match self {
            AssetKind::ContactList => "contact list",
            AssetKind::MessageSequence => "message sequence",
            AssetKind::Document => "document",
            AssetKind::StructuredTable => "table",
            AssetKind::GenericContent => "collected output",
        }
    }

    /// Parse a classifier label, tolerating both slug and snake_case forms
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "contact_list" | "contacts" => AssetKind::ContactList,
            "message_sequence" | "sequence" | "messages" => AssetKind::MessageSequence,
            "document" | "doc" => AssetKind::Document,
            "structured_table" | "table" => AssetKind::StructuredTable,
            _ => AssetKind::GenericContent,
        }
    }
}

/// A typed work product extracted from a completed task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    /// Deterministic descriptor, stable across re-extraction of the same task
    pub name: String,
    pub kind: AssetKind,
    pub content: serde_json::Value,
    pub source_task_id: String,
}

/// Result payload stored on a completed task (`tasks.result`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// Parsed JSON when the agent produced structure, raw text otherwise
    pub content: serde_json::Value,
    pub quality_score: f64,
    pub verdict: QualityVerdict,
    #[serde(default)]
    pub token_usage: i64,
}

impl TaskResult {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// An insight candidate before dedup, floors, and capacity checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightDraft {
    #[serde(default)]
    pub agent_role: String,
    #[serde(default = "default_insight_type", alias = "type")]
    pub insight_type: String,
    pub content: String,
    #[serde(default, alias = "tags")]
    pub relevance_tags: Vec<String>,
    #[serde(default = "default_confidence", alias = "confidence")]
    pub confidence_score: f64,
}

fn default_insight_type() -> String {
    "observation".to_string()
}

fn default_confidence() -> f64 {
    0.5
}

/// Outcome summary for one dispatched task
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task_id: String,
    pub name: String,
    pub status: TaskStatus,
    pub quality_score: Option<f64>,
}

/// What one orchestrator cycle did to a workspace
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub workspace_id: String,
    pub tasks_planned: usize,
    pub tasks_run: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub deliverables_updated: usize,
    pub goals_completed: usize,
    /// Set when the workspace crossed the stall limit this cycle
    pub escalated: bool,
}

impl CycleReport {
    /// The cycle moved the workspace forward
    pub fn progressed(&self) -> bool {
        self.tasks_completed > 0 || self.deliverables_updated > 0 || self.goals_completed > 0
    }

    /// Work ran but nothing landed. An idle cycle is not a stall.
    pub fn stalled(&self) -> bool {
        self.tasks_run > 0 && !self.progressed()
    }
}
