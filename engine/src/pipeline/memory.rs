//! Insight memory
//!
//! Policy layer between the pipeline and the insight store. The store is
//! append-only rows; this layer decides what deserves a row: content is
//! normalized and deduplicated by hash, weak insights are refused by a
//! confidence floor (relaxed while the workspace is cold), and a full
//! workspace only admits a newcomer that beats the weakest stored insight.

use crate::config::InsightsConfig;
use crate::db::{Database, InsightRepository};
use crate::pipeline::types::InsightDraft;
use anyhow::Result;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

/// Bounded, deduplicated insight storage for a workspace
#[derive(Clone)]
pub struct InsightMemory {
    insights: InsightRepository,
    config: InsightsConfig,
}

impl InsightMemory {
    pub fn new(db: &Database, config: InsightsConfig) -> Self {
        Self {
            insights: db.insights(),
            config,
        }
    }

    /// Offer one insight. Returns whether it was stored.
    pub async fn store(&self, workspace_id: &str, draft: &InsightDraft) -> Result<bool> {
        let confidence = draft.confidence_score.clamp(0.0, 1.0);
        let hash = content_hash(&draft.content);

        if self.insights.exists_by_hash(workspace_id, &hash).await? {
            debug!(workspace_id, "Duplicate insight skipped");
            return Ok(false);
        }

        let stored = self.insights.count_for_workspace(workspace_id).await?;
        let floor = if stored < self.config.cold_start_count {
            self.config.cold_start_min_confidence
        } else {
            self.config.min_confidence
        };
        if confidence < floor {
            debug!(workspace_id, confidence, floor, "Insight below confidence floor");
            return Ok(false);
        }

        if stored >= self.config.max_per_workspace {
            let Some(weakest) = self.insights.weakest_for_workspace(workspace_id).await? else {
                return Ok(false);
            };
            if confidence <= weakest.confidence_score {
                debug!(workspace_id, "Insight no stronger than weakest stored, refused");
                return Ok(false);
            }
            self.insights.delete(&weakest.id).await?;
        }

        let id = Uuid::new_v4().to_string();
        self.insights
            .insert(
                &id,
                workspace_id,
                &draft.agent_role,
                &draft.insight_type,
                &draft.content,
                &draft.relevance_tags,
                confidence,
                &hash,
            )
            .await?;
        Ok(true)
    }

    /// Harvest insights from an accepted task result.
    ///
    /// A payload carrying an `insights` array is banked item by item;
    /// anything else yields a single task-outcome summary whose confidence
    /// tracks the quality score. Returns how many were stored.
    pub async fn bank_from_task(
        &self,
        workspace_id: &str,
        agent_role: &str,
        task_name: &str,
        content: &Value,
        quality_score: f64,
    ) -> Result<usize> {
        let mut stored = 0;

        let items = content.get("insights").and_then(|v| v.as_array());
        match items {
            Some(items) => {
                for item in items {
                    let Some(mut draft) = draft_from_item(item, quality_score) else {
                        continue;
                    };
                    if draft.agent_role.is_empty() {
                        draft.agent_role = agent_role.to_string();
                    }
                    if self.store(workspace_id, &draft).await? {
                        stored += 1;
                    }
                }
            }
            None => {
                let draft = InsightDraft {
                    agent_role: agent_role.to_string(),
                    insight_type: "task_outcome".to_string(),
                    content: format!(
                        "Completed '{}' with quality {:.2}",
                        task_name, quality_score
                    ),
                    relevance_tags: Vec::new(),
                    confidence_score: quality_score,
                };
                if self.store(workspace_id, &draft).await? {
                    stored += 1;
                }
            }
        }

        Ok(stored)
    }
}

/// Parse one element of an `insights` array, accepting objects or bare strings
fn draft_from_item(item: &Value, default_confidence: f64) -> Option<InsightDraft> {
    if let Some(text) = item.as_str() {
        return Some(InsightDraft {
            agent_role: String::new(),
            insight_type: "observation".to_string(),
            content: text.to_string(),
            relevance_tags: Vec::new(),
            confidence_score: default_confidence,
        });
    }
    serde_json::from_value(item.clone()).ok()
}

/// Hash of the normalized content, used for dedup
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(normalize(content).as_bytes()))
}

/// Lowercase with runs of whitespace collapsed, so trivial reformatting
/// does not defeat dedup
fn normalize(content: &str) -> String {
    content
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
