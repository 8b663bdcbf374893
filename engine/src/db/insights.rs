//! Insight persistence operations
//!
//! Insights are small reusable learnings agents bank between tasks. Identity
//! is the content hash per workspace; the capacity policy (floors, eviction)
//! lives in the pipeline layer, this repository only stores and queries.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};

/// Insight record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub workspace_id: String,
    pub agent_role: String,
    pub insight_type: String,
    pub content: String,
    pub relevance_tags: Vec<String>,
    pub confidence_score: f64,
    pub content_hash: String,
    pub created_at: i64,
}

/// Insight repository for database operations
#[derive(Clone)]
pub struct InsightRepository {
    pool: SqlitePool,
}

impl InsightRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new insight
    ///
    /// Fails on a duplicate (workspace, content_hash) pair.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        &self,
        id: &str,
        workspace_id: &str,
        agent_role: &str,
        insight_type: &str,
        content: &str,
        relevance_tags: &[String],
        confidence_score: f64,
        content_hash: &str,
    ) -> Result<Insight> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
        let tags_json = serde_json::to_string(relevance_tags)?;

        sqlx::query(
            "INSERT INTO insights (id, workspace_id, agent_role, insight_type, content,
                                   relevance_tags, confidence_score, content_hash, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(workspace_id)
        .bind(agent_role)
        .bind(insight_type)
        .bind(content)
        .bind(&tags_json)
        .bind(confidence_score.clamp(0.0, 1.0))
        .bind(content_hash)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to insert insight")?;

        Ok(Insight {
            id: id.to_string(),
            workspace_id: workspace_id.to_string(),
            agent_role: agent_role.to_string(),
            insight_type: insight_type.to_string(),
            content: content.to_string(),
            relevance_tags: relevance_tags.to_vec(),
            confidence_score: confidence_score.clamp(0.0, 1.0),
            content_hash: content_hash.to_string(),
            created_at: now,
        })
    }

    /// Whether a content hash is already banked for a workspace
    pub async fn exists_by_hash(&self, workspace_id: &str, content_hash: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM insights WHERE workspace_id = ? AND content_hash = ?",
        )
        .bind(workspace_id)
        .bind(content_hash)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check insight hash")?;

        Ok(count > 0)
    }

    /// Stored insight count for a workspace
    pub async fn count_for_workspace(&self, workspace_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM insights WHERE workspace_id = ?")
            .bind(workspace_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count insights")?;

        Ok(count)
    }

    /// The eviction candidate: lowest confidence, oldest first
    pub async fn weakest_for_workspace(&self, workspace_id: &str) -> Result<Option<Insight>> {
        let row = sqlx::query(
            "SELECT * FROM insights WHERE workspace_id = ?
             ORDER BY confidence_score ASC, created_at ASC
             LIMIT 1",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch weakest insight")?;

        Ok(row.map(|r| map_insight(&r)))
    }

    /// Delete an insight by ID
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM insights WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to delete insight")?;

        Ok(())
    }

    /// Recent insights for a workspace, newest first
    pub async fn list_for_workspace(&self, workspace_id: &str, limit: i64) -> Result<Vec<Insight>> {
        let rows = sqlx::query(
            "SELECT * FROM insights WHERE workspace_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(workspace_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list insights")?;

        Ok(rows.iter().map(map_insight).collect())
    }
}

fn map_insight(r: &sqlx::sqlite::SqliteRow) -> Insight {
    let tags_json: String = r.get("relevance_tags");
    Insight {
        id: r.get("id"),
        workspace_id: r.get("workspace_id"),
        agent_role: r.get("agent_role"),
        insight_type: r.get("insight_type"),
        content: r.get("content"),
        relevance_tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        confidence_score: r.get("confidence_score"),
        content_hash: r.get("content_hash"),
        created_at: r.get("created_at"),
    }
}
