//! Deliverable persistence operations
//!
//! Deliverables are the durable outputs assembled from task assets. Identity
//! is (workspace, goal, normalized title): re-aggregating the same topic
//! enhances the existing row instead of inserting a twin. The UNIQUE
//! constraint in the schema backs the same rule at the SQL level.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};

/// Deliverable status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum DeliverableStatus {
    Draft,
    Final,
}

impl DeliverableStatus {
    pub fn as_str(&self) -> &str {
        match self {
            DeliverableStatus::Draft => "draft",
            DeliverableStatus::Final => "final",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "final" => DeliverableStatus::Final,
            _ => DeliverableStatus::Draft,
        }
    }
}

/// Canonical form of a deliverable title for identity comparison
///
/// Lowercases, strips everything but letters, digits, and spaces, and
/// collapses runs of whitespace. Applying it twice changes nothing.
pub fn normalize_title(title: &str) -> String {
    let cleaned: String = title
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c
            } else {
                ' '
            }
        })
        .collect();

    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deliverable record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deliverable {
    pub id: String,
    pub workspace_id: String,
    pub goal_id: String,
    pub title: String,
    pub normalized_title: String,
    pub kind: String,
    pub content: String,
    pub status: DeliverableStatus,
    pub quality_score: f64,
    pub completion_percentage: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Deliverable repository for database operations
#[derive(Clone)]
pub struct DeliverableRepository {
    pool: SqlitePool,
}

impl DeliverableRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new deliverable
    ///
    /// Fails on a duplicate (workspace, goal, normalized title); callers
    /// that may collide should check `find_by_title` first and enhance.
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        &self,
        id: &str,
        workspace_id: &str,
        goal_id: &str,
        title: &str,
        kind: &str,
        content: &str,
        quality_score: f64,
        completion_percentage: f64,
    ) -> Result<Deliverable> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
        let normalized = normalize_title(title);

        sqlx::query(
            "INSERT INTO deliverables (id, workspace_id, goal_id, title, normalized_title, kind,
                                       content, status, quality_score, completion_percentage,
                                       created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(workspace_id)
        .bind(goal_id)
        .bind(title)
        .bind(&normalized)
        .bind(kind)
        .bind(content)
        .bind(DeliverableStatus::Draft.as_str())
        .bind(quality_score.clamp(0.0, 1.0))
        .bind(completion_percentage.clamp(0.0, 100.0))
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create deliverable")?;

        Ok(Deliverable {
            id: id.to_string(),
            workspace_id: workspace_id.to_string(),
            goal_id: goal_id.to_string(),
            title: title.to_string(),
            normalized_title: normalized,
            kind: kind.to_string(),
            content: content.to_string(),
            status: DeliverableStatus::Draft,
            quality_score: quality_score.clamp(0.0, 1.0),
            completion_percentage: completion_percentage.clamp(0.0, 100.0),
            created_at: now,
            updated_at: now,
        })
    }

    /// Get a deliverable by ID
    pub async fn get(&self, id: &str) -> Result<Option<Deliverable>> {
        let row = sqlx::query("SELECT * FROM deliverables WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch deliverable")?;

        Ok(row.map(|r| map_deliverable(&r)))
    }

    /// Find the deliverable occupying a title slot, if any
    pub async fn find_by_title(
        &self,
        workspace_id: &str,
        goal_id: &str,
        title: &str,
    ) -> Result<Option<Deliverable>> {
        let normalized = normalize_title(title);

        let row = sqlx::query(
            "SELECT * FROM deliverables
             WHERE workspace_id = ? AND goal_id = ? AND normalized_title = ?",
        )
        .bind(workspace_id)
        .bind(goal_id)
        .bind(&normalized)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up deliverable by title")?;

        Ok(row.map(|r| map_deliverable(&r)))
    }

    /// Enhance an existing deliverable in place
    pub async fn enhance(
        &self,
        id: &str,
        content: &str,
        quality_score: f64,
        completion_percentage: f64,
    ) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        sqlx::query(
            "UPDATE deliverables
             SET content = ?, quality_score = ?, completion_percentage = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(content)
        .bind(quality_score.clamp(0.0, 1.0))
        .bind(completion_percentage.clamp(0.0, 100.0))
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to enhance deliverable")?;

        Ok(())
    }

    /// Update deliverable status
    pub async fn update_status(&self, id: &str, status: DeliverableStatus) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        sqlx::query("UPDATE deliverables SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update deliverable status")?;

        Ok(())
    }

    /// List deliverables for a workspace, newest first
    pub async fn list_for_workspace(&self, workspace_id: &str) -> Result<Vec<Deliverable>> {
        let rows = sqlx::query(
            "SELECT * FROM deliverables WHERE workspace_id = ? ORDER BY updated_at DESC",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list deliverables")?;

        Ok(rows.iter().map(map_deliverable).collect())
    }

    /// List deliverables attached to a goal
    pub async fn list_for_goal(&self, goal_id: &str) -> Result<Vec<Deliverable>> {
        let rows = sqlx::query("SELECT * FROM deliverables WHERE goal_id = ? ORDER BY updated_at DESC")
            .bind(goal_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list deliverables for goal")?;

        Ok(rows.iter().map(map_deliverable).collect())
    }

    /// Total deliverables in a workspace
    pub async fn count_for_workspace(&self, workspace_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM deliverables WHERE workspace_id = ?")
                .bind(workspace_id)
                .fetch_one(&self.pool)
                .await
                .context("Failed to count deliverables")?;

        Ok(count)
    }
}

fn map_deliverable(r: &sqlx::sqlite::SqliteRow) -> Deliverable {
    Deliverable {
        id: r.get("id"),
        workspace_id: r.get("workspace_id"),
        goal_id: r.get("goal_id"),
        title: r.get("title"),
        normalized_title: r.get("normalized_title"),
        kind: r.get("kind"),
        content: r.get("content"),
        status: DeliverableStatus::parse(&r.get::<String, _>("status")),
        quality_score: r.get("quality_score"),
        completion_percentage: r.get("completion_percentage"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}
