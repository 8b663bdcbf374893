//! Goal persistence operations
//!
//! Goals are quantified targets owned by a workspace. Progress writes go
//! through a single clamp: `current_value` never decreases and never exceeds
//! `target_value`, no matter what a caller asks for. Out-of-range requests
//! are stored clamped and logged as consistency violations.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Goal status enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GoalStatus {
    Active,
    Completed,
}

impl GoalStatus {
    pub fn as_str(&self) -> &str {
        match self {
            GoalStatus::Active => "active",
            GoalStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => GoalStatus::Completed,
            _ => GoalStatus::Active,
        }
    }
}

/// Goal record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: String,
    pub workspace_id: String,
    pub metric_type: String,
    pub target_value: f64,
    pub current_value: f64,
    pub unit: Option<String>,
    pub status: GoalStatus,
    pub last_validation_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Goal {
    /// Remaining gap toward the target, never negative
    pub fn remaining(&self) -> f64 {
        (self.target_value - self.current_value).max(0.0)
    }

    /// Fraction of the target reached, in [0, 1]
    pub fn progress_fraction(&self) -> f64 {
        if self.target_value <= 0.0 {
            return 0.0;
        }
        (self.current_value / self.target_value).clamp(0.0, 1.0)
    }
}

/// Next stored value for a progress update request
///
/// The result is monotone (never below `current`) and capped (never above
/// `target`). This is the single arithmetic every progress write goes through.
pub fn clamped_next(current: f64, target: f64, requested: f64) -> f64 {
    requested.max(current).min(target)
}

/// Goal repository for database operations
#[derive(Clone)]
pub struct GoalRepository {
    pool: SqlitePool,
}

impl GoalRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new goal
    pub async fn create(
        &self,
        id: &str,
        workspace_id: &str,
        metric_type: &str,
        target_value: f64,
        unit: Option<&str>,
    ) -> Result<Goal> {
        ensure!(target_value > 0.0, "target_value must be positive");

        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        sqlx::query(
            "INSERT INTO goals (id, workspace_id, metric_type, target_value, current_value, unit, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(workspace_id)
        .bind(metric_type)
        .bind(target_value)
        .bind(unit)
        .bind(GoalStatus::Active.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create goal")?;

        Ok(Goal {
            id: id.to_string(),
            workspace_id: workspace_id.to_string(),
            metric_type: metric_type.to_string(),
            target_value,
            current_value: 0.0,
            unit: unit.map(|u| u.to_string()),
            status: GoalStatus::Active,
            last_validation_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get a goal by ID
    pub async fn get(&self, id: &str) -> Result<Option<Goal>> {
        let row = sqlx::query("SELECT * FROM goals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch goal")?;

        Ok(row.map(|r| map_goal(&r)))
    }

    /// List all goals for a workspace
    pub async fn list_for_workspace(&self, workspace_id: &str) -> Result<Vec<Goal>> {
        let rows = sqlx::query("SELECT * FROM goals WHERE workspace_id = ? ORDER BY created_at")
            .bind(workspace_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list goals")?;

        Ok(rows.iter().map(map_goal).collect())
    }

    /// List active goals for a workspace
    pub async fn list_active_for_workspace(&self, workspace_id: &str) -> Result<Vec<Goal>> {
        let rows = sqlx::query(
            "SELECT * FROM goals WHERE workspace_id = ? AND status = 'active' ORDER BY created_at",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list active goals")?;

        Ok(rows.iter().map(map_goal).collect())
    }

    /// Add progress toward a goal, clamped monotone
    ///
    /// `delta` below zero is ignored; a result beyond the target is stored
    /// as the target. Returns the updated goal.
    pub async fn add_progress(&self, id: &str, delta: f64) -> Result<Goal> {
        let goal = self
            .get(id)
            .await?
            .with_context(|| format!("goal {} not found", id))?;

        let requested = goal.current_value + delta;
        self.write_progress(&goal, requested).await
    }

    /// Raise progress to at least `value`, clamped monotone
    ///
    /// Used by reconciliation: the stored value only moves up, and never
    /// beyond the target.
    pub async fn raise_progress_to(&self, id: &str, value: f64) -> Result<Goal> {
        let goal = self
            .get(id)
            .await?
            .with_context(|| format!("goal {} not found", id))?;

        self.write_progress(&goal, value).await
    }

    async fn write_progress(&self, goal: &Goal, requested: f64) -> Result<Goal> {
        let next = clamped_next(goal.current_value, goal.target_value, requested);

        if requested > goal.target_value {
            warn!(
                goal_id = %goal.id,
                requested,
                target = goal.target_value,
                "progress request clamped at target"
            );
        }

        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        sqlx::query("UPDATE goals SET current_value = ?, updated_at = ? WHERE id = ?")
            .bind(next)
            .bind(now)
            .bind(&goal.id)
            .execute(&self.pool)
            .await
            .context("Failed to update goal progress")?;

        let mut updated = goal.clone();
        updated.current_value = next;
        updated.updated_at = now;
        Ok(updated)
    }

    /// Flip a goal to completed when its target is reached
    ///
    /// Returns true when the flip happened in this call.
    pub async fn mark_completed_if_reached(&self, id: &str) -> Result<bool> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        let result = sqlx::query(
            "UPDATE goals SET status = 'completed', updated_at = ?
             WHERE id = ? AND status = 'active' AND current_value >= target_value",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to complete goal")?;

        Ok(result.rows_affected() == 1)
    }

    /// Stamp the planning-failure cooldown clock
    pub async fn touch_validation(&self, id: &str) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        sqlx::query("UPDATE goals SET last_validation_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to stamp goal validation time")?;

        Ok(())
    }
}

fn map_goal(r: &sqlx::sqlite::SqliteRow) -> Goal {
    Goal {
        id: r.get("id"),
        workspace_id: r.get("workspace_id"),
        metric_type: r.get("metric_type"),
        target_value: r.get("target_value"),
        current_value: r.get("current_value"),
        unit: r.get("unit"),
        status: GoalStatus::parse(&r.get::<String, _>("status")),
        last_validation_at: r.get("last_validation_at"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}
