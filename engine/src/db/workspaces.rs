//! Workspace persistence operations
//!
//! A workspace groups goals, agents, tasks, and deliverables. It also carries
//! the advisory cycle lease: an orchestrator claims a workspace before running
//! a cycle and releases it afterwards, so only one control loop mutates a
//! workspace at a time. A crashed holder's lease expires on its own.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Workspace status enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Created,
    Active,
    ProcessingTasks,
    NeedsIntervention,
    Error,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &str {
        match self {
            WorkspaceStatus::Created => "created",
            WorkspaceStatus::Active => "active",
            WorkspaceStatus::ProcessingTasks => "processing_tasks",
            WorkspaceStatus::NeedsIntervention => "needs_intervention",
            WorkspaceStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "created" => WorkspaceStatus::Created,
            "active" => WorkspaceStatus::Active,
            "processing_tasks" => WorkspaceStatus::ProcessingTasks,
            "needs_intervention" => WorkspaceStatus::NeedsIntervention,
            _ => WorkspaceStatus::Error,
        }
    }
}

/// Workspace record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub goal_text: String,
    pub budget: Option<f64>,
    pub status: WorkspaceStatus,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub stall_count: i64,
    pub last_aggregated_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Workspace {
    /// Whether an orchestrator may claim this workspace for a cycle
    pub fn is_leasable(&self) -> bool {
        matches!(
            self.status,
            WorkspaceStatus::Created | WorkspaceStatus::Active | WorkspaceStatus::ProcessingTasks
        )
    }
}

/// Workspace repository for database operations
#[derive(Clone)]
pub struct WorkspaceRepository {
    pool: SqlitePool,
}

impl WorkspaceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new workspace
    pub async fn create(
        &self,
        id: &str,
        name: &str,
        goal_text: &str,
        budget: Option<f64>,
    ) -> Result<Workspace> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        sqlx::query(
            "INSERT INTO workspaces (id, name, goal_text, budget, status, stall_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(id)
        .bind(name)
        .bind(goal_text)
        .bind(budget)
        .bind(WorkspaceStatus::Created.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create workspace")?;

        Ok(Workspace {
            id: id.to_string(),
            name: name.to_string(),
            goal_text: goal_text.to_string(),
            budget,
            status: WorkspaceStatus::Created,
            lease_owner: None,
            lease_expires_at: None,
            stall_count: 0,
            last_aggregated_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get a workspace by ID
    pub async fn get(&self, id: &str) -> Result<Option<Workspace>> {
        let row = sqlx::query("SELECT * FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch workspace")?;

        Ok(row.map(|r| map_workspace(&r)))
    }

    /// Get a workspace by its unique name
    pub async fn get_by_name(&self, name: &str) -> Result<Option<Workspace>> {
        let row = sqlx::query("SELECT * FROM workspaces WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch workspace by name")?;

        Ok(row.map(|r| map_workspace(&r)))
    }

    /// Resolve a workspace by id or name
    pub async fn resolve(&self, id_or_name: &str) -> Result<Option<Workspace>> {
        if let Some(ws) = self.get(id_or_name).await? {
            return Ok(Some(ws));
        }
        self.get_by_name(id_or_name).await
    }

    /// List all workspaces, newest first
    pub async fn list(&self) -> Result<Vec<Workspace>> {
        let rows = sqlx::query("SELECT * FROM workspaces ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list workspaces")?;

        Ok(rows.iter().map(map_workspace).collect())
    }

    /// Update workspace status
    pub async fn update_status(&self, id: &str, status: WorkspaceStatus) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        sqlx::query("UPDATE workspaces SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update workspace status")?;

        Ok(())
    }

    /// Try to claim the cycle lease for a workspace
    ///
    /// The claim succeeds only when no live lease exists and the workspace is
    /// in a leasable state. Expired leases are claimable regardless of who
    /// held them. Returns true when this owner now holds the lease.
    pub async fn try_claim_lease(&self, id: &str, owner: &str, ttl_secs: i64) -> Result<bool> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
        let expires_at = now + ttl_secs;

        let result = sqlx::query(
            "UPDATE workspaces
             SET lease_owner = ?, lease_expires_at = ?, status = 'processing_tasks', updated_at = ?
             WHERE id = ?
               AND (lease_owner IS NULL OR lease_expires_at IS NULL OR lease_expires_at < ?)
               AND status IN ('created', 'active', 'processing_tasks')",
        )
        .bind(owner)
        .bind(expires_at)
        .bind(now)
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to claim workspace lease")?;

        Ok(result.rows_affected() == 1)
    }

    /// Release the cycle lease, restoring the given status
    ///
    /// Only the current owner can release. A stale owner releasing after
    /// expiry and re-claim is a no-op.
    pub async fn release_lease(
        &self,
        id: &str,
        owner: &str,
        status: WorkspaceStatus,
    ) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        let result = sqlx::query(
            "UPDATE workspaces
             SET lease_owner = NULL, lease_expires_at = NULL, status = ?, updated_at = ?
             WHERE id = ? AND lease_owner = ?",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .context("Failed to release workspace lease")?;

        if result.rows_affected() == 0 {
            warn!(workspace_id = id, "lease release skipped, owner changed");
        }

        Ok(())
    }

    /// Increment the consecutive zero-progress cycle counter
    pub async fn record_stall(&self, id: &str) -> Result<i64> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        sqlx::query("UPDATE workspaces SET stall_count = stall_count + 1, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to record workspace stall")?;

        let count: i64 = sqlx::query_scalar("SELECT stall_count FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to read stall count")?;

        Ok(count)
    }

    /// Reset the stall counter after a productive cycle
    pub async fn reset_stall(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE workspaces SET stall_count = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to reset workspace stall count")?;

        Ok(())
    }

    /// Record the aggregation checkpoint timestamp
    pub async fn set_last_aggregated(&self, id: &str, ts: i64) -> Result<()> {
        sqlx::query("UPDATE workspaces SET last_aggregated_at = ?, updated_at = ? WHERE id = ?")
            .bind(ts)
            .bind(ts)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to set aggregation checkpoint")?;

        Ok(())
    }
}

fn map_workspace(r: &sqlx::sqlite::SqliteRow) -> Workspace {
    Workspace {
        id: r.get("id"),
        name: r.get("name"),
        goal_text: r.get("goal_text"),
        budget: r.get("budget"),
        status: WorkspaceStatus::parse(&r.get::<String, _>("status")),
        lease_owner: r.get("lease_owner"),
        lease_expires_at: r.get("lease_expires_at"),
        stall_count: r.get("stall_count"),
        last_aggregated_at: r.get("last_aggregated_at"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}
