//! Agent persistence operations
//!
//! Agents are named workers with a role and seniority. Tasks reference them
//! weakly: dispatch resolves a role to the first available agent at execution
//! time, so removing an agent never corrupts task history.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};

/// Agent seniority enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Seniority {
    Junior,
    Mid,
    Senior,
    Lead,
}

impl Seniority {
    pub fn as_str(&self) -> &str {
        match self {
            Seniority::Junior => "junior",
            Seniority::Mid => "mid",
            Seniority::Senior => "senior",
            Seniority::Lead => "lead",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "junior" => Seniority::Junior,
            "senior" => Seniority::Senior,
            "lead" => Seniority::Lead,
            _ => Seniority::Mid,
        }
    }
}

/// Agent status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Available,
    Busy,
    Active,
}

impl AgentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            AgentStatus::Available => "available",
            AgentStatus::Busy => "busy",
            AgentStatus::Active => "active",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "busy" => AgentStatus::Busy,
            "active" => AgentStatus::Active,
            _ => AgentStatus::Available,
        }
    }
}

/// Agent record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub role: String,
    pub seniority: Seniority,
    pub status: AgentStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Agent repository for database operations
#[derive(Clone)]
pub struct AgentRepository {
    pool: SqlitePool,
}

impl AgentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new agent
    pub async fn create(
        &self,
        id: &str,
        workspace_id: &str,
        name: &str,
        role: &str,
        seniority: Seniority,
    ) -> Result<Agent> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        sqlx::query(
            "INSERT INTO agents (id, workspace_id, name, role, seniority, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(workspace_id)
        .bind(name)
        .bind(role)
        .bind(seniority.as_str())
        .bind(AgentStatus::Available.as_str())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create agent")?;

        Ok(Agent {
            id: id.to_string(),
            workspace_id: workspace_id.to_string(),
            name: name.to_string(),
            role: role.to_string(),
            seniority,
            status: AgentStatus::Available,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get an agent by ID
    pub async fn get(&self, id: &str) -> Result<Option<Agent>> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch agent")?;

        Ok(row.map(|r| map_agent(&r)))
    }

    /// List all agents for a workspace
    pub async fn list_for_workspace(&self, workspace_id: &str) -> Result<Vec<Agent>> {
        let rows = sqlx::query("SELECT * FROM agents WHERE workspace_id = ? ORDER BY created_at")
            .bind(workspace_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list agents")?;

        Ok(rows.iter().map(map_agent).collect())
    }

    /// Find the first available agent for a role
    ///
    /// Seniors win ties so the most capable free agent takes the work.
    pub async fn find_available(&self, workspace_id: &str, role: &str) -> Result<Option<Agent>> {
        let row = sqlx::query(
            "SELECT * FROM agents
             WHERE workspace_id = ? AND role = ? AND status = 'available'
             ORDER BY CASE seniority
                 WHEN 'lead' THEN 0
                 WHEN 'senior' THEN 1
                 WHEN 'mid' THEN 2
                 ELSE 3
             END, created_at
             LIMIT 1",
        )
        .bind(workspace_id)
        .bind(role)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to find available agent")?;

        Ok(row.map(|r| map_agent(&r)))
    }

    /// Distinct roles present in a workspace
    pub async fn roles_for_workspace(&self, workspace_id: &str) -> Result<Vec<String>> {
        let roles: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT role FROM agents WHERE workspace_id = ? ORDER BY role")
                .bind(workspace_id)
                .fetch_all(&self.pool)
                .await
                .context("Failed to list agent roles")?;

        Ok(roles)
    }

    /// Update agent status
    pub async fn update_status(&self, id: &str, status: AgentStatus) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        sqlx::query("UPDATE agents SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update agent status")?;

        Ok(())
    }

    /// Return every busy agent in a workspace to the available pool
    ///
    /// Runs at cycle start so agents orphaned by a crashed cycle come back.
    pub async fn release_all(&self, workspace_id: &str) -> Result<u64> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        let result = sqlx::query(
            "UPDATE agents SET status = 'available', updated_at = ?
             WHERE workspace_id = ? AND status = 'busy'",
        )
        .bind(now)
        .bind(workspace_id)
        .execute(&self.pool)
        .await
        .context("Failed to release agents")?;

        Ok(result.rows_affected())
    }
}

fn map_agent(r: &sqlx::sqlite::SqliteRow) -> Agent {
    Agent {
        id: r.get("id"),
        workspace_id: r.get("workspace_id"),
        name: r.get("name"),
        role: r.get("role"),
        seniority: Seniority::parse(&r.get::<String, _>("seniority")),
        status: AgentStatus::parse(&r.get::<String, _>("status")),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}
