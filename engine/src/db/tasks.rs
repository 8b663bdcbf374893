//! Task persistence operations
//!
//! Tasks move through a strict state machine. Terminal statuses (completed,
//! failed, canceled, timed_out) are absorbing: every transition query carries
//! a status guard, so a finished task can never be re-dispatched or mutated
//! back into flight. All queries are parameterized.

use crate::errors::EngineError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::time::{SystemTime, UNIX_EPOCH};

/// Failure reason recorded when no agent covers a task's role
pub const NO_AGENTS_AVAILABLE: &str = "no_agents_available";

/// Task status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    PendingVerification,
    Completed,
    Failed,
    NeedsRevision,
    Canceled,
    TimedOut,
    Stale,
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::PendingVerification => "pending_verification",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::NeedsRevision => "needs_revision",
            TaskStatus::Canceled => "canceled",
            TaskStatus::TimedOut => "timed_out",
            TaskStatus::Stale => "stale",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => TaskStatus::Pending,
            "in_progress" => TaskStatus::InProgress,
            "pending_verification" => TaskStatus::PendingVerification,
            "completed" => TaskStatus::Completed,
            "needs_revision" => TaskStatus::NeedsRevision,
            "canceled" => TaskStatus::Canceled,
            "timed_out" => TaskStatus::TimedOut,
            "stale" => TaskStatus::Stale,
            _ => TaskStatus::Failed,
        }
    }

    /// Absorbing states: once here, a task never transitions again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled | TaskStatus::TimedOut
        )
    }

    /// States that count as open intent for duplicate checks
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            TaskStatus::Pending
                | TaskStatus::InProgress
                | TaskStatus::PendingVerification
                | TaskStatus::NeedsRevision
        )
    }
}

/// SQL guard shared by every transition query
const NOT_TERMINAL: &str = "status NOT IN ('completed', 'failed', 'canceled', 'timed_out')";

/// Task record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub workspace_id: String,
    pub goal_id: Option<String>,
    pub agent_id: Option<String>,
    pub assigned_to_role: Option<String>,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub parent_task_id: Option<String>,
    pub attempts: i64,
    pub revision_notes: Option<String>,
    pub failure_reason: Option<String>,
    pub result: Option<String>,
    pub quality_score: Option<f64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields for inserting a new task
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub id: String,
    pub workspace_id: String,
    pub goal_id: Option<String>,
    pub assigned_to_role: Option<String>,
    pub name: String,
    pub description: String,
    pub priority: i64,
    pub parent_task_id: Option<String>,
}

/// One provider attempt against a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: String,
    pub task_id: String,
    pub agent_id: Option<String>,
    pub workspace_id: String,
    pub status: String,
    pub logs: String,
    pub token_usage: i64,
    pub execution_time_ms: i64,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

/// Task repository for database operations
#[derive(Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
}

impl TaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new pending task
    pub async fn create(&self, new: NewTask) -> Result<Task> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        sqlx::query(
            "INSERT INTO tasks (id, workspace_id, goal_id, assigned_to_role, name, description,
                                status, priority, parent_task_id, attempts, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(&new.id)
        .bind(&new.workspace_id)
        .bind(&new.goal_id)
        .bind(&new.assigned_to_role)
        .bind(&new.name)
        .bind(&new.description)
        .bind(TaskStatus::Pending.as_str())
        .bind(new.priority)
        .bind(&new.parent_task_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to create task")?;

        Ok(Task {
            id: new.id,
            workspace_id: new.workspace_id,
            goal_id: new.goal_id,
            agent_id: None,
            assigned_to_role: new.assigned_to_role,
            name: new.name,
            description: new.description,
            status: TaskStatus::Pending,
            priority: new.priority,
            parent_task_id: new.parent_task_id,
            attempts: 0,
            revision_notes: None,
            failure_reason: None,
            result: None,
            quality_score: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get a task by ID
    pub async fn get(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch task")?;

        Ok(row.map(|r| map_task(&r)))
    }

    /// List tasks for a workspace, newest first
    pub async fn list_for_workspace(&self, workspace_id: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE workspace_id = ? ORDER BY created_at DESC")
            .bind(workspace_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list tasks")?;

        Ok(rows.iter().map(map_task).collect())
    }

    /// Open tasks carrying intent for a goal
    ///
    /// Used by the planner's duplicate check: pending, in-flight, awaiting
    /// verification, and revision-bound tasks all still represent intent.
    pub async fn open_tasks_for_goal(&self, goal_id: &str) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks
             WHERE goal_id = ?
               AND status IN ('pending', 'in_progress', 'pending_verification', 'needs_revision')
             ORDER BY created_at",
        )
        .bind(goal_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list open tasks for goal")?;

        Ok(rows.iter().map(map_task).collect())
    }

    /// Tasks ready for dispatch, dependency-gated
    ///
    /// A task is ready when it is pending or requeued for revision and every
    /// dependency has completed. Highest priority first, then oldest.
    pub async fn ready_tasks(&self, workspace_id: &str, limit: i64) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT t.* FROM tasks t
             WHERE t.workspace_id = ?
               AND t.status IN ('pending', 'needs_revision')
               AND NOT EXISTS (
                   SELECT 1 FROM task_dependencies d
                   JOIN tasks dep ON dep.id = d.depends_on_task_id
                   WHERE d.task_id = t.id AND dep.status != 'completed'
               )
             ORDER BY t.priority DESC, t.created_at
             LIMIT ?",
        )
        .bind(workspace_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch ready tasks")?;

        Ok(rows.iter().map(map_task).collect())
    }

    /// Move a task into flight, bumping its attempt counter
    ///
    /// Fails if the task is not in a dispatchable state.
    pub async fn start(&self, id: &str, agent_id: &str) -> Result<Task> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        let result = sqlx::query(
            "UPDATE tasks
             SET status = 'in_progress', agent_id = ?, attempts = attempts + 1, updated_at = ?
             WHERE id = ? AND status IN ('pending', 'needs_revision')",
        )
        .bind(agent_id)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to start task")?;

        if result.rows_affected() == 0 {
            return Err(self.transition_refused(id).await);
        }

        self.get(id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()).into())
    }

    /// Park a task awaiting its quality verdict
    pub async fn mark_pending_verification(&self, id: &str) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        let result = sqlx::query(
            "UPDATE tasks SET status = 'pending_verification', updated_at = ?
             WHERE id = ? AND status = 'in_progress'",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to park task for verification")?;

        if result.rows_affected() == 0 {
            return Err(self.transition_refused(id).await);
        }

        Ok(())
    }

    /// Complete a task with its accepted result
    pub async fn complete(&self, id: &str, result_json: &str, quality_score: f64) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        let result = sqlx::query(
            "UPDATE tasks SET status = 'completed', result = ?, quality_score = ?, updated_at = ?
             WHERE id = ? AND status IN ('in_progress', 'pending_verification')",
        )
        .bind(result_json)
        .bind(quality_score)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to complete task")?;

        if result.rows_affected() == 0 {
            return Err(self.transition_refused(id).await);
        }

        Ok(())
    }

    /// Terminally fail a task with a reason
    pub async fn fail(&self, id: &str, reason: &str) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        let result = sqlx::query(&format!(
            "UPDATE tasks SET status = 'failed', failure_reason = ?, updated_at = ?
             WHERE id = ? AND {}",
            NOT_TERMINAL
        ))
        .bind(reason)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to mark task as failed")?;

        if result.rows_affected() == 0 {
            return Err(self.transition_refused(id).await);
        }

        Ok(())
    }

    /// Terminally time out an in-flight task
    pub async fn time_out(&self, id: &str) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        let result = sqlx::query(
            "UPDATE tasks SET status = 'timed_out', updated_at = ?
             WHERE id = ? AND status IN ('in_progress', 'pending_verification')",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to time out task")?;

        if result.rows_affected() == 0 {
            return Err(self.transition_refused(id).await);
        }

        Ok(())
    }

    /// Cancel a non-terminal task
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        let result = sqlx::query(&format!(
            "UPDATE tasks SET status = 'canceled', updated_at = ? WHERE id = ? AND {}",
            NOT_TERMINAL
        ))
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to cancel task")?;

        if result.rows_affected() == 0 {
            return Err(self.transition_refused(id).await);
        }

        Ok(())
    }

    /// Send a task back for revision with gate feedback
    ///
    /// Feedback accumulates across rounds so the next attempt sees the
    /// full history.
    pub async fn request_revision(&self, id: &str, notes: &str) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        let result = sqlx::query(
            "UPDATE tasks
             SET status = 'needs_revision',
                 revision_notes = COALESCE(revision_notes || char(10), '') || ?,
                 updated_at = ?
             WHERE id = ? AND status IN ('in_progress', 'pending_verification')",
        )
        .bind(notes)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to request task revision")?;

        if result.rows_affected() == 0 {
            return Err(self.transition_refused(id).await);
        }

        Ok(())
    }

    /// Mark overdue in-flight tasks stale
    ///
    /// Catches executions lost to a killed process: anything in flight with
    /// no update for `older_than_secs` is no longer running anywhere.
    pub async fn sweep_stale(&self, workspace_id: &str, older_than_secs: i64) -> Result<u64> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
        let cutoff = now - older_than_secs;

        let result = sqlx::query(
            "UPDATE tasks SET status = 'stale', updated_at = ?
             WHERE workspace_id = ? AND status = 'in_progress' AND updated_at < ?",
        )
        .bind(now)
        .bind(workspace_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to sweep stale tasks")?;

        Ok(result.rows_affected())
    }

    /// Requeue stale tasks as pending
    pub async fn requeue_stale(&self, workspace_id: &str) -> Result<u64> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        let result = sqlx::query(
            "UPDATE tasks SET status = 'pending', agent_id = NULL, updated_at = ?
             WHERE workspace_id = ? AND status = 'stale'",
        )
        .bind(now)
        .bind(workspace_id)
        .execute(&self.pool)
        .await
        .context("Failed to requeue stale tasks")?;

        Ok(result.rows_affected())
    }

    /// Record a dependency edge
    pub async fn add_dependency(&self, task_id: &str, depends_on_task_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_task_id) VALUES (?, ?)",
        )
        .bind(task_id)
        .bind(depends_on_task_id)
        .execute(&self.pool)
        .await
        .context("Failed to add task dependency")?;

        Ok(())
    }

    /// IDs a task depends on
    pub async fn dependencies_of(&self, task_id: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT depends_on_task_id FROM task_dependencies WHERE task_id = ? ORDER BY depends_on_task_id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch task dependencies")?;

        Ok(ids)
    }

    /// Open a provider attempt record
    pub async fn start_execution(
        &self,
        id: &str,
        task_id: &str,
        agent_id: Option<&str>,
        workspace_id: &str,
    ) -> Result<TaskExecution> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        sqlx::query(
            "INSERT INTO task_executions (id, task_id, agent_id, workspace_id, status, started_at)
             VALUES (?, ?, ?, ?, 'running', ?)",
        )
        .bind(id)
        .bind(task_id)
        .bind(agent_id)
        .bind(workspace_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to record execution start")?;

        Ok(TaskExecution {
            id: id.to_string(),
            task_id: task_id.to_string(),
            agent_id: agent_id.map(|a| a.to_string()),
            workspace_id: workspace_id.to_string(),
            status: "running".to_string(),
            logs: String::new(),
            token_usage: 0,
            execution_time_ms: 0,
            started_at: now,
            completed_at: None,
        })
    }

    /// Close a provider attempt record
    pub async fn finish_execution(
        &self,
        id: &str,
        status: &str,
        logs: &str,
        token_usage: i64,
        execution_time_ms: i64,
    ) -> Result<()> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;

        sqlx::query(
            "UPDATE task_executions
             SET status = ?, logs = ?, token_usage = ?, execution_time_ms = ?, completed_at = ?
             WHERE id = ?",
        )
        .bind(status)
        .bind(logs)
        .bind(token_usage)
        .bind(execution_time_ms)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to record execution finish")?;

        Ok(())
    }

    /// Recent attempts across a workspace, newest first
    pub async fn recent_executions(
        &self,
        workspace_id: &str,
        limit: i64,
    ) -> Result<Vec<TaskExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM task_executions WHERE workspace_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(workspace_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch recent executions")?;

        Ok(rows.iter().map(map_execution).collect())
    }

    /// Completed tasks with stored results updated after a checkpoint
    pub async fn completed_with_results_since(
        &self,
        workspace_id: &str,
        since: i64,
    ) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks
             WHERE workspace_id = ? AND status = 'completed' AND result IS NOT NULL
               AND updated_at > ?
             ORDER BY updated_at",
        )
        .bind(workspace_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch completed tasks since checkpoint")?;

        Ok(rows.iter().map(map_task).collect())
    }

    /// Accepted contribution count for a goal
    pub async fn count_completed_for_goal(&self, goal_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM tasks WHERE goal_id = ? AND status = 'completed'",
        )
        .bind(goal_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count completed tasks for goal")?;

        Ok(count)
    }

    /// Build the right error for a refused transition
    async fn transition_refused(&self, id: &str) -> anyhow::Error {
        match self.get(id).await {
            Ok(Some(task)) => EngineError::TerminalStatus {
                task_id: id.to_string(),
                status: task.status.as_str().to_string(),
            }
            .into(),
            Ok(None) => EngineError::TaskNotFound(id.to_string()).into(),
            Err(e) => e,
        }
    }
}

fn map_task(r: &sqlx::sqlite::SqliteRow) -> Task {
    Task {
        id: r.get("id"),
        workspace_id: r.get("workspace_id"),
        goal_id: r.get("goal_id"),
        agent_id: r.get("agent_id"),
        assigned_to_role: r.get("assigned_to_role"),
        name: r.get("name"),
        description: r.get("description"),
        status: TaskStatus::parse(&r.get::<String, _>("status")),
        priority: r.get("priority"),
        parent_task_id: r.get("parent_task_id"),
        attempts: r.get("attempts"),
        revision_notes: r.get("revision_notes"),
        failure_reason: r.get("failure_reason"),
        result: r.get("result"),
        quality_score: r.get("quality_score"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

fn map_execution(r: &sqlx::sqlite::SqliteRow) -> TaskExecution {
    TaskExecution {
        id: r.get("id"),
        task_id: r.get("task_id"),
        agent_id: r.get("agent_id"),
        workspace_id: r.get("workspace_id"),
        status: r.get("status"),
        logs: r.get("logs"),
        token_usage: r.get("token_usage"),
        execution_time_ms: r.get("execution_time_ms"),
        started_at: r.get("started_at"),
        completed_at: r.get("completed_at"),
    }
}
