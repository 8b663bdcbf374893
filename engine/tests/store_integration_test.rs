//! Integration tests for the persistence layer
//!
//! Exercises the repositories together the way the pipeline uses them:
//! - Database creation, WAL mode, schema migration
//! - The full task lifecycle from planned to accepted, with execution records
//! - Dependency gating of dispatch
//! - The workspace cycle lease, including expiry takeover
//! - Stale-task recovery after a killed orchestrator

use foreman_engine::db::tasks::NewTask;
use foreman_engine::db::{
    AgentStatus, Database, GoalStatus, Seniority, TaskStatus, WorkspaceStatus,
};
use tempfile::TempDir;

async fn setup_crew() -> (TempDir, Database) {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("foreman.db"))
        .await
        .unwrap();

    db.workspaces()
        .create("ws-1", "outreach", "Build a qualified lead list", None)
        .await
        .unwrap();
    db.goals()
        .create("goal-1", "ws-1", "qualified_leads", 2.0, Some("leads"))
        .await
        .unwrap();
    db.agents()
        .create("agent-1", "ws-1", "Mira", "researcher", Seniority::Senior)
        .await
        .unwrap();

    (temp_dir, db)
}

fn new_task(id: &str, name: &str, priority: i64) -> NewTask {
    NewTask {
        id: id.to_string(),
        workspace_id: "ws-1".to_string(),
        goal_id: Some("goal-1".to_string()),
        assigned_to_role: Some("researcher".to_string()),
        name: name.to_string(),
        description: format!("{} description", name),
        priority,
        parent_task_id: None,
    }
}

#[tokio::test]
async fn test_database_lifecycle() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("foreman.db");

    let db = Database::new(&db_path).await.unwrap();

    // Verify database file and WAL companion exist
    assert!(db_path.exists());
    assert!(temp_dir.path().join("foreman.db-wal").exists());

    let result = sqlx::query("SELECT COUNT(*) FROM tasks")
        .fetch_one(db.pool())
        .await;
    assert!(result.is_ok());

    // Close flushes the WAL
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_schema_complete() {
    let temp_dir = TempDir::new().unwrap();
    let db = Database::new(&temp_dir.path().join("foreman.db"))
        .await
        .unwrap();

    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(db.pool())
            .await
            .unwrap();

    for table in [
        "workspaces",
        "goals",
        "agents",
        "tasks",
        "task_executions",
        "task_dependencies",
        "deliverables",
        "insights",
    ] {
        assert!(tables.contains(&table.to_string()), "{} table missing", table);
    }

    let indexes: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%' ORDER BY name",
    )
    .fetch_all(db.pool())
    .await
    .unwrap();

    assert!(indexes.contains(&"idx_tasks_workspace_status".to_string()));
    assert!(indexes.contains(&"idx_agents_workspace_role".to_string()));
    assert!(indexes.contains(&"idx_executions_workspace".to_string()));
    assert!(indexes.contains(&"idx_insights_workspace".to_string()));

    db.close().await.unwrap();
}

#[tokio::test]
async fn test_task_flow_from_planned_to_accepted() {
    let (_tmp, db) = setup_crew().await;
    let tasks = db.tasks();
    let goals = db.goals();
    let agents = db.agents();

    tasks
        .create(new_task("task-1", "Find 25 SaaS leads", 5))
        .await
        .unwrap();

    // Planned task is dispatchable
    let ready = tasks.ready_tasks("ws-1", 10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, "task-1");

    // Dispatch binds the agent and bumps the attempt counter
    let started = tasks.start("task-1", "agent-1").await.unwrap();
    assert_eq!(started.status, TaskStatus::InProgress);
    assert_eq!(started.attempts, 1);
    assert_eq!(started.agent_id.as_deref(), Some("agent-1"));
    agents
        .update_status("agent-1", AgentStatus::Busy)
        .await
        .unwrap();

    // An in-flight task is no longer ready
    assert!(tasks.ready_tasks("ws-1", 10).await.unwrap().is_empty());

    // Record the provider attempt
    tasks
        .start_execution("exec-1", "task-1", Some("agent-1"), "ws-1")
        .await
        .unwrap();

    // Output arrived; park it for the quality verdict, then accept
    tasks.mark_pending_verification("task-1").await.unwrap();
    tasks
        .complete("task-1", r#"{"content":{"contacts":[{}]},"quality_score":0.9,"verdict":"accept"}"#, 0.9)
        .await
        .unwrap();
    tasks
        .finish_execution("exec-1", "completed", "accepted by quality gate", 450, 1200)
        .await
        .unwrap();
    agents
        .update_status("agent-1", AgentStatus::Available)
        .await
        .unwrap();

    let done = tasks.get("task-1").await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.quality_score, Some(0.9));
    assert!(done.result.is_some());

    // Goal progress advances, clamped monotone, and flips at the target
    let goal = goals.add_progress("goal-1", 1.0).await.unwrap();
    assert_eq!(goal.current_value, 1.0);
    assert!(!goals.mark_completed_if_reached("goal-1").await.unwrap());

    let goal = goals.add_progress("goal-1", 5.0).await.unwrap();
    assert_eq!(goal.current_value, 2.0);
    assert!(goals.mark_completed_if_reached("goal-1").await.unwrap());
    let goal = goals.get("goal-1").await.unwrap().unwrap();
    assert_eq!(goal.status, GoalStatus::Completed);

    assert_eq!(tasks.count_completed_for_goal("goal-1").await.unwrap(), 1);

    // The attempt history survives
    let executions = db.tasks().recent_executions("ws-1", 10).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, "completed");
    assert_eq!(executions[0].token_usage, 450);
    assert!(executions[0].completed_at.is_some());
}

#[tokio::test]
async fn test_dependency_chain_gates_dispatch() {
    let (_tmp, db) = setup_crew().await;
    let tasks = db.tasks();

    tasks
        .create(new_task("task-research", "Research accounts", 5))
        .await
        .unwrap();
    tasks
        .create(new_task("task-write", "Write outreach emails", 8))
        .await
        .unwrap();
    tasks
        .add_dependency("task-write", "task-research")
        .await
        .unwrap();

    // Only the unblocked task is ready, despite the lower priority
    let ready = tasks.ready_tasks("ws-1", 10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, "task-research");

    // Completing the dependency unlocks the dependent
    tasks.start("task-research", "agent-1").await.unwrap();
    tasks
        .complete("task-research", "{\"content\":\"done\"}", 0.8)
        .await
        .unwrap();

    let ready = tasks.ready_tasks("ws-1", 10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, "task-write");
}

#[tokio::test]
async fn test_failed_dependency_keeps_dependent_blocked() {
    let (_tmp, db) = setup_crew().await;
    let tasks = db.tasks();

    tasks
        .create(new_task("task-a", "Collect source data", 5))
        .await
        .unwrap();
    tasks
        .create(new_task("task-b", "Summarize source data", 5))
        .await
        .unwrap();
    tasks.add_dependency("task-b", "task-a").await.unwrap();

    tasks.start("task-a", "agent-1").await.unwrap();
    tasks.fail("task-a", "no usable sources").await.unwrap();

    // Only completion satisfies a dependency
    let ready = tasks.ready_tasks("ws-1", 10).await.unwrap();
    assert!(ready.is_empty());
}

#[tokio::test]
async fn test_ready_tasks_order_by_priority_then_age() {
    let (_tmp, db) = setup_crew().await;
    let tasks = db.tasks();

    tasks.create(new_task("task-low", "Low", 2)).await.unwrap();
    tasks.create(new_task("task-high", "High", 9)).await.unwrap();
    tasks.create(new_task("task-mid", "Mid", 5)).await.unwrap();

    let ready = tasks.ready_tasks("ws-1", 10).await.unwrap();
    let ids: Vec<&str> = ready.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["task-high", "task-mid", "task-low"]);

    // The limit trims from the back of the ordering
    let ready = tasks.ready_tasks("ws-1", 2).await.unwrap();
    assert_eq!(ready.len(), 2);
    assert_eq!(ready[0].id, "task-high");
}

#[tokio::test]
async fn test_terminal_tasks_refuse_transitions() {
    let (_tmp, db) = setup_crew().await;
    let tasks = db.tasks();

    tasks
        .create(new_task("task-1", "Find leads", 5))
        .await
        .unwrap();
    tasks.start("task-1", "agent-1").await.unwrap();
    tasks.cancel("task-1").await.unwrap();

    let task = tasks.get("task-1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);
    assert!(task.status.is_terminal());

    // Every further transition is refused
    assert!(tasks.start("task-1", "agent-1").await.is_err());
    assert!(tasks.complete("task-1", "{}", 0.9).await.is_err());
    assert!(tasks.fail("task-1", "late failure").await.is_err());
    assert!(tasks.cancel("task-1").await.is_err());
}

#[tokio::test]
async fn test_lease_expiry_allows_takeover() {
    let (_tmp, db) = setup_crew().await;
    let workspaces = db.workspaces();

    // First owner claims; a rival cannot
    assert!(workspaces
        .try_claim_lease("ws-1", "foreman-a", 120)
        .await
        .unwrap());
    assert!(!workspaces
        .try_claim_lease("ws-1", "foreman-b", 120)
        .await
        .unwrap());

    // Simulate the holder dying: backdate the expiry
    sqlx::query("UPDATE workspaces SET lease_expires_at = lease_expires_at - 1000 WHERE id = ?")
        .bind("ws-1")
        .execute(db.pool())
        .await
        .unwrap();

    // Expired lease is claimable by anyone
    assert!(workspaces
        .try_claim_lease("ws-1", "foreman-b", 120)
        .await
        .unwrap());

    // The old owner's release is now a no-op
    workspaces
        .release_lease("ws-1", "foreman-a", WorkspaceStatus::Active)
        .await
        .unwrap();
    let ws = workspaces.get("ws-1").await.unwrap().unwrap();
    assert_eq!(ws.lease_owner.as_deref(), Some("foreman-b"));

    // The live owner's release clears the lease
    workspaces
        .release_lease("ws-1", "foreman-b", WorkspaceStatus::Active)
        .await
        .unwrap();
    let ws = workspaces.get("ws-1").await.unwrap().unwrap();
    assert!(ws.lease_owner.is_none());
    assert_eq!(ws.status, WorkspaceStatus::Active);
}

#[tokio::test]
async fn test_escalated_workspace_is_not_leasable() {
    let (_tmp, db) = setup_crew().await;
    let workspaces = db.workspaces();

    workspaces
        .update_status("ws-1", WorkspaceStatus::NeedsIntervention)
        .await
        .unwrap();

    assert!(!workspaces
        .try_claim_lease("ws-1", "foreman-a", 120)
        .await
        .unwrap());
    let ws = workspaces.get("ws-1").await.unwrap().unwrap();
    assert!(!ws.is_leasable());
}

#[tokio::test]
async fn test_stale_sweep_and_requeue_recover_lost_work() {
    let (_tmp, db) = setup_crew().await;
    let tasks = db.tasks();

    tasks
        .create(new_task("task-1", "Find leads", 5))
        .await
        .unwrap();
    tasks.start("task-1", "agent-1").await.unwrap();

    // A fresh in-flight task is not stale
    assert_eq!(tasks.sweep_stale("ws-1", 300).await.unwrap(), 0);

    // Backdate the task as if its orchestrator died mid-flight
    sqlx::query("UPDATE tasks SET updated_at = updated_at - 1000 WHERE id = ?")
        .bind("task-1")
        .execute(db.pool())
        .await
        .unwrap();

    assert_eq!(tasks.sweep_stale("ws-1", 300).await.unwrap(), 1);
    let task = tasks.get("task-1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Stale);

    // Requeue clears the dead agent binding but keeps the attempt count
    assert_eq!(tasks.requeue_stale("ws-1").await.unwrap(), 1);
    let task = tasks.get("task-1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.agent_id.is_none());
    assert_eq!(task.attempts, 1);

    // And the task is dispatchable again
    let ready = tasks.ready_tasks("ws-1", 10).await.unwrap();
    assert_eq!(ready.len(), 1);
}

#[tokio::test]
async fn test_revision_notes_accumulate_across_rounds() {
    let (_tmp, db) = setup_crew().await;
    let tasks = db.tasks();

    tasks
        .create(new_task("task-1", "Write outreach email", 5))
        .await
        .unwrap();

    tasks.start("task-1", "agent-1").await.unwrap();
    tasks
        .request_revision("task-1", "weak specificity (0.40)")
        .await
        .unwrap();

    tasks.start("task-1", "agent-1").await.unwrap();
    tasks
        .request_revision("task-1", "weak actionability (0.55)")
        .await
        .unwrap();

    let task = tasks.get("task-1").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::NeedsRevision);
    assert_eq!(task.attempts, 2);
    let notes = task.revision_notes.unwrap();
    assert!(notes.contains("weak specificity (0.40)"));
    assert!(notes.contains("weak actionability (0.55)"));
}

#[tokio::test]
async fn test_workspace_cascade_removes_children() {
    let (_tmp, db) = setup_crew().await;
    let tasks = db.tasks();

    tasks
        .create(new_task("task-1", "Find leads", 5))
        .await
        .unwrap();
    db.deliverables()
        .create("d-1", "ws-1", "goal-1", "Lead List", "contact-list", "{}", 0.8, 40.0)
        .await
        .unwrap();
    db.insights()
        .insert("i-1", "ws-1", "researcher", "observation", "x", &[], 0.8, "hash-1")
        .await
        .unwrap();

    sqlx::query("DELETE FROM workspaces WHERE id = ?")
        .bind("ws-1")
        .execute(db.pool())
        .await
        .unwrap();

    let orphans: i64 = sqlx::query_scalar(
        "SELECT (SELECT COUNT(*) FROM goals) + (SELECT COUNT(*) FROM agents)
              + (SELECT COUNT(*) FROM tasks) + (SELECT COUNT(*) FROM deliverables)
              + (SELECT COUNT(*) FROM insights)",
    )
    .fetch_one(db.pool())
    .await
    .unwrap();
    assert_eq!(orphans, 0);
}
