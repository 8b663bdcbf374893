//! Cycle orchestration
//!
//! Drives the plan, execute, aggregate loop over every workspace. Each
//! cycle runs under a row-level advisory lease so concurrent orchestrators
//! never double-run a workspace; a crashed holder's lease expires on its
//! own and the next sweep recovers the workspace's in-flight tasks. A
//! workspace that churns without landing anything for several consecutive
//! cycles is escalated for operator attention.

use crate::config::OrchestratorConfig;
use crate::db::goals::GoalStatus;
use crate::db::tasks::TaskStatus;
use crate::db::workspaces::WorkspaceStatus;
use crate::db::{AgentRepository, Database, GoalRepository, TaskRepository, WorkspaceRepository};
use crate::errors::EngineError;
use crate::events::{Event, EventBus};
use crate::pipeline::aggregator::DeliverableAggregator;
use crate::pipeline::executor::TaskExecutor;
use crate::pipeline::planner::GoalPlanner;
use crate::pipeline::types::CycleReport;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Workspaces cycled in parallel during one sweep
const MAX_CONCURRENT_WORKSPACES: usize = 4;

/// Runs workspace cycles under advisory leases
#[derive(Clone)]
pub struct Orchestrator {
    workspaces: WorkspaceRepository,
    goals: GoalRepository,
    tasks: TaskRepository,
    agents: AgentRepository,
    planner: GoalPlanner,
    executor: TaskExecutor,
    aggregator: DeliverableAggregator,
    events: EventBus,
    config: OrchestratorConfig,
    owner_id: String,
}

impl Orchestrator {
    pub fn new(
        db: &Database,
        planner: GoalPlanner,
        executor: TaskExecutor,
        aggregator: DeliverableAggregator,
        events: EventBus,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            workspaces: db.workspaces(),
            goals: db.goals(),
            tasks: db.tasks(),
            agents: db.agents(),
            planner,
            executor,
            aggregator,
            events,
            config,
            owner_id: format!("foreman-{}", Uuid::new_v4()),
        }
    }

    /// Run one full cycle for a workspace, holding its lease throughout
    ///
    /// Fails with `EngineError::LeaseUnavailable` when another orchestrator
    /// holds the workspace. The lease is always released, restoring
    /// `NeedsIntervention` after an escalation and `Active` otherwise.
    pub async fn run_cycle(&self, workspace_id: &str) -> Result<CycleReport> {
        let claimed = self
            .workspaces
            .try_claim_lease(workspace_id, &self.owner_id, self.config.lease_ttl_secs)
            .await?;
        if !claimed {
            return Err(EngineError::LeaseUnavailable(workspace_id.to_string()).into());
        }

        let outcome = self.cycle_under_lease(workspace_id).await;
        let restored = match &outcome {
            Ok(report) if report.escalated => WorkspaceStatus::NeedsIntervention,
            _ => WorkspaceStatus::Active,
        };
        self.workspaces
            .release_lease(workspace_id, &self.owner_id, restored)
            .await?;
        outcome
    }

    async fn cycle_under_lease(&self, workspace_id: &str) -> Result<CycleReport> {
        let workspace = self
            .workspaces
            .get(workspace_id)
            .await?
            .ok_or_else(|| EngineError::WorkspaceNotFound(workspace_id.to_string()))?;

        // Recover whatever a crashed or expired cycle left in flight
        let swept = self
            .tasks
            .sweep_stale(workspace_id, self.config.lease_ttl_secs)
            .await?;
        let requeued = self.tasks.requeue_stale(workspace_id).await?;
        if swept > 0 || requeued > 0 {
            info!(workspace_id, swept, requeued, "Recovered stale in-flight tasks");
        }
        self.agents.release_all(workspace_id).await?;

        let mut report = CycleReport {
            workspace_id: workspace_id.to_string(),
            ..Default::default()
        };

        let active_goals = self.goals.list_active_for_workspace(workspace_id).await?;
        for goal in &active_goals {
            let drafts = self.planner.plan_tasks(goal, &workspace).await?;
            if drafts.is_empty() {
                continue;
            }
            let created = self
                .planner
                .materialize(workspace_id, &goal.id, &drafts)
                .await?;
            report.tasks_planned += created.len();
        }

        let task_reports = self.executor.execute_ready(workspace_id).await?;
        report.tasks_run = task_reports.len();
        report.tasks_completed = task_reports
            .iter()
            .filter(|r| r.status == TaskStatus::Completed)
            .count();
        report.tasks_failed = task_reports
            .iter()
            .filter(|r| matches!(r.status, TaskStatus::Failed | TaskStatus::TimedOut))
            .count();

        // Aggregation trouble is recoverable; the next cycle resumes from
        // the same checkpoint
        match self.aggregator.aggregate(workspace_id, false).await {
            Ok(deliverables) => report.deliverables_updated = deliverables.len(),
            Err(e) => warn!(workspace_id, "Aggregation failed, cycle continues: {e:#}"),
        }

        for goal in &active_goals {
            if let Some(fresh) = self.goals.get(&goal.id).await? {
                if fresh.status == GoalStatus::Completed {
                    report.goals_completed += 1;
                }
            }
        }

        if report.progressed() {
            self.workspaces.reset_stall(workspace_id).await?;
        } else if report.stalled() {
            let stalls = self.workspaces.record_stall(workspace_id).await?;
            if stalls >= self.config.stall_cycles_before_intervention as i64 {
                warn!(workspace_id, stalls, "Workspace stalled, escalating");
                report.escalated = true;
                self.events
                    .publish(Event::WorkspaceEscalated {
                        workspace_id: workspace_id.to_string(),
                        reason: format!("{} consecutive cycles without progress", stalls),
                    })
                    .await;
            }
        }

        self.events
            .publish(Event::CycleFinished {
                workspace_id: workspace_id.to_string(),
                tasks_run: report.tasks_run,
            })
            .await;
        info!(
            workspace_id,
            planned = report.tasks_planned,
            run = report.tasks_run,
            completed = report.tasks_completed,
            failed = report.tasks_failed,
            deliverables = report.deliverables_updated,
            "Cycle finished"
        );
        Ok(report)
    }

    /// Cycle every leasable workspace once, a few in parallel
    ///
    /// Returns true when any cycle planned or ran something, so the caller
    /// can back off when the whole sweep was idle.
    pub async fn sweep(&self) -> bool {
        let workspaces = match self.workspaces.list().await {
            Ok(list) => list,
            Err(e) => {
                warn!("Could not list workspaces: {e:#}");
                return false;
            }
        };
        let leasable: Vec<_> = workspaces.into_iter().filter(|w| w.is_leasable()).collect();
        if leasable.is_empty() {
            return false;
        }

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_WORKSPACES));
        let mut join_set = JoinSet::new();
        for workspace in leasable {
            let orchestrator = self.clone();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let outcome = orchestrator.run_cycle(&workspace.id).await;
                (workspace.id, outcome)
            });
        }

        let mut worked = false;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((_, Ok(report))) => {
                    if report.tasks_planned > 0
                        || report.tasks_run > 0
                        || report.deliverables_updated > 0
                    {
                        worked = true;
                    }
                }
                Ok((workspace_id, Err(e))) => match e.downcast_ref::<EngineError>() {
                    Some(EngineError::LeaseUnavailable(_)) => {
                        debug!(workspace_id = %workspace_id, "Workspace leased elsewhere, skipping");
                    }
                    _ => warn!(workspace_id = %workspace_id, "Cycle failed: {e:#}"),
                },
                Err(e) => warn!("Cycle worker panicked: {}", e),
            }
        }
        worked
    }

    /// Sweep forever until Ctrl-C, backing off when a sweep found nothing
    pub async fn run_loop(&self) -> Result<()> {
        info!(owner = %self.owner_id, "Orchestrator loop started");
        loop {
            let worked = self.sweep().await;
            let mut delay = Duration::from_secs(self.config.cycle_interval_secs);
            if !worked {
                delay += Duration::from_secs(self.config.idle_backoff_secs);
            }

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received, stopping orchestrator loop");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn owner_id(&self) -> &str {
        &self.owner_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AggregatorConfig, ExecutorConfig, InsightsConfig, PlannerConfig, QualityConfig,
    };
    use crate::db::agents::AgentStatus;
    use crate::db::tasks::NewTask;
    use crate::events::EventKind;
    use crate::pipeline::assets::AssetExtractor;
    use crate::pipeline::memory::InsightMemory;
    use crate::pipeline::quality::QualityGate;
    use crate::test_support::{ok, scripted_gateway, seeded_db, Fixture, ScriptedProvider};

    const PLAN_TWO_LEAD_TASKS: &str = r#"[
        {"name": "Find qualified SaaS leads", "description": "List SaaS companies hiring SDRs with named contacts", "role": "researcher", "priority": 7},
        {"name": "Find qualified fintech leads", "description": "List fintech startups with revenue teams and named buyers", "role": "researcher", "priority": 6}
    ]"#;
    const HIGH_RUBRIC: &str = r#"{"structure": 0.9, "specificity": 0.85, "actionability": 0.85}"#;
    const LOREM: &str =
        "Lorem ipsum dolor sit amet, consectetur adipiscing elit sed do eiusmod tempor.";

    fn build_orchestrator(
        fixture: &Fixture,
        provider: Arc<ScriptedProvider>,
        executor_config: ExecutorConfig,
        orchestrator_config: OrchestratorConfig,
        events: EventBus,
    ) -> Orchestrator {
        let gateway = scripted_gateway(provider);
        let planner = GoalPlanner::new(&fixture.db, gateway.clone(), PlannerConfig::default());
        let quality = QualityGate::new(gateway.clone(), QualityConfig::default()).unwrap();
        let memory = InsightMemory::new(&fixture.db, InsightsConfig::default());
        let executor = TaskExecutor::new(
            &fixture.db,
            gateway.clone(),
            quality,
            memory,
            events.clone(),
            executor_config,
        );
        let extractor = AssetExtractor::new(gateway);
        let aggregator = DeliverableAggregator::new(
            &fixture.db,
            extractor,
            events.clone(),
            AggregatorConfig::default(),
        );
        Orchestrator::new(
            &fixture.db,
            planner,
            executor,
            aggregator,
            events,
            orchestrator_config,
        )
    }

    async fn complete_goal(fixture: &Fixture) {
        fixture
            .db
            .goals()
            .raise_progress_to(&fixture.goal_id, 3.0)
            .await
            .unwrap();
        fixture
            .db
            .goals()
            .mark_completed_if_reached(&fixture.goal_id)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_cycle_plans_executes_and_aggregates() {
        let fixture = seeded_db().await;
        let events = EventBus::new();
        let mut cycle_rx = events.subscribe(EventKind::CycleFinished).await;
        let provider =
            Arc::new(ScriptedProvider::new(vec![ok(PLAN_TWO_LEAD_TASKS)]).with_default(HIGH_RUBRIC));
        let orchestrator = build_orchestrator(
            &fixture,
            provider,
            ExecutorConfig::default(),
            OrchestratorConfig::default(),
            events,
        );

        let report = orchestrator.run_cycle(&fixture.workspace_id).await.unwrap();
        assert_eq!(report.tasks_planned, 2);
        assert_eq!(report.tasks_run, 2);
        assert_eq!(report.tasks_completed, 2);
        assert_eq!(report.tasks_failed, 0);
        assert_eq!(report.deliverables_updated, 1);
        assert!(!report.escalated);

        let goal = fixture.db.goals().get(&fixture.goal_id).await.unwrap().unwrap();
        assert_eq!(goal.current_value, 2.0);

        let workspace = fixture
            .db
            .workspaces()
            .get(&fixture.workspace_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(workspace.status, WorkspaceStatus::Active);
        assert!(workspace.lease_owner.is_none());
        assert_eq!(workspace.stall_count, 0);

        match cycle_rx.try_recv().unwrap() {
            Event::CycleFinished { tasks_run, .. } => assert_eq!(tasks_run, 2),
            _ => panic!("Wrong event"),
        }
    }

    #[tokio::test]
    async fn test_lease_held_elsewhere_refuses_cycle() {
        let fixture = seeded_db().await;
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let orchestrator = build_orchestrator(
            &fixture,
            provider,
            ExecutorConfig::default(),
            OrchestratorConfig::default(),
            EventBus::new(),
        );

        assert!(fixture
            .db
            .workspaces()
            .try_claim_lease(&fixture.workspace_id, "other-owner", 120)
            .await
            .unwrap());

        let err = orchestrator
            .run_cycle(&fixture.workspace_id)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::LeaseUnavailable(_))
        ));

        // The holder's lease is untouched
        let workspace = fixture
            .db
            .workspaces()
            .get(&fixture.workspace_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(workspace.lease_owner.as_deref(), Some("other-owner"));
    }

    #[tokio::test]
    async fn test_idle_cycle_is_not_a_stall() {
        let fixture = seeded_db().await;
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let orchestrator = build_orchestrator(
            &fixture,
            provider.clone(),
            ExecutorConfig::default(),
            OrchestratorConfig::default(),
            EventBus::new(),
        );
        complete_goal(&fixture).await;

        let report = orchestrator.run_cycle(&fixture.workspace_id).await.unwrap();
        assert_eq!(report.tasks_planned, 0);
        assert_eq!(report.tasks_run, 0);
        assert!(!report.escalated);
        assert_eq!(provider.call_count(), 0);

        let workspace = fixture
            .db
            .workspaces()
            .get(&fixture.workspace_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(workspace.stall_count, 0);
        assert_eq!(workspace.status, WorkspaceStatus::Active);
    }

    #[tokio::test]
    async fn test_churn_without_progress_escalates() {
        let fixture = seeded_db().await;
        let events = EventBus::new();
        let mut escalated_rx = events.subscribe(EventKind::WorkspaceEscalated).await;
        let provider = Arc::new(ScriptedProvider::new(vec![]).with_default(LOREM));
        let orchestrator = build_orchestrator(
            &fixture,
            provider,
            ExecutorConfig {
                max_attempts: 1,
                ..Default::default()
            },
            OrchestratorConfig {
                stall_cycles_before_intervention: 2,
                ..Default::default()
            },
            events,
        );
        // Completed goal keeps the planner quiet; only the seeded task churns
        complete_goal(&fixture).await;
        fixture
            .db
            .tasks()
            .create(NewTask {
                id: "task-reject".to_string(),
                workspace_id: fixture.workspace_id.clone(),
                goal_id: Some(fixture.goal_id.clone()),
                assigned_to_role: Some("researcher".to_string()),
                name: "Compile lead list".to_string(),
                description: "Find companies hiring SDRs".to_string(),
                priority: 5,
                parent_task_id: None,
            })
            .await
            .unwrap();

        // Cycle 1: original rejected terminally, corrective spawned
        let first = orchestrator.run_cycle(&fixture.workspace_id).await.unwrap();
        assert_eq!(first.tasks_run, 1);
        assert_eq!(first.tasks_failed, 1);
        assert!(!first.escalated);

        // Cycle 2: corrective rejected too, stall limit reached
        let second = orchestrator.run_cycle(&fixture.workspace_id).await.unwrap();
        assert_eq!(second.tasks_run, 1);
        assert!(second.escalated);
        assert!(escalated_rx.try_recv().is_ok());

        let workspace = fixture
            .db
            .workspaces()
            .get(&fixture.workspace_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(workspace.status, WorkspaceStatus::NeedsIntervention);
        assert!(!workspace.is_leasable());

        // An escalated workspace refuses further cycles
        let err = orchestrator
            .run_cycle(&fixture.workspace_id)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::LeaseUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_inflight_task_recovered_and_rerun() {
        let fixture = seeded_db().await;
        let good = r#"{"contacts": [{"name": "Dana Reyes", "email": "dana@acme.com", "company": "Acme"}]}"#;
        // Planning echoes the recovered task so the duplicate filter drops it
        let duplicate_plan = r#"[{"name": "Compile lead list", "description": "Find companies hiring SDRs", "role": "researcher"}]"#;
        let provider = Arc::new(ScriptedProvider::new(vec![
            ok(duplicate_plan),
            ok(good),
            ok(HIGH_RUBRIC),
        ]));
        let orchestrator = build_orchestrator(
            &fixture,
            provider.clone(),
            ExecutorConfig::default(),
            OrchestratorConfig::default(),
            EventBus::new(),
        );

        let task = fixture
            .db
            .tasks()
            .create(NewTask {
                id: "task-stale".to_string(),
                workspace_id: fixture.workspace_id.clone(),
                goal_id: Some(fixture.goal_id.clone()),
                assigned_to_role: Some("researcher".to_string()),
                name: "Compile lead list".to_string(),
                description: "Find companies hiring SDRs".to_string(),
                priority: 5,
                parent_task_id: None,
            })
            .await
            .unwrap();
        fixture
            .db
            .tasks()
            .start(&task.id, &fixture.agent_id)
            .await
            .unwrap();
        fixture
            .db
            .agents()
            .update_status(&fixture.agent_id, AgentStatus::Busy)
            .await
            .unwrap();
        // Backdate the in-flight row past the lease TTL, as after a crash
        sqlx::query("UPDATE tasks SET updated_at = updated_at - 10000 WHERE id = ?")
            .bind(&task.id)
            .execute(fixture.db.pool())
            .await
            .unwrap();

        let report = orchestrator.run_cycle(&fixture.workspace_id).await.unwrap();
        assert_eq!(report.tasks_planned, 0);
        assert_eq!(report.tasks_run, 1);
        assert_eq!(report.tasks_completed, 1);

        let recovered = fixture.db.tasks().get(&task.id).await.unwrap().unwrap();
        assert_eq!(recovered.status, TaskStatus::Completed);
        assert_eq!(recovered.attempts, 2);
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_sweep_skips_escalated_workspaces() {
        let fixture = seeded_db().await;
        let events = EventBus::new();
        let mut cycle_rx = events.subscribe(EventKind::CycleFinished).await;
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let orchestrator = build_orchestrator(
            &fixture,
            provider,
            ExecutorConfig::default(),
            OrchestratorConfig::default(),
            events,
        );
        complete_goal(&fixture).await;

        fixture
            .db
            .workspaces()
            .create("ws-2", "paused-campaign", "On hold", None)
            .await
            .unwrap();
        fixture
            .db
            .workspaces()
            .update_status("ws-2", WorkspaceStatus::NeedsIntervention)
            .await
            .unwrap();

        let worked = orchestrator.sweep().await;
        assert!(!worked);

        // Only the leasable workspace cycled
        match cycle_rx.try_recv().unwrap() {
            Event::CycleFinished { workspace_id, .. } => {
                assert_eq!(workspace_id, fixture.workspace_id)
            }
            _ => panic!("Wrong event"),
        }
        assert!(cycle_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_owner_ids_are_unique_per_orchestrator() {
        let fixture = seeded_db().await;
        let a = build_orchestrator(
            &fixture,
            Arc::new(ScriptedProvider::new(vec![])),
            ExecutorConfig::default(),
            OrchestratorConfig::default(),
            EventBus::new(),
        );
        let b = build_orchestrator(
            &fixture,
            Arc::new(ScriptedProvider::new(vec![])),
            ExecutorConfig::default(),
            OrchestratorConfig::default(),
            EventBus::new(),
        );
        assert_ne!(a.owner_id(), b.owner_id());
        assert!(a.owner_id().starts_with("foreman-"));
    }
}
