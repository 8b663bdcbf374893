//! Task execution
//!
//! Dispatches ready tasks to agents with bounded concurrency and drives
//! each one through the provider call, the quality gate, and the revision
//! loop. A task failure never aborts the batch: every outcome is absorbed
//! into a per-task report and recorded on the task row, so the
//! orchestrator sees one summary per dispatched task.

use crate::config::ExecutorConfig;
use crate::db::agents::{Agent, AgentStatus};
use crate::db::tasks::{NewTask, Task, TaskStatus, NO_AGENTS_AVAILABLE};
use crate::db::{AgentRepository, Database, GoalRepository, TaskRepository};
use crate::events::{Event, EventBus};
use crate::pipeline::memory::InsightMemory;
use crate::pipeline::quality::{QualityGate, TaskContext};
use crate::pipeline::types::{QualityReport, QualityVerdict, TaskReport, TaskResult};
use crate::provider::{
    extract_json_value, CallCategory, Completion, CompletionRequest, ProviderGateway,
};
use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How many ready tasks one dispatch round picks up
const READY_BATCH_LIMIT: i64 = 32;

/// Runs ready tasks through agents and the quality gate
#[derive(Clone)]
pub struct TaskExecutor {
    tasks: TaskRepository,
    agents: AgentRepository,
    goals: GoalRepository,
    gateway: Arc<ProviderGateway>,
    quality: QualityGate,
    memory: InsightMemory,
    events: EventBus,
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(
        db: &Database,
        gateway: Arc<ProviderGateway>,
        quality: QualityGate,
        memory: InsightMemory,
        events: EventBus,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            tasks: db.tasks(),
            agents: db.agents(),
            goals: db.goals(),
            gateway,
            quality,
            memory,
            events,
            config,
        }
    }

    /// Dispatch every ready task in the workspace, at most
    /// `max_concurrent_tasks` in flight at once
    pub async fn execute_ready(&self, workspace_id: &str) -> Result<Vec<TaskReport>> {
        let ready = self.tasks.ready_tasks(workspace_id, READY_BATCH_LIMIT).await?;
        if ready.is_empty() {
            return Ok(Vec::new());
        }
        info!(workspace_id, count = ready.len(), "Dispatching ready tasks");

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_tasks.max(1)));
        let mut join_set = JoinSet::new();
        for task in ready {
            let worker = self.clone();
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                worker.run_task(task).await
            });
        }

        let mut reports = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => warn!("Task worker panicked: {}", e),
            }
        }
        Ok(reports)
    }

    /// Run one task to a report, absorbing infrastructure errors into a
    /// recorded failure
    async fn run_task(&self, task: Task) -> TaskReport {
        let task_id = task.id.clone();
        let name = task.name.clone();
        match self.try_run_task(task).await {
            Ok(report) => report,
            Err(e) => {
                warn!(task_id = %task_id, "Task processing error: {e:#}");
                if let Err(mark) = self.tasks.fail(&task_id, &format!("internal: {e}")).await {
                    debug!(task_id = %task_id, "Could not record failure: {mark:#}");
                }
                self.events
                    .publish(Event::TaskFailed {
                        task_id: task_id.clone(),
                        reason: "internal".to_string(),
                    })
                    .await;
                TaskReport {
                    task_id,
                    name,
                    status: TaskStatus::Failed,
                    quality_score: None,
                }
            }
        }
    }

    async fn try_run_task(&self, task: Task) -> Result<TaskReport> {
        let Some(agent) = self.resolve_agent(&task).await? else {
            info!(
                task_id = %task.id,
                role = task.assigned_to_role.as_deref().unwrap_or(""),
                "No agent covers the role, failing task"
            );
            self.tasks.fail(&task.id, NO_AGENTS_AVAILABLE).await?;
            self.events
                .publish(Event::TaskFailed {
                    task_id: task.id.clone(),
                    reason: NO_AGENTS_AVAILABLE.to_string(),
                })
                .await;
            return Ok(report(&task, TaskStatus::Failed, None));
        };

        let started = self.tasks.start(&task.id, &agent.id).await?;
        self.agents.update_status(&agent.id, AgentStatus::Busy).await?;
        self.events
            .publish(Event::TaskStarted {
                task_id: started.id.clone(),
                agent_id: agent.id.clone(),
            })
            .await;

        let execution_id = Uuid::new_v4().to_string();
        self.tasks
            .start_execution(&execution_id, &started.id, Some(&agent.id), &started.workspace_id)
            .await?;
        let call_started = std::time::Instant::now();

        let request = self.build_request(&started, &agent);
        let deadline = Duration::from_secs(self.config.task_timeout_secs);
        let outcome = timeout(deadline, self.gateway.complete(CallCategory::Execution, &request)).await;
        let elapsed_ms = call_started.elapsed().as_millis() as i64;

        let completion = match outcome {
            Err(_) => {
                warn!(task_id = %started.id, "Task deadline exceeded");
                self.tasks.time_out(&started.id).await?;
                self.finish(&execution_id, "timed_out", "task deadline exceeded", 0, elapsed_ms, &agent)
                    .await?;
                self.events
                    .publish(Event::TaskFailed {
                        task_id: started.id.clone(),
                        reason: "timed_out".to_string(),
                    })
                    .await;
                return Ok(report(&started, TaskStatus::TimedOut, None));
            }
            Ok(Err(e)) => {
                warn!(task_id = %started.id, "Provider call failed after retries: {}", e);
                self.tasks.fail(&started.id, &e.to_string()).await?;
                self.finish(&execution_id, "failed", &e.to_string(), 0, elapsed_ms, &agent)
                    .await?;
                self.events
                    .publish(Event::TaskFailed {
                        task_id: started.id.clone(),
                        reason: e.to_string(),
                    })
                    .await;
                return Ok(report(&started, TaskStatus::Failed, None));
            }
            Ok(Ok(completion)) => completion,
        };

        self.tasks.mark_pending_verification(&started.id).await?;
        let goal_metric = match &started.goal_id {
            Some(goal_id) => self.goals.get(goal_id).await?.map(|g| g.metric_type),
            None => None,
        };
        let context = TaskContext {
            task_name: started.name.clone(),
            task_description: started.description.clone(),
            goal_metric,
        };
        let review = self.quality.evaluate(&completion.content, &context).await;
        debug!(
            task_id = %started.id,
            verdict = review.verdict.as_str(),
            score = review.score,
            "Quality verdict"
        );

        let attempts_exhausted = started.attempts >= self.config.max_attempts as i64;
        match review.verdict {
            QualityVerdict::Accept => {
                self.accept(&started, &agent, &execution_id, &completion, &review, elapsed_ms)
                    .await
            }
            QualityVerdict::Enhance if attempts_exhausted => {
                // Final attempt cleared the low bar: keep the best effort
                info!(task_id = %started.id, "Keeping best-effort output after final attempt");
                self.accept(&started, &agent, &execution_id, &completion, &review, elapsed_ms)
                    .await
            }
            QualityVerdict::Reject if attempts_exhausted => {
                let findings = review.reasons.join("; ");
                self.tasks.fail(&started.id, "quality_rejected").await?;
                self.finish(&execution_id, "failed", &findings, completion.token_usage, elapsed_ms, &agent)
                    .await?;
                self.events
                    .publish(Event::TaskFailed {
                        task_id: started.id.clone(),
                        reason: "quality_rejected".to_string(),
                    })
                    .await;
                if self.config.corrective_tasks && started.parent_task_id.is_none() {
                    self.spawn_corrective(&started, &review).await?;
                }
                Ok(report(&started, TaskStatus::Failed, Some(review.score)))
            }
            _ => {
                let feedback = if review.reasons.is_empty() {
                    format!(
                        "Output scored {:.2}, below the quality bar. Be more specific and complete.",
                        review.score
                    )
                } else {
                    review.reasons.join("; ")
                };
                self.tasks.request_revision(&started.id, &feedback).await?;
                self.finish(&execution_id, "needs_revision", &feedback, completion.token_usage, elapsed_ms, &agent)
                    .await?;
                debug!(task_id = %started.id, "Task sent back for revision");
                Ok(report(&started, TaskStatus::NeedsRevision, Some(review.score)))
            }
        }
    }

    /// Complete an accepted task: persist the result, bump the goal, bank
    /// insights, publish events
    async fn accept(
        &self,
        task: &Task,
        agent: &Agent,
        execution_id: &str,
        completion: &Completion,
        review: &QualityReport,
        elapsed_ms: i64,
    ) -> Result<TaskReport> {
        let content = extract_json_value(&completion.content)
            .unwrap_or_else(|| Value::String(completion.content.clone()));
        let stored = TaskResult {
            content: content.clone(),
            quality_score: review.score,
            verdict: review.verdict,
            token_usage: completion.token_usage,
        };
        self.tasks
            .complete(&task.id, &stored.to_json()?, review.score)
            .await?;
        self.finish(
            execution_id,
            "completed",
            "accepted by quality gate",
            completion.token_usage,
            elapsed_ms,
            agent,
        )
        .await?;

        if let Some(goal_id) = &task.goal_id {
            let goal = self.goals.add_progress(goal_id, 1.0).await?;
            self.goals.mark_completed_if_reached(goal_id).await?;
            self.events
                .publish(Event::GoalUpdated {
                    goal_id: goal.id.clone(),
                    current_value: goal.current_value,
                    target_value: goal.target_value,
                })
                .await;
        }

        if let Err(e) = self
            .memory
            .bank_from_task(&task.workspace_id, &agent.role, &task.name, &content, review.score)
            .await
        {
            warn!(task_id = %task.id, "Insight banking failed: {e:#}");
        }

        self.events
            .publish(Event::TaskCompleted {
                task_id: task.id.clone(),
                quality_score: review.score,
            })
            .await;
        info!(task_id = %task.id, score = review.score, "Task completed");
        Ok(report(task, TaskStatus::Completed, Some(review.score)))
    }

    /// Close the execution row and free the agent
    async fn finish(
        &self,
        execution_id: &str,
        status: &str,
        logs: &str,
        token_usage: i64,
        elapsed_ms: i64,
        agent: &Agent,
    ) -> Result<()> {
        self.tasks
            .finish_execution(execution_id, status, logs, token_usage, elapsed_ms)
            .await?;
        self.agents
            .update_status(&agent.id, AgentStatus::Available)
            .await?;
        Ok(())
    }

    /// Explicit assignment wins; otherwise the first available agent for
    /// the task's role. The sentinel role resolves to nobody.
    async fn resolve_agent(&self, task: &Task) -> Result<Option<Agent>> {
        if let Some(agent_id) = &task.agent_id {
            if let Some(agent) = self.agents.get(agent_id).await? {
                return Ok(Some(agent));
            }
        }
        let role = task.assigned_to_role.as_deref().unwrap_or("");
        if role.is_empty() || role == NO_AGENTS_AVAILABLE {
            return Ok(None);
        }
        self.agents.find_available(&task.workspace_id, role).await
    }

    /// One follow-up task carrying the gate's findings. Corrective tasks
    /// never chain: a failed corrective stays failed.
    async fn spawn_corrective(&self, failed: &Task, review: &QualityReport) -> Result<()> {
        let description = format!(
            "{}\n\nThe previous attempt was rejected by the quality gate: {}. \
             Produce a corrected version that fixes these findings.",
            failed.description,
            review.reasons.join("; ")
        );
        let corrective = self
            .tasks
            .create(NewTask {
                id: Uuid::new_v4().to_string(),
                workspace_id: failed.workspace_id.clone(),
                goal_id: failed.goal_id.clone(),
                assigned_to_role: failed.assigned_to_role.clone(),
                name: format!("Rework: {}", failed.name),
                description,
                priority: (failed.priority + 1).clamp(1, 10),
                parent_task_id: Some(failed.id.clone()),
            })
            .await?;
        info!(
            task_id = %failed.id,
            corrective_id = %corrective.id,
            "Spawned corrective task"
        );
        Ok(())
    }

    /// Agent persona and task brief, with any revision feedback appended
    fn build_request(&self, task: &Task, agent: &Agent) -> CompletionRequest {
        let mut system = format!(
            "You are {}, a {} {}. Produce the complete work product for the task you are given.\n\
             When the task calls for structured data (contacts, tables, message sequences), \
             respond with a JSON object; otherwise respond with the finished text.\n\
             You may include an \"insights\" array of notable observations, each with a \
             confidence between 0 and 1.\n\
             Produce the deliverable itself, not a description of how you would make it.",
            agent.name,
            agent.seniority.as_str(),
            agent.role
        );
        if let Some(notes) = &task.revision_notes {
            system.push_str("\n\nFeedback on the previous attempt:\n");
            system.push_str(notes);
        }
        let user = format!("Task: {}\n\n{}", task.name, task.description);
        CompletionRequest::new(&system, &user)
    }
}

fn report(task: &Task, status: TaskStatus, quality_score: Option<f64>) -> TaskReport {
    TaskReport {
        task_id: task.id.clone(),
        name: task.name.clone(),
        status,
        quality_score,
    }
}
