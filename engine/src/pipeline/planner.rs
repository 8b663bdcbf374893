//! Goal planning
//!
//! Turns the gap between a goal's current and target value into a small
//! batch of concrete task drafts. Planning is conservative: a completed
//! goal plans nothing, a goal inside its retry cooldown plans nothing,
//! and candidates that duplicate open work are dropped. Provider trouble
//! degrades to an empty batch (with the cooldown stamped) or, when the
//! model answered but unparseably, to a deterministic template batch.

use crate::config::PlannerConfig;
use crate::db::goals::Goal;
use crate::db::tasks::{NewTask, Task, NO_AGENTS_AVAILABLE};
use crate::db::workspaces::Workspace;
use crate::db::{AgentRepository, Database, GoalRepository, TaskRepository};
use crate::pipeline::types::TaskDraft;
use crate::provider::{extract_json_value, CallCategory, CompletionRequest, ProviderGateway};
use anyhow::Result;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One element of the model's planning response, before validation
#[derive(Debug, Deserialize)]
struct RawTaskDraft {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    role: String,
    #[serde(default = "default_priority")]
    priority: i64,
    #[serde(default)]
    depends_on_prior: bool,
}

fn default_priority() -> i64 {
    5
}

/// Plans task batches for active goals
#[derive(Clone)]
pub struct GoalPlanner {
    goals: GoalRepository,
    tasks: TaskRepository,
    agents: AgentRepository,
    gateway: Arc<ProviderGateway>,
    config: PlannerConfig,
}

impl GoalPlanner {
    pub fn new(db: &Database, gateway: Arc<ProviderGateway>, config: PlannerConfig) -> Self {
        Self {
            goals: db.goals(),
            tasks: db.tasks(),
            agents: db.agents(),
            gateway,
            config,
        }
    }

    /// Produce a batch of drafts for one goal. Provider failures never
    /// propagate: they stamp the goal's retry cooldown and yield an
    /// empty batch.
    pub async fn plan_tasks(&self, goal: &Goal, workspace: &Workspace) -> Result<Vec<TaskDraft>> {
        let remaining = goal.remaining();
        if remaining <= 0.0 {
            debug!(goal_id = %goal.id, "Goal already at target, nothing to plan");
            return Ok(Vec::new());
        }

        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
        if let Some(last) = goal.last_validation_at {
            if now - last < self.config.retry_cooldown_secs {
                debug!(goal_id = %goal.id, "Goal inside planning cooldown");
                return Ok(Vec::new());
            }
        }

        let open = self.tasks.open_tasks_for_goal(&goal.id).await?;
        let roles = self.agents.roles_for_workspace(&workspace.id).await?;
        let batch = batch_size(remaining, self.config.max_tasks_per_cycle);

        let (system, user) = self.build_prompt(goal, workspace, &roles, &open, batch);
        let request = CompletionRequest::new(&system, &user);
        let raws = match self.gateway.complete(CallCategory::Planning, &request).await {
            Ok(completion) => match parse_drafts(&completion.content) {
                Some(raws) => raws,
                None => {
                    warn!(goal_id = %goal.id, "Planning response unparseable, using template batch");
                    self.fallback_drafts(goal, &roles)
                }
            },
            Err(e) => {
                warn!(goal_id = %goal.id, "Planning call failed: {}", e);
                self.goals.touch_validation(&goal.id).await?;
                return Ok(Vec::new());
            }
        };

        let drafts = self.filter_drafts(raws, &open, &roles, batch);
        info!(
            goal_id = %goal.id,
            planned = drafts.len(),
            "Planned task batch"
        );
        Ok(drafts)
    }

    /// Persist drafts as pending tasks, chaining dependency edges where
    /// a draft builds on the one before it
    pub async fn materialize(
        &self,
        workspace_id: &str,
        goal_id: &str,
        drafts: &[TaskDraft],
    ) -> Result<Vec<Task>> {
        let mut created = Vec::with_capacity(drafts.len());
        let mut prior: Option<String> = None;

        for draft in drafts {
            let task = self
                .tasks
                .create(NewTask {
                    id: Uuid::new_v4().to_string(),
                    workspace_id: workspace_id.to_string(),
                    goal_id: Some(goal_id.to_string()),
                    assigned_to_role: Some(draft.role.clone()),
                    name: draft.name.clone(),
                    description: draft.description.clone(),
                    priority: draft.priority,
                    parent_task_id: None,
                })
                .await?;

            if draft.depends_on_prior {
                if let Some(prior_id) = &prior {
                    self.tasks.add_dependency(&task.id, prior_id).await?;
                }
            }
            prior = Some(task.id.clone());
            created.push(task);
        }

        Ok(created)
    }

    /// Drop duplicates of open work, resolve roles, enforce the batch cap
    fn filter_drafts(
        &self,
        raws: Vec<RawTaskDraft>,
        open: &[Task],
        roles: &[String],
        batch: usize,
    ) -> Vec<TaskDraft> {
        let open_intents: Vec<String> = open
            .iter()
            .map(|t| format!("{} {}", t.name, t.description))
            .collect();

        let mut kept: Vec<TaskDraft> = Vec::new();
        for raw in raws {
            if kept.len() >= batch {
                break;
            }
            let intent = format!("{} {}", raw.name, raw.description);
            let kept_intents: Vec<String> = kept
                .iter()
                .map(|d| format!("{} {}", d.name, d.description))
                .collect();
            let duplicate = open_intents.iter().chain(kept_intents.iter()).any(|existing| {
                jaccard_similarity(&intent, existing) >= self.config.similarity_threshold
            });
            if duplicate {
                debug!(name = %raw.name, "Dropping draft duplicating open work");
                continue;
            }

            kept.push(TaskDraft {
                name: raw.name,
                description: raw.description,
                role: resolve_role(&raw.role, roles),
                priority: raw.priority.clamp(1, 10),
                depends_on_prior: raw.depends_on_prior,
            });
        }
        kept
    }

    fn build_prompt(
        &self,
        goal: &Goal,
        workspace: &Workspace,
        roles: &[String],
        open: &[Task],
        batch: usize,
    ) -> (String, String) {
        let system = "You plan work for a small team of AI agents pursuing a measurable goal. \
             Break the remaining gap into concrete tasks that each produce a reviewable work \
             product. Gathering tasks collect raw material; synthesis tasks turn it into the \
             final artifact and must depend on the gathering that feeds them.\n\
             Respond with ONLY a JSON array. Each element:\n\
             {\"name\": \"short imperative title\", \
             \"description\": \"what to produce and what good looks like\", \
             \"role\": \"one of the available roles\", \
             \"priority\": 5, \"depends_on_prior\": false}"
            .to_string();

        let open_names = if open.is_empty() {
            "none".to_string()
        } else {
            open.iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        };
        let unit = goal.unit.as_deref().unwrap_or("units");
        let user = format!(
            "Mission: {}\n\
             Goal metric: {} ({:.0} of {:.0} {} done, {:.0} remaining)\n\
             Available roles: {}\n\
             Already planned, do not repeat: {}\n\
             Plan at most {} tasks.",
            workspace.goal_text,
            goal.metric_type,
            goal.current_value,
            goal.target_value,
            unit,
            goal.remaining(),
            roles.join(", "),
            open_names,
            batch,
        );
        (system, user)
    }

    /// Deterministic gather-then-produce template used when the model's
    /// answer cannot be parsed
    fn fallback_drafts(&self, goal: &Goal, roles: &[String]) -> Vec<RawTaskDraft> {
        let role = roles.first().cloned().unwrap_or_default();
        let metric = goal.metric_type.replace('_', " ");
        vec![
            RawTaskDraft {
                name: format!("Gather source material for {}", metric),
                description: format!(
                    "Collect the raw inputs needed to move {} from {:.0} to {:.0}. \
                     List concrete findings, not an approach.",
                    metric, goal.current_value, goal.target_value
                ),
                role: role.clone(),
                priority: 7,
                depends_on_prior: false,
            },
            RawTaskDraft {
                name: format!("Produce {} content", metric),
                description: format!(
                    "Turn the gathered material into finished work that advances {}.",
                    metric
                ),
                role,
                priority: 5,
                depends_on_prior: true,
            },
        ]
    }
}

/// Parse the model's response into raw drafts, skipping malformed
/// elements. Returns None when nothing usable was found.
fn parse_drafts(content: &str) -> Option<Vec<RawTaskDraft>> {
    let value = extract_json_value(content)?;
    let items = value.as_array()?;
    let raws: Vec<RawTaskDraft> = items
        .iter()
        .filter_map(|item| serde_json::from_value(item.clone()).ok())
        .collect();
    if raws.is_empty() {
        None
    } else {
        Some(raws)
    }
}

/// Half the remaining gap, at least one task, capped per cycle
fn batch_size(remaining: f64, cap: usize) -> usize {
    let wanted = (remaining / 2.0).ceil() as usize;
    wanted.clamp(1, cap.max(1))
}

/// Map a requested role onto the workspace's actual roles. Unknown roles
/// become the sentinel so dispatch can fail the task explicitly instead
/// of letting it sit in the queue forever.
fn resolve_role(requested: &str, roles: &[String]) -> String {
    let lowered = requested.trim().to_lowercase();
    if lowered.is_empty() {
        return roles
            .first()
            .cloned()
            .unwrap_or_else(|| NO_AGENTS_AVAILABLE.to_string());
    }
    for role in roles {
        if role.to_lowercase() == lowered {
            return role.clone();
        }
    }
    for role in roles {
        let candidate = role.to_lowercase();
        if lowered.contains(&candidate) || candidate.contains(&lowered) {
            return role.clone();
        }
    }
    NO_AGENTS_AVAILABLE.to_string()
}

/// Word-set Jaccard similarity, used for duplicate-intent detection
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let words_a = word_set(a);
    let words_b = word_set(b);
    let union = words_a.union(&words_b).count();
    if union == 0 {
        return 0.0;
    }
    let intersection = words_a.intersection(&words_b).count();
    intersection as f64 / union as f64
}

fn word_set(s: &str) -> HashSet<String> {
    s.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}
