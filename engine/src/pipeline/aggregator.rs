//! Deliverable aggregation
//!
//! Periodically folds accepted task results into durable deliverables and
//! reconciles goal progress against the accepted contribution count. Runs
//! are incremental: a per-workspace checkpoint remembers how far the fold
//! has come, and the asset merge is idempotent, so re-processing a task
//! changes nothing.

use crate::config::AggregatorConfig;
use crate::db::deliverables::{Deliverable, DeliverableStatus};
use crate::db::goals::Goal;
use crate::db::tasks::Task;
use crate::db::{
    Database, DeliverableRepository, GoalRepository, TaskRepository, WorkspaceRepository,
};
use crate::errors::EngineError;
use crate::events::{Event, EventBus};
use crate::pipeline::assets::AssetExtractor;
use crate::pipeline::planner::jaccard_similarity;
use crate::pipeline::types::{Asset, AssetKind};
use anyhow::Result;
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Word-overlap bar for attaching an asset to a goal it was not planned for
const RELEVANCE_BAR: f64 = 0.1;

/// Builds deliverables out of accepted task results
#[derive(Clone)]
pub struct DeliverableAggregator {
    workspaces: WorkspaceRepository,
    tasks: TaskRepository,
    goals: GoalRepository,
    deliverables: DeliverableRepository,
    extractor: AssetExtractor,
    events: EventBus,
    config: AggregatorConfig,
}

impl DeliverableAggregator {
    pub fn new(
        db: &Database,
        extractor: AssetExtractor,
        events: EventBus,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            workspaces: db.workspaces(),
            tasks: db.tasks(),
            goals: db.goals(),
            deliverables: db.deliverables(),
            extractor,
            events,
            config,
        }
    }

    /// Fold new accepted results into deliverables. Unforced runs honor
    /// the minimum-batch and cooldown gates; `force` skips both. Returns
    /// the deliverables created or enhanced.
    pub async fn aggregate(&self, workspace_id: &str, force: bool) -> Result<Vec<Deliverable>> {
        let workspace = self
            .workspaces
            .get(workspace_id)
            .await?
            .ok_or_else(|| EngineError::WorkspaceNotFound(workspace_id.to_string()))?;
        let checkpoint = workspace.last_aggregated_at.unwrap_or(0);

        let candidates = self
            .tasks
            .completed_with_results_since(workspace_id, checkpoint)
            .await?;
        if candidates.is_empty() {
            debug!(workspace_id, "No new accepted results since checkpoint");
            return Ok(Vec::new());
        }

        if !force {
            if (candidates.len() as i64) < self.config.min_completed_tasks {
                debug!(
                    workspace_id,
                    new = candidates.len(),
                    "Below aggregation batch minimum"
                );
                return Ok(Vec::new());
            }
            let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
            if checkpoint > 0 && now - checkpoint < self.config.cooldown_secs {
                debug!(workspace_id, "Aggregation inside cooldown");
                return Ok(Vec::new());
            }
        }

        let goals = self.reconcile_goals(workspace_id).await?;

        let mut watermark = checkpoint;
        let mut updated: Vec<Deliverable> = Vec::new();
        for task in &candidates {
            match self.attach_task_assets(workspace_id, &goals, task).await {
                Ok(touched) => {
                    for deliverable in touched {
                        updated.retain(|d| d.id != deliverable.id);
                        updated.push(deliverable);
                    }
                    // Timestamps are whole seconds; stay one tick behind so
                    // a completion sharing the last processed second is
                    // never skipped. Re-processing is idempotent.
                    watermark = watermark.max(task.updated_at - 1);
                }
                Err(e) => {
                    warn!(
                        workspace_id,
                        task_id = %task.id,
                        "Aggregation halted mid-batch: {e:#}"
                    );
                    break;
                }
            }
        }

        if watermark > checkpoint {
            self.workspaces
                .set_last_aggregated(workspace_id, watermark)
                .await?;
        }

        if !updated.is_empty() {
            info!(
                workspace_id,
                deliverables = updated.len(),
                "Aggregation updated deliverables"
            );
        }
        Ok(updated)
    }

    /// Raise each goal to its accepted contribution count (clamped,
    /// monotone) and flip finished goals to completed
    async fn reconcile_goals(&self, workspace_id: &str) -> Result<Vec<Goal>> {
        let goals = self.goals.list_for_workspace(workspace_id).await?;
        let mut fresh = Vec::with_capacity(goals.len());

        for goal in goals {
            let contribution = self.tasks.count_completed_for_goal(&goal.id).await?;
            let raised = self
                .goals
                .raise_progress_to(&goal.id, contribution as f64)
                .await?;
            if (raised.current_value - goal.current_value).abs() > f64::EPSILON {
                self.events
                    .publish(Event::GoalUpdated {
                        goal_id: raised.id.clone(),
                        current_value: raised.current_value,
                        target_value: raised.target_value,
                    })
                    .await;
            }
            self.goals.mark_completed_if_reached(&goal.id).await?;
            fresh.push(raised);
        }
        Ok(fresh)
    }

    /// Extract one task's assets and upsert them into deliverable slots.
    /// Unextractable results are logged and skipped, not fatal.
    async fn attach_task_assets(
        &self,
        workspace_id: &str,
        goals: &[Goal],
        task: &Task,
    ) -> Result<Vec<Deliverable>> {
        let assets = match self.extractor.extract(task).await {
            Ok(assets) => assets,
            Err(e) => {
                warn!(task_id = %task.id, "Skipping unextractable result: {e:#}");
                return Ok(Vec::new());
            }
        };

        let mut touched = Vec::new();
        for asset in assets {
            let Some(goal) = target_goal(&asset, task, goals) else {
                debug!(asset = %asset.name, task_id = %task.id, "No receptive goal for asset");
                continue;
            };
            if let Some(deliverable) = self.upsert_asset(workspace_id, goal, task, &asset).await? {
                touched.push(deliverable);
            }
        }
        Ok(touched)
    }

    /// Merge one asset into its deliverable slot. Returns None when the
    /// asset was already present and nothing changed.
    async fn upsert_asset(
        &self,
        workspace_id: &str,
        goal: &Goal,
        task: &Task,
        asset: &Asset,
    ) -> Result<Option<Deliverable>> {
        let title = deliverable_title(goal, asset.kind);
        let task_quality = task.quality_score.unwrap_or(0.0);
        let completion = (goal.progress_fraction() * 100.0).clamp(0.0, 100.0);

        let existing = self
            .deliverables
            .find_by_title(workspace_id, &goal.id, &title)
            .await?;

        let deliverable = match existing {
            Some(existing) => {
                let (content, appended) = merge_asset(Some(&existing.content), asset);
                let completion_changed =
                    (existing.completion_percentage - completion).abs() > 0.01;
                if !appended && !completion_changed {
                    return Ok(None);
                }
                let quality = if appended {
                    (existing.quality_score + task_quality) / 2.0
                } else {
                    existing.quality_score
                };
                self.deliverables
                    .enhance(&existing.id, &content, quality, completion)
                    .await?;
                let mut updated = existing;
                updated.content = content;
                updated.quality_score = quality;
                updated.completion_percentage = completion;
                updated
            }
            None => {
                let (content, _) = merge_asset(None, asset);
                let created = self
                    .deliverables
                    .create(
                        &Uuid::new_v4().to_string(),
                        workspace_id,
                        &goal.id,
                        &title,
                        asset.kind.slug(),
                        &content,
                        task_quality,
                        completion,
                    )
                    .await?;
                self.events
                    .publish(Event::DeliverableCreated {
                        deliverable_id: created.id.clone(),
                        title: created.title.clone(),
                    })
                    .await;
                created
            }
        };

        if deliverable.completion_percentage >= 100.0 - f64::EPSILON
            && deliverable.status != DeliverableStatus::Final
        {
            self.deliverables
                .update_status(&deliverable.id, DeliverableStatus::Final)
                .await?;
            let mut finalized = deliverable;
            finalized.status = DeliverableStatus::Final;
            return Ok(Some(finalized));
        }
        Ok(Some(deliverable))
    }
}

/// Title of the slot an asset kind fills for a goal
fn deliverable_title(goal: &Goal, kind: AssetKind) -> String {
    format!("{} {}", goal.metric_type.replace('_', " "), kind.display_name())
}

/// Pick the goal an asset should attach to. The task's own goal wins
/// unless the asset kind conflicts with its metric; otherwise the first
/// goal with declared affinity, then word overlap with the metric.
fn target_goal<'a>(asset: &Asset, task: &Task, goals: &'a [Goal]) -> Option<&'a Goal> {
    if let Some(goal_id) = &task.goal_id {
        if let Some(goal) = goals.iter().find(|g| g.id == *goal_id) {
            if kind_matches_metric(asset.kind, &goal.metric_type) != Some(false) {
                return Some(goal);
            }
        }
    }

    if let Some(goal) = goals
        .iter()
        .find(|g| kind_matches_metric(asset.kind, &g.metric_type) == Some(true))
    {
        return Some(goal);
    }

    let intent = format!("{} {}", task.name, task.description);
    goals.iter().find(|g| {
        jaccard_similarity(&g.metric_type.replace('_', " "), &intent) >= RELEVANCE_BAR
    })
}

/// Affinity between an asset kind and a goal metric.
/// `Some(true)` is a declared fit, `Some(false)` a declared conflict,
/// `None` no signal either way.
fn kind_matches_metric(kind: AssetKind, metric: &str) -> Option<bool> {
    let m = metric.to_lowercase();
    let contacts = m.contains("lead") || m.contains("contact") || m.contains("prospect");
    let messaging = m.contains("email")
        || m.contains("message")
        || m.contains("sequence")
        || m.contains("outreach");
    let documents = m.contains("report")
        || m.contains("document")
        || m.contains("article")
        || m.contains("post");

    match kind {
        AssetKind::ContactList => {
            if contacts {
                Some(true)
            } else if messaging || documents {
                Some(false)
            } else {
                None
            }
        }
        AssetKind::StructuredTable => {
            if contacts || documents {
                Some(true)
            } else {
                None
            }
        }
        AssetKind::MessageSequence => {
            if messaging {
                Some(true)
            } else if contacts || documents {
                Some(false)
            } else {
                None
            }
        }
        AssetKind::Document => {
            if documents {
                Some(true)
            } else if contacts {
                Some(false)
            } else {
                None
            }
        }
        AssetKind::GenericContent => None,
    }
}

/// Append an asset to a deliverable's content document unless an asset
/// with the same descriptor is already there. Returns the serialized
/// document and whether anything was appended.
fn merge_asset(existing: Option<&str>, asset: &Asset) -> (String, bool) {
    let mut items: Vec<Value> = existing
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|mut doc| doc.get_mut("assets").map(Value::take))
        .and_then(|assets| match assets {
            Value::Array(items) => Some(items),
            _ => None,
        })
        .unwrap_or_default();

    let already_present = items
        .iter()
        .any(|item| item.get("name").and_then(|n| n.as_str()) == Some(asset.name.as_str()));
    if !already_present {
        if let Ok(value) = serde_json::to_value(asset) {
            items.push(value);
        }
    }

    (json!({ "assets": items }).to_string(), !already_present)
}
