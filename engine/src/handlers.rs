//! Command handlers for CLI operations
//!
//! Each CLI command resolves to one handler here. A handler opens the
//! database, assembles the slice of the pipeline it needs, and prints either
//! human-readable text or JSON depending on the global --json flag.

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::db::{Database, Seniority, Workspace, WorkspaceStatus};
use crate::errors::{EngineError, ForemanErrorExt};
use crate::events::{Event, EventBus, EventKind};
use crate::pipeline::{
    AssetExtractor, DeliverableAggregator, GoalPlanner, InsightMemory, Orchestrator, QualityGate,
    TaskExecutor,
};
use crate::provider::anthropic::ANTHROPIC_API_KEY_ENV;
use crate::provider::openai::OPENAI_API_KEY_ENV;
use crate::provider::ProviderGateway;

/// Output format for command results
#[derive(Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Handle the init command
///
/// Stands up a workspace with its goals and crew in one shot. Specs are
/// parsed up front so a typo in the third goal fails before the first insert.
pub async fn handle_init(
    name: &str,
    mission: &str,
    goal_specs: &[String],
    agent_specs: &[String],
    budget: Option<f64>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    if name.trim().is_empty() {
        bail!("Workspace name must not be empty");
    }
    if goal_specs.is_empty() {
        bail!("At least one --goal METRIC=TARGET[:UNIT] is required");
    }

    let goals: Vec<(String, f64, Option<String>)> = goal_specs
        .iter()
        .map(|spec| parse_goal_spec(spec))
        .collect::<Result<_>>()?;
    let agents: Vec<(String, String, Seniority)> = agent_specs
        .iter()
        .map(|spec| parse_agent_spec(spec))
        .collect::<Result<_>>()?;

    let db = open_db(config).await?;

    if db.workspaces().get_by_name(name).await?.is_some() {
        bail!("Workspace '{}' already exists", name);
    }

    let workspace = db
        .workspaces()
        .create(&Uuid::new_v4().to_string(), name, mission, budget)
        .await?;

    let mut created_goals = Vec::with_capacity(goals.len());
    for (metric, target, unit) in &goals {
        let goal = db
            .goals()
            .create(
                &Uuid::new_v4().to_string(),
                &workspace.id,
                metric,
                *target,
                unit.as_deref(),
            )
            .await?;
        created_goals.push(goal);
    }

    let mut created_agents = Vec::with_capacity(agents.len());
    for (agent_name, role, seniority) in &agents {
        let agent = db
            .agents()
            .create(
                &Uuid::new_v4().to_string(),
                &workspace.id,
                agent_name,
                role,
                *seniority,
            )
            .await?;
        created_agents.push(agent);
    }

    match format {
        OutputFormat::Text => {
            println!("Workspace '{}' created ({})", workspace.name, workspace.id);
            for goal in &created_goals {
                match &goal.unit {
                    Some(unit) => {
                        println!("  goal  {} -> {} {}", goal.metric_type, goal.target_value, unit)
                    }
                    None => println!("  goal  {} -> {}", goal.metric_type, goal.target_value),
                }
            }
            for agent in &created_agents {
                println!(
                    "  agent {} ({} {})",
                    agent.name,
                    agent.seniority.as_str(),
                    agent.role
                );
            }
            if created_agents.is_empty() {
                println!("  No agents yet; planned tasks will wait for a crew");
            }
            println!();
            println!("Run 'foreman cycle {}' to start work", workspace.name);
        }
        OutputFormat::Json => {
            let output = json!({
                "workspace": workspace,
                "goals": created_goals,
                "agents": created_agents,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Handle the cycle command
///
/// Runs exactly one orchestrator cycle against the workspace and reports
/// what it did.
pub async fn handle_cycle(workspace: &str, config: &Config, format: OutputFormat) -> Result<()> {
    let db = open_db(config).await?;
    let target = resolve_workspace(&db, workspace).await?;

    let events = EventBus::new();
    let orchestrator = build_orchestrator(&db, config, events)?;

    let report = match orchestrator.run_cycle(&target.id).await {
        Ok(report) => report,
        Err(e) => {
            if let Some(engine_err) = e.downcast_ref::<EngineError>() {
                bail!("{} ({})", engine_err, engine_err.user_hint());
            }
            return Err(e);
        }
    };

    match format {
        OutputFormat::Text => {
            println!("Cycle finished for '{}'", target.name);
            println!("  Tasks planned:        {}", report.tasks_planned);
            println!("  Tasks run:            {}", report.tasks_run);
            println!("  Tasks completed:      {}", report.tasks_completed);
            println!("  Tasks failed:         {}", report.tasks_failed);
            println!("  Deliverables updated: {}", report.deliverables_updated);
            println!("  Goals completed:      {}", report.goals_completed);
            if report.escalated {
                println!();
                println!("⚠ Workspace escalated; inspect it and reactivate when ready");
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

/// Handle the run command
///
/// Starts the continuous orchestrator loop over every leasable workspace.
/// Runs until Ctrl+C; in text mode pipeline events stream to stdout.
pub async fn handle_run(config: &Config, format: OutputFormat) -> Result<()> {
    let db = open_db(config).await?;

    let events = EventBus::new();
    let orchestrator = build_orchestrator(&db, config, events.clone())?;

    if format == OutputFormat::Text {
        let mut rx = events.subscribe(EventKind::All).await;
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                print_event(&event);
            }
        });
        println!(
            "Orchestrator running (cycle every {}s). Press Ctrl+C to stop.",
            config.orchestrator.cycle_interval_secs
        );
    }

    orchestrator.run_loop().await?;

    db.close().await?;
    Ok(())
}

/// Handle the status command
///
/// Without a workspace argument, lists every workspace. With one, shows the
/// full picture: goals, crew, task census, deliverable and insight counts.
pub async fn handle_status(
    workspace: Option<&str>,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let db = open_db(config).await?;

    let Some(id_or_name) = workspace else {
        return list_workspaces(&db, format).await;
    };

    let target = resolve_workspace(&db, id_or_name).await?;
    let goals = db.goals().list_for_workspace(&target.id).await?;
    let agents = db.agents().list_for_workspace(&target.id).await?;
    let tasks = db.tasks().list_for_workspace(&target.id).await?;
    let deliverable_count = db.deliverables().count_for_workspace(&target.id).await?;
    let insight_count = db.insights().count_for_workspace(&target.id).await?;

    let mut task_census: BTreeMap<&str, usize> = BTreeMap::new();
    for task in &tasks {
        *task_census.entry(task.status.as_str()).or_insert(0) += 1;
    }

    match format {
        OutputFormat::Text => {
            println!("Workspace '{}' ({})", target.name, target.id);
            println!("  Status: {}", target.status.as_str());
            if target.stall_count > 0 {
                println!("  Stalled cycles: {}", target.stall_count);
            }
            if let Some(budget) = target.budget {
                println!("  Budget: {:.2}", budget);
            }

            println!();
            println!("Goals:");
            for goal in &goals {
                let unit = goal.unit.as_deref().unwrap_or("");
                println!(
                    "  [{}] {}: {:.1}/{:.1} {} ({:.0}%)",
                    goal.status.as_str(),
                    goal.metric_type,
                    goal.current_value,
                    goal.target_value,
                    unit,
                    goal.progress_fraction() * 100.0
                );
            }

            println!();
            println!("Agents:");
            for agent in &agents {
                println!(
                    "  {} ({} {}) - {}",
                    agent.name,
                    agent.seniority.as_str(),
                    agent.role,
                    agent.status.as_str()
                );
            }
            if agents.is_empty() {
                println!("  (none)");
            }

            println!();
            println!("Tasks: {} total", tasks.len());
            for (status, count) in &task_census {
                println!("  {}: {}", status, count);
            }

            println!();
            println!("Deliverables: {}", deliverable_count);
            println!("Insights: {}", insight_count);
        }
        OutputFormat::Json => {
            let census: BTreeMap<String, usize> = task_census
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect();
            let output = json!({
                "workspace": target,
                "goals": goals,
                "agents": agents,
                "task_counts": census,
                "deliverable_count": deliverable_count,
                "insight_count": insight_count,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Handle the deliverables command
pub async fn handle_deliverables(
    workspace: &str,
    goal: Option<&str>,
    full: bool,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let db = open_db(config).await?;
    let target = resolve_workspace(&db, workspace).await?;
    let deliverables = match goal {
        Some(goal_id) => db.deliverables().list_for_goal(goal_id).await?,
        None => db.deliverables().list_for_workspace(&target.id).await?,
    };

    match format {
        OutputFormat::Text => {
            if deliverables.is_empty() {
                println!("No deliverables yet for '{}'", target.name);
                return Ok(());
            }
            println!("Deliverables for '{}':", target.name);
            for d in &deliverables {
                println!(
                    "  {} [{}] {} - {:.0}% complete, quality {:.2} (updated {})",
                    d.title,
                    d.kind,
                    d.status.as_str(),
                    d.completion_percentage,
                    d.quality_score,
                    format_timestamp(d.updated_at)
                );
                if full {
                    println!("{}", pretty_content(&d.content));
                    println!();
                }
            }
        }
        OutputFormat::Json => {
            if full {
                println!("{}", serde_json::to_string_pretty(&deliverables)?);
            } else {
                let rows: Vec<_> = deliverables
                    .iter()
                    .map(|d| {
                        json!({
                            "id": d.id,
                            "title": d.title,
                            "kind": d.kind,
                            "status": d.status,
                            "quality_score": d.quality_score,
                            "completion_percentage": d.completion_percentage,
                            "updated_at": d.updated_at,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            }
        }
    }

    Ok(())
}

/// Handle the aggregate command
///
/// Forces an aggregation pass outside the cycle cadence, skipping the
/// cooldown and minimum-batch checks.
pub async fn handle_aggregate(workspace: &str, config: &Config, format: OutputFormat) -> Result<()> {
    let db = open_db(config).await?;
    let target = resolve_workspace(&db, workspace).await?;

    let gateway = Arc::new(ProviderGateway::from_config(config)?);
    let extractor = AssetExtractor::new(gateway);
    let aggregator = DeliverableAggregator::new(
        &db,
        extractor,
        EventBus::new(),
        config.aggregator.clone(),
    );

    let touched = aggregator.aggregate(&target.id, true).await?;

    match format {
        OutputFormat::Text => {
            if touched.is_empty() {
                println!("Nothing new to aggregate for '{}'", target.name);
            } else {
                println!("Updated {} deliverable(s):", touched.len());
                for d in &touched {
                    println!("  {} [{}] {:.0}% complete", d.title, d.kind, d.completion_percentage);
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&touched)?);
        }
    }

    Ok(())
}

/// Handle the insights command
pub async fn handle_insights(
    workspace: &str,
    limit: i64,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let db = open_db(config).await?;
    let target = resolve_workspace(&db, workspace).await?;
    let insights = db.insights().list_for_workspace(&target.id, limit).await?;

    match format {
        OutputFormat::Text => {
            if insights.is_empty() {
                println!("No insights banked yet for '{}'", target.name);
                return Ok(());
            }
            println!("Insights for '{}':", target.name);
            for insight in &insights {
                println!(
                    "  [{}] {} (confidence {:.2}, from {})",
                    insight.insight_type,
                    insight.content,
                    insight.confidence_score,
                    insight.agent_role
                );
                if !insight.relevance_tags.is_empty() {
                    println!("    tags: {}", insight.relevance_tags.join(", "));
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&insights)?);
        }
    }

    Ok(())
}

/// Handle the history command
pub async fn handle_history(
    workspace: &str,
    limit: i64,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let db = open_db(config).await?;
    let target = resolve_workspace(&db, workspace).await?;
    let executions = db.tasks().recent_executions(&target.id, limit).await?;

    match format {
        OutputFormat::Text => {
            if executions.is_empty() {
                println!("No executions recorded yet for '{}'", target.name);
                return Ok(());
            }
            println!("Recent executions for '{}':", target.name);
            for exec in &executions {
                println!(
                    "  {} task {} -> {} ({} ms, {} tokens)",
                    format_timestamp(exec.started_at),
                    exec.task_id,
                    exec.status,
                    exec.execution_time_ms,
                    exec.token_usage
                );
                if !exec.logs.is_empty() {
                    println!("    {}", exec.logs);
                }
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&executions)?);
        }
    }

    Ok(())
}

/// Handle the cancel command
pub async fn handle_cancel(task_id: &str, config: &Config, format: OutputFormat) -> Result<()> {
    let db = open_db(config).await?;
    db.tasks().cancel(task_id).await?;

    match format {
        OutputFormat::Text => {
            println!("Task {} canceled", task_id);
        }
        OutputFormat::Json => {
            let output = json!({
                "task_id": task_id,
                "status": "canceled",
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Handle the doctor command
///
/// Checks the local installation: config, data directory, database,
/// provider credentials, and workspaces waiting on an operator.
pub async fn handle_doctor(config: &Config, format: OutputFormat) -> Result<()> {
    let mut checks: Vec<(&str, String)> = Vec::new();
    let mut issues: Vec<String> = Vec::new();

    checks.push(("config", "valid".to_string()));

    let data_dir = &config.core.data_dir;
    if data_dir.exists() {
        checks.push(("data_dir", data_dir.display().to_string()));
    } else {
        issues.push(format!("Data directory missing: {}", data_dir.display()));
    }

    match Database::new(&config.db_path()).await {
        Ok(db) => {
            let workspaces = db.workspaces().list().await.unwrap_or_default();
            checks.push(("database", format!("{} workspace(s)", workspaces.len())));

            let escalated: Vec<&Workspace> = workspaces
                .iter()
                .filter(|w| w.status == WorkspaceStatus::NeedsIntervention)
                .collect();
            for ws in escalated {
                issues.push(format!(
                    "Workspace '{}' needs intervention after {} stalled cycle(s)",
                    ws.name, ws.stall_count
                ));
            }
        }
        Err(e) => {
            issues.push(format!("Database unavailable: {}", e));
        }
    }

    let provider = config.provider.default_provider.as_str();
    let (env_var, configured) = match provider {
        "anthropic" => (
            ANTHROPIC_API_KEY_ENV,
            config.provider.anthropic.api_key.as_deref(),
        ),
        _ => (OPENAI_API_KEY_ENV, config.provider.openai.api_key.as_deref()),
    };
    if has_api_key(env_var, configured) {
        checks.push(("provider", format!("{} (key present)", provider)));
    } else {
        issues.push(format!(
            "No API key for {}; set {} or add it to config.toml",
            provider, env_var
        ));
    }

    match format {
        OutputFormat::Text => {
            println!("Doctor report:");
            for (name, value) in &checks {
                println!("  ✓ {}: {}", name, value);
            }
            println!();
            if issues.is_empty() {
                println!("✓ All checks passed!");
            } else {
                println!("⚠ Issues found:");
                for issue in &issues {
                    println!("  - {}", issue);
                }
            }
        }
        OutputFormat::Json => {
            let check_map: BTreeMap<&str, &String> =
                checks.iter().map(|(k, v)| (*k, v)).collect();
            let output = json!({
                "checks": check_map,
                "issues": issues,
                "healthy": issues.is_empty(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Open the configured database
async fn open_db(config: &Config) -> Result<Database> {
    Database::new(&config.db_path())
        .await
        .context("Failed to open database")
}

/// Resolve a workspace argument by id or name
async fn resolve_workspace(db: &Database, id_or_name: &str) -> Result<Workspace> {
    db.workspaces()
        .resolve(id_or_name)
        .await?
        .ok_or_else(|| EngineError::WorkspaceNotFound(id_or_name.to_string()).into())
}

/// Assemble the full pipeline around the configured provider
fn build_orchestrator(db: &Database, config: &Config, events: EventBus) -> Result<Orchestrator> {
    let gateway = Arc::new(ProviderGateway::from_config(config)?);

    let planner = GoalPlanner::new(db, gateway.clone(), config.planner.clone());
    let quality = QualityGate::new(gateway.clone(), config.quality.clone())?;
    let memory = InsightMemory::new(db, config.insights.clone());
    let executor = TaskExecutor::new(
        db,
        gateway.clone(),
        quality,
        memory,
        events.clone(),
        config.executor.clone(),
    );
    let extractor = AssetExtractor::new(gateway);
    let aggregator =
        DeliverableAggregator::new(db, extractor, events.clone(), config.aggregator.clone());

    Ok(Orchestrator::new(
        db,
        planner,
        executor,
        aggregator,
        events,
        config.orchestrator.clone(),
    ))
}

/// Render one pipeline event for the run-mode stream
fn print_event(event: &Event) {
    match event {
        Event::TaskStarted { task_id, agent_id } => {
            println!("→ task {} started (agent {})", task_id, agent_id);
        }
        Event::TaskCompleted {
            task_id,
            quality_score,
        } => {
            println!("✓ task {} completed (quality {:.2})", task_id, quality_score);
        }
        Event::TaskFailed { task_id, reason } => {
            println!("✗ task {} failed: {}", task_id, reason);
        }
        Event::GoalUpdated {
            goal_id,
            current_value,
            target_value,
        } => {
            println!("goal {} at {:.1}/{:.1}", goal_id, current_value, target_value);
        }
        Event::DeliverableCreated {
            deliverable_id,
            title,
        } => {
            println!("deliverable {} updated: {}", deliverable_id, title);
        }
        Event::WorkspaceEscalated {
            workspace_id,
            reason,
        } => {
            println!("⚠ workspace {} escalated: {}", workspace_id, reason);
        }
        Event::CycleFinished {
            workspace_id,
            tasks_run,
        } => {
            println!("cycle finished for {} ({} tasks)", workspace_id, tasks_run);
        }
    }
}

/// List all workspaces in summary form
async fn list_workspaces(db: &Database, format: OutputFormat) -> Result<()> {
    let workspaces = db.workspaces().list().await?;

    match format {
        OutputFormat::Text => {
            if workspaces.is_empty() {
                println!("No workspaces. Create one with 'foreman init'");
                return Ok(());
            }
            println!("Workspaces:");
            for ws in &workspaces {
                let goals = db.goals().list_for_workspace(&ws.id).await?;
                let done = goals
                    .iter()
                    .filter(|g| g.current_value >= g.target_value)
                    .count();
                println!(
                    "  {} [{}] goals {}/{} (created {})",
                    ws.name,
                    ws.status.as_str(),
                    done,
                    goals.len(),
                    format_timestamp(ws.created_at)
                );
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&workspaces)?);
        }
    }

    Ok(())
}

/// Whether an API key is reachable via env or config
fn has_api_key(env_var: &str, configured: Option<&str>) -> bool {
    if let Ok(value) = std::env::var(env_var) {
        if !value.trim().is_empty() {
            return true;
        }
    }
    configured.is_some_and(|key| !key.trim().is_empty())
}

/// Render a unix timestamp as UTC
fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Pretty-print stored deliverable content, falling back to the raw string
fn pretty_content(content: &str) -> String {
    serde_json::from_str::<serde_json::Value>(content)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| content.to_string())
}

/// Parse a goal spec of the form METRIC=TARGET[:UNIT]
fn parse_goal_spec(spec: &str) -> Result<(String, f64, Option<String>)> {
    let (metric, rest) = spec
        .split_once('=')
        .with_context(|| format!("Invalid goal spec '{}': expected METRIC=TARGET[:UNIT]", spec))?;

    let metric = metric.trim();
    if metric.is_empty() {
        bail!("Invalid goal spec '{}': metric name is empty", spec);
    }

    let (target_str, unit) = match rest.split_once(':') {
        Some((target, unit)) => (target.trim(), Some(unit.trim())),
        None => (rest.trim(), None),
    };

    let target: f64 = target_str
        .parse()
        .with_context(|| format!("Invalid goal spec '{}': target is not a number", spec))?;
    if target <= 0.0 {
        bail!("Invalid goal spec '{}': target must be positive", spec);
    }

    let unit = unit.filter(|u| !u.is_empty()).map(|u| u.to_string());
    Ok((metric.to_string(), target, unit))
}

/// Parse an agent spec of the form NAME:ROLE[:SENIORITY]
fn parse_agent_spec(spec: &str) -> Result<(String, String, Seniority)> {
    let mut parts = spec.splitn(3, ':');
    let name = parts.next().unwrap_or("").trim();
    let role = parts.next().unwrap_or("").trim();
    let seniority = parts.next().map(str::trim);

    if name.is_empty() || role.is_empty() {
        bail!(
            "Invalid agent spec '{}': expected NAME:ROLE[:SENIORITY]",
            spec
        );
    }

    let seniority = match seniority {
        Some(s) if !s.is_empty() => Seniority::parse(&s.to_lowercase()),
        _ => Seniority::Mid,
    };

    Ok((name.to_string(), role.to_lowercase(), seniority))
}
