//! Example driving one full orchestration cycle from library code
//!
//! This example shows how to:
//! - Seed a workspace with a goal and a small agent crew
//! - Assemble the pipeline around the configured completion provider
//! - Run a single cycle and inspect what it produced
//!
//! Prerequisites:
//! - A provider API key in FOREMAN_OPENAI_API_KEY or FOREMAN_ANTHROPIC_API_KEY
//!   (or in the provider section of ~/.foreman/config.toml)

use foreman_engine::config::Config;
use foreman_engine::db::{Database, Seniority};
use foreman_engine::events::EventBus;
use foreman_engine::pipeline::{
    AssetExtractor, DeliverableAggregator, GoalPlanner, InsightMemory, Orchestrator, QualityGate,
    TaskExecutor,
};
use foreman_engine::provider::ProviderGateway;
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Single Cycle Example ===\n");

    let config = Config::load_or_create()?;
    let gateway = match ProviderGateway::from_config(&config) {
        Ok(gateway) => Arc::new(gateway),
        Err(e) => {
            eprintln!("Provider unavailable: {e}");
            eprintln!("Set FOREMAN_OPENAI_API_KEY or FOREMAN_ANTHROPIC_API_KEY and retry.");
            return Ok(());
        }
    };
    println!("✓ Provider: {}", gateway.provider_name());

    // A throwaway database keeps the example self-contained
    let temp_dir = TempDir::new()?;
    let db = Database::new(&temp_dir.path().join("foreman.db")).await?;
    println!("✓ Database initialized");

    db.workspaces()
        .create("ws-demo", "demo-outreach", "Build a qualified lead list for the launch", None)
        .await?;
    db.goals()
        .create("goal-demo", "ws-demo", "qualified_leads", 3.0, Some("leads"))
        .await?;
    db.agents()
        .create("agent-mira", "ws-demo", "Mira", "researcher", Seniority::Senior)
        .await?;
    db.agents()
        .create("agent-theo", "ws-demo", "Theo", "writer", Seniority::Mid)
        .await?;
    println!("✓ Workspace seeded: 1 goal, 2 agents\n");

    let events = EventBus::new();
    let planner = GoalPlanner::new(&db, gateway.clone(), config.planner.clone());
    let quality = QualityGate::new(gateway.clone(), config.quality.clone())?;
    let memory = InsightMemory::new(&db, config.insights.clone());
    let executor = TaskExecutor::new(
        &db,
        gateway.clone(),
        quality,
        memory,
        events.clone(),
        config.executor.clone(),
    );
    let extractor = AssetExtractor::new(gateway);
    let aggregator =
        DeliverableAggregator::new(&db, extractor, events.clone(), config.aggregator.clone());
    let orchestrator = Orchestrator::new(
        &db,
        planner,
        executor,
        aggregator,
        events,
        config.orchestrator.clone(),
    );

    println!("Running one cycle (this calls the provider)...\n");
    let report = orchestrator.run_cycle("ws-demo").await?;

    println!("─────────────────────────────────────");
    println!("Cycle report");
    println!("─────────────────────────────────────");
    println!("  planned:      {}", report.tasks_planned);
    println!("  run:          {}", report.tasks_run);
    println!("  completed:    {}", report.tasks_completed);
    println!("  failed:       {}", report.tasks_failed);
    println!("  deliverables: {}", report.deliverables_updated);

    let goal = db.goals().get("goal-demo").await?;
    if let Some(goal) = goal {
        println!(
            "\nGoal progress: {:.0}/{:.0} {}",
            goal.current_value,
            goal.target_value,
            goal.unit.as_deref().unwrap_or("")
        );
    }

    let deliverables = db.deliverables().list_for_workspace("ws-demo").await?;
    for deliverable in &deliverables {
        println!(
            "Deliverable: {} [{}] {:.0}% complete",
            deliverable.title, deliverable.kind, deliverable.completion_percentage
        );
    }

    let insights = db.insights().list_for_workspace("ws-demo", 5).await?;
    for insight in &insights {
        println!("Insight ({:.2}): {}", insight.confidence_score, insight.content);
    }

    db.close().await?;
    println!("\n✓ Example complete");
    Ok(())
}
