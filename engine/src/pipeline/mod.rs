//! Goal pipeline
//!
//! Plans tasks out of goal gaps, executes them through agents, gates the
//! output, folds accepted results into deliverables, and banks insights.

pub mod aggregator;
pub mod assets;
pub mod executor;
pub mod memory;
pub mod orchestrator;
pub mod planner;
pub mod quality;
pub mod types;

pub use aggregator::DeliverableAggregator;
pub use assets::AssetExtractor;
pub use executor::TaskExecutor;
pub use memory::InsightMemory;
pub use orchestrator::Orchestrator;
pub use planner::GoalPlanner;
pub use quality::QualityGate;
pub use types::{
    Asset, AssetKind, CycleReport, InsightDraft, QualityReport, QualityVerdict, TaskDraft,
    TaskReport, TaskResult,
};
