//! Event bus for pipeline lifecycle notifications
//!
//! The EventBus provides a pub/sub pattern so observers (CLI streaming, test
//! probes) can watch the pipeline without coupling to it. Channels are bounded
//! to prevent unbounded memory growth, and publishing never blocks: a slow
//! subscriber drops events rather than stalling the pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Channel buffer size for bounded channels
const CHANNEL_BUFFER_SIZE: usize = 100;

/// Event kinds that can be published on the bus
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum EventKind {
    /// Task has been dispatched to an agent
    TaskStarted,
    /// Task passed the quality gate
    TaskCompleted,
    /// Task reached a terminal failure state
    TaskFailed,
    /// Goal progress changed
    GoalUpdated,
    /// A deliverable was created or enhanced
    DeliverableCreated,
    /// A workspace was escalated for operator attention
    WorkspaceEscalated,
    /// An orchestrator cycle finished
    CycleFinished,
    /// Subscribe to all event kinds
    All,
}

/// Events published by the pipeline
#[derive(Debug, Clone)]
pub enum Event {
    /// Task dispatched with its assigned agent
    TaskStarted { task_id: String, agent_id: String },
    /// Task accepted with its quality score
    TaskCompleted { task_id: String, quality_score: f64 },
    /// Task terminally failed with a reason
    TaskFailed { task_id: String, reason: String },
    /// Goal progress after a clamped update
    GoalUpdated {
        goal_id: String,
        current_value: f64,
        target_value: f64,
    },
    /// Deliverable created or enhanced in place
    DeliverableCreated {
        deliverable_id: String,
        title: String,
    },
    /// Workspace handed to the operator
    WorkspaceEscalated { workspace_id: String, reason: String },
    /// Cycle summary for one workspace
    CycleFinished {
        workspace_id: String,
        tasks_run: usize,
    },
}

impl Event {
    /// Get the event kind for this event
    pub fn kind(&self) -> EventKind {
        match self {
            Event::TaskStarted { .. } => EventKind::TaskStarted,
            Event::TaskCompleted { .. } => EventKind::TaskCompleted,
            Event::TaskFailed { .. } => EventKind::TaskFailed,
            Event::GoalUpdated { .. } => EventKind::GoalUpdated,
            Event::DeliverableCreated { .. } => EventKind::DeliverableCreated,
            Event::WorkspaceEscalated { .. } => EventKind::WorkspaceEscalated,
            Event::CycleFinished { .. } => EventKind::CycleFinished,
        }
    }
}

/// Pub/sub bus for pipeline events
///
/// Components publish fire-and-forget; the pipeline never depends on a
/// subscriber existing. Subscribers pick a specific kind or `EventKind::All`.
#[derive(Clone)]
pub struct EventBus {
    /// Map of event kinds to subscriber channels
    channels: Arc<Mutex<HashMap<EventKind, Vec<mpsc::Sender<Event>>>>>,
}

impl EventBus {
    /// Create a new EventBus
    pub fn new() -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribe to a specific event kind
    ///
    /// Returns a bounded receiver. Use `EventKind::All` to observe everything.
    pub async fn subscribe(&self, kind: EventKind) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        let mut channels = self.channels.lock().await;
        channels.entry(kind).or_default().push(tx);
        rx
    }

    /// Publish an event to all subscribers
    ///
    /// The event goes to subscribers of its kind and to `All` subscribers.
    /// Full or closed channels are skipped silently.
    pub async fn publish(&self, event: Event) {
        let channels = self.channels.lock().await;
        let kind = event.kind();

        if let Some(subscribers) = channels.get(&kind) {
            for tx in subscribers {
                // A full buffer means the subscriber is behind; drop for it
                let _ = tx.try_send(event.clone());
            }
        }

        if let Some(subscribers) = channels.get(&EventKind::All) {
            for tx in subscribers {
                let _ = tx.try_send(event.clone());
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
