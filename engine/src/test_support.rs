//! Shared fixtures for unit tests: a scripted provider and a seeded database.

use crate::config::ProviderConfig;
use crate::db::agents::Seniority;
use crate::db::Database;
use crate::provider::{
    Completion, CompletionProvider, CompletionRequest, ProviderError, ProviderGateway,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Provider that pops one scripted outcome per call.
///
/// When the script runs dry it serves the default completion if one was
/// set, otherwise an `Invalid` error, so tests fail loudly on extra calls.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<Completion, ProviderError>>>,
    default: Option<Completion>,
    calls: AtomicU32,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<Completion, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            default: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Serve `content` for every call once the script is exhausted
    pub fn with_default(mut self, content: &str) -> Self {
        self.default = Some(completion(content));
        self
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .script
            .lock()
            .expect("script lock poisoned")
            .pop_front();
        match next {
            Some(outcome) => outcome,
            None => match &self.default {
                Some(completion) => Ok(completion.clone()),
                None => Err(ProviderError::Invalid("script exhausted".to_string())),
            },
        }
    }
}

pub fn completion(content: &str) -> Completion {
    Completion {
        content: content.to_string(),
        token_usage: 10,
    }
}

pub fn ok(content: &str) -> Result<Completion, ProviderError> {
    Ok(completion(content))
}

/// Gateway with tiny backoffs and validation caching disabled
pub fn scripted_gateway(provider: Arc<ScriptedProvider>) -> Arc<ProviderGateway> {
    let config = ProviderConfig {
        max_retries: 1,
        backoff_base_ms: 1,
        backoff_max_ms: 2,
        call_timeout_secs: 30,
        validation_cache_ttl_secs: 0,
        ..Default::default()
    };
    Arc::new(ProviderGateway::new(provider, &config))
}

/// A fresh database seeded with one workspace, one goal, and one agent
pub struct Fixture {
    pub _tempdir: TempDir,
    pub db: Database,
    pub workspace_id: String,
    pub goal_id: String,
    pub agent_id: String,
}

/// Workspace "acme-outreach" with a `qualified_leads` goal (target 3)
/// and one available researcher.
pub async fn seeded_db() -> Fixture {
    let tempdir = TempDir::new().unwrap();
    let db = Database::new(&tempdir.path().join("test.db")).await.unwrap();

    db.workspaces()
        .create(
            "ws-1",
            "acme-outreach",
            "Build a qualified lead list for the Acme launch",
            None,
        )
        .await
        .unwrap();
    db.goals()
        .create("goal-1", "ws-1", "qualified_leads", 3.0, Some("leads"))
        .await
        .unwrap();
    db.agents()
        .create("agent-1", "ws-1", "Mira", "researcher", Seniority::Mid)
        .await
        .unwrap();

    Fixture {
        _tempdir: tempdir,
        db,
        workspace_id: "ws-1".to_string(),
        goal_id: "goal-1".to_string(),
        agent_id: "agent-1".to_string(),
    }
}
