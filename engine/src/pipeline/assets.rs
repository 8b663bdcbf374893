//! Asset extraction from stored task results
//!
//! Turns an accepted task's result payload into typed assets the
//! aggregator can attach to deliverables. Explicit structure is mapped
//! directly; ambiguous content is classified by the model, falling back
//! to `GenericContent` so extraction never blocks on the provider.

use crate::db::tasks::Task;
use crate::errors::EngineError;
use crate::pipeline::types::{Asset, AssetKind, TaskResult};
use crate::provider::{extract_json_value, CallCategory, CompletionRequest, ProviderGateway};
use anyhow::Result;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};

/// Cap on how much content is sent to the classifier
const CLASSIFY_PREVIEW_LIMIT: usize = 1500;

/// Recognized top-level keys and the kinds they imply
const KIND_KEYS: [(&str, AssetKind); 5] = [
    ("contacts", AssetKind::ContactList),
    ("sequence", AssetKind::MessageSequence),
    ("steps", AssetKind::MessageSequence),
    ("messages", AssetKind::MessageSequence),
    ("sections", AssetKind::Document),
];

/// Extracts typed assets from completed tasks
#[derive(Clone)]
pub struct AssetExtractor {
    gateway: Arc<ProviderGateway>,
}

impl AssetExtractor {
    pub fn new(gateway: Arc<ProviderGateway>) -> Self {
        Self { gateway }
    }

    /// Extract assets from a completed task's stored result.
    ///
    /// A result carrying several recognized keys yields one asset per
    /// key; everything else yields a single asset of the best-fit kind.
    pub async fn extract(&self, task: &Task) -> Result<Vec<Asset>> {
        let raw = task.result.as_deref().ok_or_else(|| {
            EngineError::Extraction(format!("task {} has no stored result", task.id))
        })?;
        let stored = TaskResult::from_json(raw).map_err(|e| {
            EngineError::Extraction(format!("task {} result is not valid JSON: {}", task.id, e))
        })?;

        let parts = self.partition(&stored.content).await;
        let assets = parts
            .into_iter()
            .map(|(kind, content)| Asset {
                name: descriptor(kind, &task.id, &content),
                kind,
                content,
                source_task_id: task.id.clone(),
            })
            .collect();
        Ok(assets)
    }

    /// Split content into (kind, subtree) pairs
    async fn partition(&self, content: &Value) -> Vec<(AssetKind, Value)> {
        if let Some(obj) = content.as_object() {
            let recognized: Vec<(AssetKind, Value)> = KIND_KEYS
                .iter()
                .filter_map(|(key, kind)| {
                    obj.get(*key).map(|v| {
                        let mut wrapper = serde_json::Map::new();
                        wrapper.insert((*key).to_string(), v.clone());
                        (*kind, Value::Object(wrapper))
                    })
                })
                .collect();
            if recognized.len() > 1 {
                return recognized;
            }
        }

        let kind = match classify_structural(content) {
            Some(kind) => kind,
            None => self.classify_with_provider(content).await,
        };
        vec![(kind, content.clone())]
    }

    /// Ask the model to label ambiguous content, defaulting to generic
    async fn classify_with_provider(&self, content: &Value) -> AssetKind {
        let system = "Classify content into exactly one of: contact_list, message_sequence, \
             document, structured_table, generic_content. \
             Respond with ONLY a JSON object: {\"kind\": \"...\"}";
        let user = format!("Content to classify:\n{}", preview_text(content));
        let request = CompletionRequest::new(system, &user)
            .with_temperature(0.0)
            .with_max_tokens(50);

        match self.gateway.complete(CallCategory::Validation, &request).await {
            Ok(completion) => extract_json_value(&completion.content)
                .and_then(|v| v.get("kind").and_then(|k| k.as_str()).map(AssetKind::parse))
                .unwrap_or_else(|| {
                    debug!("Classifier response had no kind label");
                    AssetKind::GenericContent
                }),
            Err(e) => {
                warn!("Content classification unavailable: {}", e);
                AssetKind::GenericContent
            }
        }
    }
}

/// Map unmistakable shapes to kinds without a provider call
fn classify_structural(content: &Value) -> Option<AssetKind> {
    match content {
        Value::Object(obj) => {
            for (key, kind) in &KIND_KEYS {
                if obj.contains_key(*key) {
                    return Some(*kind);
                }
            }
            if obj.contains_key("rows") && obj.contains_key("columns") {
                return Some(AssetKind::StructuredTable);
            }
            if obj.contains_key("body") || obj.contains_key("document") {
                return Some(AssetKind::Document);
            }
            None
        }
        Value::Array(items) if !items.is_empty() => {
            let objects: Vec<&serde_json::Map<String, Value>> =
                items.iter().filter_map(|v| v.as_object()).collect();
            if objects.len() != items.len() {
                return None;
            }
            if objects
                .iter()
                .all(|o| o.contains_key("email") || (o.contains_key("name") && o.contains_key("company")))
            {
                return Some(AssetKind::ContactList);
            }
            if objects
                .iter()
                .all(|o| o.contains_key("subject") || o.contains_key("body"))
            {
                return Some(AssetKind::MessageSequence);
            }
            None
        }
        _ => None,
    }
}

/// Deterministic asset descriptor: kind slug plus a digest of the task id
/// and the content's shape. Re-extracting the same task yields the same
/// name, so aggregation stays idempotent.
pub fn descriptor(kind: AssetKind, task_id: &str, content: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(shape_fingerprint(content).as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", kind.slug(), &digest[..12])
}

/// Stable summary of a value's top-level shape
fn shape_fingerprint(content: &Value) -> String {
    match content {
        Value::Object(obj) => {
            let mut keys: Vec<&str> = obj.keys().map(|k| k.as_str()).collect();
            keys.sort_unstable();
            keys.join(",")
        }
        Value::Array(items) => match items.first().and_then(|v| v.as_object()) {
            Some(first) => {
                let mut keys: Vec<&str> = first.keys().map(|k| k.as_str()).collect();
                keys.sort_unstable();
                format!("array[{}]", keys.join(","))
            }
            None => format!("array[{}]", items.len()),
        },
        Value::String(s) => format!("text:{}", s.len() / 256),
        _ => "scalar".to_string(),
    }
}

fn preview_text(content: &Value) -> String {
    let rendered = match content {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    };
    if rendered.len() > CLASSIFY_PREVIEW_LIMIT {
        let mut end = CLASSIFY_PREVIEW_LIMIT;
        while !rendered.is_char_boundary(end) {
            end -= 1;
        }
        rendered[..end].to_string()
    } else {
        rendered
    }
}
