//! Quality gate over task output
//!
//! Nothing counts toward a goal until it passes this gate. Cheap local
//! heuristics run first and reject obvious filler without spending a
//! provider call; surviving content is scored against a rubric by the
//! model. When the rubric call fails the gate falls back to a conservative
//! score below the accept threshold, so unchecked content is never
//! accepted outright.

use crate::config::QualityConfig;
use crate::pipeline::types::{QualityReport, QualityVerdict};
use crate::provider::{
    extract_json_value, CallCategory, CompletionRequest, ProviderError, ProviderGateway,
};
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Content shorter than this is never a real work product
const MIN_CONTENT_LEN: usize = 20;

/// Cap on how much output is sent to the rubric reviewer
const RUBRIC_CONTENT_LIMIT: usize = 6000;

const RUBRIC_DIMENSIONS: [&str; 3] = ["structure", "specificity", "actionability"];

/// What the rubric reviewer is told about the task being scored
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_name: String,
    pub task_description: String,
    pub goal_metric: Option<String>,
}

/// Scores task output and maps scores to verdicts
#[derive(Clone)]
pub struct QualityGate {
    gateway: Arc<ProviderGateway>,
    config: QualityConfig,
    placeholder_patterns: Vec<Regex>,
}

impl QualityGate {
    pub fn new(gateway: Arc<ProviderGateway>, config: QualityConfig) -> anyhow::Result<Self> {
        let placeholder_patterns = vec![
            Regex::new(r"(?i)lorem ipsum")?,
            Regex::new(r"(?i)\[\s*(insert|placeholder|your|add|tbd|todo)\b[^\]]*\]")?,
            Regex::new(r"\{\{[^}]+\}\}")?,
            Regex::new(r"(?i)<your\b[^>]*>")?,
            Regex::new(r"\bTODO\b")?,
        ];

        Ok(Self {
            gateway,
            config,
            placeholder_patterns,
        })
    }

    /// Score one task output. Never errors: provider trouble degrades to
    /// the configured fallback score.
    pub async fn evaluate(&self, content: &str, context: &TaskContext) -> QualityReport {
        if let Some(reasons) = self.heuristic_reject(content, context) {
            debug!(task = %context.task_name, "Output rejected by heuristics");
            return QualityReport {
                verdict: QualityVerdict::Reject,
                score: 0.0,
                reasons,
            };
        }

        let (score, mut reasons) = match self.rubric_scores(content, context).await {
            Ok(dimensions) => {
                let mean = dimensions.iter().map(|(_, s)| s).sum::<f64>() / dimensions.len() as f64;
                let reasons = dimensions
                    .iter()
                    .filter(|(_, s)| *s < self.config.accept_threshold)
                    .map(|(name, s)| format!("weak {} ({:.2})", name, s))
                    .collect();
                (mean, reasons)
            }
            Err(e) => {
                warn!(task = %context.task_name, "Rubric scoring unavailable: {}", e);
                (
                    self.config.fallback_score,
                    vec!["quality check unavailable, conservative score applied".to_string()],
                )
            }
        };

        let verdict = self.verdict_for(score);
        if verdict == QualityVerdict::Accept {
            reasons.clear();
        }
        QualityReport {
            verdict,
            score,
            reasons,
        }
    }

    /// Local checks that catch filler without a provider call
    fn heuristic_reject(&self, content: &str, context: &TaskContext) -> Option<Vec<String>> {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return Some(vec!["output is empty".to_string()]);
        }
        if trimmed.len() < MIN_CONTENT_LEN {
            return Some(vec!["output too short to be a work product".to_string()]);
        }

        let mut reasons = Vec::new();
        for pattern in &self.placeholder_patterns {
            if let Some(m) = pattern.find(content) {
                reasons.push(format!("placeholder text present: '{}'", m.as_str()));
            }
        }
        if trimmed.eq_ignore_ascii_case(context.task_description.trim()) {
            reasons.push("output merely echoes the task description".to_string());
        }

        if reasons.is_empty() {
            None
        } else {
            Some(reasons)
        }
    }

    fn verdict_for(&self, score: f64) -> QualityVerdict {
        if score >= self.config.accept_threshold {
            QualityVerdict::Accept
        } else if score >= self.config.enhance_threshold {
            QualityVerdict::Enhance
        } else {
            QualityVerdict::Reject
        }
    }

    /// Ask the model to score the output on each rubric dimension
    async fn rubric_scores(
        &self,
        content: &str,
        context: &TaskContext,
    ) -> Result<Vec<(&'static str, f64)>, ProviderError> {
        let system = "You are a strict quality reviewer for work products produced by AI agents. \
             Score the output on three dimensions, each from 0.0 to 1.0:\n\
             - structure: organized and complete rather than fragmentary\n\
             - specificity: concrete names, numbers, and details rather than filler\n\
             - actionability: usable directly, without rework\n\
             Respond with ONLY a JSON object: \
             {\"structure\": 0.0, \"specificity\": 0.0, \"actionability\": 0.0}";

        let excerpt = if content.len() > RUBRIC_CONTENT_LIMIT {
            let mut end = RUBRIC_CONTENT_LIMIT;
            while !content.is_char_boundary(end) {
                end -= 1;
            }
            &content[..end]
        } else {
            content
        };

        let mut user = format!(
            "Task: {}\n{}\n",
            context.task_name, context.task_description
        );
        if let Some(metric) = &context.goal_metric {
            user.push_str(&format!("Goal metric: {}\n", metric));
        }
        user.push_str(&format!("\nOutput to review:\n{}", excerpt));

        let request = CompletionRequest::new(system, &user)
            .with_temperature(0.0)
            .with_max_tokens(300);
        let completion = self
            .gateway
            .complete(CallCategory::Validation, &request)
            .await?;

        let value = extract_json_value(&completion.content)
            .ok_or_else(|| ProviderError::Parse("no rubric JSON in review response".to_string()))?;

        let dimensions: Vec<(&'static str, f64)> = RUBRIC_DIMENSIONS
            .iter()
            .filter_map(|name| {
                value
                    .get(*name)
                    .and_then(|v| v.as_f64())
                    .map(|s| (*name, s.clamp(0.0, 1.0)))
            })
            .collect();

        if dimensions.is_empty() {
            return Err(ProviderError::Parse(
                "rubric response had no recognized dimensions".to_string(),
            ));
        }
        Ok(dimensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ok, scripted_gateway, ScriptedProvider};

    fn gate(provider: ScriptedProvider) -> QualityGate {
        QualityGate::new(scripted_gateway(Arc::new(provider)), QualityConfig::default()).unwrap()
    }

    fn context() -> TaskContext {
        TaskContext {
            task_name: "Compile lead list".to_string(),
            task_description: "Find 10 SaaS companies hiring SDRs".to_string(),
            goal_metric: Some("qualified_leads".to_string()),
        }
    }

    const SOLID_OUTPUT: &str =
        "Acme Corp (acme.com) is hiring 4 SDRs per their careers page as of this week; \
         contact: Dana Reyes, VP Sales, dana@acme.com.";

    #[tokio::test]
    async fn test_empty_output_rejected_without_provider_call() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let gate =
            QualityGate::new(scripted_gateway(provider.clone()), QualityConfig::default()).unwrap();

        let report = gate.evaluate("   \n  ", &context()).await;
        assert_eq!(report.verdict, QualityVerdict::Reject);
        assert_eq!(report.score, 0.0);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_lorem_ipsum_rejected() {
        let gate = gate(ScriptedProvider::new(vec![]));
        let report = gate
            .evaluate(
                "Lorem ipsum dolor sit amet, consectetur adipiscing elit.",
                &context(),
            )
            .await;
        assert_eq!(report.verdict, QualityVerdict::Reject);
        assert!(report.reasons[0].contains("placeholder"));
    }

    #[tokio::test]
    async fn test_bracket_placeholder_rejected() {
        let gate = gate(ScriptedProvider::new(vec![]));
        let report = gate
            .evaluate(
                "Dear [Insert company name], we noticed your team is growing fast.",
                &context(),
            )
            .await;
        assert_eq!(report.verdict, QualityVerdict::Reject);
    }

    #[tokio::test]
    async fn test_template_stub_rejected() {
        let gate = gate(ScriptedProvider::new(vec![]));
        let report = gate
            .evaluate("Hi {{first_name}}, hope this finds you well.", &context())
            .await;
        assert_eq!(report.verdict, QualityVerdict::Reject);
    }

    #[tokio::test]
    async fn test_todo_marker_rejected() {
        let gate = gate(ScriptedProvider::new(vec![]));
        let report = gate
            .evaluate(
                "Step 1: research the market. TODO: fill in the actual companies.",
                &context(),
            )
            .await;
        assert_eq!(report.verdict, QualityVerdict::Reject);
    }

    #[tokio::test]
    async fn test_description_echo_rejected() {
        let gate = gate(ScriptedProvider::new(vec![]));
        let report = gate
            .evaluate("Find 10 SaaS companies hiring SDRs", &context())
            .await;
        assert_eq!(report.verdict, QualityVerdict::Reject);
        assert!(report.reasons[0].contains("echoes"));
    }

    #[tokio::test]
    async fn test_high_rubric_scores_accept() {
        let gate = gate(ScriptedProvider::new(vec![ok(
            r#"{"structure": 0.9, "specificity": 0.8, "actionability": 0.85}"#,
        )]));
        let report = gate.evaluate(SOLID_OUTPUT, &context()).await;
        assert_eq!(report.verdict, QualityVerdict::Accept);
        assert!((report.score - 0.85).abs() < 0.001);
        assert!(report.reasons.is_empty());
    }

    #[tokio::test]
    async fn test_middling_scores_enhance_with_feedback() {
        let gate = gate(ScriptedProvider::new(vec![ok(
            r#"{"structure": 0.5, "specificity": 0.5, "actionability": 0.6}"#,
        )]));
        let report = gate.evaluate(SOLID_OUTPUT, &context()).await;
        assert_eq!(report.verdict, QualityVerdict::Enhance);
        assert!(report.reasons.iter().any(|r| r.contains("specificity")));
    }

    #[tokio::test]
    async fn test_low_scores_reject() {
        let gate = gate(ScriptedProvider::new(vec![ok(
            r#"{"structure": 0.2, "specificity": 0.3, "actionability": 0.1}"#,
        )]));
        let report = gate.evaluate(SOLID_OUTPUT, &context()).await;
        assert_eq!(report.verdict, QualityVerdict::Reject);
    }

    #[tokio::test]
    async fn test_provider_failure_falls_back_below_accept() {
        let gate = gate(ScriptedProvider::new(vec![Err(ProviderError::Invalid(
            "boom".to_string(),
        ))]));
        let report = gate.evaluate(SOLID_OUTPUT, &context()).await;
        assert_eq!(report.verdict, QualityVerdict::Enhance);
        assert!((report.score - QualityConfig::default().fallback_score).abs() < f64::EPSILON);
        assert!(report.reasons[0].contains("unavailable"));
    }

    #[tokio::test]
    async fn test_unparseable_rubric_falls_back() {
        let gate = gate(ScriptedProvider::new(vec![ok(
            "Looks pretty good to me overall!",
        )]));
        let report = gate.evaluate(SOLID_OUTPUT, &context()).await;
        assert_eq!(report.verdict, QualityVerdict::Enhance);
    }

    #[tokio::test]
    async fn test_partial_rubric_uses_present_dimensions() {
        let gate = gate(ScriptedProvider::new(vec![ok(r#"{"structure": 0.9}"#)]));
        let report = gate.evaluate(SOLID_OUTPUT, &context()).await;
        assert_eq!(report.verdict, QualityVerdict::Accept);
        assert!((report.score - 0.9).abs() < 0.001);
    }
}
