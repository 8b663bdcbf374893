//! Configuration management
//!
//! This module handles loading, validation, and management of the foreman
//! configuration. Configuration is stored in TOML format at
//! ~/.foreman/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Data directory, log level
//! - **provider**: Model provider settings, call timeouts, rate limits
//! - **executor**: Worker pool size, attempt bounds, task timeout
//! - **planner**: Batch caps, retry cooldown, duplicate-intent threshold
//! - **quality**: Accept/enhance thresholds, conservative fallback score
//! - **aggregator**: Aggregation gate (minimum tasks, cooldown)
//! - **insights**: Memory capacity and confidence floors
//! - **orchestrator**: Cycle cadence, lease TTL, escalation bound
//!
//! # Examples
//!
//! ```no_run
//! use foreman_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load configuration from default location
//! let config = Config::load_or_create()?;
//!
//! println!("Data dir: {:?}", config.core.data_dir);
//! println!("Default provider: {}", config.provider.default_provider);
//! # Ok(())
//! # }
//! ```

use crate::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
///
/// This structure represents the complete foreman configuration loaded from
/// ~/.foreman/config.toml. Every section carries serde defaults so a partial
/// file (or an empty one) still loads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Model provider configuration
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Task executor configuration
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Goal planner configuration
    #[serde(default)]
    pub planner: PlannerConfig,

    /// Quality gate configuration
    #[serde(default)]
    pub quality: QualityConfig,

    /// Deliverable aggregator configuration
    #[serde(default)]
    pub aggregator: AggregatorConfig,

    /// Insight memory configuration
    #[serde(default)]
    pub insights: InsightsConfig,

    /// Orchestrator loop configuration
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

/// Model provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Default provider (openai, anthropic)
    #[serde(default = "default_provider_name")]
    pub default_provider: String,

    /// OpenAI provider settings
    #[serde(default)]
    pub openai: OpenAIConfig,

    /// Anthropic provider settings
    #[serde(default)]
    pub anthropic: AnthropicConfig,

    /// Per-call timeout in seconds
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Maximum retries for transient provider failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff delay in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Planning call budget per minute
    #[serde(default = "default_planning_calls_per_minute")]
    pub planning_calls_per_minute: u32,

    /// Execution call budget per minute
    #[serde(default = "default_execution_calls_per_minute")]
    pub execution_calls_per_minute: u32,

    /// Validation call budget per minute
    #[serde(default = "default_validation_calls_per_minute")]
    pub validation_calls_per_minute: u32,

    /// TTL for cached validation verdicts in seconds
    #[serde(default = "default_validation_cache_ttl_secs")]
    pub validation_cache_ttl_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider_name(),
            openai: OpenAIConfig::default(),
            anthropic: AnthropicConfig::default(),
            call_timeout_secs: default_call_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            planning_calls_per_minute: default_planning_calls_per_minute(),
            execution_calls_per_minute: default_execution_calls_per_minute(),
            validation_calls_per_minute: default_validation_calls_per_minute(),
            validation_cache_ttl_secs: default_validation_cache_ttl_secs(),
        }
    }
}

/// OpenAI provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    /// API base URL
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Model identifier
    #[serde(default = "default_openai_model")]
    pub model: String,

    /// API key (FOREMAN_OPENAI_API_KEY env takes precedence)
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_openai_model(),
            api_key: None,
        }
    }
}

/// Anthropic provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    /// API base URL
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,

    /// Model identifier
    #[serde(default = "default_anthropic_model")]
    pub model: String,

    /// API key (FOREMAN_ANTHROPIC_API_KEY env takes precedence)
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            base_url: default_anthropic_base_url(),
            model: default_anthropic_model(),
            api_key: None,
        }
    }
}

/// Task executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum tasks in flight per workspace cycle
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Total provider attempts per task before it is terminal
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Per-task execution timeout in seconds
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,

    /// Spawn a single corrective follow-up task on terminal failure
    #[serde(default = "default_true")]
    pub corrective_tasks: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_attempts: default_max_attempts(),
            task_timeout_secs: default_task_timeout_secs(),
            corrective_tasks: true,
        }
    }
}

/// Goal planner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Maximum tasks created per goal per cycle
    #[serde(default = "default_max_tasks_per_cycle")]
    pub max_tasks_per_cycle: usize,

    /// Cooldown after a failed planning attempt, in seconds
    #[serde(default = "default_retry_cooldown_secs")]
    pub retry_cooldown_secs: i64,

    /// Word-overlap similarity at or above which a draft duplicates an open task
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_cycle: default_max_tasks_per_cycle(),
            retry_cooldown_secs: default_retry_cooldown_secs(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

/// Quality gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Score at or above which content is accepted
    #[serde(default = "default_accept_threshold")]
    pub accept_threshold: f64,

    /// Score at or above which content earns a bounded revision
    #[serde(default = "default_enhance_threshold")]
    pub enhance_threshold: f64,

    /// Score assigned when the scoring provider is unavailable
    #[serde(default = "default_fallback_score")]
    pub fallback_score: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            accept_threshold: default_accept_threshold(),
            enhance_threshold: default_enhance_threshold(),
            fallback_score: default_fallback_score(),
        }
    }
}

/// Deliverable aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Newly accepted tasks required before aggregation runs
    #[serde(default = "default_min_completed_tasks")]
    pub min_completed_tasks: i64,

    /// Minimum seconds between aggregation runs per workspace
    #[serde(default = "default_aggregation_cooldown_secs")]
    pub cooldown_secs: i64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            min_completed_tasks: default_min_completed_tasks(),
            cooldown_secs: default_aggregation_cooldown_secs(),
        }
    }
}

/// Insight memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightsConfig {
    /// Maximum stored insights per workspace
    #[serde(default = "default_max_insights")]
    pub max_per_workspace: i64,

    /// Confidence floor once the workspace has warmed up
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Stored-insight count below which the relaxed floor applies
    #[serde(default = "default_cold_start_count")]
    pub cold_start_count: i64,

    /// Relaxed confidence floor for a cold workspace
    #[serde(default = "default_cold_start_min_confidence")]
    pub cold_start_min_confidence: f64,
}

impl Default for InsightsConfig {
    fn default() -> Self {
        Self {
            max_per_workspace: default_max_insights(),
            min_confidence: default_min_confidence(),
            cold_start_count: default_cold_start_count(),
            cold_start_min_confidence: default_cold_start_min_confidence(),
        }
    }
}

/// Orchestrator loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Seconds between workspace sweeps
    #[serde(default = "default_cycle_interval_secs")]
    pub cycle_interval_secs: u64,

    /// Extra sleep when a sweep found nothing runnable
    #[serde(default = "default_idle_backoff_secs")]
    pub idle_backoff_secs: u64,

    /// Advisory lease TTL in seconds
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: i64,

    /// Consecutive zero-progress cycles before escalation
    #[serde(default = "default_stall_cycles")]
    pub stall_cycles_before_intervention: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: default_cycle_interval_secs(),
            idle_backoff_secs: default_idle_backoff_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
            stall_cycles_before_intervention: default_stall_cycles(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.foreman")
}

fn default_provider_name() -> String {
    "openai".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com/v1".to_string()
}

fn default_anthropic_model() -> String {
    "claude-3-5-sonnet-20241022".to_string()
}

fn default_call_timeout_secs() -> u64 {
    150
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_planning_calls_per_minute() -> u32 {
    10
}

fn default_execution_calls_per_minute() -> u32 {
    30
}

fn default_validation_calls_per_minute() -> u32 {
    20
}

fn default_validation_cache_ttl_secs() -> u64 {
    60
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    2
}

fn default_task_timeout_secs() -> u64 {
    150
}

fn default_max_tasks_per_cycle() -> usize {
    5
}

fn default_retry_cooldown_secs() -> i64 {
    300
}

fn default_similarity_threshold() -> f64 {
    0.55
}

fn default_accept_threshold() -> f64 {
    0.75
}

fn default_enhance_threshold() -> f64 {
    0.45
}

fn default_fallback_score() -> f64 {
    0.5
}

fn default_min_completed_tasks() -> i64 {
    2
}

fn default_aggregation_cooldown_secs() -> i64 {
    300
}

fn default_max_insights() -> i64 {
    100
}

fn default_min_confidence() -> f64 {
    0.6
}

fn default_cold_start_count() -> i64 {
    5
}

fn default_cold_start_min_confidence() -> f64 {
    0.3
}

fn default_cycle_interval_secs() -> u64 {
    30
}

fn default_idle_backoff_secs() -> u64 {
    60
}

fn default_lease_ttl_secs() -> i64 {
    120
}

fn default_stall_cycles() -> u32 {
    3
}

impl Default for Config {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            provider: ProviderConfig::default(),
            executor: ExecutorConfig::default(),
            planner: PlannerConfig::default(),
            quality: QualityConfig::default(),
            aggregator: AggregatorConfig::default(),
            insights: InsightsConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location, creating it if missing
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined, the file
    /// cannot be read or written, or validation fails.
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Path of the SQLite database inside the data directory
    pub fn db_path(&self) -> PathBuf {
        self.core.data_dir.join("foreman.db")
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let mut config = Self::default();
        config.validate_and_process()?;

        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.foreman/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".foreman").join("config.toml"))
    }

    /// Validate and process configuration
    ///
    /// Validates field ranges, expands ~ in the data directory, and creates
    /// the data directory if it doesn't exist.
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        let valid_providers = ["openai", "anthropic"];
        if !valid_providers.contains(&self.provider.default_provider.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid default provider '{}'. Must be one of: {}",
                self.provider.default_provider,
                valid_providers.join(", ")
            )));
        }

        for (name, value) in [
            ("accept_threshold", self.quality.accept_threshold),
            ("enhance_threshold", self.quality.enhance_threshold),
            ("fallback_score", self.quality.fallback_score),
            ("min_confidence", self.insights.min_confidence),
            (
                "cold_start_min_confidence",
                self.insights.cold_start_min_confidence,
            ),
            ("similarity_threshold", self.planner.similarity_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(EngineError::Config(format!(
                    "{} must be between 0.0 and 1.0",
                    name
                )));
            }
        }

        if self.quality.enhance_threshold >= self.quality.accept_threshold {
            return Err(EngineError::Config(
                "enhance_threshold must be below accept_threshold".to_string(),
            ));
        }

        if self.executor.max_attempts == 0 {
            return Err(EngineError::Config(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        if self.executor.max_concurrent_tasks == 0 {
            return Err(EngineError::Config(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }

        if self.planner.max_tasks_per_cycle == 0 {
            return Err(EngineError::Config(
                "max_tasks_per_cycle must be at least 1".to_string(),
            ));
        }

        // Expand and create the data directory
        self.core.data_dir = expand_path(&self.core.data_dir)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
