//! Provider gateway
//!
//! Every model call in the engine goes through this gateway. It is the single
//! place that knows about call budgets, retry policy, and quota pressure, so
//! the pipeline components never handle 429s or backoff themselves.
//!
//! The gateway tracks three call categories (planning, execution, validation)
//! with independent per-minute budgets, retries transient failures with
//! exponential backoff, amplifies backoff while the upstream quota is under
//! pressure, and serves repeated validation requests from a short-lived cache.

use super::{
    anthropic::AnthropicProvider, openai::OpenAIProvider, Completion, CompletionProvider,
    CompletionRequest, ProviderError, Result,
};
use crate::config::{Config, ProviderConfig};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::time::{sleep, timeout, Duration, Instant};

/// Quota pressure saturates here so backoff stays bounded
const QUOTA_PRESSURE_CAP: u32 = 8;

/// Category of a model call, each with its own per-minute budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallCategory {
    /// Goal decomposition and corrective planning
    Planning,
    /// Task content production
    Execution,
    /// Quality scoring and insight extraction
    Validation,
}

impl fmt::Display for CallCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallCategory::Planning => write!(f, "planning"),
            CallCategory::Execution => write!(f, "execution"),
            CallCategory::Validation => write!(f, "validation"),
        }
    }
}

/// Exponential backoff policy for retryable provider failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_backoff: Duration,
    /// Ceiling for any single delay
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ProviderConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.backoff_base_ms),
            max_backoff: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay for the given exponent: base * 2^exponent, capped at max_backoff
    pub fn delay_for(&self, exponent: u32) -> Duration {
        let factor = 2u64.saturating_pow(exponent.min(16));
        let base_ms = self.base_backoff.as_millis() as u64;
        let capped = base_ms.saturating_mul(factor).min(self.max_backoff.as_millis() as u64);
        Duration::from_millis(capped)
    }
}

/// Sliding window over call timestamps for one category
struct SlidingWindow {
    capacity: usize,
    period: Duration,
    entries: VecDeque<Instant>,
}

impl SlidingWindow {
    fn new(capacity: usize, period: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            period,
            entries: VecDeque::new(),
        }
    }

    /// How long until a slot frees up. `None` means a slot is free now.
    fn time_until_slot(&mut self, now: Instant) -> Option<Duration> {
        while let Some(&front) = self.entries.front() {
            if now.duration_since(front) >= self.period {
                self.entries.pop_front();
            } else {
                break;
            }
        }

        if self.entries.len() < self.capacity {
            None
        } else {
            let oldest = *self.entries.front()?;
            Some(self.period - now.duration_since(oldest))
        }
    }

    fn record(&mut self, now: Instant) {
        self.entries.push_back(now);
    }
}

/// Gateway wrapping a completion provider with budgets, retries and caching
pub struct ProviderGateway {
    provider: Arc<dyn CompletionProvider>,
    policy: RetryPolicy,
    call_timeout: Duration,
    windows: Mutex<HashMap<CallCategory, SlidingWindow>>,
    validation_cache: RwLock<HashMap<String, (Instant, Completion)>>,
    cache_ttl: Duration,
    quota_pressure: AtomicU32,
}

impl ProviderGateway {
    /// Wrap a provider with the budgets and policy from the config
    pub fn new(provider: Arc<dyn CompletionProvider>, config: &ProviderConfig) -> Self {
        let minute = Duration::from_secs(60);
        let mut windows = HashMap::new();
        windows.insert(
            CallCategory::Planning,
            SlidingWindow::new(config.planning_calls_per_minute as usize, minute),
        );
        windows.insert(
            CallCategory::Execution,
            SlidingWindow::new(config.execution_calls_per_minute as usize, minute),
        );
        windows.insert(
            CallCategory::Validation,
            SlidingWindow::new(config.validation_calls_per_minute as usize, minute),
        );

        Self {
            provider,
            policy: RetryPolicy::from_config(config),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            windows: Mutex::new(windows),
            validation_cache: RwLock::new(HashMap::new()),
            cache_ttl: Duration::from_secs(config.validation_cache_ttl_secs),
            quota_pressure: AtomicU32::new(0),
        }
    }

    /// Build the gateway around the configured default provider
    pub fn from_config(config: &Config) -> Result<Self> {
        let provider: Arc<dyn CompletionProvider> = match config.provider.default_provider.as_str()
        {
            "anthropic" => Arc::new(AnthropicProvider::new(config.provider.anthropic.clone())?),
            _ => Arc::new(OpenAIProvider::new(config.provider.openai.clone())?),
        };
        Ok(Self::new(provider, &config.provider))
    }

    /// Name of the wrapped provider
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Health of the wrapped provider
    pub async fn check_health(&self) -> bool {
        self.provider.check_health().await
    }

    /// Run a completion through the budget, timeout and retry machinery.
    ///
    /// Validation calls are served from the verdict cache when an identical
    /// request completed within the cache TTL.
    pub async fn complete(
        &self,
        category: CallCategory,
        request: &CompletionRequest,
    ) -> Result<Completion> {
        if category == CallCategory::Validation {
            if let Some(hit) = self.cached(request) {
                tracing::debug!("Returning cached validation verdict");
                return Ok(hit);
            }
        }

        let mut attempt: u32 = 0;
        loop {
            self.throttle(category).await;

            let outcome = match timeout(self.call_timeout, self.provider.complete(request)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout),
            };

            match outcome {
                Ok(completion) => {
                    self.decay_pressure();
                    if category == CallCategory::Validation {
                        self.store_cached(request, &completion);
                    }
                    return Ok(completion);
                }
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    let exponent = if matches!(e, ProviderError::Quota(_)) {
                        attempt.saturating_add(self.bump_pressure())
                    } else {
                        attempt
                    };
                    let delay = self.policy.delay_for(exponent);
                    tracing::warn!(
                        provider = self.provider.name(),
                        category = %category,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Provider call failed, retrying: {}",
                        e
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if matches!(e, ProviderError::Quota(_)) {
                        self.bump_pressure();
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Block until the category has a free slot, then claim it
    async fn throttle(&self, category: CallCategory) {
        loop {
            let wait = {
                let mut windows = self.windows.lock().expect("gateway window lock poisoned");
                let window = windows
                    .get_mut(&category)
                    .expect("window exists for every category");
                match window.time_until_slot(Instant::now()) {
                    None => {
                        window.record(Instant::now());
                        return;
                    }
                    Some(wait) => wait,
                }
            };
            tracing::debug!(
                category = %category,
                wait_ms = wait.as_millis() as u64,
                "Call budget exhausted, waiting for a slot"
            );
            sleep(wait).await;
        }
    }

    fn cached(&self, request: &CompletionRequest) -> Option<Completion> {
        let cache = self
            .validation_cache
            .read()
            .expect("validation cache lock poisoned");
        let (stored_at, completion) = cache.get(&request.fingerprint())?;
        if stored_at.elapsed() < self.cache_ttl {
            Some(completion.clone())
        } else {
            None
        }
    }

    fn store_cached(&self, request: &CompletionRequest, completion: &Completion) {
        let mut cache = self
            .validation_cache
            .write()
            .expect("validation cache lock poisoned");
        let ttl = self.cache_ttl;
        cache.retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
        cache.insert(
            request.fingerprint(),
            (Instant::now(), completion.clone()),
        );
    }

    fn bump_pressure(&self) -> u32 {
        let previous = self.quota_pressure.fetch_add(1, Ordering::Relaxed);
        if previous >= QUOTA_PRESSURE_CAP {
            self.quota_pressure
                .store(QUOTA_PRESSURE_CAP, Ordering::Relaxed);
            QUOTA_PRESSURE_CAP
        } else {
            previous + 1
        }
    }

    fn decay_pressure(&self) {
        let _ = self
            .quota_pressure
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| p.checked_sub(1));
    }
}
