//! Ordered, self-reranking, circuit-breaking chain of translation providers.
//!
//! Each call walks the providers in their current priority order, routing
//! every attempt through the shared [`RateLimiter`]. Transient errors are
//! retried on the same provider with backoff, each retry queued through the
//! limiter again. A provider that still fails is recorded and the chain
//! advances; the first success is returned. When every provider fails the
//! caller receives one [`SyncError::AllProvidersExhausted`] listing each
//! failure.
//!
//! A provider whose consecutive failures reach the threshold is skipped
//! until its cooldown elapses. Cooldowns double with each repeated offense,
//! bounded by `max_cooldown`, and a single success clears them. If every
//! provider is cooling down, the one whose cooldown ends first is still
//! attempted, so the chain never locks itself out.

use crate::error::{ErrorKind, ProviderError, ProviderFailure, SyncError};
use crate::providers::{ProviderEntry, TranslateOptions, TranslationProvider};
use crate::rate_limiter::RateLimiter;
use crate::retry::{with_retry_if, RetryConfig};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Fallback chain configuration
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Consecutive failures before a provider is disabled
    pub failure_threshold: u32,
    /// Cooldown for a provider's first offense
    pub base_cooldown: Duration,
    /// Upper bound for the exponential cooldown
    pub max_cooldown: Duration,
    /// Rerank providers every N operations (0 disables reranking)
    pub rerank_interval: u64,
    /// Timeout for a single provider call once released by the rate limiter
    pub request_timeout: Duration,
    /// Retries of transient errors on one provider before advancing
    pub retry: RetryConfig,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
            rerank_interval: 10,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::provider_call(),
        }
    }
}

impl FallbackConfig {
    fn normalized(mut self) -> Self {
        self.failure_threshold = self.failure_threshold.max(1);
        if self.max_cooldown < self.base_cooldown {
            self.max_cooldown = self.base_cooldown;
        }
        self
    }

    /// Cooldown for the n-th offense (1-based).
    fn cooldown_for(&self, offenses: u32) -> Duration {
        let exponent = offenses.saturating_sub(1).min(31);
        self.base_cooldown
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_cooldown)
            .min(self.max_cooldown)
    }
}

/// Running statistics for one provider.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderStats {
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    /// Exponential moving average over all attempts
    pub avg_response_ms: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Number of times the breaker tripped since the last success
    pub offenses: u32,
}

impl ProviderStats {
    /// Success rate, 1.0 for providers that were never tried.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    /// Priority score used by reranking; higher is better.
    pub fn score(&self) -> f64 {
        let speed = 1.0 / (1.0 + self.avg_response_ms / 1000.0);
        0.6 * self.success_rate() + 0.3 * speed - 0.1 * self.consecutive_failures as f64
    }

    fn record_latency(&mut self, elapsed: Duration) {
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        self.avg_response_ms = if self.success_count + self.failure_count == 0 {
            elapsed_ms
        } else {
            self.avg_response_ms * 0.8 + elapsed_ms * 0.2
        };
    }
}

/// Snapshot of one provider in chain order.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSnapshot {
    pub name: String,
    pub disabled: bool,
    pub cooldown_remaining: Option<Duration>,
    pub supports_analyze: bool,
    pub stats: ProviderStats,
}

/// Chain-wide statistics, as returned by [`FallbackChain::get_stats`].
#[derive(Debug, Clone, Serialize)]
pub struct ChainStats {
    pub operations: u64,
    /// Provider that served the most recent successful call
    pub current: Option<String>,
    pub providers: Vec<ProviderSnapshot>,
}

struct ProviderDescriptor {
    entry: ProviderEntry,
    stats: ProviderStats,
    disabled_until: Option<Instant>,
}

impl ProviderDescriptor {
    fn is_disabled(&self, now: Instant) -> bool {
        self.disabled_until.is_some_and(|until| until > now)
    }
}

struct ChainState {
    providers: Vec<ProviderDescriptor>,
    /// Index of the provider that served the last success
    cursor: usize,
    operations: u64,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Capability {
    Translate,
    Analyze,
}

pub struct FallbackChain {
    config: FallbackConfig,
    limiter: Arc<RateLimiter>,
    state: Mutex<ChainState>,
}

impl FallbackChain {
    pub fn new(
        entries: Vec<ProviderEntry>,
        limiter: Arc<RateLimiter>,
        config: FallbackConfig,
    ) -> Self {
        let providers = entries
            .into_iter()
            .map(|entry| ProviderDescriptor {
                entry,
                stats: ProviderStats::default(),
                disabled_until: None,
            })
            .collect();

        Self {
            config: config.normalized(),
            limiter,
            state: Mutex::new(ChainState {
                providers,
                cursor: 0,
                operations: 0,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
        options: &TranslateOptions,
    ) -> Result<String, SyncError> {
        self.execute(Capability::Translate, options.priority, |provider| async move {
            provider.translate(text, source_lang, target_lang, options).await
        })
        .await
    }

    /// Free-form request over the providers that support analysis.
    pub async fn analyze(
        &self,
        prompt: &str,
        options: &TranslateOptions,
    ) -> Result<String, SyncError> {
        self.execute(Capability::Analyze, options.priority, |provider| async move {
            provider.analyze(prompt, options).await
        })
        .await
    }

    async fn execute<F, Fut>(
        &self,
        capability: Capability,
        priority: i32,
        call: F,
    ) -> Result<String, SyncError>
    where
        F: Fn(Arc<dyn TranslationProvider>) -> Fut,
        Fut: Future<Output = Result<String, ProviderError>>,
    {
        let candidates = self.begin_operation(capability);
        if candidates.is_empty() && capability == Capability::Analyze {
            let message = "no configured provider supports analyze";
            return Err(ProviderError::new(ErrorKind::Api, message).into());
        }

        let mut failures = Vec::with_capacity(candidates.len());

        for entry in candidates {
            let call_micros = AtomicU64::new(0);
            let outcome = with_retry_if(
                &self.config.retry,
                &entry.name,
                || self.attempt(&entry, priority, &call, &call_micros),
                is_transient,
            )
            .await;
            let elapsed = Duration::from_micros(call_micros.load(AtomicOrdering::Relaxed));

            match outcome {
                Ok(text) => {
                    self.record_success(&entry.name, elapsed);
                    return Ok(text);
                }
                Err(e @ SyncError::LimiterClosed { .. }) => return Err(e),
                Err(e) => {
                    let error = e.as_provider_error();
                    debug!(provider = %entry.name, error = %error, "Provider failed, advancing");
                    self.record_failure(&entry.name, &error, elapsed);
                    failures.push(ProviderFailure {
                        provider: entry.name.clone(),
                        error,
                    });
                }
            }
        }

        self.lock_state().cursor = 0;
        warn!(
            attempted = failures.len(),
            code = "all_providers_exhausted",
            "Every provider failed"
        );
        Err(SyncError::AllProvidersExhausted { failures })
    }

    /// One request to one provider, queued through the rate limiter. Only
    /// the provider call itself is timed; queueing is not.
    async fn attempt<F, Fut>(
        &self,
        entry: &ProviderEntry,
        priority: i32,
        call: &F,
        call_micros: &AtomicU64,
    ) -> Result<String, SyncError>
    where
        F: Fn(Arc<dyn TranslationProvider>) -> Fut,
        Fut: Future<Output = Result<String, ProviderError>>,
    {
        let timeout = self.config.request_timeout;
        let provider = Arc::clone(&entry.provider);
        self.limiter
            .enqueue(&entry.name, priority, move || async move {
                let started = Instant::now();
                let result = match tokio::time::timeout(timeout, call(provider)).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::new(
                        ErrorKind::Timeout,
                        format!("request exceeded {:?}", timeout),
                    )),
                };
                call_micros.store(started.elapsed().as_micros() as u64, AtomicOrdering::Relaxed);
                result
            })
            .await
    }

    /// Count the operation, rerank when due, and pick the providers to try
    /// in order.
    fn begin_operation(&self, capability: Capability) -> Vec<ProviderEntry> {
        let mut state = self.lock_state();
        state.operations += 1;
        if self.config.rerank_interval > 0 && state.operations % self.config.rerank_interval == 0 {
            rerank(&mut state);
        }

        let now = Instant::now();
        let capable = |d: &&ProviderDescriptor| match capability {
            Capability::Translate => true,
            Capability::Analyze => d.entry.provider.supports_analyze(),
        };

        let available: Vec<ProviderEntry> = state
            .providers
            .iter()
            .filter(capable)
            .filter(|d| !d.is_disabled(now))
            .map(|d| d.entry.clone())
            .collect();
        if !available.is_empty() {
            return available;
        }

        // Everything is cooling down: try the provider that recovers first.
        state
            .providers
            .iter()
            .filter(capable)
            .min_by_key(|d| d.disabled_until)
            .map(|d| vec![d.entry.clone()])
            .unwrap_or_default()
    }

    fn record_success(&self, name: &str, elapsed: Duration) {
        let mut state = self.lock_state();
        let Some(index) = state.providers.iter().position(|d| d.entry.name == name) else {
            return;
        };
        state.cursor = index;

        let descriptor = &mut state.providers[index];
        if descriptor.disabled_until.take().is_some() {
            info!(provider = %name, "Provider recovered");
        }
        let stats = &mut descriptor.stats;
        stats.record_latency(elapsed);
        stats.success_count += 1;
        stats.consecutive_failures = 0;
        stats.offenses = 0;
        stats.last_success = Some(Utc::now());
    }

    fn record_failure(&self, name: &str, error: &ProviderError, elapsed: Duration) {
        let mut state = self.lock_state();
        let Some(descriptor) = state.providers.iter_mut().find(|d| d.entry.name == name) else {
            return;
        };

        let stats = &mut descriptor.stats;
        stats.record_latency(elapsed);
        stats.failure_count += 1;
        stats.consecutive_failures += 1;
        stats.last_error_at = Some(Utc::now());
        stats.last_error = Some(error.to_string());

        let cooldown = if error.kind == ErrorKind::Auth {
            stats.offenses += 1;
            Some(self.config.max_cooldown)
        } else if stats.consecutive_failures >= self.config.failure_threshold {
            stats.offenses += 1;
            Some(self.config.cooldown_for(stats.offenses))
        } else {
            None
        };

        if let Some(cooldown) = cooldown {
            descriptor.disabled_until = Some(Instant::now() + cooldown);
            warn!(
                provider = %name,
                consecutive_failures = descriptor.stats.consecutive_failures,
                offenses = descriptor.stats.offenses,
                cooldown = ?cooldown,
                "Provider disabled"
            );
        }
    }

    /// Providers in current order with their statistics.
    pub fn get_stats(&self) -> ChainStats {
        let state = self.lock_state();
        let now = Instant::now();
        let current = (state.operations > 0)
            .then(|| state.providers.get(state.cursor))
            .flatten()
            .filter(|d| d.stats.success_count > 0)
            .map(|d| d.entry.name.clone());

        ChainStats {
            operations: state.operations,
            current,
            providers: state
                .providers
                .iter()
                .map(|d| ProviderSnapshot {
                    name: d.entry.name.clone(),
                    disabled: d.is_disabled(now),
                    cooldown_remaining: d
                        .disabled_until
                        .filter(|until| *until > now)
                        .map(|until| until - now),
                    supports_analyze: d.entry.provider.supports_analyze(),
                    stats: d.stats.clone(),
                })
                .collect(),
        }
    }

    /// Zero every provider's statistics. Provider order is kept.
    pub fn reset_stats(&self) {
        let mut state = self.lock_state();
        state.operations = 0;
        for descriptor in state.providers.iter_mut() {
            descriptor.stats = ProviderStats::default();
        }
    }

    /// Clear transient selection state: cursor, cooldowns and consecutive
    /// failure counters.
    pub fn reset(&self) {
        let mut state = self.lock_state();
        state.cursor = 0;
        for descriptor in state.providers.iter_mut() {
            descriptor.disabled_until = None;
            descriptor.stats.consecutive_failures = 0;
            descriptor.stats.offenses = 0;
        }
    }
}

fn rerank(state: &mut ChainState) {
    let before: Vec<String> = state.providers.iter().map(|d| d.entry.name.clone()).collect();
    // sort_by is stable, so equal scores keep their current order
    state.providers.sort_by(|a, b| {
        b.stats
            .score()
            .partial_cmp(&a.stats.score())
            .unwrap_or(Ordering::Equal)
    });
    state.cursor = 0;

    let after: Vec<&str> = state.providers.iter().map(|d| d.entry.name.as_str()).collect();
    if before != after {
        info!(order = ?after, "Providers reranked");
    }
}

/// Provider errors worth another attempt on the same provider. Queue
/// timeouts already waited their full budget and are not retried.
fn is_transient(error: &SyncError) -> bool {
    matches!(error, SyncError::Provider(e) if e.is_retryable())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::{AdaptiveConfig, ProviderLimits, RateLimiterConfig};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    #[derive(Clone)]
    enum Behavior {
        Succeed(&'static str),
        Fail(ErrorKind),
        /// Fail with the kind for the first n calls, then succeed
        Flaky(usize, ErrorKind),
        Hang(Duration),
    }

    struct Scripted {
        behavior: Behavior,
        analyze: bool,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                analyze: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn with_analyze(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                analyze: true,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(AtomicOrdering::SeqCst)
        }

        async fn respond(&self) -> Result<String, ProviderError> {
            let call = self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            match &self.behavior {
                Behavior::Succeed(text) => Ok(text.to_string()),
                Behavior::Fail(kind) => Err(ProviderError::new(*kind, "scripted failure")),
                Behavior::Flaky(failures, kind) if call < *failures => {
                    Err(ProviderError::new(*kind, "scripted failure"))
                }
                Behavior::Flaky(..) => Ok("recovered".to_string()),
                Behavior::Hang(delay) => {
                    tokio::time::sleep(*delay).await;
                    Ok("late".to_string())
                }
            }
        }
    }

    #[async_trait]
    impl TranslationProvider for Scripted {
        async fn translate(
            &self,
            _text: &str,
            _source_lang: &str,
            _target_lang: &str,
            _options: &TranslateOptions,
        ) -> Result<String, ProviderError> {
            self.respond().await
        }

        async fn analyze(
            &self,
            _prompt: &str,
            _options: &TranslateOptions,
        ) -> Result<String, ProviderError> {
            self.respond().await
        }

        fn supports_analyze(&self) -> bool {
            self.analyze
        }
    }

    fn test_limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimiterConfig {
            default_limits: ProviderLimits {
                rpm: 10_000,
                concurrency: 10,
            },
            adaptive: AdaptiveConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }))
    }

    fn test_config() -> FallbackConfig {
        FallbackConfig {
            failure_threshold: 3,
            base_cooldown: Duration::from_millis(100),
            max_cooldown: Duration::from_secs(1),
            rerank_interval: 0,
            request_timeout: Duration::from_secs(5),
            retry: RetryConfig::no_retry(),
        }
    }

    fn limiter_with(limits: ProviderLimits, window: Duration) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimiterConfig {
            default_limits: limits,
            window,
            adaptive: AdaptiveConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        }))
    }

    fn chain_of(providers: &[(&str, Arc<Scripted>)], config: FallbackConfig) -> FallbackChain {
        let entries = providers
            .iter()
            .map(|(name, p)| ProviderEntry::new(*name, p.clone() as Arc<dyn TranslationProvider>))
            .collect();
        FallbackChain::new(entries, test_limiter(), config)
    }

    fn stats_for<'a>(stats: &'a ChainStats, name: &str) -> &'a ProviderSnapshot {
        stats.providers.iter().find(|p| p.name == name).unwrap()
    }

    async fn translate(chain: &FallbackChain) -> Result<String, SyncError> {
        chain
            .translate("Hello", "en", "tr", &TranslateOptions::default())
            .await
    }

    // ==================== Config ====================

    #[test]
    fn test_cooldown_doubles_and_is_bounded() {
        let config = FallbackConfig {
            base_cooldown: Duration::from_secs(10),
            max_cooldown: Duration::from_secs(60),
            ..Default::default()
        };
        assert_eq!(config.cooldown_for(1), Duration::from_secs(10));
        assert_eq!(config.cooldown_for(2), Duration::from_secs(20));
        assert_eq!(config.cooldown_for(3), Duration::from_secs(40));
        assert_eq!(config.cooldown_for(4), Duration::from_secs(60));
        assert_eq!(config.cooldown_for(100), Duration::from_secs(60));
    }

    #[test]
    fn test_untried_provider_scores_as_fully_reliable() {
        let stats = ProviderStats::default();
        assert_eq!(stats.success_rate(), 1.0);
        assert!((stats.score() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_score_penalizes_consecutive_failures() {
        let healthy = ProviderStats {
            success_count: 5,
            avg_response_ms: 500.0,
            ..Default::default()
        };
        let failing = ProviderStats {
            success_count: 5,
            failure_count: 2,
            consecutive_failures: 2,
            avg_response_ms: 500.0,
            ..Default::default()
        };
        assert!(healthy.score() > failing.score());
    }

    // ==================== Fallback ====================

    #[tokio::test]
    async fn test_first_provider_success_stops_chain() {
        let a = Scripted::new(Behavior::Succeed("Merhaba"));
        let b = Scripted::new(Behavior::Succeed("Selam"));
        let chain = chain_of(&[("a", a.clone()), ("b", b.clone())], test_config());

        assert_eq!(translate(&chain).await.unwrap(), "Merhaba");
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_failures_advance_to_next_provider() {
        let a = Scripted::new(Behavior::Fail(ErrorKind::Server));
        let b = Scripted::new(Behavior::Fail(ErrorKind::Timeout));
        let c = Scripted::new(Behavior::Succeed("Merhaba"));
        let chain = chain_of(&[("a", a), ("b", b), ("c", c)], test_config());

        assert_eq!(translate(&chain).await.unwrap(), "Merhaba");
        let stats = chain.get_stats();
        assert_eq!(stats_for(&stats, "a").stats.failure_count, 1);
        assert_eq!(stats_for(&stats, "b").stats.failure_count, 1);
        assert_eq!(stats_for(&stats, "c").stats.success_count, 1);
        assert_eq!(stats.current.as_deref(), Some("c"));

        assert_eq!(translate(&chain).await.unwrap(), "Merhaba");
        let stats = chain.get_stats();
        assert_eq!(stats_for(&stats, "a").stats.failure_count, 2);
        assert_eq!(stats_for(&stats, "b").stats.failure_count, 2);
        assert_eq!(stats_for(&stats, "c").stats.success_count, 2);
    }

    #[tokio::test]
    async fn test_exhaustion_lists_every_failure() {
        let a = Scripted::new(Behavior::Fail(ErrorKind::RateLimit));
        let b = Scripted::new(Behavior::Fail(ErrorKind::Api));
        let chain = chain_of(&[("a", a), ("b", b)], test_config());

        match translate(&chain).await.unwrap_err() {
            SyncError::AllProvidersExhausted { failures } => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].provider, "a");
                assert_eq!(failures[0].error.kind, ErrorKind::RateLimit);
                assert_eq!(failures[1].provider, "b");
                assert_eq!(failures[1].error.kind, ErrorKind::Api);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_each_call_restarts_from_top_after_exhaustion() {
        let a = Scripted::new(Behavior::Fail(ErrorKind::Server));
        let b = Scripted::new(Behavior::Fail(ErrorKind::Server));
        let mut config = test_config();
        config.failure_threshold = 10;
        let chain = chain_of(&[("a", a.clone()), ("b", b.clone())], config);

        assert!(translate(&chain).await.is_err());
        assert!(translate(&chain).await.is_err());
        assert_eq!(a.calls(), 2);
        assert_eq!(b.calls(), 2);
    }

    #[tokio::test]
    async fn test_request_timeout_counts_as_timeout_failure() {
        let slow = Scripted::new(Behavior::Hang(Duration::from_secs(5)));
        let fast = Scripted::new(Behavior::Succeed("ok"));
        let mut config = test_config();
        config.request_timeout = Duration::from_millis(50);
        let chain = chain_of(&[("slow", slow), ("fast", fast)], config);

        assert_eq!(translate(&chain).await.unwrap(), "ok");
        let stats = chain.get_stats();
        let slow_stats = &stats_for(&stats, "slow").stats;
        assert_eq!(slow_stats.failure_count, 1);
        assert!(slow_stats.last_error.as_deref().unwrap().starts_with("timeout"));
    }

    #[tokio::test]
    async fn test_destroyed_limiter_stops_chain() {
        let a = Scripted::new(Behavior::Succeed("x"));
        let chain = chain_of(&[("a", a.clone())], test_config());
        chain.limiter().destroy();

        let err = translate(&chain).await.unwrap_err();
        assert_eq!(err.code(), "limiter_closed");
        assert_eq!(a.calls(), 0);
        assert_eq!(stats_for(&chain.get_stats(), "a").stats.failure_count, 0);
    }

    // ==================== Retries ====================

    #[tokio::test]
    async fn test_each_retry_is_queued_through_the_limiter() {
        let flaky = Scripted::new(Behavior::Flaky(2, ErrorKind::Server));
        let limiter = limiter_with(
            ProviderLimits {
                rpm: 1,
                concurrency: 1,
            },
            Duration::from_millis(150),
        );
        let mut config = test_config();
        config.retry = RetryConfig::new(3, Duration::from_millis(1));
        let chain = FallbackChain::new(
            vec![ProviderEntry::new("flaky", flaky.clone() as Arc<dyn TranslationProvider>)],
            limiter,
            config,
        );

        let started = std::time::Instant::now();
        assert_eq!(translate(&chain).await.unwrap(), "recovered");

        // Three requests at one per 150ms window need two full windows
        assert_eq!(flaky.calls(), 3);
        assert!(started.elapsed() >= Duration::from_millis(300), "got {:?}", started.elapsed());

        let stats = chain.get_stats();
        let flaky_stats = &stats_for(&stats, "flaky").stats;
        assert_eq!(flaky_stats.success_count, 1);
        assert_eq!(flaky_stats.failure_count, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_count_one_failure_then_advance() {
        let a = Scripted::new(Behavior::Fail(ErrorKind::RateLimit));
        let b = Scripted::new(Behavior::Succeed("from b"));
        let mut config = test_config();
        config.retry = RetryConfig::new(3, Duration::from_millis(1));
        let chain = chain_of(&[("a", a.clone()), ("b", b)], config);

        assert_eq!(translate(&chain).await.unwrap(), "from b");
        assert_eq!(a.calls(), 3);
        assert_eq!(stats_for(&chain.get_stats(), "a").stats.failure_count, 1);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let a = Scripted::new(Behavior::Fail(ErrorKind::Auth));
        let mut config = test_config();
        config.retry = RetryConfig::new(3, Duration::from_millis(1));
        let chain = chain_of(&[("a", a.clone())], config);

        assert!(translate(&chain).await.is_err());
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_response_time_excludes_queue_wait() {
        let slow = Scripted::new(Behavior::Hang(Duration::from_millis(100)));
        let limiter = limiter_with(
            ProviderLimits {
                rpm: 10_000,
                concurrency: 1,
            },
            Duration::from_secs(60),
        );
        let chain = FallbackChain::new(
            vec![ProviderEntry::new("slow", slow as Arc<dyn TranslationProvider>)],
            limiter,
            test_config(),
        );

        // The second call waits ~100ms for the only slot before running
        let (first, second) = tokio::join!(translate(&chain), translate(&chain));
        assert!(first.is_ok() && second.is_ok());

        let avg = stats_for(&chain.get_stats(), "slow").stats.avg_response_ms;
        assert!(avg >= 90.0 && avg < 170.0, "got {}", avg);
    }

    // ==================== Circuit breaking ====================

    #[tokio::test]
    async fn test_provider_disabled_after_threshold() {
        let a = Scripted::new(Behavior::Fail(ErrorKind::Server));
        let b = Scripted::new(Behavior::Succeed("ok"));
        let mut config = test_config();
        config.failure_threshold = 2;
        config.base_cooldown = Duration::from_secs(60);
        config.max_cooldown = Duration::from_secs(60);
        let chain = chain_of(&[("a", a.clone()), ("b", b.clone())], config);

        translate(&chain).await.unwrap();
        translate(&chain).await.unwrap();
        assert!(stats_for(&chain.get_stats(), "a").disabled);

        translate(&chain).await.unwrap();
        assert_eq!(a.calls(), 2, "disabled provider must be skipped");
        assert_eq!(b.calls(), 3);
    }

    #[tokio::test]
    async fn test_provider_eligible_again_after_cooldown() {
        let a = Scripted::new(Behavior::Fail(ErrorKind::Network));
        let b = Scripted::new(Behavior::Succeed("ok"));
        let mut config = test_config();
        config.failure_threshold = 1;
        config.base_cooldown = Duration::from_millis(50);
        let chain = chain_of(&[("a", a.clone()), ("b", b)], config);

        translate(&chain).await.unwrap();
        translate(&chain).await.unwrap();
        assert_eq!(a.calls(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        translate(&chain).await.unwrap();
        assert_eq!(a.calls(), 2);
        assert_eq!(stats_for(&chain.get_stats(), "a").stats.offenses, 2);
    }

    #[tokio::test]
    async fn test_auth_failure_trips_breaker_immediately() {
        let a = Scripted::new(Behavior::Fail(ErrorKind::Auth));
        let b = Scripted::new(Behavior::Succeed("ok"));
        let chain = chain_of(&[("a", a), ("b", b)], test_config());

        translate(&chain).await.unwrap();
        let stats = chain.get_stats();
        let a_stats = stats_for(&stats, "a");
        assert!(a_stats.disabled);
        assert!(a_stats.cooldown_remaining.unwrap() > Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_all_disabled_still_tries_earliest_recovery() {
        let a = Scripted::new(Behavior::Fail(ErrorKind::Auth));
        let b = Scripted::new(Behavior::Fail(ErrorKind::Server));
        let mut config = test_config();
        config.failure_threshold = 1;
        let chain = chain_of(&[("a", a.clone()), ("b", b.clone())], config);

        assert!(translate(&chain).await.is_err());
        // a cools down for max_cooldown, b only for base_cooldown
        assert!(translate(&chain).await.is_err());
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 2);
    }

    #[tokio::test]
    async fn test_success_clears_consecutive_failures_and_offenses() {
        let a = Scripted::new(Behavior::Fail(ErrorKind::Server));
        let mut config = test_config();
        config.failure_threshold = 1;
        let chain = chain_of(&[("a", a)], config);

        let _ = translate(&chain).await;
        assert_eq!(stats_for(&chain.get_stats(), "a").stats.offenses, 1);
        chain.record_success("a", Duration::from_millis(10));

        let stats = chain.get_stats();
        let a_stats = &stats_for(&stats, "a").stats;
        assert!(!stats_for(&stats, "a").disabled);
        assert_eq!(a_stats.consecutive_failures, 0);
        assert_eq!(a_stats.offenses, 0);
        assert_eq!(a_stats.failure_count, 1);
    }

    #[tokio::test]
    async fn test_reset_clears_cooldowns() {
        let a = Scripted::new(Behavior::Fail(ErrorKind::Auth));
        let b = Scripted::new(Behavior::Succeed("ok"));
        let chain = chain_of(&[("a", a.clone()), ("b", b)], test_config());

        translate(&chain).await.unwrap();
        assert!(stats_for(&chain.get_stats(), "a").disabled);

        chain.reset();
        let stats = chain.get_stats();
        assert!(!stats_for(&stats, "a").disabled);
        assert_eq!(stats_for(&stats, "a").stats.failure_count, 1);

        translate(&chain).await.unwrap();
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test]
    async fn test_reset_stats_zeroes_counters() {
        let a = Scripted::new(Behavior::Succeed("ok"));
        let chain = chain_of(&[("a", a)], test_config());
        translate(&chain).await.unwrap();

        chain.reset_stats();
        let stats = chain.get_stats();
        assert_eq!(stats.operations, 0);
        assert_eq!(stats_for(&stats, "a").stats.success_count, 0);
    }

    // ==================== Reranking ====================

    #[tokio::test]
    async fn test_rerank_promotes_reliable_provider() {
        let a = Scripted::new(Behavior::Fail(ErrorKind::Server));
        let b = Scripted::new(Behavior::Succeed("ok"));
        let mut config = test_config();
        config.rerank_interval = 2;
        config.failure_threshold = 10;
        let chain = chain_of(&[("a", a.clone()), ("b", b)], config);

        translate(&chain).await.unwrap();
        // second operation triggers the rerank before providers are picked
        translate(&chain).await.unwrap();

        let order: Vec<String> = chain.get_stats().providers.into_iter().map(|p| p.name).collect();
        assert_eq!(order, vec!["b", "a"]);
        assert_eq!(a.calls(), 1);
    }

    #[tokio::test]
    async fn test_rerank_keeps_order_on_ties() {
        let a = Scripted::new(Behavior::Succeed("a"));
        let b = Scripted::new(Behavior::Succeed("b"));
        let mut config = test_config();
        config.rerank_interval = 1;
        let chain = chain_of(&[("a", a), ("b", b)], config);

        translate(&chain).await.unwrap();
        let order: Vec<String> = chain.get_stats().providers.into_iter().map(|p| p.name).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    // ==================== Analyze ====================

    #[tokio::test]
    async fn test_analyze_skips_providers_without_support() {
        let plain = Scripted::new(Behavior::Succeed("translation"));
        let capable = Scripted::with_analyze(Behavior::Succeed("analysis"));
        let chain = chain_of(&[("plain", plain.clone()), ("capable", capable)], test_config());

        let answer = chain
            .analyze("check this", &TranslateOptions::default())
            .await
            .unwrap();
        assert_eq!(answer, "analysis");
        assert_eq!(plain.calls(), 0);
    }

    #[tokio::test]
    async fn test_analyze_without_capable_provider_is_api_error() {
        let plain = Scripted::new(Behavior::Succeed("translation"));
        let chain = chain_of(&[("plain", plain)], test_config());

        let err = chain
            .analyze("check this", &TranslateOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "api");
    }

    // ==================== Properties ====================

    proptest::proptest! {
        #[test]
        fn prop_first_healthy_provider_wins(
            pattern in proptest::collection::vec(proptest::bool::ANY, 1..6),
        ) {
            let providers: Vec<Arc<Scripted>> = pattern
                .iter()
                .map(|ok| {
                    if *ok {
                        Scripted::new(Behavior::Succeed("ok"))
                    } else {
                        Scripted::new(Behavior::Fail(ErrorKind::Network))
                    }
                })
                .collect();
            let entries = providers
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    ProviderEntry::new(format!("p{}", i), p.clone() as Arc<dyn TranslationProvider>)
                })
                .collect();
            let chain = FallbackChain::new(entries, test_limiter(), test_config());

            let result = tokio_test::block_on(translate(&chain));

            let first_ok = pattern.iter().position(|ok| *ok);
            proptest::prop_assert_eq!(result.is_ok(), first_ok.is_some());
            for (i, provider) in providers.iter().enumerate() {
                let expected = match first_ok {
                    Some(winner) if i > winner => 0,
                    _ => 1,
                };
                proptest::prop_assert_eq!(provider.calls(), expected);
            }
        }
    }
}
