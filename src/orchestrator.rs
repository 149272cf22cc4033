//! Per-language translation pipeline.
//!
//! The orchestrator turns translation items into bounded concurrent batches
//! and drives each item through cache lookup, the fallback chain (itself
//! gated by the rate limiter), validation and cache store. It never fails
//! outward: every item ends in a [`TranslationResult`], and a failed item
//! carries its source text as the translation. Output the validator rejects
//! counts as a failure. Stale cache entries are refreshed through the same
//! chain and validator.
//!
//! # Item lifecycle
//!
//! ```text
//! Queued → CacheCheck ─ hit ──────────────────────────────→ Done
//!                     └ miss → ProviderAttempt(0..n) ─ ok → Validate ─ ok → CacheStore → Done
//!                                                    │              └ error → Done(error)
//!                                                    └ all failed → Done(error)
//! ```

use crate::cache::{cache_key, CacheConfig, RefreshRequest, Refresher, ResponseCache};
use crate::error::SyncError;
use crate::fallback::FallbackChain;
use crate::providers::TranslateOptions;
use crate::rate_limiter::RateLimiter;
use crate::stats::{GlobalStats, ItemOutcome};
use crate::validation::{Severity, ValidationIssue, ValidationOptions, Validator};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Concurrency tier picked from host resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyTier {
    Low,
    Mid,
    High,
}

impl ConcurrencyTier {
    pub fn concurrency(self) -> usize {
        match self {
            ConcurrencyTier::Low => 3,
            ConcurrencyTier::Mid => 5,
            ConcurrencyTier::High => 10,
        }
    }
}

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostResources {
    pub cpus: usize,
    pub total_memory: Option<u64>,
}

impl HostResources {
    pub fn detect() -> Self {
        Self {
            cpus: num_cpus::get(),
            total_memory: std::fs::read_to_string("/proc/meminfo")
                .ok()
                .and_then(|contents| parse_meminfo(&contents)),
        }
    }

    /// Unknown memory is judged on CPU count alone.
    pub fn tier(&self) -> ConcurrencyTier {
        let memory_at_least = |gib: u64| self.total_memory.map_or(true, |bytes| bytes >= gib * GIB);

        if self.cpus >= 8 && memory_at_least(16) {
            ConcurrencyTier::High
        } else if self.cpus >= 4 && memory_at_least(8) {
            ConcurrencyTier::Mid
        } else {
            ConcurrencyTier::Low
        }
    }
}

/// Total memory in bytes from `/proc/meminfo` contents.
fn parse_meminfo(contents: &str) -> Option<u64> {
    let line = contents.lines().find(|line| line.starts_with("MemTotal:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Explicit concurrency; overrides auto-optimization
    pub concurrency: Option<usize>,
    pub auto_optimize: bool,
    pub max_key_length: usize,
    pub max_batch_size: usize,
    /// Pause between consecutive chunks
    pub chunk_pause: Duration,
    /// `None` disables the response cache
    pub cache: Option<CacheConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            auto_optimize: true,
            max_key_length: 256,
            max_batch_size: 50,
            chunk_pause: Duration::from_millis(100),
            cache: Some(CacheConfig::default()),
        }
    }
}

impl OrchestratorConfig {
    fn resolve_concurrency(&self) -> usize {
        if let Some(concurrency) = self.concurrency {
            return concurrency.max(1);
        }
        if self.auto_optimize {
            let resources = HostResources::detect();
            let tier = resources.tier();
            info!(
                cpus = resources.cpus,
                memory_gib = resources.total_memory.map(|bytes| bytes / GIB),
                tier = ?tier,
                "Auto-optimized concurrency"
            );
            return tier.concurrency();
        }
        ConcurrencyTier::Mid.concurrency()
    }
}

/// Request-wide settings shared by every item of a run.
#[derive(Debug, Clone)]
pub struct TranslationContext {
    pub source_lang: String,
    pub category: Option<String>,
    pub priority: i32,
}

impl TranslationContext {
    pub fn new(source_lang: impl Into<String>) -> Self {
        Self {
            source_lang: source_lang.into(),
            category: None,
            priority: 0,
        }
    }
}

/// One key to translate into one language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationItem {
    pub key: String,
    pub text: String,
    pub target_lang: String,
    pub existing: Option<String>,
    pub is_new: bool,
    pub is_modified: bool,
    pub category: Option<String>,
}

impl TranslationItem {
    fn outcome_on_success(&self) -> ItemOutcome {
        if self.is_new || self.existing.is_none() {
            ItemOutcome::Added
        } else {
            ItemOutcome::Updated
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationResult {
    pub key: String,
    pub target_lang: String,
    /// Translated text, or the source text when `success` is false
    pub translated: String,
    pub success: bool,
    pub error: Option<String>,
    pub error_code: Option<&'static str>,
    pub from_cache: bool,
    pub stale: bool,
    /// Fixes applied by the validator
    pub fixes: Vec<String>,
    /// Issues the validator could not fix
    pub issues: Vec<String>,
}

impl TranslationResult {
    fn success(key: &str, target_lang: &str, translated: String) -> Self {
        Self {
            key: key.to_string(),
            target_lang: target_lang.to_string(),
            translated,
            success: true,
            error: None,
            error_code: None,
            from_cache: false,
            stale: false,
            fixes: Vec::new(),
            issues: Vec::new(),
        }
    }

    fn failure(key: &str, target_lang: &str, original: &str, error: &SyncError) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            error_code: Some(error.code()),
            ..Self::success(key, target_lang, original.to_string())
        }
    }
}

/// Validator output for one chain translation.
struct Checked {
    text: String,
    fixes: Vec<String>,
    issues: Vec<ValidationIssue>,
}

impl Checked {
    fn is_valid(&self) -> bool {
        !self.issues.iter().any(|issue| issue.severity == Severity::Error)
    }

    fn issue_messages(&self) -> Vec<String> {
        self.issues.iter().map(|issue| issue.message.clone()).collect()
    }
}

/// Fallback chain followed by the validator. Serves fresh translations and
/// stale cache refreshes alike.
struct TranslationPipeline {
    chain: Arc<FallbackChain>,
    validator: Option<Arc<dyn Validator>>,
}

impl TranslationPipeline {
    async fn translate(&self, request: &RefreshRequest) -> Result<Checked, SyncError> {
        let translated = self
            .chain
            .translate(
                &request.text,
                &request.source_lang,
                &request.target_lang,
                &request.options,
            )
            .await?;

        let Some(validator) = &self.validator else {
            return Ok(Checked {
                text: translated,
                fixes: Vec::new(),
                issues: Vec::new(),
            });
        };

        let report = validator.validate_and_fix(
            &request.text,
            &translated,
            &ValidationOptions {
                target_lang: request.target_lang.clone(),
                category: request.options.category.clone(),
            },
        );
        Ok(Checked {
            text: report.fixed_text,
            fixes: report.fixes,
            issues: report.issues,
        })
    }
}

#[async_trait]
impl Refresher for TranslationPipeline {
    async fn refresh(&self, request: &RefreshRequest) -> Result<String, SyncError> {
        let checked = self.translate(request).await?;
        if !checked.is_valid() {
            return Err(SyncError::Validation {
                issues: checked.issue_messages(),
            });
        }
        Ok(checked.text)
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    concurrency: usize,
    pipeline: Arc<TranslationPipeline>,
    cache: Option<ResponseCache>,
    stats: Mutex<GlobalStats>,
    shutdown_hook: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, chain: Arc<FallbackChain>) -> Self {
        let concurrency = config.resolve_concurrency();
        let pipeline = Arc::new(TranslationPipeline {
            chain,
            validator: None,
        });
        let cache = config
            .cache
            .clone()
            .map(|cache_config| ResponseCache::new(cache_config).with_refresher(pipeline.clone()));

        info!(
            concurrency,
            max_batch_size = config.max_batch_size,
            cache = cache.is_some(),
            "Orchestrator ready"
        );

        Self {
            config,
            concurrency,
            pipeline,
            cache,
            stats: Mutex::new(GlobalStats::default()),
            shutdown_hook: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Check every translation, background cache refreshes included.
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        let pipeline = Arc::new(TranslationPipeline {
            chain: Arc::clone(&self.pipeline.chain),
            validator: Some(validator),
        });
        self.cache = self
            .cache
            .take()
            .map(|cache| cache.with_refresher(pipeline.clone()));
        self.pipeline = pipeline;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn chain(&self) -> &Arc<FallbackChain> {
        &self.pipeline.chain
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        self.pipeline.chain.limiter()
    }

    pub fn cache(&self) -> Option<&ResponseCache> {
        self.cache.as_ref()
    }

    fn lock_stats(&self) -> MutexGuard<'_, GlobalStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Translate one string. Failures are reported in the result, never
    /// returned as an error.
    pub async fn process_translation(
        &self,
        key: &str,
        text: &str,
        target_lang: &str,
        context: &TranslationContext,
        existing: Option<&str>,
    ) -> TranslationResult {
        if self.destroyed.load(Ordering::SeqCst) {
            return TranslationResult::failure(key, target_lang, text, &SyncError::Destroyed);
        }

        let key_length = key.chars().count();
        if key_length > self.config.max_key_length {
            let error = SyncError::KeyTooLong {
                length: key_length,
                max: self.config.max_key_length,
            };
            warn!(key = %truncate(key, 64), code = error.code(), "Skipping item");
            return TranslationResult::failure(key, target_lang, text, &error);
        }

        if text.trim().is_empty() {
            return TranslationResult::success(key, target_lang, text.to_string());
        }

        let options = TranslateOptions {
            category: context.category.clone(),
            key: Some(key.to_string()),
            existing_translation: existing.map(str::to_string),
            priority: context.priority,
        };
        let cache_key = cache_key(text, target_lang, options.category_or_default());

        if let Some(hit) = self.cache.as_ref().and_then(|cache| cache.get(&cache_key)) {
            debug!(key = %key, lang = %target_lang, stale = hit.stale, "Cache hit");
            return TranslationResult {
                from_cache: true,
                stale: hit.stale,
                ..TranslationResult::success(key, target_lang, hit.value)
            };
        }

        let request = RefreshRequest {
            text: text.to_string(),
            source_lang: context.source_lang.clone(),
            target_lang: target_lang.to_string(),
            options,
        };
        let checked = match self.pipeline.translate(&request).await {
            Ok(checked) => checked,
            Err(error) => {
                warn!(
                    key = %key,
                    lang = %target_lang,
                    code = error.code(),
                    error = %error,
                    "Translation failed"
                );
                return TranslationResult::failure(key, target_lang, text, &error);
            }
        };

        if !checked.issues.is_empty() {
            warn!(
                key = %key,
                lang = %target_lang,
                issues = ?checked.issues,
                "Translation has validation issues"
            );
        }

        // Rejected output is neither written nor cached; the source text
        // stands in and the key is retried on the next run.
        if !checked.is_valid() {
            let issues = checked.issue_messages();
            let error = SyncError::Validation {
                issues: issues.clone(),
            };
            return TranslationResult {
                fixes: checked.fixes,
                issues,
                ..TranslationResult::failure(key, target_lang, text, &error)
            };
        }

        if let Some(cache) = &self.cache {
            cache.set_with_request(cache_key, checked.text.clone(), request);
        }

        let issues = checked.issue_messages();
        TranslationResult {
            fixes: checked.fixes,
            issues,
            ..TranslationResult::success(key, target_lang, checked.text)
        }
    }

    async fn process_item(
        &self,
        item: &TranslationItem,
        context: &TranslationContext,
    ) -> TranslationResult {
        let item_context;
        let context = match &item.category {
            Some(category) => {
                item_context = TranslationContext {
                    category: Some(category.clone()),
                    ..context.clone()
                };
                &item_context
            }
            None => context,
        };

        self.process_translation(
            &item.key,
            &item.text,
            &item.target_lang,
            context,
            item.existing.as_deref(),
        )
        .await
    }

    /// Translate a batch. Items run concurrently in chunks of
    /// `min(concurrency, max_batch_size)`; chunks run one after another.
    /// Results are returned in input order.
    pub async fn process_translations(
        &self,
        items: &[TranslationItem],
        context: &TranslationContext,
    ) -> Vec<TranslationResult> {
        let chunk_size = self.concurrency.min(self.config.max_batch_size).max(1);
        let started = Instant::now();
        let mut results = Vec::with_capacity(items.len());

        for (index, chunk) in items.chunks(chunk_size).enumerate() {
            if index > 0 && !self.config.chunk_pause.is_zero() {
                tokio::time::sleep(self.config.chunk_pause).await;
            }

            debug!(chunk = index + 1, size = chunk.len(), "Processing chunk");
            let chunk_results =
                join_all(chunk.iter().map(|item| self.process_item(item, context))).await;

            let mut stats = self.lock_stats();
            for (item, result) in chunk.iter().zip(&chunk_results) {
                let outcome = if result.success {
                    item.outcome_on_success()
                } else {
                    ItemOutcome::Failed
                };
                stats.record(&item.target_lang, outcome);
            }
            drop(stats);

            results.extend(chunk_results);
        }

        let languages: BTreeSet<&str> =
            items.iter().map(|item| item.target_lang.as_str()).collect();
        let elapsed = started.elapsed();
        let mut stats = self.lock_stats();
        for lang in languages {
            stats.record_time(lang, elapsed);
        }

        results
    }

    /// Count keys that needed no work.
    pub fn record_skipped(&self, target_lang: &str, count: u64) {
        self.lock_stats().record_skipped(target_lang, count);
    }

    pub fn get_stats(&self) -> GlobalStats {
        let mut stats = self.lock_stats().clone();
        if let Some(cache) = &self.cache {
            stats.cache = cache.get_stats();
        }
        stats
    }

    pub fn reset_stats(&self) {
        *self.lock_stats() = GlobalStats::default();
    }

    /// Destroy the rate limiter on Ctrl-C so queued work is rejected and the
    /// process can exit. Returns false when already registered or when no
    /// Tokio runtime is available.
    pub fn register_shutdown_hook(&self) -> bool {
        let mut hook = self.shutdown_hook.lock().unwrap_or_else(PoisonError::into_inner);
        if hook.is_some() || self.destroyed.load(Ordering::SeqCst) {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };

        let limiter = Arc::clone(self.limiter());
        *hook = Some(runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, rejecting queued translations");
                limiter.destroy();
            }
        }));
        true
    }

    /// Clear the cache, reset statistics, detach the shutdown hook and
    /// reject any further work. Safe to call more than once.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(hook) = self
            .shutdown_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            hook.abort();
        }
        if let Some(cache) = &self.cache {
            cache.clear();
        }
        self.reset_stats();
        debug!("Orchestrator destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(hook) = self
            .shutdown_hook
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            hook.abort();
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => format!("{}…", &text[..index]),
        None => text.to_string(),
    }
}
