use crate::cache::CacheConfig;
use crate::fallback::FallbackConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::providers::ProviderSettings;
use crate::rate_limiter::{AdaptiveConfig, ProviderLimits, QueueStrategy, RateLimiterConfig};
use crate::retry::RetryConfig;
use crate::sync::SyncConfig;
use crate::validation::LengthMode;
use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

/// One configured translation backend.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub api_key: String,
    pub api_url: String,
    pub model: String,
    pub rpm: u32,
    pub concurrency: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    // Files
    pub source_file: PathBuf,
    pub locale_dir: PathBuf,
    pub source_lang: String,
    pub target_langs: Vec<String>,
    pub state_dir: PathBuf,
    pub sync_deletions: bool,
    pub category: Option<String>,

    // Providers, in fallback order
    pub providers: Vec<ProviderConfig>,

    // Orchestrator
    pub concurrency: Option<usize>,
    pub auto_optimize: bool,
    pub max_key_length: usize,
    pub max_batch_size: usize,

    // Cache
    pub cache_enabled: bool,
    pub cache_size: usize,
    pub cache_ttl: Duration,

    // Rate limiter
    pub queue_strategy: QueueStrategy,
    pub queue_timeout: Duration,
    pub adaptive_throttling: bool,

    // Retry
    pub retry: RetryConfig,

    // Validation
    pub length_mode: LengthMode,
}

/// Endpoint and model used when a well-known provider has no explicit settings.
fn known_provider_defaults(name: &str) -> Option<(&'static str, &'static str)> {
    match name {
        "openai" => Some(("https://api.openai.com/v1/chat/completions", "gpt-4o-mini")),
        "deepseek" => Some(("https://api.deepseek.com/chat/completions", "deepseek-chat")),
        "groq" => Some(("https://api.groq.com/openai/v1/chat/completions", "llama-3.1-8b-instant")),
        "mistral" => Some(("https://api.mistral.ai/v1/chat/completions", "mistral-small-latest")),
        _ => None,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl ProviderConfig {
    fn from_env(name: &str) -> Result<Self> {
        let prefix = name.to_ascii_uppercase().replace('-', "_");
        let defaults = known_provider_defaults(name);

        let api_key_var = format!("{}_API_KEY", prefix);
        let api_key =
            std::env::var(&api_key_var).with_context(|| format!("{} not set", api_key_var))?;

        let api_url = match (std::env::var(format!("{}_API_URL", prefix)), defaults) {
            (Ok(url), _) => url,
            (Err(_), Some((url, _))) => url.to_string(),
            (Err(_), None) => bail!(
                "{}_API_URL not set (no default endpoint for '{}')",
                prefix,
                name
            ),
        };
        let model = match (std::env::var(format!("{}_MODEL", prefix)), defaults) {
            (Ok(model), _) => model,
            (Err(_), Some((_, model))) => model.to_string(),
            (Err(_), None) => bail!("{}_MODEL not set (no default model for '{}')", prefix, name),
        };

        Ok(Self {
            name: name.to_string(),
            api_key,
            api_url,
            model,
            rpm: env_parse(&format!("{}_RPM", prefix), 60),
            concurrency: env_parse(&format!("{}_CONCURRENCY", prefix), 5),
        })
    }

    pub fn settings(&self) -> ProviderSettings {
        ProviderSettings::new(&self.api_url, &self.api_key, &self.model)
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let provider_names: Vec<String> = env_list("LOCALE_PROVIDERS")
            .into_iter()
            .map(|name| name.to_ascii_lowercase())
            .collect();
        let providers = provider_names
            .iter()
            .map(|name| ProviderConfig::from_env(name))
            .collect::<Result<Vec<_>>>()?;

        let queue_strategy = match std::env::var("LOCALE_QUEUE_STRATEGY") {
            Ok(v) => v.parse::<QueueStrategy>().context("Invalid LOCALE_QUEUE_STRATEGY")?,
            Err(_) => QueueStrategy::Fifo,
        };
        let length_mode = match std::env::var("LOCALE_LENGTH_MODE") {
            Ok(v) => v.parse::<LengthMode>().context("Invalid LOCALE_LENGTH_MODE")?,
            Err(_) => LengthMode::Smart,
        };

        let config = Self {
            // Files
            source_file: std::env::var("LOCALE_SOURCE_FILE")
                .unwrap_or_else(|_| "locales/en.json".to_string())
                .into(),
            locale_dir: std::env::var("LOCALE_DIR")
                .unwrap_or_else(|_| "locales".to_string())
                .into(),
            source_lang: std::env::var("LOCALE_SOURCE_LANG").unwrap_or_else(|_| "en".to_string()),
            target_langs: env_list("LOCALE_TARGET_LANGS"),
            state_dir: std::env::var("LOCALE_STATE_DIR")
                .unwrap_or_else(|_| ".locale-sync".to_string())
                .into(),
            sync_deletions: env_bool("LOCALE_SYNC_DELETIONS", true),
            category: std::env::var("LOCALE_CATEGORY").ok().filter(|c| !c.trim().is_empty()),

            providers,

            // Orchestrator
            concurrency: std::env::var("LOCALE_CONCURRENCY")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
            auto_optimize: env_bool("LOCALE_AUTO_OPTIMIZE", true),
            max_key_length: env_parse("LOCALE_MAX_KEY_LENGTH", 256),
            max_batch_size: env_parse("LOCALE_MAX_BATCH_SIZE", 50),

            // Cache
            cache_enabled: env_bool("LOCALE_CACHE_ENABLED", true),
            cache_size: env_parse("LOCALE_CACHE_SIZE", 1000),
            cache_ttl: Duration::from_secs(env_parse("LOCALE_CACHE_TTL_SECS", 3600)),

            // Rate limiter
            queue_strategy,
            queue_timeout: Duration::from_secs(env_parse("LOCALE_QUEUE_TIMEOUT_SECS", 60)),
            adaptive_throttling: env_bool("LOCALE_ADAPTIVE_THROTTLING", true),

            // Retry
            retry: RetryConfig::new(
                env_parse("LOCALE_RETRY_MAX_ATTEMPTS", 3),
                Duration::from_millis(env_parse("LOCALE_RETRY_INITIAL_MS", 1000)),
            )
            .with_max_delay(Duration::from_millis(env_parse("LOCALE_RETRY_MAX_MS", 5000)))
            .with_jitter(env_parse("LOCALE_RETRY_JITTER", 0.1)),

            length_mode,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_langs.is_empty() {
            bail!("LOCALE_TARGET_LANGS not set");
        }
        if self.providers.is_empty() {
            bail!("LOCALE_PROVIDERS not set");
        }
        if self.concurrency == Some(0) {
            bail!("LOCALE_CONCURRENCY must be at least 1");
        }
        if self.max_key_length == 0 || self.max_batch_size == 0 {
            bail!("LOCALE_MAX_KEY_LENGTH and LOCALE_MAX_BATCH_SIZE must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("LOCALE_RETRY_MAX_ATTEMPTS must be at least 1");
        }
        if self.retry.max_delay < self.retry.initial_delay {
            bail!("LOCALE_RETRY_MAX_MS must not be lower than LOCALE_RETRY_INITIAL_MS");
        }
        for provider in &self.providers {
            if provider.rpm == 0 || provider.concurrency == 0 {
                bail!("Provider '{}' needs a positive RPM and concurrency", provider.name);
            }
        }
        Ok(())
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name.clone()).collect()
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        let base = RateLimiterConfig {
            strategy: self.queue_strategy,
            queue_timeout: self.queue_timeout,
            adaptive: AdaptiveConfig {
                enabled: self.adaptive_throttling,
                ..Default::default()
            },
            ..Default::default()
        };

        self.providers.iter().fold(base, |config, provider| {
            config.with_provider(
                provider.name.clone(),
                ProviderLimits {
                    rpm: provider.rpm,
                    concurrency: provider.concurrency,
                },
            )
        })
    }

    /// Retries run per provider inside the chain, one limiter slot each.
    pub fn fallback_config(&self) -> FallbackConfig {
        FallbackConfig {
            retry: self.retry.clone(),
            ..Default::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            concurrency: self.concurrency,
            auto_optimize: self.auto_optimize,
            max_key_length: self.max_key_length,
            max_batch_size: self.max_batch_size,
            cache: self.cache_enabled.then(|| CacheConfig {
                capacity: self.cache_size,
                ttl: self.cache_ttl,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            source_file: self.source_file.clone(),
            locale_dir: self.locale_dir.clone(),
            source_lang: self.source_lang.clone(),
            target_langs: self.target_langs.clone(),
            sync_deletions: self.sync_deletions,
            category: self.category.clone(),
        }
    }
}
