use anyhow::Result;
use locale_sync::config::Config;
use locale_sync::fallback::FallbackChain;
use locale_sync::orchestrator::Orchestrator;
use locale_sync::providers::{OpenAiCompatibleProvider, ProviderRegistry};
use locale_sync::rate_limiter::RateLimiter;
use locale_sync::state::StateManager;
use locale_sync::sync::LocaleSync;
use locale_sync::validation::{LengthPolicy, PlaceholderValidator};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignored in CI)
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("locale_sync=info".parse()?),
        )
        .init();

    info!("Starting locale sync");

    // Load configuration from environment
    let config = Config::from_env()?;

    // Step 1: Register providers (one shared HTTP client)
    let client = reqwest::Client::new();
    let mut registry = ProviderRegistry::new();
    for provider in &config.providers {
        registry.register(
            &provider.name,
            Arc::new(OpenAiCompatibleProvider::new(client.clone(), provider.settings())),
        );
    }
    let entries = registry.resolve(&config.provider_names())?;

    // Step 2: Build the pipeline
    let limiter = Arc::new(RateLimiter::new(config.rate_limiter_config()));
    limiter.start();

    let chain = Arc::new(FallbackChain::new(
        entries,
        Arc::clone(&limiter),
        config.fallback_config(),
    ));
    let validator = PlaceholderValidator::new(LengthPolicy {
        mode: config.length_mode,
        ..Default::default()
    });
    let orchestrator = Orchestrator::new(config.orchestrator_config(), Arc::clone(&chain))
        .with_validator(Arc::new(validator));
    orchestrator.register_shutdown_hook();
    let mut refresh_errors = orchestrator.cache().and_then(|cache| cache.take_refresh_errors());

    info!(
        providers = ?config.provider_names(),
        targets = ?config.target_langs,
        concurrency = orchestrator.concurrency(),
        "Pipeline ready"
    );

    // Step 3: Sync every target language
    let state = StateManager::new(&config.state_dir);
    let result = LocaleSync::new(config.sync_config(), &orchestrator, state).run().await;

    // Step 4: Tear down whatever happened
    if let Some(cache) = orchestrator.cache() {
        cache.wait_for_refreshes().await;
    }
    orchestrator.destroy();
    limiter.destroy();

    if let Some(errors) = refresh_errors.as_mut() {
        while let Ok(failure) = errors.try_recv() {
            warn!(
                key = %failure.key,
                code = failure.error.code(),
                error = %failure.error,
                "Stale cache entry could not be refreshed"
            );
        }
    }

    let report = result?;
    for language in &report.languages {
        match &language.error {
            Some(error) => warn!(lang = %language.lang, error = %error, "Language not synced"),
            None => info!(
                lang = %language.lang,
                translated = language.translated,
                failed = language.failed,
                skipped = language.skipped,
                removed = language.removed,
                "Language synced"
            ),
        }
    }

    for provider in chain.get_stats().providers {
        info!(
            provider = %provider.name,
            successes = provider.stats.success_count,
            failures = provider.stats.failure_count,
            disabled = provider.disabled,
            "Provider summary"
        );
    }

    info!(
        success = report.stats.success,
        failed = report.stats.failed,
        skipped = report.stats.skipped,
        success_rate = format!("{:.1}%", report.stats.success_rate()),
        cache_hit_rate = format!("{:.1}%", report.stats.cache.hit_rate * 100.0),
        "Locale sync finished"
    );

    Ok(())
}
