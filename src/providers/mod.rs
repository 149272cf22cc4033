//! Translation provider adapters and the typed registry the fallback chain
//! is built from.
//!
//! # Architecture
//!
//! - [`TranslationProvider`]: the adapter contract every backend implements
//! - [`ProviderRegistry`]: explicit name → adapter map populated at startup
//! - `openai`: adapter for OpenAI-compatible chat-completions endpoints
//!
//! # Example
//!
//! ```rust,ignore
//! let mut registry = ProviderRegistry::new();
//! registry.register("openai", Arc::new(OpenAiCompatibleProvider::new(client, settings)));
//! let entries = registry.resolve(&["openai".to_string()])?;
//! let chain = FallbackChain::new(entries, limiter, FallbackConfig::default());
//! ```

mod openai;

pub use openai::{OpenAiCompatibleProvider, ProviderSettings};

use crate::error::{ErrorKind, ProviderError};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-request hints passed down to a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslateOptions {
    /// Content category (e.g. "ui", "error", "marketing"); part of the cache key
    pub category: Option<String>,
    /// Flattened key the text belongs to, useful as prompt context
    pub key: Option<String>,
    /// Translation already present in the target file, if any
    pub existing_translation: Option<String>,
    /// Queue priority used by the rate limiter
    pub priority: i32,
}

impl TranslateOptions {
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn category_or_default(&self) -> &str {
        self.category.as_deref().unwrap_or("default")
    }
}

/// Adapter contract for a translation backend.
///
/// Failures must be reported with the [`ErrorKind`] taxonomy so the
/// fallback chain and rate limiter can tell transient from fatal errors.
#[async_trait]
pub trait TranslationProvider: Send + Sync {
    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
        options: &TranslateOptions,
    ) -> Result<String, ProviderError>;

    /// Free-form analysis request. Only called when [`supports_analyze`]
    /// returns true.
    ///
    /// [`supports_analyze`]: TranslationProvider::supports_analyze
    async fn analyze(
        &self,
        _prompt: &str,
        _options: &TranslateOptions,
    ) -> Result<String, ProviderError> {
        Err(ProviderError::new(ErrorKind::Api, "analyze is not supported by this provider"))
    }

    fn supports_analyze(&self) -> bool {
        false
    }
}

/// A named provider, in fallback order.
#[derive(Clone)]
pub struct ProviderEntry {
    pub name: String,
    pub provider: Arc<dyn TranslationProvider>,
}

impl ProviderEntry {
    pub fn new(name: impl Into<String>, provider: Arc<dyn TranslationProvider>) -> Self {
        Self {
            name: name.into(),
            provider,
        }
    }
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("name", &self.name)
            .field("supports_analyze", &self.provider.supports_analyze())
            .finish()
    }
}

/// Registry of provider implementations, keyed by name.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn TranslationProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a provider under `name`. Names are case-insensitive.
    pub fn register(&mut self, name: &str, provider: Arc<dyn TranslationProvider>) {
        self.providers.insert(name.to_ascii_lowercase(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TranslationProvider>> {
        self.providers.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(&name.to_ascii_lowercase())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build the ordered entry list for a fallback chain.
    ///
    /// Fails on unknown names or an empty list: a chain without providers
    /// could never translate anything.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<ProviderEntry>> {
        if names.is_empty() {
            bail!("No providers requested");
        }

        names
            .iter()
            .map(|name| match self.get(name) {
                Some(provider) => Ok(ProviderEntry::new(name.to_ascii_lowercase(), provider)),
                None => bail!(
                    "Unknown provider '{}'; registered providers: {:?}",
                    name,
                    self.names()
                ),
            })
            .collect()
    }
}
