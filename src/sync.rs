//! End-to-end locale synchronization.
//!
//! A run reads the source locale, diffs it against the saved state, works
//! out per target language which keys need translating (changed keys plus
//! keys missing or empty in that target), drives them through the
//! orchestrator and writes every target file back. Keys deleted from the
//! source are removed from existing targets when deletion sync is on.

use crate::locale::{self, FlatLocale};
use crate::orchestrator::{Orchestrator, TranslationContext, TranslationItem};
use crate::state::{ComparisonResult, StateHashes, StateManager};
use crate::stats::GlobalStats;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source_file: PathBuf,
    /// Directory holding `<lang>.json` target files
    pub locale_dir: PathBuf,
    pub source_lang: String,
    pub target_langs: Vec<String>,
    pub sync_deletions: bool,
    /// Category applied to every key (part of the cache key and prompt)
    pub category: Option<String>,
}

impl SyncConfig {
    pub fn target_path(&self, lang: &str) -> PathBuf {
        self.locale_dir.join(format!("{}.json", lang))
    }
}

/// Outcome for one target language.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LanguageReport {
    pub lang: String,
    pub path: PathBuf,
    pub translated: usize,
    pub failed: usize,
    pub skipped: usize,
    pub removed: usize,
    pub written: bool,
    /// Set when the language could not be processed at all
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub comparison: ComparisonResult,
    pub stats: GlobalStats,
    pub languages: Vec<LanguageReport>,
}

impl SyncReport {
    pub fn language(&self, lang: &str) -> Option<&LanguageReport> {
        self.languages.iter().find(|l| l.lang == lang)
    }
}

pub struct LocaleSync<'a> {
    config: SyncConfig,
    orchestrator: &'a Orchestrator,
    state: StateManager,
}

impl<'a> LocaleSync<'a> {
    pub fn new(config: SyncConfig, orchestrator: &'a Orchestrator, state: StateManager) -> Self {
        Self {
            config,
            orchestrator,
            state,
        }
    }

    pub async fn run(&self) -> Result<SyncReport> {
        let started = Instant::now();
        let source = locale::read_locale(&self.config.source_file)
            .context("Failed to load source locale")?;

        let previous = self.state.load_state().hashes;
        let current = StateManager::generate_state(&source);
        let comparison = StateManager::compare_states(&previous, &current);

        info!(
            keys = source.len(),
            new = comparison.new_keys.len(),
            modified = comparison.modified_keys.len(),
            deleted = comparison.deleted_keys.len(),
            "Compared source with previous state"
        );

        let mut context = TranslationContext::new(&self.config.source_lang);
        context.category = self.config.category.clone();

        let mut languages = Vec::with_capacity(self.config.target_langs.len());
        let mut failed_keys = BTreeSet::new();
        let mut language_failed = false;

        for lang in &self.config.target_langs {
            if lang.eq_ignore_ascii_case(&self.config.source_lang) {
                warn!(lang = %lang, "Skipping target identical to source language");
                continue;
            }

            match self
                .sync_language(lang, &source, &comparison, &context, &mut failed_keys)
                .await
            {
                Ok(report) => languages.push(report),
                Err(e) => {
                    error!(lang = %lang, error = %format!("{:#}", e), "Language sync failed");
                    // Nothing reached this target, so every change is still pending for it.
                    failed_keys.extend(comparison.changed_keys().cloned());
                    language_failed = true;
                    languages.push(LanguageReport {
                        lang: lang.clone(),
                        path: self.config.target_path(lang),
                        error: Some(format!("{:#}", e)),
                        ..Default::default()
                    });
                }
            }
        }

        let retry_deletions = language_failed && self.config.sync_deletions;
        let saved = state_after_run(
            &previous,
            current,
            &failed_keys,
            &comparison.deleted_keys,
            retry_deletions,
        );
        if let Err(e) = self.state.save_state(&saved) {
            warn!(error = %format!("{:#}", e), "Failed to save sync state");
        }

        let stats = self.orchestrator.get_stats();
        info!(
            success = stats.success,
            failed = stats.failed,
            skipped = stats.skipped,
            elapsed = ?started.elapsed(),
            "Sync complete"
        );

        Ok(SyncReport {
            comparison,
            stats,
            languages,
        })
    }

    async fn sync_language(
        &self,
        lang: &str,
        source: &FlatLocale,
        comparison: &ComparisonResult,
        context: &TranslationContext,
        failed_keys: &mut BTreeSet<String>,
    ) -> Result<LanguageReport> {
        let path = self.config.target_path(lang);
        let existing = locale::read_target_locale(&path)?;
        let existed = existing.is_some();
        let mut target = existing.unwrap_or_default();

        let mut removed = 0;
        if self.config.sync_deletions && existed {
            for key in &comparison.deleted_keys {
                if target.remove(key).is_some() {
                    removed += 1;
                }
            }
        }

        let new_keys: BTreeSet<&String> = comparison.new_keys.iter().collect();
        let modified_keys: BTreeSet<&String> = comparison.modified_keys.iter().collect();

        let mut items = Vec::new();
        let mut skipped = 0;
        for (key, text) in source {
            let current = target.get(key).filter(|value| !value.trim().is_empty());
            let is_new = new_keys.contains(key);
            let is_modified = modified_keys.contains(key);

            if current.is_some() && !is_new && !is_modified {
                skipped += 1;
                continue;
            }

            items.push(TranslationItem {
                key: key.clone(),
                text: text.clone(),
                target_lang: lang.to_string(),
                existing: current.cloned(),
                is_new: is_new || current.is_none(),
                is_modified,
                category: None,
            });
        }

        self.orchestrator.record_skipped(lang, skipped as u64);
        info!(lang = %lang, queued = items.len(), skipped, removed, "Syncing language");

        let results = self.orchestrator.process_translations(&items, context).await;

        let mut translated = 0;
        let mut failed = 0;
        for result in results {
            if result.success {
                translated += 1;
            } else {
                failed += 1;
                failed_keys.insert(result.key.clone());
            }
            target.insert(result.key, result.translated);
        }

        let written = !items.is_empty() || removed > 0 || !existed;
        if written {
            locale::write_locale(&path, &target)?;
        }

        if failed > 0 {
            warn!(lang = %lang, failed, "Some keys kept their source text");
        }

        Ok(LanguageReport {
            lang: lang.to_string(),
            path,
            translated,
            failed,
            skipped,
            removed,
            written,
            error: None,
        })
    }
}

/// Hashes to persist after a run. Failed keys keep their previous hash, or
/// none if they had none, so the next run sees them as changed again. With
/// `retry_deletions`, deleted keys keep their previous hash too and their
/// removal is attempted again.
fn state_after_run(
    previous: &StateHashes,
    current: StateHashes,
    failed_keys: &BTreeSet<String>,
    deleted_keys: &[String],
    retry_deletions: bool,
) -> StateHashes {
    let mut saved = current;
    for key in failed_keys {
        match previous.get(key) {
            Some(hash) => saved.insert(key.clone(), hash.clone()),
            None => saved.remove(key),
        };
    }
    if retry_deletions {
        for key in deleted_keys {
            if let Some(hash) = previous.get(key) {
                saved.insert(key.clone(), hash.clone());
            }
        }
    }
    saved
}
