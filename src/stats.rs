//! Run statistics aggregated by the orchestrator.

use crate::cache::CacheStats;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Counters for one target language.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LanguageStats {
    /// Items that went through the pipeline (success or failure)
    pub processed: u64,
    /// Keys translated for the first time in this language
    pub added: u64,
    /// Keys retranslated because their source changed
    pub updated: u64,
    /// Keys left alone because nothing changed
    pub skipped: u64,
    pub failed: u64,
    pub time_ms: u64,
}

/// How a single item ended, as far as statistics are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Added,
    Updated,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalStats {
    pub languages: BTreeMap<String, LanguageStats>,
    pub success: u64,
    pub failed: u64,
    pub skipped: u64,
    pub cache: CacheStats,
}

impl GlobalStats {
    pub fn language_mut(&mut self, lang: &str) -> &mut LanguageStats {
        self.languages.entry(lang.to_string()).or_default()
    }

    pub fn record(&mut self, lang: &str, outcome: ItemOutcome) {
        let stats = self.language_mut(lang);
        stats.processed += 1;
        match outcome {
            ItemOutcome::Added => stats.added += 1,
            ItemOutcome::Updated => stats.updated += 1,
            ItemOutcome::Failed => stats.failed += 1,
        }

        match outcome {
            ItemOutcome::Failed => self.failed += 1,
            ItemOutcome::Added | ItemOutcome::Updated => self.success += 1,
        }
    }

    pub fn record_skipped(&mut self, lang: &str, count: u64) {
        self.language_mut(lang).skipped += count;
        self.skipped += count;
    }

    pub fn record_time(&mut self, lang: &str, elapsed: Duration) {
        self.language_mut(lang).time_ms += elapsed.as_millis() as u64;
    }

    /// Successful items as a percentage of processed items (0-100).
    pub fn success_rate(&self) -> f64 {
        let processed = self.success + self.failed;
        if processed == 0 {
            0.0
        } else {
            self.success as f64 / processed as f64 * 100.0
        }
    }

    /// Per-language counters, for tests and reports.
    pub fn language(&self, lang: &str) -> Option<&LanguageStats> {
        self.languages.get(lang)
    }
}
