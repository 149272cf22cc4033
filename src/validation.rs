//! Translation validation.
//!
//! Validators check that a translated string kept the machine-readable parts
//! of its source (placeholders, printf specifiers, HTML tags, URLs) and stays
//! within a plausible length. `validate_and_fix` also repairs the mistakes
//! models commonly make, like wrapping the answer in quotes or dropping
//! surrounding whitespace.

use crate::languages::LanguageRegistry;
use regex::Regex;
use std::str::FromStr;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub message: String,
}

impl ValidationIssue {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }
}

/// Result of [`Validator::validate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// False when any issue is an error
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        Self {
            is_valid: !issues.iter().any(|i| i.severity == Severity::Error),
            issues,
        }
    }

    pub fn has_warnings(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Warning)
    }
}

/// Result of [`Validator::validate_and_fix`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixReport {
    pub fixed_text: String,
    /// Human-readable description of each applied fix
    pub fixes: Vec<String>,
    /// Issues remaining after the fixes
    pub issues: Vec<ValidationIssue>,
}

/// How translated length is checked against the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LengthMode {
    Off,
    /// Fixed maximum deviation; violations are errors
    Strict,
    /// Language- and context-aware deviation; violations are warnings
    #[default]
    Smart,
}

impl FromStr for LengthMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(LengthMode::Off),
            "strict" => Ok(LengthMode::Strict),
            "smart" => Ok(LengthMode::Smart),
            other => {
                anyhow::bail!("Unknown length mode '{}' (expected off, strict or smart)", other)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LengthPolicy {
    pub mode: LengthMode,
    /// Allowed relative deviation in strict mode (0.5 = ±50%)
    pub strict_deviation: f64,
    /// Sources shorter than this (in characters) are not length-checked
    pub min_source_chars: usize,
}

impl Default for LengthPolicy {
    fn default() -> Self {
        Self {
            mode: LengthMode::Smart,
            strict_deviation: 0.5,
            min_source_chars: 8,
        }
    }
}

/// Allowed deviation for a content category, if the category constrains it.
pub fn context_deviation(category: &str) -> Option<f64> {
    match category.to_ascii_lowercase().as_str() {
        "button" | "label" | "menu" | "nav" | "tab" => Some(0.3),
        "title" | "heading" | "ui" => Some(0.5),
        "error" | "message" | "notification" | "tooltip" => Some(0.7),
        "description" | "marketing" | "paragraph" | "content" => Some(1.0),
        _ => None,
    }
}

impl LengthPolicy {
    /// Allowed deviation for a target language and category, `None` when the
    /// length is not checked.
    ///
    /// In smart mode the language and context bounds are combined by taking
    /// the more restrictive one.
    pub fn allowed_deviation(&self, target_lang: &str, category: Option<&str>) -> Option<f64> {
        match self.mode {
            LengthMode::Off => None,
            LengthMode::Strict => Some(self.strict_deviation),
            LengthMode::Smart => {
                let language = LanguageRegistry::get().length_tolerance(target_lang);
                let context = category.and_then(context_deviation);
                Some(context.map_or(language, |c| c.min(language)))
            }
        }
    }

    fn check(
        &self,
        source: &str,
        translated: &str,
        options: &ValidationOptions,
    ) -> Option<ValidationIssue> {
        let allowed = self.allowed_deviation(&options.target_lang, options.category.as_deref())?;
        let source_len = source.trim().chars().count();
        if source_len < self.min_source_chars {
            return None;
        }

        let translated_len = translated.trim().chars().count();
        let deviation = (translated_len as f64 / source_len as f64 - 1.0).abs();
        if deviation <= allowed {
            return None;
        }

        let message = format!(
            "Length deviation {:.0}% exceeds allowed {:.0}% ({} → {} characters)",
            deviation * 100.0,
            allowed * 100.0,
            source_len,
            translated_len
        );
        Some(match self.mode {
            LengthMode::Strict => ValidationIssue::error(message),
            _ => ValidationIssue::warning(message),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationOptions {
    pub target_lang: String,
    pub category: Option<String>,
}

/// Quality checks run on every fresh translation.
pub trait Validator: Send + Sync {
    fn validate(
        &self,
        source: &str,
        translated: &str,
        options: &ValidationOptions,
    ) -> ValidationReport;

    fn validate_and_fix(
        &self,
        source: &str,
        translated: &str,
        options: &ValidationOptions,
    ) -> FixReport;
}

/// Checks that placeholders, printf specifiers, HTML tags and URLs survive
/// translation, plus the configured length policy.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderValidator {
    length: LengthPolicy,
}

static BRACE_REGEX: OnceLock<Regex> = OnceLock::new();
static PRINTF_REGEX: OnceLock<Regex> = OnceLock::new();
static HTML_TAG_REGEX: OnceLock<Regex> = OnceLock::new();
static URL_REGEX: OnceLock<Regex> = OnceLock::new();

impl PlaceholderValidator {
    pub fn new(length: LengthPolicy) -> Self {
        Self { length }
    }

    /// `{name}`, `{{name}}` and `{ count }` style placeholders
    fn extract_placeholders(text: &str) -> Vec<String> {
        let regex = BRACE_REGEX
            .get_or_init(|| Regex::new(r"\{\{\s*[\w.\-]+\s*\}\}|\{\s*[\w.\-]+\s*\}").unwrap());
        sorted_matches(regex, text)
    }

    /// `%s`, `%d`, `%1$s`, `%.2f`, ...
    fn extract_printf(text: &str) -> Vec<String> {
        let regex = PRINTF_REGEX.get_or_init(|| {
            Regex::new(r"%(?:\d+\$)?[-+ 0#]*\d*(?:\.\d+)?[sdifuxXeEgGc@]").unwrap()
        });
        sorted_matches(regex, &text.replace("%%", ""))
    }

    /// Tag names only; attribute values may legitimately be translated
    fn extract_tags(text: &str) -> Vec<String> {
        let regex = HTML_TAG_REGEX
            .get_or_init(|| Regex::new(r"<(/?[a-zA-Z][a-zA-Z0-9]*)\b[^<>]*?(/?)>").unwrap());

        let mut tags: Vec<String> = regex
            .captures_iter(text)
            .map(|cap| format!("<{}{}>", &cap[1].to_ascii_lowercase(), &cap[2]))
            .collect();
        tags.sort();
        tags
    }

    fn extract_urls(text: &str) -> Vec<String> {
        let regex = URL_REGEX.get_or_init(|| Regex::new(r#"https?://[^\s)\]"'<>]+"#).unwrap());
        sorted_matches(regex, text)
    }

    fn compare(
        kind: &str,
        source: Vec<String>,
        translated: Vec<String>,
        issues: &mut Vec<ValidationIssue>,
    ) {
        if source == translated {
            return;
        }

        let missing: Vec<&String> = source.iter().filter(|s| !translated.contains(s)).collect();
        let extra: Vec<&String> = translated.iter().filter(|t| !source.contains(t)).collect();

        if !missing.is_empty() || source.len() > translated.len() {
            issues.push(ValidationIssue::error(format!(
                "{} mismatch: source has {:?}, translation has {:?}",
                kind, source, translated
            )));
        } else if !extra.is_empty() || translated.len() > source.len() {
            issues.push(ValidationIssue::warning(format!(
                "Unexpected {} in translation: {:?}",
                kind.to_ascii_lowercase(),
                extra
            )));
        }
    }
}

fn sorted_matches(regex: &Regex, text: &str) -> Vec<String> {
    let mut found: Vec<String> = regex.find_iter(text).map(|m| m.as_str().to_string()).collect();
    found.sort();
    found
}

const QUOTE_PAIRS: [(char, char); 5] = [
    ('"', '"'),
    ('\'', '\''),
    ('“', '”'),
    ('«', '»'),
    ('„', '“'),
];

fn strip_wrapping_quotes<'a>(source: &str, translated: &'a str) -> Option<&'a str> {
    let trimmed_source = source.trim();
    let trimmed = translated.trim();

    QUOTE_PAIRS.iter().find_map(|&(open, close)| {
        let inner = trimmed.strip_prefix(open)?.strip_suffix(close)?;
        let source_quoted = trimmed_source.starts_with(open) && trimmed_source.ends_with(close);
        (!source_quoted && !inner.is_empty()).then_some(inner)
    })
}

fn outer_whitespace(text: &str) -> (&str, &str) {
    let leading = &text[..text.len() - text.trim_start().len()];
    let trailing = &text[text.trim_end().len()..];
    (leading, trailing)
}

impl Validator for PlaceholderValidator {
    fn validate(
        &self,
        source: &str,
        translated: &str,
        options: &ValidationOptions,
    ) -> ValidationReport {
        let mut issues = Vec::new();

        if translated.trim().is_empty() && !source.trim().is_empty() {
            issues.push(ValidationIssue::error("Translation is empty"));
            return ValidationReport::from_issues(issues);
        }

        Self::compare(
            "Placeholder",
            Self::extract_placeholders(source),
            Self::extract_placeholders(translated),
            &mut issues,
        );
        Self::compare(
            "Format specifier",
            Self::extract_printf(source),
            Self::extract_printf(translated),
            &mut issues,
        );
        Self::compare(
            "HTML tag",
            Self::extract_tags(source),
            Self::extract_tags(translated),
            &mut issues,
        );
        Self::compare(
            "URL",
            Self::extract_urls(source),
            Self::extract_urls(translated),
            &mut issues,
        );

        issues.extend(self.length.check(source, translated, options));

        ValidationReport::from_issues(issues)
    }

    fn validate_and_fix(
        &self,
        source: &str,
        translated: &str,
        options: &ValidationOptions,
    ) -> FixReport {
        let mut fixes = Vec::new();
        let mut text = translated.to_string();

        if let Some(inner) = strip_wrapping_quotes(source, &text) {
            text = inner.to_string();
            fixes.push("Removed wrapping quotes".to_string());
        }

        let (leading, trailing) = outer_whitespace(source);
        let restored = format!("{}{}{}", leading, text.trim(), trailing);
        if restored != text {
            text = restored;
            fixes.push("Restored surrounding whitespace".to_string());
        }

        let report = self.validate(source, &text, options);
        FixReport {
            fixed_text: text,
            fixes,
            issues: report.issues,
        }
    }
}
