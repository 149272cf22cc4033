//! Language registry: metadata for the target languages we know about.
//!
//! Unknown codes are still valid translation targets; the registry only
//! supplies display names for prompts and the length tolerance used by the
//! validator. It is immutable static data, initialized once with `OnceLock`.

use std::sync::OnceLock;

/// Metadata for one language.
#[derive(Debug, Clone)]
pub struct LanguageInfo {
    /// BCP 47 / ISO 639-1 code (e.g., "tr", "pt-BR")
    pub code: &'static str,

    /// English name (e.g., "Turkish")
    pub name: &'static str,

    /// Native name (e.g., "Türkçe")
    pub native_name: &'static str,

    /// Allowed relative length deviation from the source text (0.5 = ±50%)
    pub length_tolerance: f64,
}

pub struct LanguageRegistry {
    languages: Vec<LanguageInfo>,
}

static REGISTRY: OnceLock<LanguageRegistry> = OnceLock::new();

/// Tolerance used for codes missing from the registry.
pub const DEFAULT_LENGTH_TOLERANCE: f64 = 0.5;

impl LanguageRegistry {
    pub fn get() -> &'static LanguageRegistry {
        REGISTRY.get_or_init(|| LanguageRegistry {
            languages: default_languages(),
        })
    }

    /// Look up a language by code. Matching is case-insensitive and falls
    /// back to the primary subtag (`pt-BR` → `pt`).
    pub fn get_by_code(&self, code: &str) -> Option<&LanguageInfo> {
        let exact = self
            .languages
            .iter()
            .find(|lang| lang.code.eq_ignore_ascii_case(code));
        if exact.is_some() {
            return exact;
        }

        let primary = code.split(['-', '_']).next().unwrap_or(code);
        self.languages
            .iter()
            .find(|lang| lang.code.eq_ignore_ascii_case(primary))
    }

    /// English display name, or the code itself when unknown.
    pub fn display_name<'a>(&self, code: &'a str) -> &'a str {
        self.get_by_code(code).map(|lang| lang.name).unwrap_or(code)
    }

    pub fn length_tolerance(&self, code: &str) -> f64 {
        self.get_by_code(code)
            .map(|lang| lang.length_tolerance)
            .unwrap_or(DEFAULT_LENGTH_TOLERANCE)
    }

    pub fn list_all(&self) -> Vec<&LanguageInfo> {
        self.languages.iter().collect()
    }
}

// Tolerances follow typical expansion from English source text: German
// and Finnish run long, CJK scripts run short.
const DEFAULT_LANGUAGES: [(&str, &str, &str, f64); 18] = [
    ("en", "English", "English", 0.5),
    ("es", "Spanish", "Español", 0.6),
    ("fr", "French", "Français", 0.6),
    ("de", "German", "Deutsch", 0.8),
    ("it", "Italian", "Italiano", 0.6),
    ("pt", "Portuguese", "Português", 0.6),
    ("nl", "Dutch", "Nederlands", 0.7),
    ("pl", "Polish", "Polski", 0.7),
    ("ru", "Russian", "Русский", 0.7),
    ("uk", "Ukrainian", "Українська", 0.7),
    ("tr", "Turkish", "Türkçe", 0.6),
    ("fi", "Finnish", "Suomi", 0.8),
    ("sv", "Swedish", "Svenska", 0.6),
    ("ar", "Arabic", "العربية", 0.6),
    ("hi", "Hindi", "हिन्दी", 0.7),
    ("ja", "Japanese", "日本語", 0.8),
    ("ko", "Korean", "한국어", 0.8),
    ("zh", "Chinese", "中文", 0.8),
];

fn default_languages() -> Vec<LanguageInfo> {
    DEFAULT_LANGUAGES
        .iter()
        .map(|&(code, name, native_name, length_tolerance)| LanguageInfo {
            code,
            name,
            native_name,
            length_tolerance,
        })
        .collect()
}
