use crate::error::{ErrorKind, ProviderError};
use crate::languages::LanguageRegistry;
use crate::providers::{TranslateOptions, TranslationProvider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Connection settings for one OpenAI-compatible endpoint.
///
/// The adapter sends exactly one HTTP request per call. Retries belong to
/// the fallback chain, which routes every attempt through the rate limiter.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_completion_tokens: u32,
    /// Per-request HTTP timeout
    pub timeout: Duration,
}

impl ProviderSettings {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: 0.3,
            max_completion_tokens: 1024,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Chat Completion request
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    max_completion_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

/// Check if a model is a reasoning model that doesn't support temperature
fn is_reasoning_model(model: &str) -> bool {
    model.starts_with("gpt-5")
        || model.starts_with("o1")
        || model.starts_with("o3")
        || model.starts_with("o4")
}

/// Build the system prompt for translating a single locale string
fn build_translation_system_prompt(source_language: &str, target_language: &str) -> String {
    format!(
        r#"You are a professional software localizer.
Translate user interface strings from {} to {}.

## Rules

### DO NOT translate or alter:
- Placeholders such as {{name}}, {{{{count}}}}, %s, %d, %1$s
- HTML tags and their attributes (e.g., <b>, <a href="...">)
- URLs, e-mail addresses and product names

### Output:
- Return ONLY the translated string, without quotes, notes or explanations
- Preserve leading/trailing whitespace, line breaks and punctuation style
- Keep roughly the same length as the source when possible"#,
        source_language, target_language
    )
}

/// Build the user prompt, including key/category context when available
fn build_translation_user_prompt(text: &str, options: &TranslateOptions) -> String {
    let mut prompt = String::new();
    if let Some(key) = &options.key {
        prompt.push_str(&format!("Key: {}\n", key));
    }
    if let Some(category) = &options.category {
        prompt.push_str(&format!("Context: {}\n", category));
    }
    if let Some(existing) = &options.existing_translation {
        prompt.push_str(&format!("Previous translation (may be outdated): {}\n", existing));
    }
    if !prompt.is_empty() {
        prompt.push('\n');
    }
    prompt.push_str(text);
    prompt
}

/// Translation adapter for any endpoint speaking the OpenAI chat-completions API
pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    settings: ProviderSettings,
}

impl OpenAiCompatibleProvider {
    pub fn new(client: reqwest::Client, settings: ProviderSettings) -> Self {
        Self { client, settings }
    }

    fn build_request(&self, system: String, user: String) -> ChatRequest {
        // Reasoning models don't support temperature - use reasoning_effort instead
        let is_reasoning = is_reasoning_model(&self.settings.model);
        ChatRequest {
            model: self.settings.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system,
                },
                Message {
                    role: "user".to_string(),
                    content: user,
                },
            ],
            max_completion_tokens: self.settings.max_completion_tokens,
            temperature: if is_reasoning {
                None
            } else {
                Some(self.settings.temperature)
            },
            reasoning_effort: if is_reasoning {
                Some("low".to_string())
            } else {
                None
            },
        }
    }

    async fn send(&self, request: &ChatRequest) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(&self.settings.api_url)
            .header("Authorization", format!("Bearer {}", self.settings.api_key))
            .header("Content-Type", "application/json")
            .timeout(self.settings.timeout)
            .json(request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|e| format!("<failed to read body: {}>", e));
            return Err(ProviderError::new(
                ErrorKind::from_status(status.as_u16()),
                format!("HTTP {}: {}", status, body),
            ));
        }

        let chat_response: ChatResponse = response.json().await.map_err(|e| {
            let message = format!("Failed to parse completion response: {}", e);
            ProviderError::new(ErrorKind::Api, message)
        })?;

        chat_response
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| {
                ProviderError::new(ErrorKind::Api, "Completion response contained no content")
            })
    }
}

#[async_trait]
impl TranslationProvider for OpenAiCompatibleProvider {
    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
        options: &TranslateOptions,
    ) -> Result<String, ProviderError> {
        let registry = LanguageRegistry::get();
        let request = self.build_request(
            build_translation_system_prompt(
                registry.display_name(source_lang),
                registry.display_name(target_lang),
            ),
            build_translation_user_prompt(text, options),
        );

        debug!(model = %self.settings.model, target = %target_lang, "Requesting translation");
        self.send(&request).await
    }

    async fn analyze(
        &self,
        prompt: &str,
        _options: &TranslateOptions,
    ) -> Result<String, ProviderError> {
        let request = self.build_request(
            "You are a careful localization reviewer. Answer concisely.".to_string(),
            prompt.to_string(),
        );
        self.send(&request).await
    }

    fn supports_analyze(&self) -> bool {
        true
    }
}

fn classify_transport_error(error: reqwest::Error) -> ProviderError {
    let kind = if error.is_timeout() {
        ErrorKind::Timeout
    } else if error.is_connect() || error.is_request() {
        ErrorKind::Network
    } else if let Some(status) = error.status() {
        ErrorKind::from_status(status.as_u16())
    } else {
        ErrorKind::Unknown
    };
    ProviderError::new(kind, error.to_string())
}
