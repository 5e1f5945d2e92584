//! Chat completion client with multi-provider fallback.
//!
//! Supports Gemini, Anthropic and any OpenAI-compatible endpoint (OpenAI,
//! OpenRouter, Groq, local servers). Providers are tried in priority order;
//! rate limits and transient failures are retried with backoff before
//! falling back to the next provider.
//!
//! Structured output is requested by passing a JSON schema in
//! [`ChatOptions::response_schema`]. Providers that cannot enforce a schema
//! get it appended to the system prompt instead, so callers should always
//! run the reply through [`extract_json`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Maximum retries per provider before fallback
const MAX_RETRIES: u32 = 2;

/// Delay between retries (doubles each time)
const RETRY_DELAY_MS: u64 = 500;

/// Minimum interval between health checks
const HEALTH_CHECK_INTERVAL_SECS: u64 = 60;

/// Number of consecutive errors before marking unavailable
const ERROR_THRESHOLD: u32 = 3;

/// Error types for the LLM service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("No providers configured")]
    NoProviders,

    #[error("Request failed: {0}")]
    Request(String),
}

/// Result type for LLM operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration for an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmProviderConfig {
    pub name: String,
    pub base_url: String,
    pub model: String,
    /// Local OpenAI-compatible servers may run without a key.
    pub api_key: Option<String>,
    pub priority: u8,
}

impl LlmProviderConfig {
    /// Provider with default endpoint and model for `name`.
    pub fn named(name: &str, api_key: Option<String>, priority: u8) -> Self {
        Self {
            name: name.to_string(),
            base_url: default_endpoint(name),
            model: default_model(name),
            api_key,
            priority,
        }
    }

    fn kind(&self) -> ProviderKind {
        match self.name.as_str() {
            "gemini" => ProviderKind::Gemini,
            "anthropic" => ProviderKind::Anthropic,
            _ => ProviderKind::OpenAiCompatible,
        }
    }
}

/// Configuration for the LLM service.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub providers: Vec<LlmProviderConfig>,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProviderKind {
    Gemini,
    Anthropic,
    OpenAiCompatible,
}

/// Get default endpoint for a provider
pub fn default_endpoint(name: &str) -> String {
    match name {
        "gemini" => "https://generativelanguage.googleapis.com/v1beta".to_string(),
        "anthropic" => "https://api.anthropic.com/v1".to_string(),
        "openrouter" => "https://openrouter.ai/api/v1".to_string(),
        "groq" => "https://api.groq.com/openai/v1".to_string(),
        "ollama" => "http://localhost:11434/v1".to_string(),
        _ => "https://api.openai.com/v1".to_string(),
    }
}

/// Get default model for a provider
pub fn default_model(name: &str) -> String {
    match name {
        "gemini" => "gemini-1.5-flash".to_string(),
        "anthropic" => "claude-3-5-haiku-20241022".to_string(),
        "openrouter" => "meta-llama/llama-3.1-70b-instruct".to_string(),
        "groq" => "llama-3.3-70b-versatile".to_string(),
        "ollama" => "llama3.1".to_string(),
        _ => "gpt-4o-mini".to_string(),
    }
}

/// One turn of a chat conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Per-call generation options.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    /// JSON schema the reply must satisfy.
    pub response_schema: Option<Value>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.3,
            response_schema: None,
        }
    }
}

impl ChatOptions {
    pub fn json(schema: Value) -> Self {
        Self {
            response_schema: Some(schema),
            ..Default::default()
        }
    }
}

/// Service for chat completions with multi-provider fallback.
///
/// Tries providers in priority order, automatically falling back
/// on rate limits or failures.
#[derive(Clone)]
pub struct LlmService {
    inner: Arc<LlmServiceInner>,
}

struct LlmServiceInner {
    providers: RwLock<Vec<LlmProviderConfig>>,
    client: Client,
    last_error: RwLock<Option<String>>,
    error_count: AtomicU32,
    last_health_check: RwLock<Option<Instant>>,
}

/// Response from LLM API
#[derive(Debug, Deserialize)]
struct LlmResponse {
    choices: Option<Vec<Choice>>,
    candidates: Option<Vec<Candidate>>,     // Gemini format
    content: Option<Vec<AnthropicContent>>, // Anthropic format
    error: Option<LlmError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LlmError {
    message: String,
}

impl LlmService {
    /// Create LLM service from config.
    pub fn new(config: &LlmConfig) -> Self {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        let mut providers = config.providers.clone();
        providers.sort_by_key(|p| p.priority);

        info!(
            providers = ?providers.iter().map(|p| &p.name).collect::<Vec<_>>(),
            "LLM service initialized from config"
        );

        Self {
            inner: Arc::new(LlmServiceInner {
                providers: RwLock::new(providers),
                client,
                last_error: RwLock::new(None),
                error_count: AtomicU32::new(0),
                last_health_check: RwLock::new(None),
            }),
        }
    }

    /// Check if LLM service is available.
    /// Returns false if no providers configured or if in error state
    /// and the last failure was less than a minute ago.
    pub async fn is_available(&self) -> bool {
        let guard = self.inner.providers.read().await;
        if guard.is_empty() {
            return false;
        }
        drop(guard);

        let error_count = self.inner.error_count.load(Ordering::Relaxed);
        if error_count >= ERROR_THRESHOLD {
            let last_check = self.inner.last_health_check.read().await;
            if let Some(last) = *last_check {
                if last.elapsed().as_secs() < HEALTH_CHECK_INTERVAL_SECS {
                    return false;
                }
            }
        }

        true
    }

    /// Last error message and consecutive error count, if any.
    pub async fn get_error_info(&self) -> Option<(String, u32)> {
        let error = self.inner.last_error.read().await;
        error.as_ref().map(|msg| {
            let count = self.inner.error_count.load(Ordering::Relaxed);
            (msg.clone(), count)
        })
    }

    async fn record_error(&self, error: &str) {
        let mut last_error = self.inner.last_error.write().await;
        *last_error = Some(error.to_string());
        drop(last_error);

        self.inner.error_count.fetch_add(1, Ordering::Relaxed);

        let mut last_check = self.inner.last_health_check.write().await;
        *last_check = Some(Instant::now());
    }

    async fn clear_error(&self) {
        let mut last_error = self.inner.last_error.write().await;
        *last_error = None;
        drop(last_error);

        self.inner.error_count.store(0, Ordering::Relaxed);
    }

    /// Get provider names in priority order
    pub async fn providers(&self) -> Vec<String> {
        let guard = self.inner.providers.read().await;
        guard.iter().map(|p| p.name.clone()).collect()
    }

    /// Run a chat completion with automatic provider fallback.
    pub async fn chat(&self, messages: &[ChatMessage], options: &ChatOptions) -> Result<String> {
        let providers = {
            let guard = self.inner.providers.read().await;
            guard.clone()
        };

        if providers.is_empty() {
            return Err(Error::NoProviders);
        }

        let mut last_error = None;

        for provider in &providers {
            match self.try_provider(provider, messages, options).await {
                Ok(response) => {
                    self.clear_error().await;
                    return Ok(response);
                }
                Err(e) => {
                    warn!(
                        provider = %provider.name,
                        error = %e,
                        "Provider failed, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        let error_msg = last_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "All providers failed".to_string());
        self.record_error(&error_msg).await;

        Err(last_error.unwrap_or(Error::Llm("All providers failed".to_string())))
    }

    /// Try a specific provider with retries.
    async fn try_provider(
        &self,
        provider: &LlmProviderConfig,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<String> {
        let mut delay = Duration::from_millis(RETRY_DELAY_MS);

        for attempt in 0..MAX_RETRIES {
            match self.call_provider(provider, messages, options).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    if Self::is_retryable(&e) && attempt < MAX_RETRIES - 1 {
                        debug!(
                            provider = %provider.name,
                            attempt,
                            delay_ms = delay.as_millis(),
                            "Retrying after error"
                        );
                        sleep(delay).await;
                        delay *= 2;
                    } else {
                        return Err(e);
                    }
                }
            }
        }

        Err(Error::Llm(format!(
            "Provider {} failed after {} retries",
            provider.name, MAX_RETRIES
        )))
    }

    fn is_retryable(error: &Error) -> bool {
        match error {
            Error::RateLimitExceeded => true,
            other => {
                let msg = other.to_string();
                msg.contains("503") || msg.contains("timed out") || msg.contains("timeout")
            }
        }
    }

    async fn call_provider(
        &self,
        provider: &LlmProviderConfig,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<String> {
        debug!(
            provider = %provider.name,
            model = %provider.model,
            turns = messages.len(),
            structured = options.response_schema.is_some(),
            "Calling LLM provider"
        );

        let kind = provider.kind();
        let (url, body) = match kind {
            ProviderKind::Gemini => build_gemini_request(provider, messages, options),
            ProviderKind::Anthropic => build_anthropic_request(provider, messages, options),
            ProviderKind::OpenAiCompatible => build_openai_request(provider, messages, options),
        };

        let mut request = self
            .inner
            .client
            .post(&url)
            .header("Content-Type", "application/json");

        request = match (kind, provider.api_key.as_deref()) {
            (ProviderKind::Gemini, Some(key)) => request.header("x-goog-api-key", key),
            (ProviderKind::Anthropic, Some(key)) => request
                .header("x-api-key", key)
                .header("anthropic-version", "2023-06-01"),
            (ProviderKind::OpenAiCompatible, Some(key)) => {
                request.header("Authorization", format!("Bearer {}", key))
            }
            (ProviderKind::OpenAiCompatible, None) => request,
            (_, None) => {
                return Err(Error::Llm(format!(
                    "No credentials for provider {}",
                    provider.name
                )))
            }
        };

        let response = request
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Request(format!("Request failed: {}", e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Request(format!("Failed to read response: {}", e)))?;

        if status.as_u16() == 429 {
            return Err(Error::RateLimitExceeded);
        }

        if !status.is_success() {
            return Err(Error::Llm(format!("Provider returned {}: {}", status, text)));
        }

        parse_response(&provider.name, &text)
    }
}

/// Split out system turns; most providers want them outside the message list.
fn split_system(messages: &[ChatMessage], options: &ChatOptions) -> (Option<String>, Vec<ChatMessage>) {
    let mut system_parts: Vec<String> = messages
        .iter()
        .filter(|m| m.role == "system")
        .map(|m| m.content.clone())
        .collect();

    if let Some(schema) = &options.response_schema {
        system_parts.push(format!(
            "Respond with a single JSON object that conforms to this JSON schema and nothing else:\n{}",
            schema
        ));
    }

    let rest = messages
        .iter()
        .filter(|m| m.role != "system")
        .cloned()
        .collect();

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, rest)
}

/// Build request for Gemini API
fn build_gemini_request(
    provider: &LlmProviderConfig,
    messages: &[ChatMessage],
    options: &ChatOptions,
) -> (String, Value) {
    let url = format!(
        "{}/models/{}:generateContent",
        provider.base_url, provider.model
    );

    let (system, turns) = split_system(messages, options);
    let contents: Vec<Value> = turns
        .iter()
        .map(|m| {
            let role = if m.role == "assistant" { "model" } else { "user" };
            json!({"role": role, "parts": [{"text": m.content}]})
        })
        .collect();

    let mut generation_config = json!({
        "maxOutputTokens": options.max_tokens,
        "temperature": options.temperature
    });
    if options.response_schema.is_some() {
        generation_config["responseMimeType"] = json!("application/json");
    }

    let mut body = json!({
        "contents": contents,
        "generationConfig": generation_config
    });
    if let Some(system) = system {
        body["systemInstruction"] = json!({"parts": [{"text": system}]});
    }

    (url, body)
}

/// Build request for OpenAI-compatible APIs
fn build_openai_request(
    provider: &LlmProviderConfig,
    messages: &[ChatMessage],
    options: &ChatOptions,
) -> (String, Value) {
    let url = format!("{}/chat/completions", provider.base_url);

    let mut body = json!({
        "model": provider.model,
        "messages": messages,
        "max_tokens": options.max_tokens,
        "temperature": options.temperature
    });

    if let Some(schema) = &options.response_schema {
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": {"name": "response", "schema": schema}
        });
    }

    (url, body)
}

/// Build request for Anthropic Messages API
fn build_anthropic_request(
    provider: &LlmProviderConfig,
    messages: &[ChatMessage],
    options: &ChatOptions,
) -> (String, Value) {
    let url = format!("{}/messages", provider.base_url);

    let (system, turns) = split_system(messages, options);
    let mut body = json!({
        "model": provider.model,
        "messages": turns,
        "max_tokens": options.max_tokens,
        "temperature": options.temperature
    });
    if let Some(system) = system {
        body["system"] = json!(system);
    }

    (url, body)
}

/// Parse response from different API formats
fn parse_response(provider: &str, text: &str) -> Result<String> {
    let response: LlmResponse = serde_json::from_str(text)
        .map_err(|e| Error::Llm(format!("Failed to parse response: {}", e)))?;

    if let Some(error) = response.error {
        return Err(Error::Llm(error.message));
    }

    if let Some(content) = response.content {
        let text: String = content.into_iter().filter_map(|c| c.text).collect();
        if !text.is_empty() {
            return Ok(text);
        }
    }

    if let Some(candidates) = response.candidates {
        if let Some(candidate) = candidates.into_iter().next() {
            let text: String = candidate.content.parts.into_iter().map(|p| p.text).collect();
            if !text.is_empty() {
                return Ok(text);
            }
        }
    }

    if let Some(choices) = response.choices {
        if let Some(choice) = choices.into_iter().next() {
            if let Some(content) = choice.message.and_then(|m| m.content) {
                return Ok(content);
            }
            if let Some(text) = choice.text {
                return Ok(text);
            }
        }
    }

    Err(Error::Llm(format!("No content in {} response", provider)))
}

/// Extract a JSON object from model output.
///
/// Looks for a fenced ```json block, then any fenced block, then the
/// first balanced `{...}` span.
pub fn extract_json(text: &str) -> Option<Value> {
    if let Ok(json) = serde_json::from_str::<Value>(text.trim()) {
        if json.is_object() {
            return Some(json);
        }
    }

    if let Some(start) = text.find("```json") {
        let start = start + 7;
        if let Some(end) = text[start..].find("```") {
            if let Ok(json) = serde_json::from_str(&text[start..start + end]) {
                return Some(json);
            }
        }
    }

    if let Some(start) = text.find("```") {
        let start = start + 3;
        // Skip language identifier if present
        let start = text[start..]
            .find('\n')
            .map(|i| start + i + 1)
            .unwrap_or(start);
        if let Some(end) = text[start..].find("```") {
            if let Ok(json) = serde_json::from_str(&text[start..start + end]) {
                return Some(json);
            }
        }
    }

    if let Some(start) = text.find('{') {
        let mut depth = 0;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = start;
        for (i, c) in text[start..].char_indices() {
            if in_string {
                match c {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '"' => in_string = false,
                    _ => {}
                }
                continue;
            }
            match c {
                '"' => in_string = true,
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = start + i + 1;
                        break;
                    }
                }
                _ => {}
            }
        }
        if end > start {
            if let Ok(json) = serde_json::from_str(&text[start..end]) {
                return Some(json);
            }
        }
    }

    None
}
