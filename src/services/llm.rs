use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    pub provider: String, // "gemini", "ollama" or "openai"
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    pub gemini: Option<GeminiConfig>,
    pub ollama: Option<OllamaConfig>,
    pub openai: Option<OpenAIConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
}

fn default_retry_count() -> usize {
    2
}
fn default_retry_delay() -> u64 {
    5
}

#[async_trait]
pub trait LlmClient: Send + Sync + Debug {
    async fn chat(&self, system: &str, user: &str) -> Result<String>;
}

pub fn create_llm(config: &LlmConfig) -> Result<Box<dyn LlmClient>> {
    let inner: Box<dyn LlmClient> = match config.provider.as_str() {
        "gemini" => {
            let cfg = config.gemini.as_ref().context("Gemini config missing")?;
            Box::new(GeminiClient::new(&cfg.api_key, &cfg.model))
        }
        "ollama" => {
            let cfg = config.ollama.as_ref().context("Ollama config missing")?;
            Box::new(OllamaClient::new(&cfg.base_url, &cfg.model))
        }
        "openai" => {
            let cfg = config.openai.as_ref().context("OpenAI config missing")?;
            Box::new(OpenAIClient::new(&cfg.api_key, &cfg.model, cfg.base_url.as_deref()))
        }
        _ => return Err(anyhow!("Unknown LLM provider: {}", config.provider)),
    };

    Ok(Box::new(RetryingLlm::new(
        inner,
        config.retry_count,
        Duration::from_secs(config.retry_delay_seconds),
    )))
}

/// Retries a failed chat a fixed number of times with a fixed pause.
#[derive(Debug)]
pub struct RetryingLlm {
    inner: Box<dyn LlmClient>,
    retries: usize,
    delay: Duration,
}

impl RetryingLlm {
    pub fn new(inner: Box<dyn LlmClient>, retries: usize, delay: Duration) -> Self {
        Self { inner, retries, delay }
    }
}

#[async_trait]
impl LlmClient for RetryingLlm {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.inner.chat(system, user).await {
                Ok(text) => return Ok(text),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!("LLM call failed (attempt {}/{}): {:#}", attempt, self.retries + 1, e);
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                }
                Err(e) => return Err(e.context(format!("LLM call failed after {} attempts", attempt + 1))),
            }
        }
    }
}

async fn error_body(resp: reqwest::Response, provider: &str) -> anyhow::Error {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    anyhow!("{} API error ({}): {}", provider, status, body)
}

// --- Gemini ---

#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    system_instruction: GeminiContent,
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    response_mime_type: String,
}

#[derive(Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiCandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

impl GeminiResponse {
    fn into_text(self) -> Result<String> {
        if let Some(err) = self.error {
            return Err(anyhow!("Gemini API returned error: {}", err.message));
        }
        let candidate = self
            .candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| anyhow!("Gemini response has no candidates"))?;

        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().map(|p| p.text).collect())
            .unwrap_or_default();
        if text.is_empty() {
            let reason = candidate.finish_reason.as_deref().unwrap_or("UNKNOWN");
            return Err(anyhow!("Gemini response empty. Finish reason: {}", reason));
        }
        Ok(text)
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        );
        let body = GeminiRequest {
            contents: vec![GeminiContent {
                role: Some("user".to_string()),
                parts: vec![GeminiPart { text: user.to_string() }],
            }],
            system_instruction: GeminiContent {
                role: None,
                parts: vec![GeminiPart { text: system.to_string() }],
            },
            generation_config: GeminiGenerationConfig {
                response_mime_type: "application/json".to_string(),
            },
        };

        debug!("Gemini request to {} ({} chars)", self.model, user.len());
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_body(resp, "Gemini").await);
        }

        let text = resp.text().await?;
        let parsed: GeminiResponse = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse Gemini response: {}", text))?;
        parsed.into_text()
    }
}

// --- Chat-completion style providers (OpenAI, Ollama) ---

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

fn chat_messages(system: &str, user: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage {
            role: "system",
            content: system.to_string(),
        },
        ChatMessage {
            role: "user",
            content: user.to_string(),
        },
    ]
}

#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    format: &'static str,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}

#[async_trait]
impl LlmClient for OllamaClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let body = OllamaRequest {
            model: self.model.clone(),
            messages: chat_messages(system, user),
            stream: false,
            format: "json",
        };

        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_body(resp, "Ollama").await);
        }

        let result: OllamaResponse = resp.json().await?;
        Ok(result.message.content)
    }
}

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(api_key: &str, model: &str, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessage,
}

#[derive(Deserialize)]
struct OpenAIMessage {
    content: Option<String>,
}

#[async_trait]
impl LlmClient for OpenAIClient {
    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let body = OpenAIRequest {
            model: self.model.clone(),
            messages: chat_messages(system, user),
        };

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_body(resp, "OpenAI").await);
        }

        let result: OpenAIResponse = resp.json().await?;
        result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("OpenAI response empty or missing content"))
    }
}
