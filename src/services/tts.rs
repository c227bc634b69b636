use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::json;

// --- Config ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TtsConfig {
    #[serde(default = "default_tts_provider")]
    pub provider: String, // "elevenlabs"
    pub api_key: String,
    #[serde(default)]
    pub voice_id: Option<String>,
    #[serde(default = "default_tts_model")]
    pub model: String,
}

fn default_tts_provider() -> String {
    "elevenlabs".to_string()
}
fn default_tts_model() -> String {
    "eleven_multilingual_v2".to_string()
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Voice {
    pub voice_id: String,
    pub name: String,
    #[serde(default)]
    pub category: Option<String>,
}

#[async_trait]
pub trait TtsClient: Send + Sync {
    async fn list_voices(&self) -> Result<Vec<Voice>>;
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>>;
}

pub fn create_tts_client(config: &TtsConfig) -> Result<Box<dyn TtsClient>> {
    info!("Initializing TTS client for provider: {}", config.provider);
    match config.provider.as_str() {
        "elevenlabs" => Ok(Box::new(ElevenLabsClient::new(&config.api_key, &config.model))),
        _ => Err(anyhow!("Unknown TTS provider: {}", config.provider)),
    }
}

// --- ElevenLabs ---

const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io/v1";

pub struct ElevenLabsClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl ElevenLabsClient {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct VoiceList {
    voices: Vec<Voice>,
}

#[async_trait]
impl TtsClient for ElevenLabsClient {
    async fn list_voices(&self) -> Result<Vec<Voice>> {
        let resp = self
            .client
            .get(format!("{}/voices", ELEVENLABS_BASE_URL))
            .header("xi-api-key", &self.api_key)
            .send()
            .await
            .context("Failed to list ElevenLabs voices")?;
        if !resp.status().is_success() {
            return Err(anyhow!("Failed to list voices: {}", resp.status()));
        }
        let list: VoiceList = resp.json().await?;
        Ok(list.voices)
    }

    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<u8>> {
        debug!("Synthesizing {} chars with voice {}", text.len(), voice_id);
        let resp = self
            .client
            .post(format!("{}/text-to-speech/{}", ELEVENLABS_BASE_URL, voice_id))
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/mpeg")
            .json(&json!({
                "text": text,
                "model_id": self.model,
            }))
            .send()
            .await
            .context("Failed to send ElevenLabs request")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("ElevenLabs API error ({}): {}", status, body));
        }
        Ok(resp.bytes().await?.to_vec())
    }
}
