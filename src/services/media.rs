use crate::services::poller::JobPoll;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// --- Config ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default = "default_image_provider")]
    pub provider: String, // "fal"
    pub api_key: String,
    #[serde(default = "default_image_model")]
    pub model: String,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VideoConfig {
    pub provider: String, // "fal" or "replicate"
    pub api_key: String,
    pub model: String,
    #[serde(default = "default_allowed_durations")]
    pub allowed_durations: Vec<u32>,
}

fn default_image_provider() -> String {
    "fal".to_string()
}
fn default_image_model() -> String {
    "fal-ai/flux/schnell".to_string()
}
fn default_aspect_ratio() -> String {
    "16:9".to_string()
}
fn default_allowed_durations() -> Vec<u32> {
    vec![6, 8, 10]
}

// --- Traits ---

#[async_trait]
pub trait ImageClient: Send + Sync {
    /// Render one image and return where it can be fetched.
    async fn generate(&self, prompt: &str, aspect_ratio: &str) -> Result<String>;
}

#[async_trait]
pub trait VideoClient: Send + Sync {
    /// Queue an image-to-video render and return the provider's job handle.
    async fn submit(&self, prompt: &str, duration_seconds: u32, image_url: Option<&str>) -> Result<String>;
    /// `Err` means the status request itself failed, not the render.
    async fn poll(&self, job_id: &str) -> Result<JobPoll>;
    fn provider(&self) -> &str;
}

pub fn create_image_client(config: &ImageConfig) -> Result<Box<dyn ImageClient>> {
    match config.provider.as_str() {
        "fal" => Ok(Box::new(FalImageClient::new(&config.api_key, &config.model))),
        _ => Err(anyhow!("Unknown image provider: {}", config.provider)),
    }
}

pub fn create_video_client(config: &VideoConfig) -> Result<Box<dyn VideoClient>> {
    match config.provider.as_str() {
        "fal" => Ok(Box::new(FalVideoClient::new(&config.api_key, &config.model))),
        "replicate" => Ok(Box::new(ReplicateVideoClient::new(&config.api_key, &config.model))),
        _ => Err(anyhow!("Unknown video provider: {}", config.provider)),
    }
}

fn fal_image_size(aspect_ratio: &str) -> &'static str {
    match aspect_ratio {
        "9:16" => "portrait_16_9",
        "1:1" => "square_hd",
        "4:3" => "landscape_4_3",
        "3:4" => "portrait_4_3",
        _ => "landscape_16_9",
    }
}

async fn ensure_success(resp: reqwest::Response, provider: &str) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(anyhow!("{} API error ({}): {}", provider, status, body))
}

// --- fal.ai ---

pub struct FalImageClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl FalImageClient {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct FalImageResponse {
    #[serde(default)]
    images: Vec<FalFile>,
}

#[derive(Deserialize)]
struct FalFile {
    url: String,
}

#[async_trait]
impl ImageClient for FalImageClient {
    async fn generate(&self, prompt: &str, aspect_ratio: &str) -> Result<String> {
        let resp = self
            .client
            .post(format!("https://fal.run/{}", self.model))
            .header("Authorization", format!("Key {}", self.api_key))
            .json(&json!({
                "prompt": prompt,
                "image_size": fal_image_size(aspect_ratio),
                "num_images": 1,
            }))
            .send()
            .await
            .context("Failed to send fal image request")?;
        let result: FalImageResponse = ensure_success(resp, "fal").await?.json().await?;
        result
            .images
            .into_iter()
            .next()
            .map(|f| f.url)
            .ok_or_else(|| anyhow!("fal returned no images"))
    }
}

pub struct FalVideoClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl FalVideoClient {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Queue paths address the owner/app part of the model id only.
    fn app_path(&self) -> String {
        self.model.split('/').take(2).collect::<Vec<_>>().join("/")
    }
}

#[derive(Deserialize)]
struct FalQueued {
    request_id: String,
}

#[derive(Deserialize)]
struct FalStatus {
    status: String,
}

#[derive(Deserialize)]
struct FalVideoResult {
    video: Option<FalFile>,
}

#[async_trait]
impl VideoClient for FalVideoClient {
    async fn submit(&self, prompt: &str, duration_seconds: u32, image_url: Option<&str>) -> Result<String> {
        let mut body = json!({
            "prompt": prompt,
            "duration": duration_seconds.to_string(),
        });
        if let Some(url) = image_url {
            body["image_url"] = Value::String(url.to_string());
        }

        let resp = self
            .client
            .post(format!("https://queue.fal.run/{}", self.model))
            .header("Authorization", format!("Key {}", self.api_key))
            .json(&body)
            .send()
            .await
            .context("Failed to submit fal video job")?;
        let queued: FalQueued = ensure_success(resp, "fal").await?.json().await?;
        debug!("fal queued video request {}", queued.request_id);
        Ok(queued.request_id)
    }

    async fn poll(&self, job_id: &str) -> Result<JobPoll> {
        let base = format!("https://queue.fal.run/{}/requests/{}", self.app_path(), job_id);
        let resp = self
            .client
            .get(format!("{}/status", base))
            .header("Authorization", format!("Key {}", self.api_key))
            .send()
            .await?;
        let status: FalStatus = ensure_success(resp, "fal").await?.json().await?;

        match status.status.as_str() {
            "IN_QUEUE" | "IN_PROGRESS" => Ok(JobPoll::pending()),
            "COMPLETED" => {
                let resp = self
                    .client
                    .get(&base)
                    .header("Authorization", format!("Key {}", self.api_key))
                    .send()
                    .await?;
                if !resp.status().is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    return Ok(JobPoll::failed(format!("fal render failed: {}", body)));
                }
                let result: FalVideoResult = resp.json().await?;
                Ok(match result.video {
                    Some(file) => JobPoll::completed(file.url),
                    None => JobPoll::failed("fal returned no video".to_string()),
                })
            }
            other => Ok(JobPoll::failed(format!("fal status {}", other))),
        }
    }

    fn provider(&self) -> &str {
        "fal"
    }
}

// --- Replicate ---

pub struct ReplicateVideoClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl ReplicateVideoClient {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct ReplicatePrediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

impl ReplicatePrediction {
    fn into_poll(self) -> JobPoll {
        match self.status.as_str() {
            "succeeded" => match replicate_output_url(self.output.as_ref()) {
                Some(url) => JobPoll::completed(url),
                None => JobPoll::failed("replicate returned no output".to_string()),
            },
            "failed" | "canceled" => JobPoll::failed(
                self.error
                    .map(|e| e.as_str().map(str::to_string).unwrap_or_else(|| e.to_string()))
                    .unwrap_or_else(|| format!("prediction {}", self.status)),
            ),
            _ => JobPoll::pending(),
        }
    }
}

fn replicate_output_url(output: Option<&Value>) -> Option<String> {
    match output? {
        Value::String(url) => Some(url.clone()),
        Value::Array(items) => items.iter().find_map(|v| v.as_str().map(str::to_string)),
        _ => None,
    }
}

#[async_trait]
impl VideoClient for ReplicateVideoClient {
    async fn submit(&self, prompt: &str, duration_seconds: u32, image_url: Option<&str>) -> Result<String> {
        let mut input = json!({
            "prompt": prompt,
            "duration": duration_seconds,
        });
        if let Some(url) = image_url {
            input["start_image"] = Value::String(url.to_string());
        }

        let resp = self
            .client
            .post(format!("https://api.replicate.com/v1/models/{}/predictions", self.model))
            .bearer_auth(&self.api_key)
            .json(&json!({ "input": input }))
            .send()
            .await
            .context("Failed to submit replicate prediction")?;
        let prediction: ReplicatePrediction = ensure_success(resp, "Replicate").await?.json().await?;
        debug!("replicate prediction {} is {}", prediction.id, prediction.status);
        Ok(prediction.id)
    }

    async fn poll(&self, job_id: &str) -> Result<JobPoll> {
        let resp = self
            .client
            .get(format!("https://api.replicate.com/v1/predictions/{}", job_id))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let prediction: ReplicatePrediction = ensure_success(resp, "Replicate").await?.json().await?;
        Ok(prediction.into_poll())
    }

    fn provider(&self) -> &str {
        "replicate"
    }
}
