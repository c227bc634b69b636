use crate::core::config::Config;
use crate::core::state::{Scene, SceneImagePrompts, ScenePlan, SelectedImagePrompt, Story, VideoPrompt};
use crate::services::llm::{create_llm, LlmClient};
use crate::services::media::{create_image_client, create_video_client, ImageClient, VideoClient};
use crate::services::poller::JobPoll;
use crate::services::prompts::{self, SceneConstraints, StoryConstraints, SYSTEM_PROMPT};
use crate::services::tts::{create_tts_client, TtsClient};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;

/// Everything the pipeline asks of the outside world. The orchestration code
/// only sees this trait; which vendors sit behind it is a configuration matter.
#[async_trait]
pub trait GenerationGateway: Send + Sync {
    async fn generate_story_candidates(&self, topic: &str, constraints: &StoryConstraints) -> Result<Vec<Story>>;

    async fn generate_scene_plan(&self, story: &Story, constraints: &SceneConstraints) -> Result<ScenePlan>;

    async fn generate_image_prompts_for_scenes(&self, scenes: &[Scene]) -> Result<Vec<SceneImagePrompts>>;

    /// `Ok` carries the image url, `Err` the reason it could not be rendered.
    async fn generate_image(&self, prompt: &str, aspect_ratio: &str) -> Result<String>;

    async fn generate_video_prompts_for_scenes(
        &self,
        scenes: &[Scene],
        selected: &[SelectedImagePrompt],
    ) -> Result<Vec<VideoPrompt>>;

    /// Returns the job handle of a queued render.
    async fn submit_video_job(&self, prompt: &str, duration_seconds: u32, image_url: Option<&str>) -> Result<String>;

    /// `Err` is a failed status request; a failed render is `Ok` with a failed status.
    async fn poll_video_job(&self, job_id: &str) -> Result<JobPoll>;

    async fn generate_speech(&self, text: &str, voice_id: &str) -> Result<Vec<u8>>;

    /// Name recorded on each job so a resumed session polls the right backend.
    fn video_provider(&self) -> String;

    /// Clip lengths, in seconds, the video backend accepts.
    fn allowed_durations(&self) -> Vec<u32>;

    fn image_aspect_ratio(&self) -> String {
        "16:9".to_string()
    }
}

/// Gateway assembled from one client per capability.
pub struct ProviderGateway {
    llm: Box<dyn LlmClient>,
    image: Box<dyn ImageClient>,
    video: Box<dyn VideoClient>,
    tts: Option<Box<dyn TtsClient>>,
    image_variants: usize,
    aspect_ratio: String,
    allowed_durations: Vec<u32>,
}

impl ProviderGateway {
    pub fn new(
        llm: Box<dyn LlmClient>,
        image: Box<dyn ImageClient>,
        video: Box<dyn VideoClient>,
        tts: Option<Box<dyn TtsClient>>,
    ) -> Self {
        Self {
            llm,
            image,
            video,
            tts,
            image_variants: 4,
            aspect_ratio: "16:9".to_string(),
            allowed_durations: vec![6, 8, 10],
        }
    }

    pub fn with_image_variants(mut self, variants: usize) -> Self {
        self.image_variants = variants.max(1);
        self
    }

    pub fn with_aspect_ratio(mut self, aspect_ratio: &str) -> Self {
        self.aspect_ratio = aspect_ratio.to_string();
        self
    }

    pub fn with_allowed_durations(mut self, allowed: Vec<u32>) -> Self {
        self.allowed_durations = allowed;
        self
    }
}

pub fn create_gateway(config: &Config) -> Result<Arc<dyn GenerationGateway>> {
    let llm = create_llm(&config.llm)?;
    let image = create_image_client(&config.image)?;
    let video = create_video_client(&config.video)?;
    let tts = config.tts.as_ref().map(create_tts_client).transpose()?;

    Ok(Arc::new(
        ProviderGateway::new(llm, image, video, tts)
            .with_image_variants(config.pipeline.image_variants)
            .with_aspect_ratio(&config.image.aspect_ratio)
            .with_allowed_durations(config.video.allowed_durations.clone()),
    ))
}

#[async_trait]
impl GenerationGateway for ProviderGateway {
    async fn generate_story_candidates(&self, topic: &str, constraints: &StoryConstraints) -> Result<Vec<Story>> {
        let reply = self.llm.chat(SYSTEM_PROMPT, &prompts::story_prompt(topic, constraints)).await?;
        prompts::parse_stories(&reply)
    }

    async fn generate_scene_plan(&self, story: &Story, constraints: &SceneConstraints) -> Result<ScenePlan> {
        let prompt = prompts::scene_plan_prompt(story, constraints)?;
        let reply = self.llm.chat(SYSTEM_PROMPT, &prompt).await?;
        prompts::parse_scene_plan(&reply)
    }

    async fn generate_image_prompts_for_scenes(&self, scenes: &[Scene]) -> Result<Vec<SceneImagePrompts>> {
        let prompt = prompts::image_prompts_prompt(scenes, self.image_variants)?;
        let reply = self.llm.chat(SYSTEM_PROMPT, &prompt).await?;
        let parsed = prompts::parse_image_prompts(&reply, self.image_variants)?;
        debug!("Image prompts for {} of {} scenes", parsed.len(), scenes.len());
        Ok(parsed)
    }

    async fn generate_image(&self, prompt: &str, aspect_ratio: &str) -> Result<String> {
        self.image.generate(prompt, aspect_ratio).await
    }

    async fn generate_video_prompts_for_scenes(
        &self,
        scenes: &[Scene],
        selected: &[SelectedImagePrompt],
    ) -> Result<Vec<VideoPrompt>> {
        let prompt = prompts::video_prompts_prompt(scenes, selected)?;
        let reply = self.llm.chat(SYSTEM_PROMPT, &prompt).await?;
        prompts::parse_video_prompts(&reply)
    }

    async fn submit_video_job(&self, prompt: &str, duration_seconds: u32, image_url: Option<&str>) -> Result<String> {
        self.video.submit(prompt, duration_seconds, image_url).await
    }

    async fn poll_video_job(&self, job_id: &str) -> Result<JobPoll> {
        self.video.poll(job_id).await
    }

    async fn generate_speech(&self, text: &str, voice_id: &str) -> Result<Vec<u8>> {
        let tts = self.tts.as_ref().ok_or_else(|| anyhow!("No TTS provider configured"))?;
        tts.synthesize(text, voice_id).await
    }

    fn video_provider(&self) -> String {
        self.video.provider().to_string()
    }

    fn allowed_durations(&self) -> Vec<u32> {
        self.allowed_durations.clone()
    }

    fn image_aspect_ratio(&self) -> String {
        self.aspect_ratio.clone()
    }
}
