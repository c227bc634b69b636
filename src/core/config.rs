use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::services::llm::LlmConfig;
use crate::services::media::{ImageConfig, VideoConfig};
use crate::services::tts::TtsConfig;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_project")]
    pub project_folder: String,

    #[serde(default = "default_export")]
    pub export_folder: String,

    /// Run every phase without asking between them.
    #[serde(default)]
    pub unattended: bool,

    pub llm: LlmConfig,

    pub image: ImageConfig,

    pub video: VideoConfig,

    #[serde(default)]
    pub tts: Option<TtsConfig>,

    #[serde(default)]
    pub pipeline: PipelineSettings,
}

/// Batch sizes, pacing and fan-out limits for the orchestration loops.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PipelineSettings {
    #[serde(default = "default_story_count")]
    pub story_count: usize,
    #[serde(default = "default_image_batch_size")]
    pub image_batch_size: usize,
    #[serde(default = "default_video_batch_size")]
    pub video_batch_size: usize,
    #[serde(default = "default_inter_batch_delay_ms")]
    pub inter_batch_delay_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_chunk_size")]
    pub poll_chunk_size: usize,
    #[serde(default = "default_poll_chunk_gap_ms")]
    pub poll_chunk_gap_ms: u64,
    #[serde(default = "default_image_variants")]
    pub image_variants: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            story_count: default_story_count(),
            image_batch_size: default_image_batch_size(),
            video_batch_size: default_video_batch_size(),
            inter_batch_delay_ms: default_inter_batch_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_chunk_size: default_poll_chunk_size(),
            poll_chunk_gap_ms: default_poll_chunk_gap_ms(),
            image_variants: default_image_variants(),
        }
    }
}

impl PipelineSettings {
    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_chunk_gap(&self) -> Duration {
        Duration::from_millis(self.poll_chunk_gap_ms)
    }
}

fn default_project() -> String {
    "project".to_string()
}
fn default_export() -> String {
    "export".to_string()
}
fn default_story_count() -> usize {
    5
}
fn default_image_batch_size() -> usize {
    10
}
fn default_video_batch_size() -> usize {
    8
}
fn default_inter_batch_delay_ms() -> u64 {
    500
}
fn default_poll_interval_ms() -> u64 {
    4000
}
fn default_poll_chunk_size() -> usize {
    20
}
fn default_poll_chunk_gap_ms() -> u64 {
    200
}
fn default_image_variants() -> usize {
    4
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.yml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("{} not found. Please create one.", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write("config.yml", content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.project_folder)?;
        fs::create_dir_all(&self.export_folder)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_fills_pipeline_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.yml");
        fs::write(
            &path,
            r#"
llm:
  provider: gemini
  gemini:
    api_key: key
    model: gemini-2.5-flash
image:
  provider: fal
  api_key: fal-key
video:
  provider: replicate
  api_key: r8-key
  model: kwaivgi/kling-v2.1
"#,
        )?;

        let config = Config::load_from(&path)?;
        assert_eq!(config.project_folder, "project");
        assert_eq!(config.pipeline, PipelineSettings::default());
        assert_eq!(config.pipeline.image_batch_size, 10);
        assert_eq!(config.pipeline.video_batch_size, 8);
        assert_eq!(config.pipeline.poll_interval(), Duration::from_millis(4000));
        assert_eq!(config.video.allowed_durations, vec![6, 8, 10]);
        assert!(config.tts.is_none());
        assert!(!config.unattended);
        Ok(())
    }

    #[test]
    fn test_missing_config_is_reported() {
        let err = Config::load_from(Path::new("/nonexistent/config.yml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
