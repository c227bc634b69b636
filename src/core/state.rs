use crate::services::batch::Batch;
use crate::services::poller::Job;
use crate::services::progress::ProgressState;
use crate::utils::duration::clamp_duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of one unit of work within a phase: `"{scene}_{variant}"`.
pub fn item_key(scene_number: u32, variant_index: u32) -> String {
    format!("{}_{}", scene_number, variant_index)
}

pub fn parse_item_key(key: &str) -> Option<(u32, u32)> {
    let (scene, variant) = key.split_once('_')?;
    Some((scene.parse().ok()?, variant.parse().ok()?))
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    #[default]
    Idle,
    Running,
    Paused,
    Stopped,
}

impl GenerationState {
    /// Paused and stopped both mean "issue no further work".
    pub fn is_halted(self) -> bool {
        matches!(self, GenerationState::Paused | GenerationState::Stopped)
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum GenerationPhase {
    ScenePlan,
    ImagePrompts,
    Images,
    VideoPrompts,
    Videos,
}

impl fmt::Display for GenerationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GenerationPhase::ScenePlan => "scene plan",
            GenerationPhase::ImagePrompts => "image prompts",
            GenerationPhase::Images => "images",
            GenerationPhase::VideoPrompts => "video prompts",
            GenerationPhase::Videos => "videos",
        };
        f.write_str(name)
    }
}

/// Which progress ledger an observer is asking about.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProgressKind {
    Images,
    Videos,
}

/// Which batched LLM phase a batch list belongs to.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BatchKind {
    ImagePrompts,
    VideoPrompts,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub scene_number: u32,
    pub variant_index: u32,
    pub payload: String,
}

impl WorkItem {
    pub fn key(&self) -> String {
        item_key(self.scene_number, self.variant_index)
    }
}

/// Anything produced per scene that a batch retry may replace.
pub trait SceneKeyed {
    fn scene_number(&self) -> u32;
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub era: Option<String>,
    #[serde(default)]
    pub hook: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    pub scene_number: u32,
    pub title: String,
    pub description: String,
    pub duration_seconds: f64,
    #[serde(default)]
    pub narration: Option<String>,
}

impl SceneKeyed for Scene {
    fn scene_number(&self) -> u32 {
        self.scene_number
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScenePlan {
    pub scenes: Vec<Scene>,
}

impl ScenePlan {
    pub fn clamp_durations(&mut self, allowed: &[u32]) {
        for scene in &mut self.scenes {
            if let Some(d) = clamp_duration(scene.duration_seconds, allowed) {
                scene.duration_seconds = f64::from(d);
            }
        }
    }

    pub fn scene(&self, scene_number: u32) -> Option<&Scene> {
        self.scenes.iter().find(|s| s.scene_number == scene_number)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SceneImagePrompts {
    pub scene_number: u32,
    pub prompts: Vec<String>,
}

impl SceneKeyed for SceneImagePrompts {
    fn scene_number(&self) -> u32 {
        self.scene_number
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImage {
    pub scene_number: u32,
    pub variant_index: u32,
    pub prompt: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl GeneratedImage {
    pub fn key(&self) -> String {
        item_key(self.scene_number, self.variant_index)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoPrompt {
    pub scene_number: u32,
    pub prompt: String,
    #[serde(default)]
    pub duration_seconds: f64,
}

impl SceneKeyed for VideoPrompt {
    fn scene_number(&self) -> u32 {
        self.scene_number
    }
}

/// The image prompt (and rendered url, if any) chosen to seed a scene's video.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelectedImagePrompt {
    pub scene_number: u32,
    pub prompt: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Creative artifacts produced so far. Urls and artifact keys only, never bytes.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub stories: Vec<Story>,
    #[serde(default)]
    pub selected_story: Option<Story>,
    #[serde(default)]
    pub scene_plan: Option<ScenePlan>,
    #[serde(default)]
    pub images: BTreeMap<String, GeneratedImage>,
    #[serde(default)]
    pub selected_images: BTreeMap<u32, u32>,
    #[serde(default)]
    pub narration: BTreeMap<u32, String>,
}

impl Project {
    pub fn selected_image(&self, scene_number: u32) -> Option<&GeneratedImage> {
        let variant = self.selected_images.get(&scene_number)?;
        self.images.get(&item_key(scene_number, *variant))
    }
}

/// Everything needed to pick a run back up after a restart.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSnapshot {
    #[serde(default)]
    pub state: GenerationState,
    #[serde(default)]
    pub phase: Option<GenerationPhase>,
    #[serde(default)]
    pub phase_error: Option<String>,
    #[serde(default)]
    pub project: Project,
    #[serde(default)]
    pub image_prompts: Vec<SceneImagePrompts>,
    #[serde(default)]
    pub image_prompt_batches: Vec<Batch>,
    #[serde(default)]
    pub video_prompts: Vec<VideoPrompt>,
    #[serde(default)]
    pub video_prompt_batches: Vec<Batch>,
    #[serde(default)]
    pub image_progress: ProgressState,
    #[serde(default)]
    pub video_progress: ProgressState,
    #[serde(default)]
    pub jobs: BTreeMap<u32, Job>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_key_format() {
        assert_eq!(item_key(12, 3), "12_3");
        assert_eq!(parse_item_key("12_3"), Some((12, 3)));
        assert_eq!(parse_item_key("12"), None);
        assert_eq!(parse_item_key("a_b"), None);

        let item = WorkItem {
            scene_number: 4,
            variant_index: 0,
            payload: "a harbor at dawn".to_string(),
        };
        assert_eq!(item.key(), "4_0");
    }

    #[test]
    fn test_scene_plan_clamps_to_allowed_set() {
        let mut plan = ScenePlan {
            scenes: vec![
                Scene {
                    scene_number: 1,
                    title: "Arrival".to_string(),
                    description: "".to_string(),
                    duration_seconds: 7.0,
                    narration: None,
                },
                Scene {
                    scene_number: 2,
                    title: "Siege".to_string(),
                    description: "".to_string(),
                    duration_seconds: 13.2,
                    narration: None,
                },
            ],
        };
        plan.clamp_durations(&[6, 8, 10]);
        assert_eq!(plan.scenes[0].duration_seconds, 8.0);
        assert_eq!(plan.scenes[1].duration_seconds, 10.0);
    }

    #[test]
    fn test_halted_states() {
        assert!(GenerationState::Paused.is_halted());
        assert!(GenerationState::Stopped.is_halted());
        assert!(!GenerationState::Running.is_halted());
        assert!(!GenerationState::Idle.is_halted());
    }

    #[test]
    fn test_snapshot_serializes_phase_in_camel_case() -> anyhow::Result<()> {
        let snapshot = PipelineSnapshot {
            state: GenerationState::Paused,
            phase: Some(GenerationPhase::VideoPrompts),
            ..Default::default()
        };
        let json = serde_json::to_string(&snapshot)?;
        assert!(json.contains("\"state\":\"paused\""));
        assert!(json.contains("\"phase\":\"videoPrompts\""));

        let back: PipelineSnapshot = serde_json::from_str(&json)?;
        assert_eq!(back.phase, Some(GenerationPhase::VideoPrompts));
        Ok(())
    }
}
