use crate::core::error::PipelineError;
use crate::core::io::{write_json, Storage};
use crate::core::state::{GenerationPhase, PipelineSnapshot};
use crate::services::poller::JobStatus;
use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportScene {
    pub scene_number: u32,
    pub title: String,
    pub description: String,
    pub duration_seconds: f64,
    pub narration: Option<String>,
    pub image_prompt: Option<String>,
    pub image_url: Option<String>,
    pub video_prompt: Option<String>,
    pub video_url: Option<String>,
    pub video_status: Option<JobStatus>,
    pub audio_key: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
    pub topic: Option<String>,
    pub title: String,
    pub summary: String,
    pub scenes: Vec<ExportScene>,
}

impl ExportBundle {
    /// Scenes that have every visual artifact a final cut needs.
    pub fn complete_scenes(&self) -> usize {
        self.scenes
            .iter()
            .filter(|s| s.image_url.is_some() && s.video_url.is_some())
            .count()
    }
}

pub struct ExportAssembler;

impl ExportAssembler {
    /// Build the per-scene manifest in scene order from a pipeline snapshot.
    pub fn assemble(snapshot: &PipelineSnapshot) -> std::result::Result<ExportBundle, PipelineError> {
        let project = &snapshot.project;
        let plan = project
            .scene_plan
            .as_ref()
            .ok_or(PipelineError::NoScenePlan(GenerationPhase::Videos))?;

        let scenes = plan
            .scenes
            .iter()
            .map(|scene| {
                let n = scene.scene_number;
                let image = project.selected_image(n);
                let video_prompt = snapshot.video_prompts.iter().find(|v| v.scene_number == n);
                let job = snapshot.jobs.get(&n);
                ExportScene {
                    scene_number: n,
                    title: scene.title.clone(),
                    description: scene.description.clone(),
                    duration_seconds: scene.duration_seconds,
                    narration: scene.narration.clone(),
                    image_prompt: image.map(|i| i.prompt.clone()),
                    image_url: image.and_then(|i| i.url.clone()),
                    video_prompt: video_prompt.map(|v| v.prompt.clone()),
                    video_url: job.and_then(|j| j.url.clone()),
                    video_status: job.map(|j| j.status),
                    audio_key: project.narration.get(&n).cloned(),
                }
            })
            .collect();

        let (title, summary) = match &project.selected_story {
            Some(story) => (story.title.clone(), story.summary.clone()),
            None => (String::new(), String::new()),
        };

        Ok(ExportBundle {
            topic: project.topic.clone(),
            title,
            summary,
            scenes,
        })
    }

    /// Write `manifest.json` under `dir` and return its path.
    pub async fn write(bundle: &ExportBundle, storage: &dyn Storage, dir: &str) -> Result<String> {
        let path = Path::new(dir).join("manifest.json").to_string_lossy().to_string();
        write_json(storage, &path, bundle).await?;
        info!(
            "Exported {} scenes ({} complete) to {}",
            bundle.scenes.len(),
            bundle.complete_scenes(),
            path
        );
        Ok(path)
    }
}
