//! Prompt construction and reply parsing for the text-generation steps.
//!
//! Replies are expected to be JSON, either a bare array or an object holding
//! the array under a named field, optionally wrapped in a Markdown code fence.

use crate::core::state::{Scene, SceneImagePrompts, ScenePlan, SelectedImagePrompt, Story, VideoPrompt};
use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoryConstraints {
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SceneConstraints {
    pub allowed_durations: Vec<u32>,
}

pub const SYSTEM_PROMPT: &str =
    "You are a documentary director and researcher. Reply with valid JSON only, no commentary.";

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json").trim_end_matches("```").trim().to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```").trim_end_matches("```").trim().to_string()
    } else {
        s.to_string()
    }
}

fn parse_list<T: DeserializeOwned>(response: &str, field: &str) -> Result<Vec<T>> {
    let clean = strip_code_blocks(response);
    let value: Value =
        serde_json::from_str(&clean).with_context(|| format!("Failed to parse JSON reply: {}", clean))?;
    let list = match value {
        Value::Array(_) => value,
        Value::Object(mut map) => map
            .remove(field)
            .ok_or_else(|| anyhow!("JSON reply has no \"{}\" field", field))?,
        _ => return Err(anyhow!("JSON reply is neither a list nor an object")),
    };
    serde_json::from_value(list).with_context(|| format!("Unexpected \"{}\" entries in reply", field))
}

// --- Stories ---

pub fn story_prompt(topic: &str, constraints: &StoryConstraints) -> String {
    format!(
        "Propose {} little-known but true historical stories about: {}\n\
         Return {{ \"stories\": [ {{ \"id\": \"...\", \"title\": \"...\", \"summary\": \"...\", \"era\": \"...\", \"hook\": \"...\" }} ] }}",
        constraints.count, topic
    )
}

#[derive(Deserialize)]
struct RawStory {
    #[serde(default)]
    id: Option<String>,
    title: String,
    summary: String,
    #[serde(default)]
    era: Option<String>,
    #[serde(default)]
    hook: Option<String>,
}

pub fn parse_stories(response: &str) -> Result<Vec<Story>> {
    let raw: Vec<RawStory> = parse_list(response, "stories")?;
    Ok(raw
        .into_iter()
        .enumerate()
        .map(|(i, s)| Story {
            id: s.id.filter(|id| !id.trim().is_empty()).unwrap_or_else(|| format!("story-{}", i + 1)),
            title: s.title,
            summary: s.summary,
            era: s.era,
            hook: s.hook,
        })
        .collect())
}

// --- Scene plan ---

pub fn scene_plan_prompt(story: &Story, constraints: &SceneConstraints) -> Result<String> {
    let allowed = constraints
        .allowed_durations
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!(
        "Break this story into cinematic scenes, numbered from 1.\n\
         Each scene lasts one of these durations in seconds: {}.\n\
         Story: {}\n\
         Return {{ \"scenes\": [ {{ \"sceneNumber\": 1, \"title\": \"...\", \"description\": \"...\", \"durationSeconds\": 8, \"narration\": \"...\" }} ] }}",
        allowed,
        serde_json::to_string(story)?
    ))
}

pub fn parse_scene_plan(response: &str) -> Result<ScenePlan> {
    let scenes: Vec<Scene> = parse_list(response, "scenes")?;
    if scenes.is_empty() {
        return Err(anyhow!("scene plan has no scenes"));
    }
    Ok(ScenePlan { scenes })
}

// --- Image prompts ---

pub fn image_prompts_prompt(scenes: &[Scene], variants: usize) -> Result<String> {
    Ok(format!(
        "For each scene write {} distinct, photorealistic still-image prompts.\n\
         Scenes: {}\n\
         Return {{ \"scenes\": [ {{ \"sceneNumber\": 1, \"prompts\": [\"...\"] }} ] }}",
        variants,
        serde_json::to_string(scenes)?
    ))
}

pub fn parse_image_prompts(response: &str, variants: usize) -> Result<Vec<SceneImagePrompts>> {
    let mut parsed: Vec<SceneImagePrompts> = parse_list(response, "scenes")?;
    for entry in &mut parsed {
        entry.prompts.retain(|p| !p.trim().is_empty());
        entry.prompts.truncate(variants.max(1));
    }
    parsed.retain(|entry| !entry.prompts.is_empty());
    Ok(parsed)
}

// --- Video prompts ---

pub fn video_prompts_prompt(scenes: &[Scene], selected: &[SelectedImagePrompt]) -> Result<String> {
    Ok(format!(
        "Write one camera-motion prompt per scene that animates its chosen still image.\n\
         Keep each scene's durationSeconds.\n\
         Scenes: {}\n\
         Chosen stills: {}\n\
         Return {{ \"scenes\": [ {{ \"sceneNumber\": 1, \"prompt\": \"...\", \"durationSeconds\": 8 }} ] }}",
        serde_json::to_string(scenes)?,
        serde_json::to_string(selected)?
    ))
}

pub fn parse_video_prompts(response: &str) -> Result<Vec<VideoPrompt>> {
    parse_list(response, "scenes")
}
