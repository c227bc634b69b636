use crate::core::config::Config;
use crate::core::state::Story;
use crate::services::tts::{create_tts_client, Voice};
use anyhow::{anyhow, Result};
use inquire::{Confirm, Select, Text};

/// Ask for a narration voice if a TTS provider is configured without one,
/// and persist the choice to `config.yml`.
pub async fn run_setup(config: &mut Config) -> Result<()> {
    let tts_config = match config.tts.as_ref() {
        Some(cfg) if cfg.voice_id.is_none() => cfg.clone(),
        _ => return Ok(()),
    };

    println!("Fetching {} voices...", tts_config.provider);
    let client = create_tts_client(&tts_config)?;
    let voices = client.list_voices().await?;
    if voices.is_empty() {
        return Err(anyhow!(
            "No voices available from {}. Please check the API key.",
            tts_config.provider
        ));
    }

    let voice_id = select_voice("Select Narrator Voice:", &voices)?;
    if let Some(cfg) = config.tts.as_mut() {
        cfg.voice_id = Some(voice_id);
    }
    config.save()?;
    println!("Configuration saved.");
    Ok(())
}

fn voice_label(voice: &Voice) -> String {
    match &voice.category {
        Some(category) => format!("{} ({})", voice.name, category),
        None => voice.name.clone(),
    }
}

fn select_voice(prompt: &str, voices: &[Voice]) -> Result<String> {
    let options: Vec<String> = voices.iter().map(voice_label).collect();
    let choice = Select::new(prompt, options).raw_prompt()?;
    voices
        .get(choice.index)
        .map(|v| v.voice_id.clone())
        .ok_or_else(|| anyhow!("Voice selection out of range"))
}

pub fn prompt_topic(previous: Option<&str>) -> Result<String> {
    let mut text = Text::new("Historical topic to explore:");
    if let Some(previous) = previous {
        text = text.with_default(previous);
    }
    Ok(text.prompt()?.trim().to_string())
}

fn story_label(story: &Story) -> String {
    match &story.era {
        Some(era) => format!("{} [{}] - {}", story.title, era, story.summary),
        None => format!("{} - {}", story.title, story.summary),
    }
}

/// Let the user pick one of the candidate stories; returns its id.
pub fn select_story(stories: &[Story]) -> Result<String> {
    if stories.is_empty() {
        return Err(anyhow!("No stories to choose from"));
    }
    let options: Vec<String> = stories.iter().map(story_label).collect();
    let choice = Select::new("Select a story:", options).raw_prompt()?;
    stories
        .get(choice.index)
        .map(|s| s.id.clone())
        .ok_or_else(|| anyhow!("Story selection out of range"))
}

pub fn confirm(message: &str) -> Result<bool> {
    Ok(Confirm::new(message).with_default(true).prompt()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels() {
        let voice = Voice {
            voice_id: "v1".to_string(),
            name: "Rachel".to_string(),
            category: Some("premade".to_string()),
        };
        assert_eq!(voice_label(&voice), "Rachel (premade)");

        let story = Story {
            id: "s".to_string(),
            title: "The Defenestration".to_string(),
            summary: "Prague".to_string(),
            era: Some("1618".to_string()),
            hook: None,
        };
        assert_eq!(story_label(&story), "The Defenestration [1618] - Prague");
    }
}
