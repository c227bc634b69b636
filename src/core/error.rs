use crate::core::state::{BatchKind, GenerationPhase};
use thiserror::Error;

/// Failures that end a phase outright. Item, batch and poll failures never
/// show up here; they are recorded on the affected record instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("no topic given for story generation")]
    EmptyTopic,

    #[error("story not found: {0}")]
    UnknownStory(String),

    #[error("no story selected; pick a story before planning scenes")]
    NoStorySelected,

    #[error("no scene plan; plan scenes before running {0}")]
    NoScenePlan(GenerationPhase),

    #[error("no image prompts; generate image prompts before running {0}")]
    NoImagePrompts(GenerationPhase),

    #[error("no video prompts; generate video prompts before running videos")]
    NoVideoPrompts,

    #[error("nothing to resume for {0}; start the phase first")]
    NothingToResume(GenerationPhase),

    #[error("{phase} failed: {message}")]
    PhaseFailed {
        phase: GenerationPhase,
        message: String,
    },

    #[error("{0} cannot be regenerated per item")]
    NotRegenerable(GenerationPhase),

    #[error("unknown {phase} item: {key}")]
    UnknownItem { phase: GenerationPhase, key: String },

    #[error("{0:?} has no batches to retry")]
    NoBatches(BatchKind),
}
