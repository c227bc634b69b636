pub mod batch;
pub mod control;
pub mod export;
pub mod gateway;
pub mod llm;
pub mod media;
pub mod pipeline;
pub mod poller;
pub mod progress;
pub mod prompts;
pub mod setup;
pub mod tts;
