use crate::core::config::{Config, PipelineSettings};
use crate::core::error::PipelineError;
use crate::core::io::{read_json, write_json, Storage};
use crate::core::state::{
    item_key, parse_item_key, BatchKind, GeneratedImage, GenerationPhase, GenerationState, ProgressKind, Project,
    PipelineSnapshot, Scene, SceneImagePrompts, ScenePlan, SelectedImagePrompt, Story, VideoPrompt, WorkItem,
};
use crate::services::batch::{Batch, BatchLedger, BatchProcessor, BatchReport, BatchStatus};
use crate::services::control::GenerationControl;
use crate::services::export::ExportAssembler;
use crate::services::gateway::GenerationGateway;
use crate::services::poller::{Job, JobMap, JobPoller, JobStatus, PollSummary, PollerSettings};
use crate::services::progress::{resumable_worklist, ProgressState, ProgressSummary};
use crate::services::prompts::{SceneConstraints, StoryConstraints};
use crate::utils::duration::clamp_duration;
use anyhow::{anyhow, Result};
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

/// Phase order used when driving a project to completion.
pub const PHASES: [GenerationPhase; 5] = [
    GenerationPhase::ScenePlan,
    GenerationPhase::ImagePrompts,
    GenerationPhase::Images,
    GenerationPhase::VideoPrompts,
    GenerationPhase::Videos,
];

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub settings: PipelineSettings,
    pub project_folder: String,
    pub export_folder: String,
    pub narration_voice: Option<String>,
}

impl CoordinatorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            settings: config.pipeline.clone(),
            project_folder: config.project_folder.clone(),
            export_folder: config.export_folder.clone(),
            narration_voice: config.tts.as_ref().and_then(|t| t.voice_id.clone()),
        }
    }
}

/// What a phase run produced.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    Planned(usize),
    Batches(BatchReport),
    Items(ProgressSummary),
}

/// Result of regenerating a single item.
#[derive(Debug, Clone, PartialEq)]
pub enum RegeneratedItem {
    Image(GeneratedImage),
    Video(Job),
}

/// Owns the project artifacts and the run state, and drives the five
/// generation phases over a [`GenerationGateway`].
///
/// All mutable state sits behind short-lived locks so a UI task holding an
/// `Arc` to the coordinator can observe progress, batches and jobs while a
/// phase is awaiting the gateway.
pub struct PipelineCoordinator {
    settings: PipelineSettings,
    project_folder: String,
    export_folder: String,
    narration_voice: Option<String>,
    gateway: Arc<dyn GenerationGateway>,
    storage: Arc<dyn Storage>,
    control: GenerationControl,
    project: Mutex<Project>,
    image_prompts: BatchLedger<SceneImagePrompts>,
    video_prompts: BatchLedger<VideoPrompt>,
    image_progress: Mutex<ProgressState>,
    video_progress: Mutex<ProgressState>,
    jobs: JobMap,
    poller: JobPoller,
    phase_error: Mutex<Option<String>>,
}

async fn image_prompts_for(gateway: Arc<dyn GenerationGateway>, scenes: Vec<Scene>) -> Result<Vec<SceneImagePrompts>> {
    gateway.generate_image_prompts_for_scenes(&scenes).await
}

async fn video_prompts_for(
    gateway: Arc<dyn GenerationGateway>,
    scenes: Vec<Scene>,
    selected: Arc<Vec<SelectedImagePrompt>>,
) -> Result<Vec<VideoPrompt>> {
    let wanted: Vec<SelectedImagePrompt> = selected
        .iter()
        .filter(|s| scenes.iter().any(|scene| scene.scene_number == s.scene_number))
        .cloned()
        .collect();
    let allowed = gateway.allowed_durations();
    let mut prompts = gateway.generate_video_prompts_for_scenes(&scenes, &wanted).await?;
    for prompt in &mut prompts {
        let requested = if prompt.duration_seconds > 0.0 {
            prompt.duration_seconds
        } else {
            scenes
                .iter()
                .find(|s| s.scene_number == prompt.scene_number)
                .map_or(0.0, |s| s.duration_seconds)
        };
        prompt.duration_seconds = clamp_duration(requested, &allowed).map_or(requested, f64::from);
    }
    Ok(prompts)
}

impl PipelineCoordinator {
    pub fn new(options: CoordinatorOptions, gateway: Arc<dyn GenerationGateway>, storage: Arc<dyn Storage>) -> Self {
        let control = GenerationControl::new();
        let jobs: JobMap = Arc::new(Mutex::new(BTreeMap::new()));
        let poller = JobPoller::new(
            jobs.clone(),
            control.clone(),
            PollerSettings {
                interval: options.settings.poll_interval(),
                chunk_size: options.settings.poll_chunk_size,
                chunk_gap: options.settings.poll_chunk_gap(),
            },
        );

        Self {
            settings: options.settings,
            project_folder: options.project_folder,
            export_folder: options.export_folder,
            narration_voice: options.narration_voice,
            gateway,
            storage,
            control,
            project: Mutex::new(Project::default()),
            image_prompts: BatchLedger::default(),
            video_prompts: BatchLedger::default(),
            image_progress: Mutex::new(ProgressState::default()),
            video_progress: Mutex::new(ProgressState::default()),
            jobs,
            poller,
            phase_error: Mutex::new(None),
        }
    }

    // --- Observers ---

    pub fn state(&self) -> GenerationState {
        self.control.state()
    }

    pub fn phase(&self) -> Option<GenerationPhase> {
        self.control.phase()
    }

    /// Handle for code that only needs to pause or stop, such as a signal task.
    pub fn control(&self) -> GenerationControl {
        self.control.clone()
    }

    pub fn phase_error(&self) -> Option<String> {
        self.phase_error.lock().clone()
    }

    pub fn project(&self) -> Project {
        self.project.lock().clone()
    }

    pub fn progress(&self, kind: ProgressKind) -> ProgressState {
        match kind {
            ProgressKind::Images => self.image_progress.lock().clone(),
            ProgressKind::Videos => self.video_progress.lock().clone(),
        }
    }

    pub fn progress_summary(&self, kind: ProgressKind) -> ProgressSummary {
        let progress = self.progress(kind);
        let failed = match kind {
            ProgressKind::Images => self
                .project
                .lock()
                .images
                .values()
                .filter(|i| i.error.is_some() && progress.completed.contains(&i.key()))
                .count(),
            ProgressKind::Videos => self
                .jobs
                .lock()
                .values()
                .filter(|j| j.status == JobStatus::Failed && progress.completed.contains(&item_key(j.scene_number, 0)))
                .count(),
        };
        ProgressSummary::new(&progress, failed)
    }

    pub fn batches(&self, kind: BatchKind) -> Vec<Batch> {
        match kind {
            BatchKind::ImagePrompts => self.image_prompts.batches(),
            BatchKind::VideoPrompts => self.video_prompts.batches(),
        }
    }

    pub fn image_prompts(&self) -> Vec<SceneImagePrompts> {
        self.image_prompts.results()
    }

    pub fn video_prompts(&self) -> Vec<VideoPrompt> {
        self.video_prompts.results()
    }

    pub fn jobs(&self) -> BTreeMap<u32, Job> {
        self.jobs.lock().clone()
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_active()
    }

    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            state: self.control.state(),
            phase: self.control.phase(),
            phase_error: self.phase_error(),
            project: self.project(),
            image_prompts: self.image_prompts.results(),
            image_prompt_batches: self.image_prompts.batches(),
            video_prompts: self.video_prompts.results(),
            video_prompt_batches: self.video_prompts.batches(),
            image_progress: self.progress(ProgressKind::Images),
            video_progress: self.progress(ProgressKind::Videos),
            jobs: self.jobs(),
        }
    }

    // --- Run control ---

    pub fn pause(&self) -> bool {
        self.control.pause()
    }

    pub fn resume(&self) -> bool {
        self.control.resume()
    }

    pub fn stop(&self) -> bool {
        let stopped = self.control.stop();
        self.poller.stop_polling();
        stopped
    }

    /// Back to an empty idle project.
    pub fn reset(&self) {
        self.poller.stop_polling();
        self.control.reset();
        *self.project.lock() = Project::default();
        self.invalidate_downstream(GenerationPhase::ScenePlan);
        *self.phase_error.lock() = None;
        info!("Pipeline reset");
    }

    fn fail_phase(&self, phase: GenerationPhase, err: PipelineError) -> anyhow::Error {
        error!("{}", err);
        self.control.abort(phase);
        *self.phase_error.lock() = Some(err.to_string());
        err.into()
    }

    fn enter_phase(&self, phase: GenerationPhase) {
        self.control.begin(phase);
        *self.phase_error.lock() = None;
    }

    fn finish_phase(&self) {
        if !self.control.is_halted() {
            self.control.finish_phase();
        }
    }

    /// Drop every artifact produced by `from` and the phases after it.
    fn invalidate_downstream(&self, from: GenerationPhase) {
        if from <= GenerationPhase::ScenePlan {
            let mut project = self.project.lock();
            project.scene_plan = None;
            project.narration.clear();
        }
        if from <= GenerationPhase::ImagePrompts {
            self.image_prompts.clear();
        }
        if from <= GenerationPhase::Images {
            let mut project = self.project.lock();
            project.images.clear();
            project.selected_images.clear();
            *self.image_progress.lock() = ProgressState::default();
        }
        if from <= GenerationPhase::VideoPrompts {
            self.video_prompts.clear();
        }
        if from <= GenerationPhase::Videos {
            self.jobs.lock().clear();
            *self.video_progress.lock() = ProgressState::default();
        }
    }

    fn scene_plan(&self) -> Option<ScenePlan> {
        self.project.lock().scene_plan.clone()
    }

    fn processor(&self, kind: BatchKind) -> BatchProcessor {
        let size = match kind {
            BatchKind::ImagePrompts => self.settings.image_batch_size,
            BatchKind::VideoPrompts => self.settings.video_batch_size,
        };
        BatchProcessor::new(size, self.settings.inter_batch_delay())
    }

    // --- Stories ---

    pub async fn generate_stories(&self, topic: &str) -> Result<Vec<Story>> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(PipelineError::EmptyTopic.into());
        }
        let constraints = StoryConstraints {
            count: self.settings.story_count,
        };
        let stories = self.gateway.generate_story_candidates(topic, &constraints).await?;
        info!("{} story candidates for \"{}\"", stories.len(), topic);

        let mut project = self.project.lock();
        project.topic = Some(topic.to_string());
        project.stories = stories.clone();
        Ok(stories)
    }

    /// Choose a story. Picking a different one discards everything planned
    /// for the previous choice.
    pub fn select_story(&self, story_id: &str) -> Result<Story> {
        let (story, changed) = {
            let project = self.project.lock();
            let story = project
                .stories
                .iter()
                .find(|s| s.id == story_id)
                .cloned()
                .ok_or_else(|| PipelineError::UnknownStory(story_id.to_string()))?;
            let changed = project.selected_story.as_ref().map(|s| s.id.as_str()) != Some(story_id);
            (story, changed)
        };

        if changed {
            self.invalidate_downstream(GenerationPhase::ScenePlan);
            self.project.lock().selected_story = Some(story.clone());
            info!("Selected story: {}", story.title);
        }
        Ok(story)
    }

    // --- Phases ---

    /// Start `phase` from scratch.
    pub async fn start(&self, phase: GenerationPhase) -> Result<PhaseOutcome> {
        match phase {
            GenerationPhase::ScenePlan => Ok(PhaseOutcome::Planned(self.plan_scenes().await?.scenes.len())),
            GenerationPhase::ImagePrompts => Ok(PhaseOutcome::Batches(self.generate_image_prompts().await?)),
            GenerationPhase::Images => Ok(PhaseOutcome::Items(self.generate_images().await?)),
            GenerationPhase::VideoPrompts => Ok(PhaseOutcome::Batches(self.generate_video_prompts().await?)),
            GenerationPhase::Videos => Ok(PhaseOutcome::Items(self.generate_videos().await?)),
        }
    }

    pub async fn plan_scenes(&self) -> Result<ScenePlan> {
        let phase = GenerationPhase::ScenePlan;
        let story = self.project.lock().selected_story.clone();
        let story = match story {
            Some(story) => story,
            None => return Err(self.fail_phase(phase, PipelineError::NoStorySelected)),
        };

        self.enter_phase(phase);
        let constraints = SceneConstraints {
            allowed_durations: self.gateway.allowed_durations(),
        };
        let mut plan = match self.gateway.generate_scene_plan(&story, &constraints).await {
            Ok(plan) => plan,
            Err(e) => {
                return Err(self.fail_phase(
                    phase,
                    PipelineError::PhaseFailed {
                        phase,
                        message: format!("{:#}", e),
                    },
                ))
            }
        };

        plan.scenes.sort_by_key(|s| s.scene_number);
        plan.scenes.dedup_by_key(|s| s.scene_number);
        plan.clamp_durations(&constraints.allowed_durations);
        info!("Scene plan for \"{}\": {} scenes", story.title, plan.scenes.len());

        self.invalidate_downstream(phase);
        self.project.lock().scene_plan = Some(plan.clone());
        self.finish_phase();
        Ok(plan)
    }

    pub async fn generate_image_prompts(&self) -> Result<BatchReport> {
        let phase = GenerationPhase::ImagePrompts;
        let plan = match self.scene_plan() {
            Some(plan) => plan,
            None => return Err(self.fail_phase(phase, PipelineError::NoScenePlan(phase))),
        };

        self.enter_phase(phase);
        self.invalidate_downstream(phase);
        let gateway = self.gateway.clone();
        let report = self
            .processor(BatchKind::ImagePrompts)
            .run(&phase.to_string(), &plan.scenes, &self.control, &self.image_prompts, |subset| {
                image_prompts_for(gateway.clone(), subset)
            })
            .await;
        self.finish_phase();
        Ok(report)
    }

    pub async fn generate_video_prompts(&self) -> Result<BatchReport> {
        let phase = GenerationPhase::VideoPrompts;
        let plan = match self.scene_plan() {
            Some(plan) => plan,
            None => return Err(self.fail_phase(phase, PipelineError::NoScenePlan(phase))),
        };
        if self.image_prompts.results().is_empty() {
            return Err(self.fail_phase(phase, PipelineError::NoImagePrompts(phase)));
        }

        self.enter_phase(phase);
        self.invalidate_downstream(phase);
        let gateway = self.gateway.clone();
        let selected = Arc::new(self.selected_image_prompts());
        let report = self
            .processor(BatchKind::VideoPrompts)
            .run(&phase.to_string(), &plan.scenes, &self.control, &self.video_prompts, |subset| {
                video_prompts_for(gateway.clone(), subset, selected.clone())
            })
            .await;
        self.finish_phase();
        Ok(report)
    }

    /// Continue a batched phase with the batches it has not attempted yet.
    pub async fn resume_prompts(&self, kind: BatchKind) -> Result<BatchReport> {
        let phase = match kind {
            BatchKind::ImagePrompts => GenerationPhase::ImagePrompts,
            BatchKind::VideoPrompts => GenerationPhase::VideoPrompts,
        };
        let plan = match self.scene_plan() {
            Some(plan) => plan,
            None => return Err(self.fail_phase(phase, PipelineError::NoScenePlan(phase))),
        };
        if self.batches(kind).is_empty() {
            return Err(self.fail_phase(phase, PipelineError::NothingToResume(phase)));
        }

        self.enter_phase(phase);
        let gateway = self.gateway.clone();
        let processor = self.processor(kind);
        let report = match kind {
            BatchKind::ImagePrompts => {
                processor
                    .drain(&phase.to_string(), &plan.scenes, &self.control, &self.image_prompts, |subset| {
                        image_prompts_for(gateway.clone(), subset)
                    })
                    .await
            }
            BatchKind::VideoPrompts => {
                let selected = Arc::new(self.selected_image_prompts());
                processor
                    .drain(&phase.to_string(), &plan.scenes, &self.control, &self.video_prompts, |subset| {
                        video_prompts_for(gateway.clone(), subset, selected.clone())
                    })
                    .await
            }
        };
        self.finish_phase();
        Ok(report)
    }

    /// Re-run one prompt batch. The rest of the ledger and the run state are
    /// left alone. If the matching media phase already started, its progress
    /// follows the new prompts: added items become pending, and items the
    /// retry no longer produces are forgotten along with their renders.
    pub async fn retry_batch(&self, kind: BatchKind, batch_index: usize) -> Result<Option<BatchStatus>> {
        let phase = match kind {
            BatchKind::ImagePrompts => GenerationPhase::ImagePrompts,
            BatchKind::VideoPrompts => GenerationPhase::VideoPrompts,
        };
        let plan = self.scene_plan().ok_or(PipelineError::NoScenePlan(phase))?;
        if self.batches(kind).is_empty() {
            return Err(PipelineError::NoBatches(kind).into());
        }

        let gateway = self.gateway.clone();
        let processor = self.processor(kind);
        let label = phase.to_string();
        let status = match kind {
            BatchKind::ImagePrompts => {
                let status = processor
                    .retry(&label, batch_index, &plan.scenes, &self.image_prompts, |subset| {
                        image_prompts_for(gateway.clone(), subset)
                    })
                    .await;
                let keys: Vec<String> = self.image_work_items().iter().map(|i| i.key()).collect();
                {
                    let mut progress = self.image_progress.lock();
                    if progress.is_initialized() {
                        progress.sync_keys(&keys);
                    }
                }
                self.prune_images(&keys.into_iter().collect());
                status
            }
            BatchKind::VideoPrompts => {
                let selected = Arc::new(self.selected_image_prompts());
                let status = processor
                    .retry(&label, batch_index, &plan.scenes, &self.video_prompts, |subset| {
                        video_prompts_for(gateway.clone(), subset, selected.clone())
                    })
                    .await;
                let prompted: BTreeSet<u32> = self.video_prompts.results().iter().map(|p| p.scene_number).collect();
                let keys: Vec<String> = prompted.iter().map(|&scene| item_key(scene, 0)).collect();
                {
                    let mut progress = self.video_progress.lock();
                    if progress.is_initialized() {
                        progress.sync_keys(&keys);
                    }
                }
                self.jobs.lock().retain(|scene, _| prompted.contains(scene));
                status
            }
        };
        Ok(status)
    }

    pub async fn generate_images(&self) -> Result<ProgressSummary> {
        self.run_images(false).await
    }

    pub async fn resume_images(&self) -> Result<ProgressSummary> {
        self.run_images(true).await
    }

    fn image_work_items(&self) -> Vec<WorkItem> {
        self.image_prompts
            .results()
            .into_iter()
            .flat_map(|sp| {
                let scene_number = sp.scene_number;
                sp.prompts.into_iter().enumerate().map(move |(v, payload)| WorkItem {
                    scene_number,
                    variant_index: v as u32,
                    payload,
                })
            })
            .collect()
    }

    async fn run_images(&self, resume: bool) -> Result<ProgressSummary> {
        let phase = GenerationPhase::Images;
        let items = self.image_work_items();
        if items.is_empty() {
            return Err(self.fail_phase(phase, PipelineError::NoImagePrompts(phase)));
        }

        let all_keys: Vec<String> = items.iter().map(|i| i.key()).collect();
        if resume {
            let mut progress = self.image_progress.lock();
            if !progress.is_initialized() {
                drop(progress);
                return Err(self.fail_phase(phase, PipelineError::NothingToResume(phase)));
            }
            progress.sync_keys(&all_keys);
        } else {
            let rendered: BTreeSet<String> = self
                .project
                .lock()
                .images
                .values()
                .filter(|i| i.url.is_some())
                .map(|i| i.key())
                .collect();
            *self.image_progress.lock() = ProgressState::init(&all_keys, &rendered);
        }

        self.enter_phase(phase);
        let completed = self.image_progress.lock().completed.clone();
        let worklist: BTreeSet<String> = resumable_worklist(&all_keys, &completed).into_iter().collect();
        let mut by_scene: BTreeMap<u32, Vec<WorkItem>> = BTreeMap::new();
        for item in items.into_iter().filter(|i| worklist.contains(&i.key())) {
            by_scene.entry(item.scene_number).or_default().push(item);
        }
        info!("Images: {} to render across {} scenes", worklist.len(), by_scene.len());

        let aspect_ratio = self.gateway.image_aspect_ratio();
        for (scene_number, work) in by_scene {
            if self.control.is_halted() {
                info!("Images: halted before scene {}", scene_number);
                break;
            }

            let aspect_ratio = aspect_ratio.as_str();
            let outcomes = join_all(work.iter().map(|item| async move {
                (item, self.gateway.generate_image(&item.payload, aspect_ratio).await)
            }))
            .await;

            let keys: Vec<String> = work.iter().map(|i| i.key()).collect();
            {
                let mut project = self.project.lock();
                for (item, outcome) in outcomes {
                    let image = Self::image_record(item.scene_number, item.variant_index, &item.payload, outcome);
                    project.images.insert(item.key(), image);
                }
                Self::select_default_image(&mut project, scene_number);
            }
            self.image_progress.lock().mark_completed(&keys);
            debug!("Images: scene {} done", scene_number);
        }

        if self.image_progress.lock().is_complete() {
            self.finish_phase();
        }
        let summary = self.progress_summary(ProgressKind::Images);
        info!("Images: {}", summary);
        Ok(summary)
    }

    fn image_record(scene_number: u32, variant_index: u32, prompt: &str, outcome: Result<String>) -> GeneratedImage {
        let (url, error) = match outcome {
            Ok(url) => (Some(url), None),
            Err(e) => {
                warn!("Image {} failed: {:#}", item_key(scene_number, variant_index), e);
                (None, Some(format!("{:#}", e)))
            }
        };
        GeneratedImage {
            scene_number,
            variant_index,
            prompt: prompt.to_string(),
            url,
            error,
        }
    }

    /// Point a scene without a usable selection at its first rendered variant.
    fn select_default_image(project: &mut Project, scene_number: u32) {
        if project.selected_image(scene_number).is_some_and(|i| i.url.is_some()) {
            return;
        }
        let first = project
            .images
            .values()
            .filter(|i| i.scene_number == scene_number && i.url.is_some())
            .map(|i| i.variant_index)
            .min();
        if let Some(variant) = first {
            project.selected_images.insert(scene_number, variant);
        }
    }

    /// Forget renders whose prompt no longer exists and repoint the affected
    /// scenes' selection.
    fn prune_images(&self, known: &BTreeSet<String>) {
        let mut project = self.project.lock();
        let stale: Vec<String> = project.images.keys().filter(|k| !known.contains(*k)).cloned().collect();
        if stale.is_empty() {
            return;
        }
        for key in &stale {
            project.images.remove(key);
        }
        let scenes: BTreeSet<u32> = stale.iter().filter_map(|k| parse_item_key(k)).map(|(scene, _)| scene).collect();
        for scene_number in scenes {
            let dangling = project
                .selected_images
                .get(&scene_number)
                .is_some_and(|v| !project.images.contains_key(&item_key(scene_number, *v)));
            if dangling {
                project.selected_images.remove(&scene_number);
            }
            Self::select_default_image(&mut project, scene_number);
        }
        info!("Dropped {} stale images", stale.len());
    }

    pub fn select_image(&self, scene_number: u32, variant_index: u32) -> Result<()> {
        let key = item_key(scene_number, variant_index);
        let mut project = self.project.lock();
        match project.images.get(&key) {
            Some(image) if image.url.is_some() => {
                project.selected_images.insert(scene_number, variant_index);
                Ok(())
            }
            _ => Err(PipelineError::UnknownItem {
                phase: GenerationPhase::Images,
                key,
            }
            .into()),
        }
    }

    fn selected_image_prompts(&self) -> Vec<SelectedImagePrompt> {
        let prompts = self.image_prompts.results();
        let project = self.project.lock();
        prompts
            .iter()
            .filter_map(|sp| {
                let chosen = project.selected_image(sp.scene_number);
                let prompt = chosen
                    .map(|i| i.prompt.clone())
                    .or_else(|| sp.prompts.first().cloned())?;
                Some(SelectedImagePrompt {
                    scene_number: sp.scene_number,
                    prompt,
                    image_url: chosen.and_then(|i| i.url.clone()),
                })
            })
            .collect()
    }

    pub async fn generate_videos(&self) -> Result<ProgressSummary> {
        self.run_videos(false).await
    }

    pub async fn resume_videos(&self) -> Result<ProgressSummary> {
        self.run_videos(true).await
    }

    async fn run_videos(&self, resume: bool) -> Result<ProgressSummary> {
        let phase = GenerationPhase::Videos;
        let prompts = self.video_prompts.results();
        if prompts.is_empty() {
            return Err(self.fail_phase(phase, PipelineError::NoVideoPrompts));
        }

        let all_keys: Vec<String> = prompts.iter().map(|p| item_key(p.scene_number, 0)).collect();
        if resume {
            let mut progress = self.video_progress.lock();
            if !progress.is_initialized() {
                drop(progress);
                return Err(self.fail_phase(phase, PipelineError::NothingToResume(phase)));
            }
            progress.sync_keys(&all_keys);
        } else {
            let rendered: BTreeSet<String> = self
                .jobs
                .lock()
                .values()
                .filter(|j| j.status == JobStatus::Completed)
                .map(|j| item_key(j.scene_number, 0))
                .collect();
            *self.video_progress.lock() = ProgressState::init(&all_keys, &rendered);
        }

        self.enter_phase(phase);
        let completed = self.video_progress.lock().completed.clone();
        let worklist: BTreeSet<String> = resumable_worklist(&all_keys, &completed).into_iter().collect();
        for prompt in prompts.iter().filter(|p| worklist.contains(&item_key(p.scene_number, 0))) {
            if self.control.is_halted() {
                info!("Videos: halted before submitting scene {}", prompt.scene_number);
                break;
            }
            let in_flight = self
                .jobs
                .lock()
                .get(&prompt.scene_number)
                .is_some_and(|j| j.is_pollable());
            if in_flight {
                continue;
            }

            let job = self.submit_job(prompt).await;
            let rejected = job.status.is_terminal();
            self.jobs.lock().insert(prompt.scene_number, job);
            if rejected {
                self.video_progress.lock().mark_completed([item_key(prompt.scene_number, 0)]);
            }
        }

        let polled = if self.control.is_halted() {
            None
        } else {
            self.poll_videos().await
        };
        if self.video_progress.lock().is_complete() {
            self.finish_phase();
        } else if polled.is_some_and(|p| p.halted) && !self.control.is_halted() {
            // Polling was stopped on its own; park the phase so resume_videos picks it up.
            self.control.pause();
        }
        let summary = self.progress_summary(ProgressKind::Videos);
        info!("Videos: {}", summary);
        Ok(summary)
    }

    fn clip_length(&self, prompt: &VideoPrompt) -> u32 {
        let requested = if prompt.duration_seconds > 0.0 {
            prompt.duration_seconds
        } else {
            self.project
                .lock()
                .scene_plan
                .as_ref()
                .and_then(|plan| plan.scene(prompt.scene_number))
                .map_or(0.0, |s| s.duration_seconds)
        };
        clamp_duration(requested, &self.gateway.allowed_durations()).unwrap_or_else(|| requested.round().max(1.0) as u32)
    }

    async fn submit_job(&self, prompt: &VideoPrompt) -> Job {
        let duration = self.clip_length(prompt);
        let image_url = self
            .project
            .lock()
            .selected_image(prompt.scene_number)
            .and_then(|i| i.url.clone());
        let provider = self.gateway.video_provider();

        match self
            .gateway
            .submit_video_job(&prompt.prompt, duration, image_url.as_deref())
            .await
        {
            Ok(job_id) => {
                debug!("Scene {} submitted as job {}", prompt.scene_number, job_id);
                Job::submitted(prompt.scene_number, job_id, &provider)
            }
            Err(e) => {
                warn!("Scene {} video submission failed: {:#}", prompt.scene_number, e);
                Job::rejected(prompt.scene_number, format!("{:#}", e), &provider)
            }
        }
    }

    /// Poll outstanding video jobs until they settle or the run halts.
    /// Returns `None` if a polling loop is already active.
    pub async fn poll_videos(&self) -> Option<PollSummary> {
        let gateway = self.gateway.clone();
        self.poller
            .run(
                |job_id: String| {
                    let gateway = gateway.clone();
                    async move { gateway.poll_video_job(&job_id).await }
                },
                |job: &Job| {
                    self.video_progress.lock().mark_completed([item_key(job.scene_number, 0)]);
                },
            )
            .await
    }

    /// End the polling loop without stopping the run. A video phase waiting on
    /// the loop comes back paused.
    pub fn stop_polling(&self) {
        self.poller.stop_polling();
    }

    /// Redo one image or video outside the phase loop. Progress and run state
    /// are not touched.
    pub async fn regenerate_item(
        &self,
        phase: GenerationPhase,
        key: &str,
        prompt_override: Option<String>,
    ) -> Result<RegeneratedItem> {
        let unknown = || PipelineError::UnknownItem {
            phase,
            key: key.to_string(),
        };
        let (scene_number, variant_index) = parse_item_key(key).ok_or_else(unknown)?;

        match phase {
            GenerationPhase::Images => {
                let mut prompts = self.image_prompts.result_for(scene_number);
                let existing = prompts
                    .as_ref()
                    .and_then(|sp| sp.prompts.get(variant_index as usize).cloned())
                    .or_else(|| self.project.lock().images.get(key).map(|i| i.prompt.clone()));
                let prompt = prompt_override.clone().or(existing).ok_or_else(unknown)?;

                if let (Some(new_prompt), Some(sp)) = (prompt_override, prompts.as_mut()) {
                    if let Some(slot) = sp.prompts.get_mut(variant_index as usize) {
                        *slot = new_prompt;
                        self.image_prompts.upsert(sp.clone());
                    }
                }

                let outcome = self
                    .gateway
                    .generate_image(&prompt, &self.gateway.image_aspect_ratio())
                    .await;
                let image = Self::image_record(scene_number, variant_index, &prompt, outcome);
                let mut project = self.project.lock();
                project.images.insert(key.to_string(), image.clone());
                Self::select_default_image(&mut project, scene_number);
                info!("Regenerated image {}", key);
                Ok(RegeneratedItem::Image(image))
            }
            GenerationPhase::Videos => {
                let mut prompt = self.video_prompts.result_for(scene_number).ok_or_else(unknown)?;
                if let Some(new_prompt) = prompt_override {
                    prompt.prompt = new_prompt;
                    self.video_prompts.upsert(prompt.clone());
                }
                let job = self.submit_job(&prompt).await;
                self.jobs.lock().insert(scene_number, job.clone());
                info!("Resubmitted video for scene {}", scene_number);
                Ok(RegeneratedItem::Video(job))
            }
            other => Err(PipelineError::NotRegenerable(other).into()),
        }
    }

    // --- Narration and export ---

    /// Synthesize narration for every scene that has text and no clip yet.
    /// Failures are logged per scene; returns how many clips were written.
    pub async fn generate_narration(&self) -> Result<usize> {
        let plan = self.scene_plan().ok_or(PipelineError::NoScenePlan(GenerationPhase::Videos))?;
        let voice = self
            .narration_voice
            .clone()
            .ok_or_else(|| anyhow!("No narration voice configured"))?;

        let mut written = 0;
        for scene in &plan.scenes {
            if self.control.is_halted() {
                break;
            }
            let text = match scene.narration.as_deref().map(str::trim) {
                Some(text) if !text.is_empty() => text,
                _ => continue,
            };
            if self.project.lock().narration.contains_key(&scene.scene_number) {
                continue;
            }

            match self.gateway.generate_speech(text, &voice).await {
                Ok(bytes) => {
                    let path = Path::new(&self.project_folder)
                        .join("audio")
                        .join(format!("scene_{:03}.mp3", scene.scene_number))
                        .to_string_lossy()
                        .to_string();
                    self.storage.write(&path, &bytes).await?;
                    self.project.lock().narration.insert(scene.scene_number, path);
                    written += 1;
                }
                Err(e) => warn!("Narration for scene {} failed: {:#}", scene.scene_number, e),
            }
        }
        info!("Narration: {} clips written", written);
        Ok(written)
    }

    /// Write the export manifest and return its path.
    pub async fn export(&self) -> Result<String> {
        let bundle = ExportAssembler::assemble(&self.snapshot())?;
        ExportAssembler::write(&bundle, self.storage.as_ref(), &self.export_folder).await
    }

    // --- Persistence ---

    fn snapshot_path(&self) -> String {
        Path::new(&self.project_folder)
            .join("pipeline.json")
            .to_string_lossy()
            .to_string()
    }

    pub async fn save(&self) -> Result<()> {
        write_json(self.storage.as_ref(), &self.snapshot_path(), &self.snapshot()).await
    }

    /// Load the saved snapshot if there is one. Returns whether anything was restored.
    pub async fn load(&self) -> Result<bool> {
        match read_json::<PipelineSnapshot>(self.storage.as_ref(), &self.snapshot_path()).await? {
            Some(snapshot) => {
                self.restore(snapshot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace all state with `snapshot`. A run that was in flight when the
    /// snapshot was taken comes back paused.
    pub fn restore(&self, snapshot: PipelineSnapshot) {
        let state = match snapshot.state {
            GenerationState::Running => GenerationState::Paused,
            other => other,
        };
        self.control.restore(state, snapshot.phase);
        *self.phase_error.lock() = snapshot.phase_error;
        *self.project.lock() = snapshot.project;
        self.image_prompts
            .restore(snapshot.image_prompt_batches, snapshot.image_prompts);
        self.video_prompts
            .restore(snapshot.video_prompt_batches, snapshot.video_prompts);
        *self.image_progress.lock() = snapshot.image_progress;
        *self.video_progress.lock() = snapshot.video_progress;
        *self.jobs.lock() = snapshot.jobs;
        info!("Restored pipeline ({:?}, phase {:?})", state, snapshot.phase);
    }

    // --- Driving a whole run ---

    /// Whether `phase` has nothing left to do.
    pub fn phase_satisfied(&self, phase: GenerationPhase) -> bool {
        let no_pending = |batches: Vec<Batch>| {
            batches
                .iter()
                .all(|b| matches!(b.status, BatchStatus::Done | BatchStatus::Failed))
        };
        match phase {
            GenerationPhase::ScenePlan => self.project.lock().scene_plan.is_some(),
            GenerationPhase::ImagePrompts => {
                !self.image_prompts.results().is_empty() && no_pending(self.image_prompts.batches())
            }
            GenerationPhase::Images => {
                let progress = self.image_progress.lock();
                progress.is_initialized() && progress.is_complete()
            }
            GenerationPhase::VideoPrompts => {
                !self.video_prompts.results().is_empty() && no_pending(self.video_prompts.batches())
            }
            GenerationPhase::Videos => {
                let progress = self.video_progress.lock();
                progress.is_initialized() && progress.is_complete()
            }
        }
    }

    /// Run `phase`, continuing where an earlier run left off if it can.
    pub async fn continue_phase(&self, phase: GenerationPhase) -> Result<PhaseOutcome> {
        let has_pending = |batches: Vec<Batch>| {
            batches
                .iter()
                .any(|b| matches!(b.status, BatchStatus::Pending | BatchStatus::Running))
        };
        match phase {
            GenerationPhase::ImagePrompts if has_pending(self.image_prompts.batches()) => {
                Ok(PhaseOutcome::Batches(self.resume_prompts(BatchKind::ImagePrompts).await?))
            }
            GenerationPhase::VideoPrompts if has_pending(self.video_prompts.batches()) => {
                Ok(PhaseOutcome::Batches(self.resume_prompts(BatchKind::VideoPrompts).await?))
            }
            GenerationPhase::Images if self.image_progress.lock().is_initialized() => {
                Ok(PhaseOutcome::Items(self.resume_images().await?))
            }
            GenerationPhase::Videos if self.video_progress.lock().is_initialized() => {
                Ok(PhaseOutcome::Items(self.resume_videos().await?))
            }
            _ => self.start(phase).await,
        }
    }

    /// Walk the phases in order, skipping finished ones, until everything is
    /// done or the run is paused or stopped. `on_phase` sees each outcome.
    pub async fn run_to_completion<F>(&self, mut on_phase: F) -> Result<()>
    where
        F: FnMut(GenerationPhase, &PhaseOutcome),
    {
        for phase in PHASES {
            if self.phase_satisfied(phase) {
                debug!("Skipping finished phase: {}", phase);
                continue;
            }
            let outcome = self.continue_phase(phase).await?;
            on_phase(phase, &outcome);
            if self.control.is_halted() {
                info!("Run halted during {}", phase);
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::services::poller::JobPoll;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeGateway {
        fail_images: BTreeSet<String>,
        calls: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl GenerationGateway for FakeGateway {
        async fn generate_story_candidates(&self, topic: &str, _c: &StoryConstraints) -> Result<Vec<Story>> {
            Ok(vec![Story {
                id: "a".to_string(),
                title: format!("{} story", topic),
                summary: "summary".to_string(),
                era: None,
                hook: None,
            }])
        }

        async fn generate_scene_plan(&self, _story: &Story, _c: &SceneConstraints) -> Result<ScenePlan> {
            Ok(ScenePlan {
                scenes: (1..=3)
                    .map(|n| Scene {
                        scene_number: n,
                        title: format!("Scene {}", n),
                        description: "desc".to_string(),
                        duration_seconds: 7.0,
                        narration: Some(format!("Line {}", n)),
                    })
                    .collect(),
            })
        }

        async fn generate_image_prompts_for_scenes(&self, scenes: &[Scene]) -> Result<Vec<SceneImagePrompts>> {
            Ok(scenes
                .iter()
                .map(|s| SceneImagePrompts {
                    scene_number: s.scene_number,
                    prompts: vec![format!("wide {}", s.scene_number), format!("close {}", s.scene_number)],
                })
                .collect())
        }

        async fn generate_image(&self, prompt: &str, _aspect_ratio: &str) -> Result<String> {
            self.calls.lock().unwrap().push(prompt.to_string());
            if self.fail_images.contains(prompt) {
                return Err(anyhow!("nsfw filter"));
            }
            Ok(format!("https://img/{}", prompt.replace(' ', "_")))
        }

        async fn generate_video_prompts_for_scenes(
            &self,
            scenes: &[Scene],
            _selected: &[SelectedImagePrompt],
        ) -> Result<Vec<VideoPrompt>> {
            Ok(scenes
                .iter()
                .map(|s| VideoPrompt {
                    scene_number: s.scene_number,
                    prompt: format!("pan {}", s.scene_number),
                    duration_seconds: 0.0,
                })
                .collect())
        }

        async fn submit_video_job(&self, _prompt: &str, duration: u32, _image_url: Option<&str>) -> Result<String> {
            Ok(format!("job-{}", duration))
        }

        async fn poll_video_job(&self, job_id: &str) -> Result<JobPoll> {
            Ok(JobPoll::completed(format!("https://vid/{}", job_id)))
        }

        async fn generate_speech(&self, text: &str, _voice_id: &str) -> Result<Vec<u8>> {
            Ok(text.as_bytes().to_vec())
        }

        fn video_provider(&self) -> String {
            "fake".to_string()
        }

        fn allowed_durations(&self) -> Vec<u32> {
            vec![6, 8, 10]
        }
    }

    fn coordinator(gateway: FakeGateway, folder: &Path) -> PipelineCoordinator {
        let settings = PipelineSettings {
            inter_batch_delay_ms: 0,
            poll_interval_ms: 0,
            poll_chunk_gap_ms: 0,
            ..Default::default()
        };
        PipelineCoordinator::new(
            CoordinatorOptions {
                settings,
                project_folder: folder.join("project").to_string_lossy().to_string(),
                export_folder: folder.join("export").to_string_lossy().to_string(),
                narration_voice: Some("narrator".to_string()),
            },
            Arc::new(gateway),
            Arc::new(NativeStorage::new()),
        )
    }

    async fn planned(c: &PipelineCoordinator) -> Result<()> {
        c.generate_stories("Rome").await?;
        c.select_story("a")?;
        c.plan_scenes().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_plan_requires_story_and_clamps() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let c = coordinator(FakeGateway::default(), dir.path());

        let err = c.plan_scenes().await.unwrap_err();
        assert_eq!(err.downcast_ref::<PipelineError>(), Some(&PipelineError::NoStorySelected));
        assert_eq!(c.state(), GenerationState::Stopped);
        assert!(c.phase_error().is_some());

        planned(&c).await?;
        assert_eq!(c.state(), GenerationState::Idle);
        assert_eq!(c.phase_error(), None);
        let plan = c.project().scene_plan.unwrap();
        assert!(plan.scenes.iter().all(|s| s.duration_seconds == 8.0));
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_topic_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let c = coordinator(FakeGateway::default(), dir.path());
        let err = c.generate_stories("   ").await.unwrap_err();
        assert_eq!(err.downcast_ref::<PipelineError>(), Some(&PipelineError::EmptyTopic));
        assert_eq!(c.state(), GenerationState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_image_counts_as_completed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let gateway = FakeGateway {
            fail_images: ["wide 2".to_string()].into_iter().collect(),
            ..Default::default()
        };
        let c = coordinator(gateway, dir.path());
        planned(&c).await?;
        c.generate_image_prompts().await?;

        let summary = c.generate_images().await?;
        assert_eq!(summary, ProgressSummary { total: 6, completed: 5, failed: 1, pending: 0 });
        let project = c.project();
        assert_eq!(project.images["2_0"].error.as_deref(), Some("nsfw filter"));
        assert_eq!(project.selected_images.get(&2), Some(&1));
        assert_eq!(project.selected_images.get(&1), Some(&0));
        Ok(())
    }

    #[tokio::test]
    async fn test_regenerate_leaves_progress_and_state_alone() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let c = coordinator(FakeGateway::default(), dir.path());
        planned(&c).await?;
        c.generate_image_prompts().await?;
        c.generate_images().await?;
        let before = c.progress(ProgressKind::Images);

        let item = c
            .regenerate_item(GenerationPhase::Images, "3_1", Some("close 3 at dusk".to_string()))
            .await?;
        match item {
            RegeneratedItem::Image(image) => assert_eq!(image.url.as_deref(), Some("https://img/close_3_at_dusk")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(c.progress(ProgressKind::Images), before);
        assert_eq!(c.state(), GenerationState::Idle);
        assert_eq!(c.image_prompts()[2].prompts[1], "close 3 at dusk");

        let err = c.regenerate_item(GenerationPhase::ScenePlan, "1_0", None).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<PipelineError>(),
            Some(&PipelineError::NotRegenerable(GenerationPhase::ScenePlan))
        );
        assert!(c.regenerate_item(GenerationPhase::Images, "9_0", None).await.is_err());
        assert_eq!(c.state(), GenerationState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn test_videos_use_scene_duration_when_prompt_has_none() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let c = coordinator(FakeGateway::default(), dir.path());
        planned(&c).await?;
        c.generate_image_prompts().await?;
        c.generate_images().await?;
        c.generate_video_prompts().await?;
        assert!(c.video_prompts().iter().all(|p| p.duration_seconds == 8.0));

        let summary = c.generate_videos().await?;
        assert_eq!(summary.completed, 3);
        assert_eq!(c.jobs()[&1].url.as_deref(), Some("https://vid/job-8"));
        assert_eq!(c.state(), GenerationState::Idle);
        Ok(())
    }

    #[tokio::test]
    async fn test_selecting_another_story_invalidates_plan() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let c = coordinator(FakeGateway::default(), dir.path());
        planned(&c).await?;
        c.generate_image_prompts().await?;

        c.select_story("a")?;
        assert!(c.project().scene_plan.is_some(), "same story keeps the plan");

        c.project.lock().stories.push(Story {
            id: "b".to_string(),
            title: "Other".to_string(),
            summary: "".to_string(),
            era: None,
            hook: None,
        });
        c.select_story("b")?;
        assert!(c.project().scene_plan.is_none());
        assert!(c.image_prompts().is_empty());
        assert!(c.select_story("zzz").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_narration_and_export() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let c = coordinator(FakeGateway::default(), dir.path());
        planned(&c).await?;

        assert_eq!(c.generate_narration().await?, 3);
        assert_eq!(c.generate_narration().await?, 0);
        let clip = c.project().narration[&2].clone();
        assert_eq!(tokio::fs::read(&clip).await?, b"Line 2");

        let manifest = c.export().await?;
        assert!(manifest.ends_with("manifest.json"));
        assert!(tokio::fs::try_exists(&manifest).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_restore_turns_running_into_paused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let c = coordinator(FakeGateway::default(), dir.path());
        planned(&c).await?;
        c.control.begin(GenerationPhase::Images);
        c.save().await?;

        let fresh = coordinator(FakeGateway::default(), dir.path());
        assert!(fresh.load().await?);
        assert_eq!(fresh.state(), GenerationState::Paused);
        assert_eq!(fresh.phase(), Some(GenerationPhase::Images));
        assert_eq!(fresh.project().scene_plan, c.project().scene_plan);
        Ok(())
    }
}
