use anyhow::Result;
use history2video::core::config::Config;
use history2video::core::io::NativeStorage;
use history2video::core::state::{BatchKind, GenerationPhase, GenerationState, ProgressKind};
use history2video::services::batch::BatchStatus;
use history2video::services::gateway::create_gateway;
use history2video::services::pipeline::{CoordinatorOptions, PhaseOutcome, PipelineCoordinator, PHASES};
use history2video::services::setup;
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure 'config.yml' exists with LLM, image and video provider settings.");
            return Err(e);
        }
    };
    config.ensure_directories()?;

    setup::run_setup(&mut config).await?;

    let gateway = create_gateway(&config)?;
    let coordinator = Arc::new(PipelineCoordinator::new(
        CoordinatorOptions::from_config(&config),
        gateway,
        Arc::new(NativeStorage::new()),
    ));

    if coordinator.load().await? {
        let project = coordinator.project();
        let title = project.selected_story.as_ref().map_or("(no story)", |s| s.title.as_str());
        println!("Found saved project: {} [{:?}]", title, coordinator.state());
        if let Some(err) = coordinator.phase_error() {
            println!("Last run stopped with: {}", err);
        }
        if !config.unattended && !setup::confirm("Resume saved project?")? {
            coordinator.reset();
        }
    }

    if coordinator.project().selected_story.is_none() {
        let previous = coordinator.project().topic;
        let topic = setup::prompt_topic(previous.as_deref())?;
        let stories = coordinator.generate_stories(&topic).await?;
        let story_id = setup::select_story(&stories)?;
        coordinator.select_story(&story_id)?;
        coordinator.save().await?;
    }

    let control = coordinator.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() && control.pause() {
            println!("\nPausing after the current step. Progress will be saved.");
        }
    });

    let (monitor, pb) = spawn_monitor(coordinator.clone());
    let result = drive(&coordinator, &config).await;
    monitor.abort();
    pb.finish_and_clear();

    coordinator.save().await?;
    result?;

    if coordinator.state() == GenerationState::Paused {
        println!("Paused. Run again to continue where you left off.");
        return Ok(());
    }

    if config.tts.is_some() {
        match coordinator.generate_narration().await {
            Ok(count) => println!("Narration clips written: {}", count),
            Err(e) => warn!("Skipping narration: {:#}", e),
        }
    }

    let manifest = coordinator.export().await?;
    coordinator.save().await?;
    println!("Export manifest written to {}", manifest);
    Ok(())
}

async fn drive(coordinator: &PipelineCoordinator, config: &Config) -> Result<()> {
    for (i, phase) in PHASES.iter().copied().enumerate() {
        if coordinator.phase_satisfied(phase) {
            continue;
        }

        let outcome = coordinator.continue_phase(phase).await?;
        report(phase, &outcome);
        coordinator.save().await?;

        if coordinator.state().is_halted() {
            return Ok(());
        }

        if !config.unattended {
            offer_retries(coordinator, phase).await?;
            if let Some(next) = PHASES.get(i + 1) {
                if !setup::confirm(&format!("Continue to {}?", next))? {
                    println!("Stopping as requested.");
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn offer_retries(coordinator: &PipelineCoordinator, phase: GenerationPhase) -> Result<()> {
    let kind = match phase {
        GenerationPhase::ImagePrompts => BatchKind::ImagePrompts,
        GenerationPhase::VideoPrompts => BatchKind::VideoPrompts,
        _ => return Ok(()),
    };

    for batch in coordinator.batches(kind) {
        if batch.status != BatchStatus::Failed {
            continue;
        }
        let question = format!(
            "Batch {} (scenes {:?}) failed: {}. Retry?",
            batch.batch_index,
            batch.scene_numbers,
            batch.error.as_deref().unwrap_or("unknown error")
        );
        if setup::confirm(&question)? {
            let status = coordinator.retry_batch(kind, batch.batch_index).await?;
            println!("Batch {}: {:?}", batch.batch_index, status);
            coordinator.save().await?;
        }
    }
    Ok(())
}

fn report(phase: GenerationPhase, outcome: &PhaseOutcome) {
    match outcome {
        PhaseOutcome::Planned(scenes) => println!("Scene plan ready: {} scenes", scenes),
        PhaseOutcome::Batches(r) => println!(
            "{}: {} batches done, {} failed, {} pending",
            phase, r.done, r.failed, r.pending
        ),
        PhaseOutcome::Items(summary) => println!("{}: {}", phase, summary),
    }
}

fn spawn_monitor(coordinator: Arc<PipelineCoordinator>) -> (tokio::task::JoinHandle<()>, ProgressBar) {
    let pb = ProgressBar::new(0);
    if let Ok(style) =
        ProgressStyle::default_bar().template("{spinner:.green} [{elapsed_precise}] {msg} [{bar:40.cyan/blue}] {pos}/{len}")
    {
        pb.set_style(style.progress_chars("#>-"));
    }

    let bar = pb.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(250));
        loop {
            ticker.tick().await;
            let Some(phase) = coordinator.phase() else {
                continue;
            };
            let (done, total) = match phase {
                GenerationPhase::ScenePlan => (0, 1),
                GenerationPhase::ImagePrompts | GenerationPhase::VideoPrompts => {
                    let kind = if phase == GenerationPhase::ImagePrompts {
                        BatchKind::ImagePrompts
                    } else {
                        BatchKind::VideoPrompts
                    };
                    let batches = coordinator.batches(kind);
                    let done = batches
                        .iter()
                        .filter(|b| matches!(b.status, BatchStatus::Done | BatchStatus::Failed))
                        .count();
                    (done, batches.len())
                }
                GenerationPhase::Images => {
                    let progress = coordinator.progress(ProgressKind::Images);
                    (progress.completed.len(), progress.total)
                }
                GenerationPhase::Videos => {
                    let progress = coordinator.progress(ProgressKind::Videos);
                    (progress.completed.len(), progress.total)
                }
            };
            bar.set_message(phase.to_string());
            bar.set_length(total as u64);
            bar.set_position(done as u64);
        }
    });
    (handle, pb)
}
