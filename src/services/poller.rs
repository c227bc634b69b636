use crate::services::control::GenerationControl;
use anyhow::Result;
use futures_util::future::join_all;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

/// One asynchronous video render for a scene.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub scene_number: u32,
    #[serde(default)]
    pub job_id: Option<String>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub provider: String,
}

impl Job {
    pub fn submitted(scene_number: u32, job_id: String, provider: &str) -> Self {
        Self {
            scene_number,
            job_id: Some(job_id),
            status: JobStatus::Pending,
            url: None,
            error: None,
            provider: provider.to_string(),
        }
    }

    /// A job whose submission was refused; terminal from the start.
    pub fn rejected(scene_number: u32, error: String, provider: &str) -> Self {
        Self {
            scene_number,
            job_id: None,
            status: JobStatus::Failed,
            url: None,
            error: Some(error),
            provider: provider.to_string(),
        }
    }

    pub fn is_pollable(&self) -> bool {
        self.status == JobStatus::Pending && self.job_id.is_some()
    }
}

/// What the gateway said about a job on one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct JobPoll {
    pub status: JobStatus,
    pub url: Option<String>,
    pub error: Option<String>,
}

impl JobPoll {
    pub fn pending() -> Self {
        Self {
            status: JobStatus::Pending,
            url: None,
            error: None,
        }
    }

    pub fn completed(url: String) -> Self {
        Self {
            status: JobStatus::Completed,
            url: Some(url),
            error: None,
        }
    }

    pub fn failed(error: String) -> Self {
        Self {
            status: JobStatus::Failed,
            url: None,
            error: Some(error),
        }
    }
}

pub type JobMap = Arc<Mutex<BTreeMap<u32, Job>>>;

#[derive(Debug, Clone, Copy)]
pub struct PollerSettings {
    pub interval: Duration,
    pub chunk_size: usize,
    pub chunk_gap: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub ticks: usize,
    pub halted: bool,
}

/// Drives pending jobs to a terminal status by polling in bounded chunks.
///
/// Only one loop runs at a time; a second `run` while one is active returns
/// immediately. The loop ends when nothing is pending, when the generation
/// state is paused or stopped at the top of a tick, or on `stop_polling`.
pub struct JobPoller {
    jobs: JobMap,
    control: GenerationControl,
    settings: PollerSettings,
    active: AtomicBool,
    stop_requested: AtomicBool,
}

struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl JobPoller {
    pub fn new(jobs: JobMap, control: GenerationControl, settings: PollerSettings) -> Self {
        Self {
            jobs,
            control,
            settings,
            active: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn stop_polling(&self) {
        if self.is_active() {
            info!("Stopping video job polling");
            self.stop_requested.store(true, Ordering::SeqCst);
        }
    }

    /// Poll until every job is terminal or the loop is halted. `poll_one` is
    /// called with a job id; `on_terminal` fires once per job that turns
    /// completed or failed during this loop. Returns `None` if a loop was
    /// already running.
    pub async fn run<P, Fut, T>(&self, poll_one: P, mut on_terminal: T) -> Option<PollSummary>
    where
        P: Fn(String) -> Fut,
        Fut: Future<Output = Result<JobPoll>>,
        T: FnMut(&Job),
    {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Polling loop already active");
            return None;
        }
        let _guard = ActiveGuard(&self.active);
        self.stop_requested.store(false, Ordering::SeqCst);

        let mut ticks = 0;
        loop {
            if self.stop_requested.swap(false, Ordering::SeqCst) || self.control.is_halted() {
                info!("Polling halted ({:?})", self.control.state());
                return Some(self.summarize(ticks, true));
            }

            let pending = self.pollable();
            if pending.is_empty() {
                break;
            }
            ticks += 1;
            debug!("Poll tick {}: {} pending jobs", ticks, pending.len());

            let chunk_size = self.settings.chunk_size.max(1);
            for (i, chunk) in pending.chunks(chunk_size).enumerate() {
                if i > 0 && !self.settings.chunk_gap.is_zero() {
                    tokio::time::sleep(self.settings.chunk_gap).await;
                }

                let outcomes = join_all(chunk.iter().map(|(scene, job_id)| {
                    let fut = poll_one(job_id.clone());
                    async move { (*scene, job_id.clone(), fut.await) }
                }))
                .await;

                for (scene, job_id, outcome) in outcomes {
                    match outcome {
                        Ok(poll) if poll.status.is_terminal() => {
                            if let Some(job) = self.apply(scene, &job_id, poll) {
                                on_terminal(&job);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Poll of scene {} job {} failed, retrying next tick: {:#}", scene, job_id, e),
                    }
                }
            }

            if self.pollable().is_empty() {
                break;
            }
            if !self.settings.interval.is_zero() {
                tokio::time::sleep(self.settings.interval).await;
            }
        }

        let summary = self.summarize(ticks, false);
        info!(
            "Video polling finished: {} completed, {} failed",
            summary.completed, summary.failed
        );
        Some(summary)
    }

    fn pollable(&self) -> Vec<(u32, String)> {
        self.jobs
            .lock()
            .values()
            .filter(|job| job.is_pollable())
            .filter_map(|job| job.job_id.clone().map(|id| (job.scene_number, id)))
            .collect()
    }

    /// Record a terminal poll result, unless the scene has since been given a
    /// new job or the job already left pending.
    fn apply(&self, scene: u32, job_id: &str, poll: JobPoll) -> Option<Job> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(&scene)?;
        if job.job_id.as_deref() != Some(job_id) || job.status.is_terminal() {
            debug!("Discarding stale poll result for scene {}", scene);
            return None;
        }
        job.status = poll.status;
        match poll.status {
            JobStatus::Completed => {
                job.url = poll.url;
                job.error = None;
            }
            _ => {
                job.error = Some(poll.error.unwrap_or_else(|| "video generation failed".to_string()));
            }
        }
        Some(job.clone())
    }

    fn summarize(&self, ticks: usize, halted: bool) -> PollSummary {
        let jobs = self.jobs.lock();
        let mut summary = PollSummary {
            ticks,
            halted,
            ..Default::default()
        };
        for job in jobs.values() {
            match job.status {
                JobStatus::Completed => summary.completed += 1,
                JobStatus::Failed => summary.failed += 1,
                JobStatus::Pending => summary.pending += 1,
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::GenerationPhase;
    use anyhow::anyhow;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    fn settings() -> PollerSettings {
        PollerSettings {
            interval: Duration::ZERO,
            chunk_size: 20,
            chunk_gap: Duration::ZERO,
        }
    }

    fn jobs_with(count: u32) -> JobMap {
        let mut map = BTreeMap::new();
        for scene in 1..=count {
            map.insert(scene, Job::submitted(scene, format!("job-{}", scene), "mock"));
        }
        Arc::new(Mutex::new(map))
    }

    fn running_control() -> GenerationControl {
        let control = GenerationControl::new();
        control.begin(GenerationPhase::Videos);
        control
    }

    #[tokio::test]
    async fn test_loop_terminates_when_all_jobs_resolve() {
        let jobs = jobs_with(45);
        let poller = JobPoller::new(jobs.clone(), running_control(), settings());
        let polls: Arc<StdMutex<HashMap<String, usize>>> = Arc::new(StdMutex::new(HashMap::new()));
        let mut terminal = Vec::new();

        let summary = poller
            .run(
                |job_id: String| {
                    let polls = polls.clone();
                    async move {
                        let mut polls = polls.lock().unwrap();
                        let count = polls.entry(job_id.clone()).or_insert(0);
                        *count += 1;
                        // every job resolves on its third poll; multiples of 5 fail
                        if *count < 3 {
                            Ok(JobPoll::pending())
                        } else if job_id.ends_with('5') || job_id.ends_with('0') {
                            Ok(JobPoll::failed("content policy".to_string()))
                        } else {
                            Ok(JobPoll::completed(format!("https://cdn/{}.mp4", job_id)))
                        }
                    }
                },
                |job: &Job| terminal.push(job.scene_number),
            )
            .await
            .expect("loop should start");

        assert_eq!(summary.ticks, 3);
        assert_eq!(summary.failed, 9);
        assert_eq!(summary.completed, 36);
        assert_eq!(summary.pending, 0);
        assert!(!summary.halted);
        assert_eq!(terminal.len(), 45, "each job reported exactly once");
        assert!(!poller.is_active());

        let jobs = jobs.lock();
        assert_eq!(jobs[&7].url.as_deref(), Some("https://cdn/job-7.mp4"));
        assert_eq!(jobs[&10].error.as_deref(), Some("content policy"));
    }

    #[tokio::test]
    async fn test_poll_errors_leave_jobs_pending() {
        let jobs = jobs_with(2);
        let poller = JobPoller::new(jobs.clone(), running_control(), settings());
        let attempts = Arc::new(StdMutex::new(0));

        let summary = poller
            .run(
                |job_id: String| {
                    let attempts = attempts.clone();
                    async move {
                        let mut attempts = attempts.lock().unwrap();
                        *attempts += 1;
                        if *attempts <= 2 {
                            Err(anyhow!("status endpoint timed out"))
                        } else {
                            Ok(JobPoll::completed(format!("https://cdn/{}.mp4", job_id)))
                        }
                    }
                },
                |_job: &Job| {},
            )
            .await
            .expect("loop should start");

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.ticks, 2);
    }

    #[tokio::test]
    async fn test_halted_state_stops_before_polling() {
        let jobs = jobs_with(3);
        let control = running_control();
        control.pause();
        let poller = JobPoller::new(jobs.clone(), control, settings());

        let summary = poller
            .run(
                |_job_id: String| async move { Err::<JobPoll, _>(anyhow!("must not poll")) },
                |_job: &Job| {},
            )
            .await
            .expect("loop should start");

        assert!(summary.halted);
        assert_eq!(summary.ticks, 0);
        assert_eq!(summary.pending, 3);
    }

    #[tokio::test]
    async fn test_second_loop_is_rejected_while_active() {
        let jobs = jobs_with(1);
        let poller = Arc::new(JobPoller::new(jobs.clone(), running_control(), settings()));
        let inner = poller.clone();

        let summary = poller
            .run(
                |_job_id: String| {
                    let inner = inner.clone();
                    async move {
                        let nested = inner
                            .run(|_id: String| async move { Ok(JobPoll::pending()) }, |_job: &Job| {})
                            .await;
                        assert!(nested.is_none());
                        Ok(JobPoll::completed("https://cdn/1.mp4".to_string()))
                    }
                },
                |_job: &Job| {},
            )
            .await;

        assert_eq!(summary.map(|s| s.completed), Some(1));
    }

    #[tokio::test]
    async fn test_replaced_job_ignores_stale_result() {
        let jobs = jobs_with(1);
        let poller = JobPoller::new(jobs.clone(), running_control(), settings());
        let swap = jobs.clone();
        let mut reported = 0;

        let summary = poller
            .run(
                |job_id: String| {
                    let swap = swap.clone();
                    async move {
                        if job_id == "job-1" {
                            swap.lock().insert(1, Job::submitted(1, "job-1b".to_string(), "mock"));
                            Ok(JobPoll::failed("old render".to_string()))
                        } else {
                            Ok(JobPoll::completed("https://cdn/1b.mp4".to_string()))
                        }
                    }
                },
                |_job: &Job| reported += 1,
            )
            .await
            .expect("loop should start");

        assert_eq!(summary.completed, 1);
        assert_eq!(reported, 1);
        assert_eq!(jobs.lock()[&1].job_id.as_deref(), Some("job-1b"));
    }
}
