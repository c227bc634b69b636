use crate::core::state::{Scene, SceneKeyed};
use crate::services::control::GenerationControl;
use anyhow::Result;
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    #[default]
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub batch_index: usize,
    pub scene_numbers: Vec<u32>,
    pub status: BatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Batch {
    fn new(batch_index: usize, scene_numbers: Vec<u32>) -> Self {
        Self {
            batch_index,
            scene_numbers,
            status: BatchStatus::Pending,
            error: None,
        }
    }
}

/// Split an ordered scene list into consecutive batches of at most `batch_size`.
pub fn plan_batches(scene_numbers: &[u32], batch_size: usize) -> Vec<Batch> {
    scene_numbers
        .chunks(batch_size.max(1))
        .enumerate()
        .map(|(i, chunk)| Batch::new(i, chunk.to_vec()))
        .collect()
}

/// Batch list plus the merged per-scene output of one batched phase.
///
/// Each half sits behind its own lock, taken only for in-memory updates, so
/// observers can read a consistent view while a run is awaiting the gateway.
#[derive(Debug)]
pub struct BatchLedger<T> {
    batches: Mutex<Vec<Batch>>,
    results: Mutex<Vec<T>>,
}

impl<T> Default for BatchLedger<T> {
    fn default() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            results: Mutex::new(Vec::new()),
        }
    }
}

impl<T: SceneKeyed + Clone> BatchLedger<T> {
    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().clone()
    }

    pub fn results(&self) -> Vec<T> {
        self.results.lock().clone()
    }

    pub fn result_for(&self, scene_number: u32) -> Option<T> {
        self.results
            .lock()
            .iter()
            .find(|r| r.scene_number() == scene_number)
            .cloned()
    }

    pub fn clear(&self) {
        self.batches.lock().clear();
        self.results.lock().clear();
    }

    pub fn restore(&self, batches: Vec<Batch>, results: Vec<T>) {
        *self.batches.lock() = batches;
        *self.results.lock() = results;
    }

    /// Replace the stored output for a single scene, keeping scene order.
    pub fn upsert(&self, item: T) {
        self.merge(vec![item]);
    }

    fn reset(&self, batches: Vec<Batch>) {
        *self.batches.lock() = batches;
        self.results.lock().clear();
    }

    fn set_status(&self, batch_index: usize, status: BatchStatus, error: Option<String>) {
        if let Some(batch) = self.batches.lock().get_mut(batch_index) {
            batch.status = status;
            batch.error = error;
        }
    }

    fn merge(&self, fresh: Vec<T>) {
        let mut results = self.results.lock();
        for item in fresh {
            let scene = item.scene_number();
            match results.iter_mut().find(|r| r.scene_number() == scene) {
                Some(existing) => *existing = item,
                None => results.push(item),
            }
        }
        results.sort_by_key(|r| r.scene_number());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub done: usize,
    pub failed: usize,
    pub pending: usize,
}

impl BatchReport {
    fn from_batches(batches: &[Batch]) -> Self {
        let mut report = Self::default();
        for batch in batches {
            match batch.status {
                BatchStatus::Done => report.done += 1,
                BatchStatus::Failed => report.failed += 1,
                BatchStatus::Pending | BatchStatus::Running => report.pending += 1,
            }
        }
        report
    }
}

/// Runs a scene list through an LLM-backed worker one batch at a time.
pub struct BatchProcessor {
    batch_size: usize,
    inter_batch_delay: Duration,
}

impl BatchProcessor {
    pub fn new(batch_size: usize, inter_batch_delay: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            inter_batch_delay,
        }
    }

    /// Plan fresh batches for `scenes` and execute them all. See [`Self::drain`].
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        scenes: &[Scene],
        control: &GenerationControl,
        ledger: &BatchLedger<T>,
        worker: F,
    ) -> BatchReport
    where
        T: SceneKeyed + Clone,
        F: Fn(Vec<Scene>) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let scene_numbers: Vec<u32> = scenes.iter().map(|s| s.scene_number).collect();
        let planned = plan_batches(&scene_numbers, self.batch_size);
        info!("{}: {} scenes in {} batches", label, scenes.len(), planned.len());
        ledger.reset(planned);
        self.drain(label, scenes, control, ledger, worker).await
    }

    /// Execute every batch not yet attempted, sequentially and in index order.
    /// A failed batch is recorded and skipped; a pause or stop observed before a
    /// batch leaves it and its successors pending.
    pub async fn drain<T, F, Fut>(
        &self,
        label: &str,
        scenes: &[Scene],
        control: &GenerationControl,
        ledger: &BatchLedger<T>,
        worker: F,
    ) -> BatchReport
    where
        T: SceneKeyed + Clone,
        F: Fn(Vec<Scene>) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let todo: Vec<usize> = ledger
            .batches()
            .iter()
            .filter(|b| matches!(b.status, BatchStatus::Pending | BatchStatus::Running))
            .map(|b| b.batch_index)
            .collect();

        for (i, &index) in todo.iter().enumerate() {
            if control.is_halted() {
                info!("{}: halted before batch {}", label, index);
                break;
            }

            let succeeded = self.execute(label, index, scenes, ledger, &worker).await == BatchStatus::Done;

            if succeeded && i + 1 < todo.len() && !self.inter_batch_delay.is_zero() {
                tokio::time::sleep(self.inter_batch_delay).await;
            }
        }

        let report = BatchReport::from_batches(&ledger.batches());
        info!(
            "{}: {} done, {} failed, {} pending",
            label, report.done, report.failed, report.pending
        );
        report
    }

    /// Re-run a single batch, merging its output over whatever the ledger holds.
    /// Returns `None` when the batch does not resolve to any scene.
    pub async fn retry<T, F, Fut>(
        &self,
        label: &str,
        batch_index: usize,
        scenes: &[Scene],
        ledger: &BatchLedger<T>,
        worker: F,
    ) -> Option<BatchStatus>
    where
        T: SceneKeyed + Clone,
        F: Fn(Vec<Scene>) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        if Self::subset(batch_index, scenes, ledger).is_empty() {
            warn!("{}: batch {} has no scenes to retry, skipping", label, batch_index);
            return None;
        }
        info!("{}: retrying batch {}", label, batch_index);
        Some(self.execute(label, batch_index, scenes, ledger, &worker).await)
    }

    fn subset<T: SceneKeyed + Clone>(batch_index: usize, scenes: &[Scene], ledger: &BatchLedger<T>) -> Vec<Scene> {
        let wanted: BTreeSet<u32> = match ledger.batches.lock().get(batch_index) {
            Some(batch) => batch.scene_numbers.iter().copied().collect(),
            None => return Vec::new(),
        };
        scenes
            .iter()
            .filter(|s| wanted.contains(&s.scene_number))
            .cloned()
            .collect()
    }

    async fn execute<T, F, Fut>(
        &self,
        label: &str,
        batch_index: usize,
        scenes: &[Scene],
        ledger: &BatchLedger<T>,
        worker: &F,
    ) -> BatchStatus
    where
        T: SceneKeyed + Clone,
        F: Fn(Vec<Scene>) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let subset = Self::subset(batch_index, scenes, ledger);
        let wanted: BTreeSet<u32> = subset.iter().map(|s| s.scene_number).collect();
        ledger.set_status(batch_index, BatchStatus::Running, None);

        match worker(subset).await {
            Ok(output) => {
                let (kept, dropped): (Vec<T>, Vec<T>) =
                    output.into_iter().partition(|r| wanted.contains(&r.scene_number()));
                if !dropped.is_empty() {
                    warn!(
                        "{}: batch {} returned {} entries for scenes outside the batch",
                        label,
                        batch_index,
                        dropped.len()
                    );
                }
                ledger.merge(kept);
                ledger.set_status(batch_index, BatchStatus::Done, None);
                BatchStatus::Done
            }
            Err(e) => {
                warn!("{}: batch {} failed: {:#}", label, batch_index, e);
                ledger.set_status(batch_index, BatchStatus::Failed, Some(format!("{:#}", e)));
                BatchStatus::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{GenerationPhase, SceneImagePrompts};
    use anyhow::anyhow;
    use std::sync::{Arc, Mutex as StdMutex};

    fn scenes(count: u32) -> Vec<Scene> {
        (1..=count)
            .map(|n| Scene {
                scene_number: n,
                title: format!("Scene {}", n),
                description: format!("Description {}", n),
                duration_seconds: 8.0,
                narration: None,
            })
            .collect()
    }

    fn prompts_for(subset: &[Scene], tag: &str) -> Vec<SceneImagePrompts> {
        subset
            .iter()
            .map(|s| SceneImagePrompts {
                scene_number: s.scene_number,
                prompts: vec![format!("{} {}", tag, s.scene_number)],
            })
            .collect()
    }

    #[test]
    fn test_plan_batches_sizes() {
        let numbers: Vec<u32> = (1..=12).collect();
        let batches = plan_batches(&numbers, 10);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].scene_numbers.len(), 10);
        assert_eq!(batches[1].scene_numbers, vec![11, 12]);
        assert_eq!(batches[1].batch_index, 1);
        assert!(batches.iter().all(|b| b.status == BatchStatus::Pending));

        assert!(plan_batches(&[], 8).is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_stop_others() {
        let processor = BatchProcessor::new(4, Duration::ZERO);
        let control = GenerationControl::new();
        control.begin(GenerationPhase::ImagePrompts);
        let ledger = BatchLedger::default();
        let all = scenes(10);

        let report = processor
            .run("image prompts", &all, &control, &ledger, |subset: Vec<Scene>| async move {
                if subset[0].scene_number == 5 {
                    Err(anyhow!("malformed response"))
                } else {
                    Ok(prompts_for(&subset, "p"))
                }
            })
            .await;

        assert_eq!(report, BatchReport { done: 2, failed: 1, pending: 0 });
        let batches = ledger.batches();
        assert_eq!(batches[1].status, BatchStatus::Failed);
        assert_eq!(batches[1].error.as_deref(), Some("malformed response"));
        let covered: Vec<u32> = ledger.results().iter().map(|r| r.scene_number).collect();
        assert_eq!(covered, vec![1, 2, 3, 4, 9, 10]);
    }

    #[tokio::test]
    async fn test_halt_leaves_remaining_batches_pending() {
        let processor = BatchProcessor::new(2, Duration::ZERO);
        let control = GenerationControl::new();
        control.begin(GenerationPhase::VideoPrompts);
        let ledger = BatchLedger::default();
        let all = scenes(6);
        let calls = Arc::new(StdMutex::new(0));

        let report = processor
            .run("video prompts", &all, &control, &ledger, |subset: Vec<Scene>| {
                let control = control.clone();
                let calls = calls.clone();
                async move {
                    *calls.lock().unwrap() += 1;
                    control.pause();
                    Ok(prompts_for(&subset, "v"))
                }
            })
            .await;

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(report, BatchReport { done: 1, failed: 0, pending: 2 });
        let statuses: Vec<BatchStatus> = ledger.batches().iter().map(|b| b.status).collect();
        assert_eq!(statuses, vec![BatchStatus::Done, BatchStatus::Pending, BatchStatus::Pending]);
    }

    #[tokio::test]
    async fn test_drain_continues_after_pause() {
        let processor = BatchProcessor::new(2, Duration::ZERO);
        let control = GenerationControl::new();
        control.begin(GenerationPhase::ImagePrompts);
        let ledger = BatchLedger::default();
        let all = scenes(5);

        processor
            .run("image prompts", &all, &control, &ledger, |subset: Vec<Scene>| {
                let control = control.clone();
                async move {
                    control.pause();
                    Ok(prompts_for(&subset, "first"))
                }
            })
            .await;
        assert_eq!(ledger.results().len(), 2);

        control.resume();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let report = processor
            .drain("image prompts", &all, &control, &ledger, |subset: Vec<Scene>| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(subset[0].scene_number);
                    Ok(prompts_for(&subset, "later"))
                }
            })
            .await;

        assert_eq!(*seen.lock().unwrap(), vec![3, 5]);
        assert_eq!(report, BatchReport { done: 3, failed: 0, pending: 0 });
        assert_eq!(ledger.results()[0].prompts[0], "first 1");
        assert_eq!(ledger.results()[4].prompts[0], "later 5");
    }

    #[tokio::test]
    async fn test_retry_merges_without_touching_other_scenes() {
        let processor = BatchProcessor::new(10, Duration::ZERO);
        let control = GenerationControl::new();
        control.begin(GenerationPhase::ImagePrompts);
        let ledger = BatchLedger::default();
        let all = scenes(12);

        processor
            .run("image prompts", &all, &control, &ledger, |subset: Vec<Scene>| async move {
                if subset.len() == 2 {
                    Err(anyhow!("rate limited"))
                } else {
                    Ok(prompts_for(&subset, "first"))
                }
            })
            .await;
        assert_eq!(ledger.results().len(), 10);

        let status = processor
            .retry("image prompts", 1, &all, &ledger, |subset: Vec<Scene>| async move {
                Ok(prompts_for(&subset, "retry"))
            })
            .await;

        assert_eq!(status, Some(BatchStatus::Done));
        let results = ledger.results();
        assert_eq!(results.len(), 12);
        assert_eq!(results[0].prompts[0], "first 1");
        assert_eq!(results[11].prompts[0], "retry 12");
        assert_eq!(ledger.batches()[1].error, None);
    }

    #[tokio::test]
    async fn test_retry_of_empty_batch_is_noop() {
        let processor = BatchProcessor::new(10, Duration::ZERO);
        let ledger: BatchLedger<SceneImagePrompts> = BatchLedger::default();
        ledger.restore(vec![Batch::new(0, vec![40, 41])], Vec::new());

        let status = processor
            .retry("image prompts", 0, &scenes(3), &ledger, |_subset: Vec<Scene>| async move {
                Err(anyhow!("should not run"))
            })
            .await;
        assert_eq!(status, None);

        let status = processor
            .retry("image prompts", 7, &scenes(3), &ledger, |_subset: Vec<Scene>| async move {
                Err(anyhow!("should not run"))
            })
            .await;
        assert_eq!(status, None);
        assert_eq!(ledger.batches()[0].status, BatchStatus::Pending);
    }
}
