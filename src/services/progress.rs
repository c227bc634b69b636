use crate::core::state::parse_item_key;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Keys still to be processed, in scene/variant order, given the full key list
/// of a phase and what already finished. Shared by the image and video phases so
/// a resumed run never re-issues finished work.
pub fn resumable_worklist(all_keys: &[String], completed: &BTreeSet<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut pending: Vec<String> = all_keys
        .iter()
        .filter(|k| !completed.contains(*k) && seen.insert(k.as_str()))
        .cloned()
        .collect();
    sort_keys(&mut pending);
    pending
}

fn sort_keys(keys: &mut [String]) {
    keys.sort_by_key(|k| parse_item_key(k).unwrap_or((u32::MAX, u32::MAX)));
}

/// Per-phase bookkeeping: how many items exist, which reached a terminal
/// state, which still wait. A failed item counts as completed.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ProgressState {
    pub total: usize,
    pub completed: BTreeSet<String>,
    pub pending: BTreeSet<String>,
}

impl ProgressState {
    /// Fresh ledger for a phase start. Keys in `already_completed` that belong
    /// to the phase start out completed; everything else is pending.
    pub fn init(all_keys: &[String], already_completed: &BTreeSet<String>) -> Self {
        let known: BTreeSet<String> = all_keys.iter().cloned().collect();
        let completed: BTreeSet<String> = known.intersection(already_completed).cloned().collect();
        let pending: BTreeSet<String> = known.difference(&completed).cloned().collect();
        Self {
            total: known.len(),
            completed,
            pending,
        }
    }

    /// Move keys into `completed`. Unknown keys are ignored so the totals stay
    /// consistent; re-completing a key is a no-op.
    pub fn mark_completed<I, S>(&mut self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for key in keys {
            let key = key.as_ref();
            if self.pending.remove(key) {
                self.completed.insert(key.to_string());
            } else if !self.completed.contains(key) {
                debug!("Ignoring completion of untracked key {}", key);
            }
        }
    }

    /// Align the ledger with the phase's current key set after its prompts
    /// changed (e.g. a retried prompt batch). New keys become pending, keys the
    /// phase no longer produces leave both sets. Returns the dropped keys.
    pub fn sync_keys<S: AsRef<str>>(&mut self, all_keys: &[S]) -> Vec<String> {
        let known: BTreeSet<&str> = all_keys.iter().map(|k| k.as_ref()).collect();
        let dropped: Vec<String> = self
            .completed
            .iter()
            .chain(self.pending.iter())
            .filter(|k| !known.contains(k.as_str()))
            .cloned()
            .collect();
        self.completed.retain(|k| known.contains(k.as_str()));
        self.pending.retain(|k| known.contains(k.as_str()));
        for key in known {
            if !self.completed.contains(key) {
                self.pending.insert(key.to_string());
            }
        }
        self.total = self.completed.len() + self.pending.len();
        if !dropped.is_empty() {
            debug!("Dropped {} keys no longer produced: {:?}", dropped.len(), dropped);
        }
        dropped
    }

    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_initialized(&self) -> bool {
        self.total > 0
    }
}

/// Counts shown to a user. `completed` excludes failures, so the three
/// numbers add up to `total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
}

impl ProgressSummary {
    pub fn new(state: &ProgressState, failed: usize) -> Self {
        let failed = failed.min(state.completed.len());
        Self {
            total: state.total,
            completed: state.completed.len() - failed,
            failed,
            pending: state.pending.len(),
        }
    }
}

impl fmt::Display for ProgressSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} complete, {} failed, {} pending",
            self.completed, self.total, self.failed, self.pending
        )
    }
}
