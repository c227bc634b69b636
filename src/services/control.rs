use crate::core::state::{GenerationPhase, GenerationState};
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default)]
struct ControlState {
    state: GenerationState,
    phase: Option<GenerationPhase>,
}

/// Shared run-state flag that every long-running loop consults at its
/// checkpoints. Cloning hands out another handle to the same state.
#[derive(Debug, Clone, Default)]
pub struct GenerationControl {
    inner: Arc<Mutex<ControlState>>,
}

impl GenerationControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> GenerationState {
        self.inner.lock().state
    }

    pub fn phase(&self) -> Option<GenerationPhase> {
        self.inner.lock().phase
    }

    pub fn is_halted(&self) -> bool {
        self.state().is_halted()
    }

    /// Enter `phase` in the running state. Starting a phase is always explicit,
    /// so this succeeds from any state.
    pub fn begin(&self, phase: GenerationPhase) {
        let mut inner = self.inner.lock();
        info!("Starting phase: {} (was {:?})", phase, inner.state);
        inner.state = GenerationState::Running;
        inner.phase = Some(phase);
    }

    /// Leave the current phase after it ran to completion. A pause or stop that
    /// landed meanwhile wins.
    pub fn finish_phase(&self) {
        let mut inner = self.inner.lock();
        if inner.state == GenerationState::Running {
            debug!("Phase finished: {:?}", inner.phase);
            inner.state = GenerationState::Idle;
            inner.phase = None;
        }
    }

    pub fn pause(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != GenerationState::Running {
            debug!("Ignoring pause in state {:?}", inner.state);
            return false;
        }
        info!("Pausing during {:?}", inner.phase);
        inner.state = GenerationState::Paused;
        true
    }

    /// Flip back to running. Re-entering the right phase loop is up to the caller.
    pub fn resume(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != GenerationState::Paused {
            debug!("Ignoring resume in state {:?}", inner.state);
            return false;
        }
        info!("Resuming {:?}", inner.phase);
        inner.state = GenerationState::Running;
        true
    }

    /// Stop from any state but stopped. Idle counts, so a caller can block
    /// the next phase before it starts.
    pub fn stop(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == GenerationState::Stopped {
            debug!("Ignoring stop in state {:?}", inner.state);
            return false;
        }
        info!("Stopping during {:?}", inner.phase);
        inner.state = GenerationState::Stopped;
        true
    }

    /// Force the stopped state regardless of the current one; used when a phase
    /// cannot proceed at all.
    pub fn abort(&self, phase: GenerationPhase) {
        let mut inner = self.inner.lock();
        inner.state = GenerationState::Stopped;
        inner.phase = Some(phase);
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = GenerationState::Idle;
        inner.phase = None;
    }

    pub(crate) fn restore(&self, state: GenerationState, phase: Option<GenerationPhase>) {
        let mut inner = self.inner.lock();
        inner.state = state;
        inner.phase = phase;
    }
}
