//! Tree-stable timer: coalesces a burst of matching changes into one set.
//!
//! Every matching change pushes the deadline out to `now + window`; the set
//! is emitted only once the window passes without another matching change.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::models::change::Change;

#[derive(Debug, Clone, Default)]
pub enum TimerState {
    #[default]
    Idle,
    Accumulating {
        deadline: Instant,
        changes: Vec<Arc<Change>>,
    },
}

#[derive(Debug)]
pub struct StableSetAssembler {
    window: Duration,
    state: TimerState,
}

impl StableSetAssembler {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: TimerState::Idle,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn state(&self) -> &TimerState {
        &self.state
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            TimerState::Idle => None,
            TimerState::Accumulating { deadline, .. } => Some(deadline),
        }
    }

    /// Accept a change that already passed the scheduler's filter.
    pub fn add_change(&mut self, change: Arc<Change>, now: Instant) {
        let deadline = now + self.window;
        match self.state {
            TimerState::Idle => {
                self.state = TimerState::Accumulating {
                    deadline,
                    changes: vec![change],
                };
            }
            TimerState::Accumulating {
                deadline: ref mut current,
                ref mut changes,
            } => {
                *current = deadline;
                if !changes.iter().any(|c| c.id == change.id) {
                    changes.push(change);
                }
            }
        }
    }

    /// Emit the stable set if the deadline has passed, returning to idle.
    pub fn poll(&mut self, now: Instant) -> Option<Vec<Arc<Change>>> {
        if !self.deadline().is_some_and(|deadline| now >= deadline) {
            return None;
        }
        match std::mem::take(&mut self.state) {
            TimerState::Accumulating { mut changes, .. } => {
                changes.sort_by_key(|c| c.id);
                Some(changes)
            }
            TimerState::Idle => None,
        }
    }

    /// Drop anything accumulated without emitting it.
    pub fn reset(&mut self) -> usize {
        match std::mem::take(&mut self.state) {
            TimerState::Accumulating { changes, .. } => changes.len(),
            TimerState::Idle => 0,
        }
    }
}
