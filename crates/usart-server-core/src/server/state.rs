//! Server run state

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Server run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    /// Waiting for the next command slot
    Receiving,
    /// Running a command handler
    Executing,
    /// Stop requested; the loop exits at its next check
    Terminating,
}

impl RunState {
    fn as_u8(self) -> u8 {
        match self {
            RunState::Receiving => 0,
            RunState::Executing => 1,
            RunState::Terminating => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunState::Receiving,
            1 => RunState::Executing,
            _ => RunState::Terminating,
        }
    }
}

/// Run state shared between the Server thread and its owner.
///
/// Only the Server thread moves between `Receiving` and `Executing`; the
/// owner only ever requests `Terminating`, which is never overwritten.
#[derive(Debug, Clone, Default)]
pub struct SharedRunState(Arc<AtomicU8>);

impl SharedRunState {
    /// Current state
    pub fn get(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Ask the run loop to terminate; sticky
    pub fn request_stop(&self) {
        self.0.store(RunState::Terminating.as_u8(), Ordering::Release);
    }

    /// Whether a stop was requested
    pub fn is_terminating(&self) -> bool {
        self.get() == RunState::Terminating
    }

    /// Move from `from` to `to`; fails if the state changed meanwhile
    pub(crate) fn advance(&self, from: RunState, to: RunState) -> bool {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state_is_receiving() {
        assert_eq!(SharedRunState::default().get(), RunState::Receiving);
    }

    #[test]
    fn test_stop_request_wins_over_transition() {
        let state = SharedRunState::default();
        assert!(state.advance(RunState::Receiving, RunState::Executing));
        state.request_stop();
        assert!(!state.advance(RunState::Executing, RunState::Receiving));
        assert!(state.is_terminating());
    }
}
