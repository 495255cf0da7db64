//! Lifecycle states of workers and listeners.
//!
//! Transitions only move forward; a rejected transition reports both ends.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid transition from {from:?} to {to:?}")]
pub struct StateError<S: std::fmt::Debug> {
    pub from: S,
    pub to: S,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerState {
    Running,
    Terminating,
    Closed,
}

impl WorkerState {
    pub fn transition(&mut self, to: WorkerState) -> Result<(), StateError<WorkerState>> {
        let allowed = matches!(
            (*self, to),
            (WorkerState::Running, WorkerState::Terminating)
                | (WorkerState::Terminating, WorkerState::Closed)
        );
        if !allowed {
            return Err(StateError { from: *self, to });
        }
        *self = to;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ListenerState {
    Initializing,
    Listening,
    Terminating,
    Closed,
}

impl ListenerState {
    pub fn transition(&mut self, to: ListenerState) -> Result<(), StateError<ListenerState>> {
        let allowed = matches!(
            (*self, to),
            (ListenerState::Initializing, ListenerState::Listening)
                | (ListenerState::Initializing, ListenerState::Closed)
                | (ListenerState::Listening, ListenerState::Terminating)
                | (ListenerState::Terminating, ListenerState::Closed)
        );
        if !allowed {
            return Err(StateError { from: *self, to });
        }
        *self = to;
        Ok(())
    }
}
