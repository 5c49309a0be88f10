//! Per-run in-memory event log.

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::model::Event;

#[derive(Debug, Default)]
struct BufferState {
    events: Vec<Event>,
    sealed: bool,
}

/// Append-only, insertion-ordered events of one run.
///
/// Once sealed the buffer ignores further appends, so a snapshot taken at
/// sealing time stays the complete history.
#[derive(Debug, Default)]
pub struct EventBuffer {
    state: Mutex<BufferState>,
}

impl EventBuffer {
    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false` if the buffer is sealed and the event was dropped.
    pub fn push(&self, event: Event) -> bool {
        let mut state = self.lock();
        if state.sealed {
            return false;
        }
        state.events.push(event);
        true
    }

    /// Seal and return everything appended so far, in one step.
    pub fn seal(&self) -> Vec<Event> {
        let mut state = self.lock();
        state.sealed = true;
        state.events.clone()
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    /// Events appended after the first `offset` ones.
    pub fn since(&self, offset: usize) -> Vec<Event> {
        let state = self.lock();
        state.events.get(offset..).map(<[Event]>::to_vec).unwrap_or_default()
    }
}
