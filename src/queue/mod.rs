//! In-process run queue: FIFO admission, bounded concurrency, cancellation.
//!
//! The wait list, the running set and the event buffers share one mutex that
//! is never held across an `.await`. Admission, dispatch and completion
//! bookkeeping each run inside a single critical section, so at most
//! `concurrency` runs execute and wait-list order is preserved. Store writes
//! happen outside the lock; a failed write is logged and scheduling carries
//! on from the in-memory state.

pub mod buffer;

pub use self::buffer::EventBuffer;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::model::{Event, RunConfig, RunStatus};
use crate::runner::{Emitter, Executor, RunError, RunOutcome};
use crate::storage::{Completion, RunStore};

pub const STOPPED_BY_USER: &str = "Test stopped by user";
pub const CANCELLED_WHILE_QUEUED: &str = "Cancelled while queued";
pub const FORCE_CANCELLED: &str = "Force cancelled (orphaned run)";

/// Scheduling limits.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub concurrency: usize,
    pub job_timeout: Duration,
    /// How long a finished run's buffer stays readable.
    pub buffer_grace: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            job_timeout: Duration::from_secs(600),
            buffer_grace: Duration::from_secs(10),
        }
    }
}

/// In-memory view of a run. Anything else has to be looked up in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LiveStatus {
    Running,
    Queued,
}

impl From<LiveStatus> for RunStatus {
    fn from(s: LiveStatus) -> Self {
        match s {
            LiveStatus::Running => RunStatus::Running,
            LiveStatus::Queued => RunStatus::Queued,
        }
    }
}

struct Job {
    run_id: String,
    config: RunConfig,
    cancel: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    waiting: VecDeque<Job>,
    running: HashMap<String, CancellationToken>,
    buffers: HashMap<String, Arc<EventBuffer>>,
}

impl QueueState {
    fn is_tracked(&self, run_id: &str) -> bool {
        self.running.contains_key(run_id) || self.waiting.iter().any(|j| j.run_id == run_id)
    }
}

enum CancelAction {
    /// Token fired; carries the sealed buffer contents.
    Running(Vec<Event>),
    Queued,
    AlreadyCancelling,
    Untracked,
}

struct Inner {
    settings: QueueSettings,
    store: Arc<dyn RunStore>,
    executor: Arc<dyn Executor>,
    state: Mutex<QueueState>,
}

/// Handle to the run queue. Clones share the same queue.
#[derive(Clone)]
pub struct TestQueue {
    inner: Arc<Inner>,
}

impl TestQueue {
    pub fn new(settings: QueueSettings, store: Arc<dyn RunStore>, executor: Arc<dyn Executor>) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                store,
                executor,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a run. Returns once it is queued and dispatch was attempted;
    /// never waits for the run itself.
    pub async fn submit(&self, run_id: impl Into<String>, config: RunConfig) {
        let run_id = run_id.into();
        let snapshot = config.clone();

        let queued = {
            let mut state = self.state();
            if state.is_tracked(&run_id) {
                None
            } else {
                state
                    .buffers
                    .insert(run_id.clone(), Arc::new(EventBuffer::default()));
                state.waiting.push_back(Job {
                    run_id: run_id.clone(),
                    config,
                    cancel: CancellationToken::new(),
                });
                Some(state.waiting.len())
            }
        };
        let Some(depth) = queued else {
            warn!(run_id = %run_id, "run is already queued or running, ignoring submit");
            return;
        };
        info!(run_id = %run_id, depth, "run queued");

        if let Err(e) = self.inner.store.create(&run_id, &snapshot).await {
            error!(run_id = %run_id, error = %e, "failed to persist QUEUED status");
        }

        self.dispatch();
    }

    /// Cancel a run. Safe to repeat, and a no-op for finished runs.
    pub async fn cancel(&self, run_id: &str) {
        self.cancel_with(run_id, STOPPED_BY_USER).await
    }

    async fn cancel_with(&self, run_id: &str, reason: &str) {
        match self.begin_cancel(run_id) {
            CancelAction::Running(events) => {
                info!(run_id, events = events.len(), reason, "cancelling running run");
                let completion =
                    Completion::new(RunStatus::Cancelled, Some(reason.to_string()), Some(events));
                self.persist(run_id, completion).await;
            }
            CancelAction::Queued => {
                info!(run_id, "cancelled run before it started");
                let completion = Completion::new(
                    RunStatus::Cancelled,
                    Some(CANCELLED_WHILE_QUEUED.to_string()),
                    None,
                );
                self.persist(run_id, completion).await;
            }
            CancelAction::AlreadyCancelling => {
                debug!(run_id, "run is already cancelling");
            }
            CancelAction::Untracked => match self.inner.store.get(run_id).await {
                Ok(Some(rec)) if rec.status.is_active() => {
                    warn!(run_id, status = %rec.status, "orphaned run, forcing CANCELLED");
                    let completion = Completion::new(
                        RunStatus::Cancelled,
                        Some(FORCE_CANCELLED.to_string()),
                        None,
                    );
                    self.persist(run_id, completion).await;
                }
                Ok(_) => debug!(run_id, "cancel ignored, run is not active"),
                Err(e) => error!(run_id, error = %e, "failed to read run while cancelling"),
            },
        }
    }

    fn begin_cancel(&self, run_id: &str) -> CancelAction {
        let mut state = self.state();

        if let Some(token) = state.running.get(run_id) {
            if token.is_cancelled() {
                return CancelAction::AlreadyCancelling;
            }
            token.cancel();
            let events = state
                .buffers
                .get(run_id)
                .map(|b| b.seal())
                .unwrap_or_default();
            return CancelAction::Running(events);
        }

        if let Some(pos) = state.waiting.iter().position(|j| j.run_id == run_id) {
            if let Some(job) = state.waiting.remove(pos) {
                job.cancel.cancel();
            }
            state.buffers.remove(run_id);
            return CancelAction::Queued;
        }

        CancelAction::Untracked
    }

    /// In-memory status only; `None` covers both "finished" and "never seen".
    pub fn status(&self, run_id: &str) -> Option<LiveStatus> {
        let state = self.state();
        if state.running.contains_key(run_id) {
            Some(LiveStatus::Running)
        } else if state.waiting.iter().any(|j| j.run_id == run_id) {
            Some(LiveStatus::Queued)
        } else {
            None
        }
    }

    fn buffer(&self, run_id: &str) -> Option<Arc<EventBuffer>> {
        self.state().buffers.get(run_id).cloned()
    }

    /// Live events of a run; empty when no buffer exists.
    pub fn events(&self, run_id: &str) -> Vec<Event> {
        self.buffer(run_id).map(|b| b.snapshot()).unwrap_or_default()
    }

    /// Live events past the first `offset`.
    pub fn events_since(&self, run_id: &str, offset: usize) -> Vec<Event> {
        self.buffer(run_id).map(|b| b.since(offset)).unwrap_or_default()
    }

    pub fn running_count(&self) -> usize {
        self.state().running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.state().waiting.len()
    }

    /// Move jobs from the wait list into free slots. Caller holds the lock.
    fn take_dispatchable(&self, state: &mut QueueState) -> Vec<(Job, Arc<EventBuffer>)> {
        let mut started = Vec::new();
        while state.running.len() < self.inner.settings.concurrency {
            let Some(job) = state.waiting.pop_front() else {
                break;
            };
            state.running.insert(job.run_id.clone(), job.cancel.clone());
            let buffer = state.buffers.entry(job.run_id.clone()).or_default().clone();
            started.push((job, buffer));
        }
        started
    }

    fn dispatch(&self) {
        let started = {
            let mut state = self.state();
            self.take_dispatchable(&mut state)
        };
        self.spawn_all(started);
    }

    fn spawn_all(&self, started: Vec<(Job, Arc<EventBuffer>)>) {
        for (job, buffer) in started {
            let queue = self.clone();
            tokio::spawn(queue.run_job(job, buffer));
        }
    }

    async fn run_job(self, job: Job, buffer: Arc<EventBuffer>) {
        let Job {
            run_id,
            config,
            cancel,
        } = job;
        info!(run_id = %run_id, "run started");

        match self.inner.store.mark_running(&run_id, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => debug!(run_id = %run_id, "record was not QUEUED, RUNNING not recorded"),
            Err(e) => error!(run_id = %run_id, error = %e, "failed to persist RUNNING status"),
        }

        let emit = {
            let buffer = buffer.clone();
            Emitter::new(move |event| {
                buffer.push(event);
            })
        };
        let executor = self.inner.executor.clone();
        let exec_id = run_id.clone();
        let exec_cancel = cancel.clone();
        let mut handle = tokio::spawn(async move {
            executor.execute(&exec_id, &config, exec_cancel, emit).await
        });

        let timeout = self.inner.settings.job_timeout;
        let joined = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(run_id = %run_id, timeout_secs = timeout.as_secs(), "run exceeded maximum duration");
                let reason = format!(
                    "Test exceeded maximum duration of {}s",
                    timeout.as_secs()
                );
                self.cancel_with(&run_id, &reason).await;
                handle.await
            }
        };

        self.record_outcome(&run_id, &cancel, &buffer, joined).await;
        self.release(&run_id, buffer);
    }

    async fn record_outcome(
        &self,
        run_id: &str,
        cancel: &CancellationToken,
        buffer: &EventBuffer,
        joined: Result<Result<RunOutcome, RunError>, JoinError>,
    ) {
        if cancel.is_cancelled() {
            // The cancel path already wrote the terminal record.
            debug!(run_id, "run unwound after cancellation");
            return;
        }

        let events = buffer.snapshot();
        let completion = match joined {
            Ok(Ok(outcome)) => {
                info!(run_id, status = %outcome.status, events = events.len(), "run finished");
                Completion::new(outcome.status, outcome.error, Some(events))
            }
            Ok(Err(e)) => {
                error!(run_id, error = %e, "run rejected by executor");
                Completion::new(RunStatus::Fail, Some(e.to_string()), Some(events))
            }
            Err(e) => {
                error!(run_id, error = %e, "run task ended unexpectedly");
                Completion::new(RunStatus::Fail, Some(e.to_string()), Some(events))
            }
        };
        self.persist(run_id, completion).await;
    }

    /// Completion bookkeeping: free the slot, schedule buffer removal,
    /// start whatever fits.
    fn release(&self, run_id: &str, buffer: Arc<EventBuffer>) {
        let started = {
            let mut state = self.state();
            state.running.remove(run_id);
            self.take_dispatchable(&mut state)
        };
        self.schedule_buffer_cleanup(run_id, buffer);
        self.spawn_all(started);
    }

    fn schedule_buffer_cleanup(&self, run_id: &str, buffer: Arc<EventBuffer>) {
        let queue = self.clone();
        let run_id = run_id.to_string();
        let grace = self.inner.settings.buffer_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            queue.drop_buffer(&run_id, &buffer);
        });
    }

    fn drop_buffer(&self, run_id: &str, buffer: &Arc<EventBuffer>) {
        let mut state = self.state();
        // A resubmitted run with the same id owns a fresh buffer.
        if state
            .buffers
            .get(run_id)
            .is_some_and(|b| Arc::ptr_eq(b, buffer))
        {
            state.buffers.remove(run_id);
            debug!(run_id, "live event buffer released");
        }
    }

    async fn persist(&self, run_id: &str, completion: Completion) {
        let status = completion.status;
        match self.inner.store.complete(run_id, completion).await {
            Ok(true) => debug!(run_id, %status, "terminal status persisted"),
            Ok(false) => debug!(run_id, %status, "record already terminal, left unchanged"),
            Err(e) => error!(run_id, %status, error = %e, "failed to persist terminal status"),
        }
    }
}
