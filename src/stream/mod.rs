//! Live event streams for subscribers.
//!
//! A finished run is replayed from its stored event list. An active run is
//! followed by polling the queue's live buffer; once the queue forgets the
//! run, the store decides how the stream ends. A store that still claims
//! the run is active at that point describes an orphan (the process that
//! owned it is gone) and the run is forced to FAIL.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::ser::{Serialize, SerializeMap, Serializer};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::model::{Event, RunRecord, RunStatus};
use crate::queue::TestQueue;
use crate::storage::{Completion, RunStore};

pub const ORPHAN_ERROR: &str = "Test execution interrupted (server restarted or process lost)";
pub const NOT_FOUND_ERROR: &str = "Test run not found";
pub const STREAM_ERROR: &str = "Streaming error";

const CHANNEL_CAPACITY: usize = 64;

/// One unit of a live stream: an event, or the closing status.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(Event),
    Status {
        status: RunStatus,
        error: Option<String>,
    },
}

impl Frame {
    pub fn is_status(&self) -> bool {
        matches!(self, Frame::Status { .. })
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Frame::Event(event) => event.serialize(serializer),
            Frame::Status { status, error } => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("type", "status")?;
                map.serialize_entry("status", status)?;
                if let Some(error) = error {
                    map.serialize_entry("error", error)?;
                }
                map.end()
            }
        }
    }
}

enum Step {
    Continue,
    Done,
}

/// Merges queue state and stored records into per-subscriber frame streams.
#[derive(Clone)]
pub struct StreamReconciler {
    queue: TestQueue,
    store: Arc<dyn RunStore>,
    poll_interval: Duration,
    orphan_grace: Duration,
}

impl StreamReconciler {
    pub fn new(
        queue: TestQueue,
        store: Arc<dyn RunStore>,
        poll_interval: Duration,
        orphan_grace: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            poll_interval,
            orphan_grace,
        }
    }

    /// Open a stream for `run_id`. `None` when no such run exists.
    ///
    /// Dropping the receiver stops the background work.
    pub async fn open(&self, run_id: &str) -> Result<Option<mpsc::Receiver<Frame>>> {
        let Some(record) = self.store.get(run_id).await? else {
            return Ok(None);
        };
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        if record.status.is_terminal() {
            debug!(run_id, status = %record.status, "replaying finished run");
            tokio::spawn(async move {
                finish(&tx, &record, 0).await;
            });
        } else {
            tokio::spawn(self.clone().follow(run_id.to_string(), tx));
        }
        Ok(Some(rx))
    }

    async fn follow(self, run_id: String, tx: mpsc::Sender<Frame>) {
        let mut cursor = 0;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tx.closed() => {
                    debug!(run_id = %run_id, "subscriber disconnected");
                    return;
                }
            }

            match self.step(&run_id, &mut cursor, &tx).await {
                Ok(Step::Continue) => {}
                Ok(Step::Done) => return,
                Err(e) => {
                    // The run itself is left alone; only this subscriber gives up.
                    error!(run_id = %run_id, error = %e, "live stream aborted");
                    send_status(&tx, RunStatus::Fail, Some(STREAM_ERROR.to_string())).await;
                    return;
                }
            }
        }
    }

    async fn step(&self, run_id: &str, cursor: &mut usize, tx: &mpsc::Sender<Frame>) -> Result<Step> {
        if self.queue.status(run_id).is_some() {
            for event in self.queue.events_since(run_id, *cursor) {
                if tx.send(Frame::Event(event)).await.is_err() {
                    return Ok(Step::Done);
                }
                *cursor += 1;
            }
            return Ok(Step::Continue);
        }

        match self.store.get(run_id).await? {
            Some(rec) if rec.status.is_terminal() => {
                finish(tx, &rec, *cursor).await;
                Ok(Step::Done)
            }
            Some(_) => self.settle_or_fail(run_id, *cursor, tx).await,
            None => {
                send_status(tx, RunStatus::Fail, Some(NOT_FOUND_ERROR.to_string())).await;
                Ok(Step::Done)
            }
        }
    }

    /// The queue forgot the run but the store still calls it active. Give an
    /// in-flight write a moment to land before treating the run as orphaned.
    async fn settle_or_fail(&self, run_id: &str, cursor: usize, tx: &mpsc::Sender<Frame>) -> Result<Step> {
        tokio::time::sleep(self.orphan_grace).await;
        if self.queue.status(run_id).is_some() {
            return Ok(Step::Continue);
        }

        let rec = match self.store.get(run_id).await? {
            Some(rec) => rec,
            None => {
                send_status(tx, RunStatus::Fail, Some(NOT_FOUND_ERROR.to_string())).await;
                return Ok(Step::Done);
            }
        };
        if rec.status.is_terminal() {
            finish(tx, &rec, cursor).await;
            return Ok(Step::Done);
        }

        warn!(run_id, status = %rec.status, "orphaned run detected, marking FAIL");
        let completion = Completion::new(RunStatus::Fail, Some(ORPHAN_ERROR.to_string()), None);
        if self.store.complete(run_id, completion).await? {
            send_status(tx, RunStatus::Fail, Some(ORPHAN_ERROR.to_string())).await;
        } else if let Some(rec) = self.store.get(run_id).await? {
            // Someone else finished it first.
            finish(tx, &rec, cursor).await;
        }
        Ok(Step::Done)
    }
}

/// Stored events past `cursor`, then the closing status.
async fn finish(tx: &mpsc::Sender<Frame>, record: &RunRecord, cursor: usize) {
    for event in record.events().into_iter().skip(cursor) {
        if tx.send(Frame::Event(event)).await.is_err() {
            return;
        }
    }
    send_status(tx, record.status, record.error.clone()).await;
}

async fn send_status(tx: &mpsc::Sender<Frame>, status: RunStatus, error: Option<String>) {
    // A closed channel just means the subscriber left.
    let _ = tx.send(Frame::Status { status, error }).await;
}

/// Force every record still claiming QUEUED or RUNNING to FAIL. Only valid
/// while no queue is serving the same store.
pub async fn fail_orphans(store: &dyn RunStore) -> Result<Vec<String>> {
    let mut repaired = Vec::new();
    for id in store.active_run_ids().await? {
        let completion = Completion::new(RunStatus::Fail, Some(ORPHAN_ERROR.to_string()), None);
        if store.complete(&id, completion).await? {
            info!(run_id = %id, "orphaned run marked FAIL");
            repaired.push(id);
        }
    }
    Ok(repaired)
}
