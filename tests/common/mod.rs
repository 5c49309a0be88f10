//! Shared fakes for the integration suites.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use autotest::browser::{
    ActionEngine, AgentHooks, BrowserDriver, BrowserError, BrowserSession, ConsoleLevel,
    ConsoleMessage, Screenshot, SessionHandle,
};
use autotest::model::{Event, RunConfig, RunRecord, RunStatus};
use autotest::queue::{QueueSettings, TestQueue};
use autotest::runner::{Emitter, Executor, RunError, RunOutcome};
use autotest::storage::{RunStore, SqliteRunStore};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub fn temp_store() -> (tempfile::TempDir, Arc<SqliteRunStore>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs.db");
    let pool = autotest::storage::open_pool(path.to_str().unwrap()).unwrap();
    (dir, Arc::new(SqliteRunStore::new(pool)))
}

pub fn prompt_config(url: &str, prompt: &str) -> RunConfig {
    RunConfig {
        url: Some(url.to_string()),
        prompt: Some(prompt.to_string()),
        ..Default::default()
    }
}

/// Poll until `check` holds, panicking after five seconds.
pub async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll the store until the record reaches `status`.
pub async fn wait_for_status(store: &dyn RunStore, run_id: &str, status: RunStatus) -> RunRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(rec) = store.get(run_id).await.unwrap() {
            if rec.status == status {
                return rec;
            }
        }
        if tokio::time::Instant::now() > deadline {
            let current = store.get(run_id).await.unwrap().map(|r| r.status);
            panic!("run {} never reached {}, last seen {:?}", run_id, status, current);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn messages(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Log { data, .. } => Some(data.message.clone()),
            Event::Screenshot { .. } => None,
        })
        .collect()
}

pub fn screenshot_labels(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            Event::Screenshot { data, .. } => Some(data.label.clone()),
            Event::Log { .. } => None,
        })
        .collect()
}

/// Emitter that collects into a shared vector.
pub fn recording_emitter() -> (Emitter, Arc<Mutex<Vec<Event>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let emit = Emitter::new(move |e| sink.lock().unwrap().push(e));
    (emit, events)
}

// ---------------------------------------------------------------------------
// Gated executor: runs block until the test hands out permits
// ---------------------------------------------------------------------------

pub struct GateExecutor {
    gate: Semaphore,
    pub started: Mutex<Vec<String>>,
    active: AtomicUsize,
    pub peak: AtomicUsize,
    /// Run ids whose execution panics instead of finishing.
    pub panics: Mutex<Vec<String>>,
    /// Whether a cancelled run keeps emitting while it unwinds.
    pub chatty_unwind: bool,
}

impl GateExecutor {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    pub fn chatty() -> Arc<Self> {
        Self::build(true)
    }

    fn build(chatty_unwind: bool) -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            started: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            panics: Mutex::new(Vec::new()),
            chatty_unwind,
        })
    }

    /// Let `n` blocked runs finish with PASS.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Executor for GateExecutor {
    async fn execute(
        &self,
        run_id: &str,
        _config: &RunConfig,
        cancel: CancellationToken,
        emit: Emitter,
    ) -> Result<RunOutcome, RunError> {
        self.started.lock().unwrap().push(run_id.to_string());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        emit.info(format!("{} started", run_id));

        if self.panics.lock().unwrap().iter().any(|id| id == run_id) {
            self.active.fetch_sub(1, Ordering::SeqCst);
            panic!("executor blew up");
        }

        let outcome = tokio::select! {
            permit = self.gate.acquire() => {
                permit.unwrap().forget();
                emit.success(format!("{} done", run_id));
                RunOutcome::pass()
            }
            _ = cancel.cancelled() => {
                if self.chatty_unwind {
                    emit.info("still cleaning up");
                }
                RunOutcome::cancelled()
            }
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(outcome)
    }
}

pub fn queue_with(
    concurrency: usize,
    store: Arc<dyn RunStore>,
    executor: Arc<dyn Executor>,
) -> TestQueue {
    let settings = QueueSettings {
        concurrency,
        job_timeout: Duration::from_secs(30),
        buffer_grace: Duration::from_millis(200),
    };
    TestQueue::new(settings, store, executor)
}

// ---------------------------------------------------------------------------
// Browser fakes
// ---------------------------------------------------------------------------

/// Everything the fake browser saw, in order.
pub type Journal = Arc<Mutex<Vec<String>>>;

pub struct FakeDriver {
    pub journal: Journal,
    opened: AtomicUsize,
    pub broken_screenshots: bool,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            journal: Journal::default(),
            opened: AtomicUsize::new(0),
            broken_screenshots: false,
        })
    }

    pub fn with_broken_screenshots() -> Arc<Self> {
        Arc::new(Self {
            journal: Journal::default(),
            opened: AtomicUsize::new(0),
            broken_screenshots: true,
        })
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.journal().iter().filter(|l| l.starts_with(prefix)).count()
    }
}

#[async_trait::async_trait]
impl BrowserDriver for FakeDriver {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let n = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("s{}", n);
        self.journal.lock().unwrap().push(format!("open {}", id));
        Ok(Box::new(FakeSession {
            id,
            journal: self.journal.clone(),
            broken_screenshots: self.broken_screenshots,
        }))
    }
}

pub struct FakeSession {
    id: String,
    journal: Journal,
    broken_screenshots: bool,
}

#[async_trait::async_trait]
impl BrowserSession for FakeSession {
    fn handle(&self) -> SessionHandle {
        SessionHandle {
            driver_url: "http://fake-driver".to_string(),
            session_id: self.id.clone(),
        }
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("navigate {} {}", self.id, url));
        Ok(())
    }

    async fn screenshot(&self) -> Result<Screenshot, BrowserError> {
        if self.broken_screenshots {
            return Err(BrowserError::SessionClosed(self.id.clone()));
        }
        Ok(Screenshot::png(format!("png-{}", self.id)))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.journal.lock().unwrap().push(format!("close {}", self.id));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum Script {
    Pass,
    Fail(String),
    /// Never finishes on its own.
    Hang,
}

/// Engine that records every call and behaves per its script.
pub struct FakeEngine {
    script: Script,
    tips: Vec<String>,
    console: Vec<ConsoleMessage>,
    /// (session id, instruction) per call.
    pub calls: Mutex<Vec<(String, String)>>,
}

impl FakeEngine {
    pub fn new(script: Script) -> Arc<Self> {
        Self::with_callbacks(script, Vec::new(), Vec::new())
    }

    pub fn with_callbacks(script: Script, tips: Vec<&str>, console: Vec<(ConsoleLevel, &str)>) -> Arc<Self> {
        Arc::new(Self {
            script,
            tips: tips.into_iter().map(str::to_string).collect(),
            console: console
                .into_iter()
                .map(|(level, text)| ConsoleMessage {
                    level,
                    text: text.to_string(),
                })
                .collect(),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ActionEngine for FakeEngine {
    async fn act(
        &self,
        session: &dyn BrowserSession,
        instruction: &str,
        hooks: &dyn AgentHooks,
    ) -> Result<(), BrowserError> {
        self.calls
            .lock()
            .unwrap()
            .push((session.handle().session_id, instruction.to_string()));
        for tip in &self.tips {
            hooks.on_task_start(tip).await;
        }
        for line in &self.console {
            hooks.on_console(line.clone()).await;
        }
        match &self.script {
            Script::Pass => Ok(()),
            Script::Fail(msg) => Err(BrowserError::Action(msg.clone())),
            Script::Hang => std::future::pending().await,
        }
    }
}
