//! Execution orchestrator: drives one run through its browser sessions.
//!
//! Sessions are opened per target, instructions are handed to the
//! action-execution engine, and every step leaves a log line and a
//! screenshot behind. Whatever happens, every opened session is closed
//! before the outcome is returned.

pub mod emit;
pub mod targets;

pub use self::emit::Emitter;

use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::browser::{
    ActionEngine, AgentHooks, BrowserDriver, BrowserError, BrowserSession, ConsoleLevel,
    ConsoleMessage,
};
use crate::model::{BrowserTarget, Instructions, LogLevel, RunConfig, RunStatus};

/// Error stored on a run stopped by cancellation.
pub const CANCELLED_MESSAGE: &str = "Test was cancelled by user";

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Valid configuration (URL or BrowserConfig) is required")]
    MissingTarget,

    #[error("Instructions (Prompt or Steps) are required")]
    MissingInstructions,

    #[error("Browser instance '{target}' not found for step: {action}")]
    UnknownTarget { target: String, action: String },

    #[error("No browser agent available")]
    NoTargets,

    #[error(transparent)]
    Browser(#[from] BrowserError),

    #[error("{}", CANCELLED_MESSAGE)]
    Cancelled,
}

impl RunError {
    /// Rejected before any browser session was opened.
    pub fn is_config(&self) -> bool {
        matches!(self, RunError::MissingTarget | RunError::MissingInstructions)
    }
}

/// Terminal result of one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn pass() -> Self {
        Self {
            status: RunStatus::Pass,
            error: None,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Fail,
            error: Some(error.into()),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            status: RunStatus::Cancelled,
            error: Some(CANCELLED_MESSAGE.to_string()),
        }
    }
}

/// Runs one job to a terminal outcome.
///
/// `Err` is reserved for runs rejected before execution started; failures
/// during execution come back as a FAIL outcome.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        run_id: &str,
        config: &RunConfig,
        cancel: CancellationToken,
        emit: Emitter,
    ) -> Result<RunOutcome, RunError>;
}

struct OpenTarget {
    id: String,
    name: String,
    config: BrowserTarget,
    session: Box<dyn BrowserSession>,
}

/// Turns engine callbacks into run events for one target.
struct TargetHooks<'a> {
    emit: &'a Emitter,
    target: &'a OpenTarget,
}

#[async_trait::async_trait]
impl<'a> AgentHooks for TargetHooks<'a> {
    async fn on_task_start(&self, tip: &str) {
        let t = self.target;
        self.emit
            .log(format!("[{}] 🤖 {}", t.name, tip), LogLevel::Info, Some(&t.id));
        self.emit
            .screenshot(t.session.as_ref(), &format!("[{}] {}", t.name, tip), Some(&t.id))
            .await;
    }

    async fn on_console(&self, message: ConsoleMessage) {
        let t = self.target;
        match message.level {
            ConsoleLevel::Log | ConsoleLevel::Info => self.emit.log(
                format!("[{}] {}", t.name, message.text),
                LogLevel::Info,
                Some(&t.id),
            ),
            ConsoleLevel::Error => self.emit.log(
                format!("[{} Error] {}", t.name, message.text),
                LogLevel::Error,
                Some(&t.id),
            ),
            ConsoleLevel::Warn | ConsoleLevel::Debug => {}
        }
    }
}

/// [`Executor`] backed by a browser driver and an action-execution engine.
pub struct Orchestrator {
    driver: Arc<dyn BrowserDriver>,
    engine: Arc<dyn ActionEngine>,
}

impl Orchestrator {
    pub fn new(driver: Arc<dyn BrowserDriver>, engine: Arc<dyn ActionEngine>) -> Self {
        Self { driver, engine }
    }

    async fn drive(
        &self,
        resolved: &IndexMap<String, BrowserTarget>,
        instructions: Instructions<'_>,
        cancel: &CancellationToken,
        emit: &Emitter,
        open: &mut Vec<OpenTarget>,
    ) -> Result<(), RunError> {
        emit.info("Launching browser...");

        for (id, target) in resolved {
            if cancel.is_cancelled() {
                break;
            }
            let name = targets::display_name(id);
            emit.log(format!("Initializing {}...", name), LogLevel::Info, Some(id));

            let session = self.driver.open_session().await?;
            if open.is_empty() {
                emit.success("Browser launched successfully");
            }
            open.push(OpenTarget {
                id: id.clone(),
                name,
                config: target.clone(),
                session,
            });
            let t = &open[open.len() - 1];

            if let Some(url) = t.config.url.as_deref() {
                emit.log(
                    format!("[{}] Navigating to {}...", t.name, url),
                    LogLevel::Info,
                    Some(&t.id),
                );
                t.session.navigate(url).await?;
                emit.screenshot(
                    t.session.as_ref(),
                    &format!("[{}] Initial Page Load", t.name),
                    Some(&t.id),
                )
                .await;
            }
        }

        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        emit.success("All browser instances ready");
        emit.info("Executing test...");

        match instructions {
            Instructions::Steps(steps) => {
                for (i, step) in steps.iter().enumerate() {
                    if cancel.is_cancelled() {
                        return Err(RunError::Cancelled);
                    }
                    let wanted = step
                        .target
                        .as_deref()
                        .or_else(|| resolved.keys().next().map(String::as_str))
                        .unwrap_or(targets::MAIN_TARGET);
                    let t = open.iter().find(|t| t.id == wanted).ok_or_else(|| {
                        RunError::UnknownTarget {
                            target: wanted.to_string(),
                            action: step.action.clone(),
                        }
                    })?;

                    emit.log(
                        format!("[Step {}] Executing on {}: {}", i + 1, t.name, step.action),
                        LogLevel::Info,
                        Some(&t.id),
                    );
                    let instruction = targets::step_instruction(&step.action, &t.config);
                    self.act(t, &instruction, cancel, emit).await?;
                    emit.screenshot(
                        t.session.as_ref(),
                        &format!("[{}] Step {} Complete", t.name, i + 1),
                        Some(&t.id),
                    )
                    .await;
                }
            }
            Instructions::Prompt(prompt) => {
                let t = open.first().ok_or(RunError::NoTargets)?;
                let instruction = targets::prompt_instruction(prompt, &t.config);
                self.act(t, &instruction, cancel, emit).await?;
            }
        }

        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        emit.success("✅ Test executed successfully");

        for t in open.iter() {
            if cancel.is_cancelled() {
                break;
            }
            emit.screenshot(
                t.session.as_ref(),
                &format!("[{}] Final State", t.name),
                Some(&t.id),
            )
            .await;
        }
        Ok(())
    }

    /// One engine call. Cancellation wins the race; the in-flight call is dropped.
    async fn act(
        &self,
        target: &OpenTarget,
        instruction: &str,
        cancel: &CancellationToken,
        emit: &Emitter,
    ) -> Result<(), RunError> {
        let hooks = TargetHooks { emit, target };
        tokio::select! {
            res = self.engine.act(target.session.as_ref(), instruction, &hooks) => res.map_err(RunError::from),
            _ = cancel.cancelled() => Err(RunError::Cancelled),
        }
    }
}

#[async_trait::async_trait]
impl Executor for Orchestrator {
    async fn execute(
        &self,
        run_id: &str,
        config: &RunConfig,
        cancel: CancellationToken,
        emit: Emitter,
    ) -> Result<RunOutcome, RunError> {
        let resolved = targets::resolve(config)?;
        let instructions = config
            .instructions()
            .ok_or(RunError::MissingInstructions)?;

        let mut open = Vec::new();
        let result = self
            .drive(&resolved, instructions, &cancel, &emit, &mut open)
            .await;

        let outcome = match result {
            Ok(()) => {
                info!(run_id, "run passed");
                RunOutcome::pass()
            }
            Err(e) if cancel.is_cancelled() || matches!(e, RunError::Cancelled) => {
                info!(run_id, "run cancelled");
                RunOutcome::cancelled()
            }
            Err(e) => {
                let msg = e.to_string();
                warn!(run_id, error = %msg, "run failed");
                emit.error(format!("Critical System Error: {}", msg));
                for t in &open {
                    emit.screenshot(
                        t.session.as_ref(),
                        &format!("Error State [{}]", t.id),
                        Some(&t.id),
                    )
                    .await;
                }
                RunOutcome::fail(msg)
            }
        };

        for t in open {
            if let Err(e) = t.session.close().await {
                warn!(run_id, target = %t.id, error = %e, "failed to close browser session");
            } else {
                debug!(run_id, target = %t.id, "browser session closed");
            }
        }

        Ok(outcome)
    }
}
