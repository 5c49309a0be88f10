//! Browser capability: sessions, the driver that opens them, and the
//! action-execution engine that acts on them.
//!
//! The orchestrator only talks to these traits. `webdriver` and `agent` hold
//! the HTTP-backed implementations used by the daemon.

pub mod agent;
pub mod webdriver;

pub use self::agent::RemoteAgent;
pub use self::webdriver::WebDriverClient;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("browser request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webdriver error ({status}): {message}")]
    Driver { status: u16, message: String },

    #[error("unexpected webdriver response: {0}")]
    Protocol(String),

    #[error("{0}")]
    Action(String),

    #[error("browser session {0} is closed")]
    SessionClosed(String),
}

/// A captured page image.
#[derive(Debug, Clone, PartialEq)]
pub struct Screenshot {
    pub mime: String,
    /// Base64-encoded image bytes.
    pub base64: String,
}

impl Screenshot {
    pub fn png(base64: String) -> Self {
        Self {
            mime: "image/png".to_string(),
            base64,
        }
    }

    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime, self.base64)
    }
}

/// Coordinates an engine needs to attach to a live session.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHandle {
    pub driver_url: String,
    pub session_id: String,
}

/// Severity of a console line reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Debug,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsoleMessage {
    pub level: ConsoleLevel,
    pub text: String,
}

/// One live browser session.
#[async_trait::async_trait]
pub trait BrowserSession: Send + Sync {
    fn handle(&self) -> SessionHandle;

    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    async fn screenshot(&self) -> Result<Screenshot, BrowserError>;

    /// Release the session. Safe to call on a session that already went away.
    async fn close(&self) -> Result<(), BrowserError>;
}

/// Opens browser sessions.
#[async_trait::async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, BrowserError>;
}

/// Callbacks the engine fires while working on an instruction.
#[async_trait::async_trait]
pub trait AgentHooks: Send + Sync {
    /// A new sub-task is starting; `tip` describes it.
    async fn on_task_start(&self, tip: &str);

    async fn on_console(&self, message: ConsoleMessage);
}

/// Performs one instructed interaction, or interprets one natural-language
/// instruction, against a browser session.
#[async_trait::async_trait]
pub trait ActionEngine: Send + Sync {
    async fn act(
        &self,
        session: &dyn BrowserSession,
        instruction: &str,
        hooks: &dyn AgentHooks,
    ) -> Result<(), BrowserError>;
}
