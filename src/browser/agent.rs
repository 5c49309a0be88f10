//! Remote action-execution engine.
//!
//! The engine runs as a separate service that attaches to our WebDriver
//! session. `POST {endpoint}/act` replies with newline-delimited JSON, read
//! chunk by chunk so tips and console lines reach the run as they happen:
//!
//! ```text
//! {"type":"tip","text":"Clicking the login button"}
//! {"type":"console","level":"error","text":"Uncaught TypeError"}
//! {"type":"error","message":"element not found"}
//! {"type":"done"}
//! ```

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use super::{ActionEngine, AgentHooks, BrowserError, BrowserSession, ConsoleLevel, ConsoleMessage};
use crate::config::AgentConfig;

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
enum AgentLine {
    Tip { text: String },
    Console { level: ConsoleLevel, text: String },
    Error { message: String },
    Done,
}

/// HTTP client for the remote engine.
pub struct RemoteAgent {
    client: Client,
    endpoint: String,
}

impl RemoteAgent {
    pub fn new(config: &AgentConfig) -> Result<Self, BrowserError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }
}

/// Reassembles lines from arbitrarily split body chunks. Bytes are only
/// decoded once a full line is present, so multi-byte characters survive a
/// chunk boundary.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and return every line it completed.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever trails the last newline.
    fn finish(self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }
}

/// Feed one NDJSON line to the hooks. Returns the failure carried by an
/// `error` line.
async fn dispatch_line(line: &str, hooks: &dyn AgentHooks) -> Option<String> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<AgentLine>(line) {
        Ok(AgentLine::Tip { text }) => {
            hooks.on_task_start(&text).await;
            None
        }
        Ok(AgentLine::Console { level, text }) => {
            hooks.on_console(ConsoleMessage { level, text }).await;
            None
        }
        Ok(AgentLine::Error { message }) => Some(message),
        Ok(AgentLine::Done) => None,
        Err(e) => {
            warn!(error = %e, line, "unrecognised engine output");
            None
        }
    }
}

#[async_trait::async_trait]
impl ActionEngine for RemoteAgent {
    async fn act(
        &self,
        session: &dyn BrowserSession,
        instruction: &str,
        hooks: &dyn AgentHooks,
    ) -> Result<(), BrowserError> {
        let handle = session.handle();
        debug!(session_id = %handle.session_id, "sending instruction to engine");

        let mut resp = self
            .client
            .post(format!("{}/act", self.endpoint))
            .json(&json!({
                "driverUrl": handle.driver_url,
                "sessionId": handle.session_id,
                "instruction": instruction,
            }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BrowserError::Action(format!(
                "engine returned {}: {}",
                status,
                body.trim()
            )));
        }

        let mut lines = LineBuffer::default();
        let mut failure = None;
        while let Some(chunk) = resp.chunk().await? {
            for line in lines.push(&chunk) {
                if let Some(msg) = dispatch_line(&line, hooks).await {
                    failure = Some(msg);
                }
            }
        }
        if let Some(msg) = dispatch_line(&lines.finish(), hooks).await {
            failure = Some(msg);
        }

        match failure {
            Some(msg) => Err(BrowserError::Action(msg)),
            None => Ok(()),
        }
    }
}
