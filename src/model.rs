//! Run records, run configuration and the events a run produces.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a test run as stored in the run store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Queued,
    Running,
    Pass,
    Fail,
    Cancelled,
}

impl RunStatus {
    /// Terminal states never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Pass | RunStatus::Fail | RunStatus::Cancelled)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Running => "RUNNING",
            RunStatus::Pass => "PASS",
            RunStatus::Fail => "FAIL",
            RunStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(RunStatus::Queued),
            "RUNNING" => Ok(RunStatus::Running),
            "PASS" => Ok(RunStatus::Pass),
            "FAIL" => Ok(RunStatus::Fail),
            "CANCELLED" => Ok(RunStatus::Cancelled),
            other => anyhow::bail!("unknown run status '{}'", other),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
    Success,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogData {
    pub message: String,
    pub level: LogLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotData {
    /// Image as a `data:` URL.
    pub src: String,
    pub label: String,
}

/// One timestamped entry in a run's ordered history.
///
/// Serialized as `{"type": "log" | "screenshot", "data": {...}, "timestamp": <ms>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Log {
        data: LogData,
        timestamp: i64,
        #[serde(rename = "browserId", default, skip_serializing_if = "Option::is_none")]
        browser_id: Option<String>,
    },
    Screenshot {
        data: ScreenshotData,
        timestamp: i64,
        #[serde(rename = "browserId", default, skip_serializing_if = "Option::is_none")]
        browser_id: Option<String>,
    },
}

impl Event {
    pub fn log(message: impl Into<String>, level: LogLevel, browser_id: Option<&str>) -> Self {
        Event::Log {
            data: LogData {
                message: message.into(),
                level,
            },
            timestamp: Utc::now().timestamp_millis(),
            browser_id: browser_id.map(str::to_string),
        }
    }

    pub fn screenshot(src: String, label: impl Into<String>, browser_id: Option<&str>) -> Self {
        Event::Screenshot {
            data: ScreenshotData {
                src,
                label: label.into(),
            },
            timestamp: Utc::now().timestamp_millis(),
            browser_id: browser_id.map(str::to_string),
        }
    }
}

// ---------------------------------------------------------------------------
// Run configuration
// ---------------------------------------------------------------------------

/// One independently addressable browser session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrowserTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl BrowserTarget {
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() || self.password.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStep {
    pub action: String,
    /// Target id; the first configured target when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// A submitted test specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<TestStep>,
    /// Insertion order matters: the first entry is the default target.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub browser_config: IndexMap<String, BrowserTarget>,
}

/// What drives a run: a literal step list or one natural-language prompt.
#[derive(Debug, Clone, Copy)]
pub enum Instructions<'a> {
    Steps(&'a [TestStep]),
    Prompt(&'a str),
}

impl RunConfig {
    fn has_target(&self) -> bool {
        !self.browser_config.is_empty() || self.url.as_deref().is_some_and(|u| !u.is_empty())
    }

    /// Steps win over the prompt when both are present.
    pub fn instructions(&self) -> Option<Instructions<'_>> {
        if !self.steps.is_empty() {
            return Some(Instructions::Steps(&self.steps));
        }
        match self.prompt.as_deref() {
            Some(p) if !p.is_empty() => Some(Instructions::Prompt(p)),
            _ => None,
        }
    }

    /// Check the invariants every submission must satisfy before it reaches
    /// the queue.
    pub fn validate(&self) -> Result<(), crate::runner::RunError> {
        if !self.has_target() {
            return Err(crate::runner::RunError::MissingTarget);
        }
        if self.instructions().is_none() {
            return Err(crate::runner::RunError::MissingInstructions);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Durable record
// ---------------------------------------------------------------------------

/// Durable projection of a run's lifecycle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// JSON event list.
    pub result: Option<String>,
    /// Legacy copy of `result`, same shape.
    pub logs: Option<String>,
    pub configuration_snapshot: String,
}

impl RunRecord {
    /// Stored events, preferring `result` and falling back to `logs`.
    pub fn events(&self) -> Vec<Event> {
        let raw = match (&self.result, &self.logs) {
            (Some(r), _) => r,
            (None, Some(l)) => l,
            (None, None) => return Vec::new(),
        };
        match serde_json::from_str::<Vec<Event>>(raw) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(run_id = %self.id, error = %e, "stored events could not be decoded");
                Vec::new()
            }
        }
    }

    pub fn config(&self) -> Option<RunConfig> {
        serde_json::from_str(&self.configuration_snapshot).ok()
    }
}
