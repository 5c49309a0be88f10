use std::sync::Arc;

use crate::browser::BrowserSession;
use crate::model::{Event, LogLevel};

/// Callback through which a run publishes its events.
#[derive(Clone)]
pub struct Emitter {
    sink: Arc<dyn Fn(Event) + Send + Sync>,
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter").finish_non_exhaustive()
    }
}

impl Emitter {
    pub fn new(sink: impl Fn(Event) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    pub fn emit(&self, event: Event) {
        (self.sink)(event)
    }

    pub fn log(&self, message: impl Into<String>, level: LogLevel, browser_id: Option<&str>) {
        self.emit(Event::log(message, level, browser_id));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(message, LogLevel::Info, None);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.log(message, LogLevel::Success, None);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(message, LogLevel::Error, None);
    }

    /// Capture and publish a screenshot. A failed capture becomes an error
    /// log line; it never fails the run.
    pub async fn screenshot(&self, session: &dyn BrowserSession, label: &str, browser_id: Option<&str>) {
        match session.screenshot().await {
            Ok(shot) => self.emit(Event::screenshot(shot.to_data_url(), label, browser_id)),
            Err(e) => self.log(
                format!("Failed to capture screenshot: {}", e),
                LogLevel::Error,
                browser_id,
            ),
        }
    }
}
