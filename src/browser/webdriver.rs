//! W3C WebDriver client (chromedriver, geckodriver, Selenium grid).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use tracing::debug;

use super::{BrowserDriver, BrowserError, BrowserSession, Screenshot, SessionHandle};
use crate::config::DriverConfig;

/// Opens sessions on a WebDriver endpoint.
pub struct WebDriverClient {
    client: Client,
    config: DriverConfig,
}

impl WebDriverClient {
    pub fn new(config: DriverConfig) -> Result<Self, BrowserError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.navigation_timeout_secs + 30))
            .build()?;
        Ok(Self { client, config })
    }

    fn base_url(&self) -> &str {
        self.config.webdriver_url.trim_end_matches('/')
    }
}

/// New-session capabilities for a Chrome-compatible driver.
fn capabilities(config: &DriverConfig) -> Value {
    let mut args = vec![
        "--no-default-browser-check".to_string(),
        "--no-first-run".to_string(),
        "--disable-default-apps".to_string(),
        "--password-store=basic".to_string(),
        "--use-mock-keychain".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport_width, config.viewport_height
        ),
    ];
    if config.headless {
        args.push("--headless=new".to_string());
    }

    json!({
        "capabilities": {
            "alwaysMatch": {
                "browserName": "chrome",
                // DOMContentLoaded, not the full load event
                "pageLoadStrategy": "eager",
                "timeouts": { "pageLoad": config.navigation_timeout_secs * 1000 },
                "goog:chromeOptions": { "args": args }
            }
        }
    })
}

fn driver_error(status: u16, body: &Value) -> BrowserError {
    let value = &body["value"];
    let message = value["message"]
        .as_str()
        .or_else(|| value["error"].as_str())
        .unwrap_or("unknown error")
        .to_string();
    BrowserError::Driver { status, message }
}

/// Send a WebDriver command and unwrap the `value` member of the reply.
async fn send(req: RequestBuilder) -> Result<Value, BrowserError> {
    let resp = req.send().await?;
    let status = resp.status();
    let mut body: Value = resp.json().await?;
    if !status.is_success() {
        return Err(driver_error(status.as_u16(), &body));
    }
    Ok(body["value"].take())
}

#[async_trait::async_trait]
impl BrowserDriver for WebDriverClient {
    async fn open_session(&self) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let url = format!("{}/session", self.base_url());
        let value = send(self.client.post(&url).json(&capabilities(&self.config))).await?;
        let id = value["sessionId"]
            .as_str()
            .ok_or_else(|| BrowserError::Protocol("new session reply has no sessionId".to_string()))?
            .to_string();

        debug!(session_id = %id, driver = %self.base_url(), "webdriver session opened");
        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            base_url: self.base_url().to_string(),
            id,
            closed: AtomicBool::new(false),
        }))
    }
}

/// One WebDriver session.
pub struct WebDriverSession {
    client: Client,
    base_url: String,
    id: String,
    closed: AtomicBool,
}

impl WebDriverSession {
    fn endpoint(&self, command: &str) -> Result<String, BrowserError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrowserError::SessionClosed(self.id.clone()));
        }
        Ok(format!("{}/session/{}/{}", self.base_url, self.id, command))
    }
}

#[async_trait::async_trait]
impl BrowserSession for WebDriverSession {
    fn handle(&self) -> SessionHandle {
        SessionHandle {
            driver_url: self.base_url.clone(),
            session_id: self.id.clone(),
        }
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let endpoint = self.endpoint("url")?;
        send(self.client.post(&endpoint).json(&json!({ "url": url }))).await?;
        Ok(())
    }

    async fn screenshot(&self) -> Result<Screenshot, BrowserError> {
        let endpoint = self.endpoint("screenshot")?;
        match send(self.client.get(&endpoint)).await? {
            Value::String(data) => Ok(Screenshot::png(data)),
            other => Err(BrowserError::Protocol(format!(
                "screenshot reply is not a string: {}",
                other
            ))),
        }
    }

    async fn close(&self) -> Result<(), BrowserError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let url = format!("{}/session/{}", self.base_url, self.id);
        send(self.client.delete(&url)).await?;
        debug!(session_id = %self.id, "webdriver session closed");
        Ok(())
    }
}
