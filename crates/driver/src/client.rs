//! Minimal WebDriver (HTTP/JSON) client.
//!
//! Speaks just enough of the W3C WebDriver wire protocol to open a remote
//! session, drive it, and tear it down. The protocol itself is treated as a
//! black box; what matters here is the split between *transport* failures
//! (the connection to the container died) and *protocol* errors (the command
//! failed but the connection is fine), because the session state machine
//! escalates only the former.

use std::time::Duration;

use {
    async_trait::async_trait,
    corral_factory::{Endpoint, ReadyProbe},
    serde_json::{Value, json},
    thiserror::Error,
    tracing::{debug, trace},
};

/// Path prefix the browser containers serve WebDriver under.
pub const WEBDRIVER_PATH: &str = "/wd/hub";

/// Errors from the WebDriver connection.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The HTTP request itself failed: connection refused, reset, timed out.
    /// This is a connection-level fault.
    #[error("webdriver transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The remote end answered with a WebDriver error. Task-scoped; the
    /// connection is still usable.
    #[error("webdriver error {error}: {message}")]
    WebDriver { error: String, message: String },

    /// The remote end answered with something that is not WebDriver JSON.
    #[error("invalid webdriver response: {0}")]
    InvalidResponse(String),
}

impl ClientError {
    /// Whether this error means the connection to the session is gone.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// A live WebDriver session on a remote endpoint.
#[derive(Debug)]
pub struct WebDriverClient {
    http: reqwest::Client,
    base_url: String,
    session_id: String,
}

impl WebDriverClient {
    /// Open a new remote session at `base_url` (e.g.
    /// `http://127.0.0.1:32768/wd/hub`) with the given W3C capabilities.
    pub async fn open(
        http: reqwest::Client,
        base_url: impl Into<String>,
        capabilities: Value,
    ) -> Result<Self, ClientError> {
        let base_url = base_url.into();
        let body = json!({ "capabilities": { "alwaysMatch": capabilities } });
        let response = http
            .post(format!("{base_url}/session"))
            .json(&body)
            .send()
            .await?;
        let value = unwrap_value(response).await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::InvalidResponse("missing sessionId".into()))?
            .to_string();
        debug!(session_id, base_url, "webdriver session opened");
        Ok(Self { http, base_url, session_id })
    }

    /// The remote session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// A client over an already-known session id, bypassing `open`.
    #[cfg(test)]
    pub(crate) fn for_tests(base_url: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            session_id: session_id.into(),
        }
    }

    /// Navigate to `url`.
    pub async fn goto(&self, url: &str) -> Result<(), ClientError> {
        trace!(url, "navigate");
        let response = self
            .http
            .post(self.session_url("url"))
            .json(&json!({ "url": url }))
            .send()
            .await?;
        unwrap_value(response).await?;
        Ok(())
    }

    /// Read the current page title.
    pub async fn title(&self) -> Result<String, ClientError> {
        let response = self.http.get(self.session_url("title")).send().await?;
        as_string(unwrap_value(response).await?)
    }

    /// Read the current URL.
    pub async fn current_url(&self) -> Result<String, ClientError> {
        let response = self.http.get(self.session_url("url")).send().await?;
        as_string(unwrap_value(response).await?)
    }

    /// Synchronously execute a JavaScript snippet in the page.
    pub async fn execute_script(
        &self,
        script: &str,
        args: Vec<Value>,
    ) -> Result<Value, ClientError> {
        let response = self
            .http
            .post(self.session_url("execute/sync"))
            .json(&json!({ "script": script, "args": args }))
            .send()
            .await?;
        unwrap_value(response).await
    }

    /// Delete the remote session. Best-effort by convention: callers tearing
    /// down a container ignore the result.
    pub async fn quit(&self) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(format!("{}/session/{}", self.base_url, self.session_id))
            .send()
            .await?;
        unwrap_value(response).await?;
        debug!(session_id = self.session_id, "webdriver session deleted");
        Ok(())
    }

    fn session_url(&self, command: &str) -> String {
        format!("{}/session/{}/{}", self.base_url, self.session_id, command)
    }
}

/// Extract `value` from a WebDriver response, mapping protocol errors.
async fn unwrap_value(response: reqwest::Response) -> Result<Value, ClientError> {
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
    let value = body.get("value").cloned().unwrap_or(Value::Null);
    if !status.is_success() {
        let error = value
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Err(ClientError::WebDriver { error, message });
    }
    Ok(value)
}

fn as_string(value: Value) -> Result<String, ClientError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ClientError::InvalidResponse(format!("expected string, got {value}")))
}

/// Readiness = the WebDriver `/status` endpoint answers 200.
///
/// A TCP connect is not enough: the container accepts connections before the
/// browser service can take commands, so this probes the protocol's own
/// health endpoint the way the upstream hub intends.
#[derive(Debug, Clone)]
pub struct WebDriverReadyProbe {
    http: reqwest::Client,
}

impl WebDriverReadyProbe {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(1))
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        Self { http }
    }
}

impl Default for WebDriverReadyProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReadyProbe for WebDriverReadyProbe {
    async fn check(&self, endpoint: &Endpoint) -> bool {
        let url = format!("http://{endpoint}{WEBDRIVER_PATH}/status");
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
