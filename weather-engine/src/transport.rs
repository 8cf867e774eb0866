//! Fire-and-forget HTTP GET whose JSON result is handed to a completion
//! callback. Both providers sit on top of this.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::{fmt::Debug, sync::Arc, time::Duration};
use tokio::task::JoinHandle;

use crate::error::TransportError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("weather-engine/", env!("CARGO_PKG_VERSION"));

/// Status, reason and body of a completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub status_text: String,
    pub body: String,
}

#[async_trait]
pub trait HttpFetch: Send + Sync + Debug {
    async fn get(&self, url: &str) -> Result<RawResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestFetch {
    http: Client,
}

impl ReqwestFetch {
    pub fn new() -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client, using defaults: {}", e);
                Client::new()
            });

        Self { http }
    }

    pub fn with_client(http: Client) -> Self {
        Self { http }
    }
}

impl Default for ReqwestFetch {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetch {
    async fn get(&self, url: &str) -> Result<RawResponse, TransportError> {
        let res = self.http.get(url).send().await.map_err(|e| {
            let msg = if e.is_connect() {
                "network unavailable".to_string()
            } else if e.is_timeout() {
                "request timed out".to_string()
            } else {
                e.to_string()
            };
            TransportError::Network(msg)
        })?;

        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| TransportError::Network(format!("failed to read response body: {e}")))?;

        Ok(RawResponse {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            body,
        })
    }
}

/// Conventional 2xx check.
pub fn is_success_status(code: u16) -> bool {
    (200..300).contains(&code)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    /// 2xx with a JSON body.
    Json(Value),
    /// 2xx whose body failed to parse.
    Malformed(String),
    /// Non-2xx; the body was not parsed.
    Skipped,
    /// No HTTP exchange happened.
    Unreachable,
}

/// What a completion callback receives.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonReply {
    /// 0 when the server was never reached.
    pub status: u16,
    /// Reason phrase on success. On a non-2xx status this is the server's
    /// own body text when it sent plain text, and the network error for
    /// status 0.
    pub status_text: String,
    pub body: ReplyBody,
}

impl JsonReply {
    pub fn from_raw(raw: RawResponse) -> Self {
        if !is_success_status(raw.status) {
            let trimmed = raw.body.trim();
            // error pages from proxies are markup, not a message
            let markup = trimmed.starts_with('<') && !raw.status_text.is_empty();
            let status_text = if trimmed.is_empty() || markup {
                raw.status_text
            } else {
                truncate_body(trimmed)
            };
            return Self {
                status: raw.status,
                status_text,
                body: ReplyBody::Skipped,
            };
        }

        let body = match serde_json::from_str::<Value>(&raw.body) {
            Ok(value) => ReplyBody::Json(value),
            Err(e) => ReplyBody::Malformed(e.to_string()),
        };

        Self {
            status: raw.status,
            status_text: raw.status_text,
            body,
        }
    }

    pub fn unreachable(error: &TransportError) -> Self {
        let status_text = match error {
            TransportError::Network(msg) => msg.clone(),
            other => other.to_string(),
        };
        Self {
            status: 0,
            status_text,
            body: ReplyBody::Unreachable,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.body, ReplyBody::Json(_))
    }

    pub fn into_json(self) -> Result<Value, TransportError> {
        match self.body {
            ReplyBody::Json(value) => Ok(value),
            ReplyBody::Malformed(reason) => Err(TransportError::Malformed(reason)),
            ReplyBody::Skipped => Err(TransportError::Status {
                code: self.status,
                text: self.status_text,
            }),
            ReplyBody::Unreachable => Err(TransportError::Network(self.status_text)),
        }
    }
}

/// A started GET. Dropping or stopping it aborts the task; an aborted
/// request never runs its completion callback.
#[derive(Debug)]
pub struct JsonRequest {
    url: String,
    task: JoinHandle<()>,
}

impl JsonRequest {
    /// Starts the request on the current tokio runtime and returns
    /// immediately. `on_complete` runs exactly once unless the request is
    /// stopped first.
    pub fn start<F>(
        fetch: Arc<dyn HttpFetch>,
        url: impl Into<String>,
        on_complete: F,
    ) -> Result<Self, TransportError>
    where
        F: FnOnce(JsonReply) + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Network(format!("no async runtime available: {e}")))?;

        let url = url.into();
        let target = url.clone();
        let task = runtime.spawn(async move {
            let reply = match fetch.get(&target).await {
                Ok(raw) => JsonReply::from_raw(raw),
                Err(err) => JsonReply::unreachable(&err),
            };
            tracing::debug!(url = %target, status = reply.status, "json request completed");
            on_complete(reply);
        });

        Ok(Self { url, task })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for JsonRequest {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.chars().count() > MAX {
        format!("{}...", body.chars().take(MAX).collect::<String>())
    } else {
        body.to_string()
    }
}
