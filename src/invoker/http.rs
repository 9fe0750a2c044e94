//! `reqwest` binding for [`ResilientInvoker`].

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use super::{CallFailure, InvokeError, ResilientInvoker};
use crate::config::RetryConfig;

const MAX_ERROR_BODY_CHARS: usize = 256;

/// A successful response.
#[derive(Debug, Clone)]
pub struct HttpReply {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: String,
}

/// HTTP client whose calls go through a shared [`ResilientInvoker`].
pub struct HttpInvoker {
    client: reqwest::Client,
    invoker: Arc<ResilientInvoker>,
}

impl HttpInvoker {
    /// Build a client with a per-attempt timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new(invoker: Arc<ResilientInvoker>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, invoker })
    }

    /// Build a client whose per-attempt timeout is `retry.request_timeout_secs`.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn from_config(
        invoker: Arc<ResilientInvoker>,
        retry: &RetryConfig,
    ) -> Result<Self, reqwest::Error> {
        Self::new(invoker, retry.request_timeout())
    }

    /// Send a request built by `build` once per attempt.
    ///
    /// # Errors
    ///
    /// See [`ResilientInvoker::call`].
    pub async fn send<B>(
        &self,
        upstream: &str,
        operation: &str,
        cancel: &CancellationToken,
        build: B,
    ) -> Result<HttpReply, InvokeError>
    where
        B: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        self.invoker
            .call(upstream, operation, cancel, || execute(build(&self.client)))
            .await
    }

    /// GET `url` and decode the JSON body.
    ///
    /// # Errors
    ///
    /// See [`ResilientInvoker::call`]; additionally [`InvokeError::Decode`].
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        upstream: &str,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<T, InvokeError> {
        let reply = self
            .send(upstream, "get", cancel, |client| client.get(url))
            .await?;
        serde_json::from_str(&reply.body).map_err(|e| InvokeError::Decode {
            upstream: upstream.to_owned(),
            message: e.to_string(),
        })
    }
}

async fn execute(request: reqwest::RequestBuilder) -> Result<HttpReply, CallFailure> {
    let response = request
        .send()
        .await
        .map_err(|e| CallFailure::Transport(e.to_string()))?;
    let status = response.status();
    if status.is_success() {
        let body = response
            .text()
            .await
            .map_err(|e| CallFailure::Transport(e.to_string()))?;
        return Ok(HttpReply {
            status: status.as_u16(),
            body,
        });
    }

    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(CallFailure::Status {
        status: status.as_u16(),
        retry_after,
        body: sanitize_error_body(&body),
    })
}

/// Read `Retry-After` as delta-seconds. HTTP-date values are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn credential_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)bearer\s+[A-Za-z0-9._~+/\-]+=*",
            r#"(?i)"?(access_token|refresh_token|api_key|apikey|password|secret)"?\s*[:=]\s*"?[^"\s,&}]+"?"#,
            r"eyJ[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Collapse whitespace, redact credential-looking tokens and truncate an
/// upstream error body before it reaches errors, logs or audit records.
pub fn sanitize_error_body(raw: &str) -> String {
    let mut sanitized = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    for regex in credential_patterns() {
        sanitized = regex.replace_all(&sanitized, "[REDACTED]").into_owned();
    }

    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized
            .chars()
            .take(MAX_ERROR_BODY_CHARS)
            .collect::<String>();
        return format!("{shortened}...[truncated]");
    }
    sanitized
}
