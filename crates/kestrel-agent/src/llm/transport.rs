//! HTTP transport seam for the backend client.
//!
//! [`LlmClient`](super::client::LlmClient) never touches `reqwest` directly;
//! it builds an [`HttpRequest`] and hands it to a [`Transport`].  Production
//! code uses [`ReqwestTransport`], tests substitute scripted responses.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use crate::error::{AgentError, Result};

/// A stream of raw body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// A JSON POST request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl HttpRequest {
    pub fn new(url: impl Into<String>, body: Value) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            body,
        }
    }

    /// Add a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// A response whose body is consumed incrementally.
pub struct StreamingResponse {
    pub status: u16,
    pub body: ByteStream,
}

impl StreamingResponse {
    /// Drain the body into a string (used for error statuses).
    pub async fn collect_text(mut self) -> String {
        let mut bytes = Vec::new();
        while let Some(Ok(chunk)) = self.body.next().await {
            bytes.extend_from_slice(&chunk);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Sends requests on behalf of the backend client.
///
/// Implementations return `Err` only for transport-level failures
/// (connection refused, DNS, TLS).  Non-2xx statuses are returned as
/// responses so the client can classify them.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post_json(&self, request: HttpRequest) -> Result<HttpResponse>;

    async fn post_stream(&self, request: HttpRequest) -> Result<StreamingResponse>;
}

// ---------------------------------------------------------------------------
// reqwest implementation
// ---------------------------------------------------------------------------

/// [`Transport`] backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a transport with the given connect timeout.  Overall request
    /// deadlines are enforced by the retry policy.
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| AgentError::NetworkFailure {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http })
    }

    fn headers(request: &HttpRequest) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                AgentError::Config {
                    reason: format!("invalid header name `{name}`: {e}"),
                }
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| AgentError::Config {
                reason: format!("invalid header value for `{name}`: {e}"),
            })?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    async fn send(&self, request: &HttpRequest) -> Result<reqwest::Response> {
        let headers = Self::headers(request)?;
        Ok(self
            .http
            .post(&request.url)
            .headers(headers)
            .json(&request.body)
            .send()
            .await?)
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post_json(&self, request: HttpRequest) -> Result<HttpResponse> {
        let resp = self.send(&request).await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        Ok(HttpResponse { status, body })
    }

    async fn post_stream(&self, request: HttpRequest) -> Result<StreamingResponse> {
        let resp = self.send(&request).await?;
        let status = resp.status().as_u16();
        let body = resp.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| AgentError::StreamFailure {
                    reason: format!("stream read error: {e}"),
                    after_output: false,
                })
        });
        Ok(StreamingResponse {
            status,
            body: Box::pin(body),
        })
    }
}
