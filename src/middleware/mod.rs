//! Middleware resolution: capture groups in, substitution string out.
//!
//! A middleware call is built from the request template ([`OutboundRequest`]),
//! dispatched through a [`MiddlewareClient`], checked against the success
//! status ceiling and finally mapped through the restricted evaluator in
//! [`crate::context`].

mod request;

pub use request::{build_body, build_query_string, OutboundRequest};

use crate::config::{Middleware, RequestMethod, Settings};
use crate::context::{MappingContext, MappingError};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Errors raised while resolving a middleware value.
#[derive(Debug, thiserror::Error)]
pub enum MiddlewareError {
    #[error("Couldn't get data from API: {url} responded with status {status}")]
    Status { url: String, status: u16 },

    #[error("Request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("Request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("Invalid body template: {0}")]
    BodyTemplate(String),

    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error(transparent)]
    Mapping(#[from] MappingError),
}

/// The raw outcome of a middleware call.
#[derive(Debug, Clone)]
pub struct MiddlewareReply {
    /// HTTP status code
    pub status: u16,
    /// Captured response headers (lowercase names)
    pub headers: HashMap<String, String>,
    /// Parsed body; non-JSON payloads are kept as a JSON string
    pub body: JsonValue,
}

/// Transport for middleware calls.
#[async_trait]
pub trait MiddlewareClient: Send + Sync {
    /// Perform the call. Non-success statuses are returned, not raised.
    async fn dispatch(&self, request: &OutboundRequest) -> Result<MiddlewareReply, MiddlewareError>;

    /// Get the client name for debugging.
    fn name(&self) -> &'static str;
}

/// reqwest-backed middleware transport with a per-call timeout.
#[derive(Debug, Clone)]
pub struct HttpMiddlewareClient {
    http_client: Client,
    timeout_ms: u64,
}

impl HttpMiddlewareClient {
    /// Create a client whose calls time out after `timeout_ms`.
    pub fn new(timeout_ms: u64) -> Result<Self, MiddlewareError> {
        let http_client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| MiddlewareError::ClientBuild(e.to_string()))?;

        Ok(Self {
            http_client,
            timeout_ms,
        })
    }
}

#[async_trait]
impl MiddlewareClient for HttpMiddlewareClient {
    async fn dispatch(&self, request: &OutboundRequest) -> Result<MiddlewareReply, MiddlewareError> {
        let url = request.full_url();

        let mut builder = match request.method {
            RequestMethod::Get => self.http_client.get(&url),
            RequestMethod::Post => self.http_client.post(&url),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!(url = %url, method = ?request.method, "Dispatching middleware request");

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                MiddlewareError::Timeout {
                    url: url.clone(),
                    timeout_ms: self.timeout_ms,
                }
            } else {
                MiddlewareError::Transport {
                    url: url.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();

        let headers = request
            .response_headers
            .iter()
            .filter_map(|name| {
                let value = response.headers().get(name.as_str())?.to_str().ok()?;
                Some((name.clone(), value.to_string()))
            })
            .collect();

        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                MiddlewareError::Timeout {
                    url: url.clone(),
                    timeout_ms: self.timeout_ms,
                }
            } else {
                MiddlewareError::Transport {
                    url: url.clone(),
                    message: e.to_string(),
                }
            }
        })?;

        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| JsonValue::String(String::from_utf8_lossy(&bytes).into_owned()));

        Ok(MiddlewareReply {
            status,
            headers,
            body,
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Resolves substitution values through middlewares.
pub struct MiddlewareResolver<C = HttpMiddlewareClient> {
    client: C,
    max_success_status: u16,
}

impl MiddlewareResolver<HttpMiddlewareClient> {
    /// Create a resolver backed by HTTP using the configured timeout.
    pub fn from_settings(settings: &Settings) -> Result<Self, MiddlewareError> {
        let client = HttpMiddlewareClient::new(settings.timeout_ms)?;
        Ok(Self::with_client(client, settings))
    }
}

impl<C: MiddlewareClient> MiddlewareResolver<C> {
    /// Create a resolver over a custom transport.
    pub fn with_client(client: C, settings: &Settings) -> Self {
        Self {
            client,
            max_success_status: settings.max_success_status,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Resolve the substitution value for a match.
    ///
    /// `groups` are the capture groups of the triggering match, without the
    /// whole-match element.
    pub async fn resolve(
        &self,
        middleware: &Middleware,
        groups: &[String],
    ) -> Result<String, MiddlewareError> {
        let request = OutboundRequest::build(middleware, groups)?;
        let reply = self.client.dispatch(&request).await?;

        if reply.status > self.max_success_status {
            warn!(
                middleware = %middleware.name,
                client = self.client.name(),
                status = reply.status,
                "Middleware responded with failure status"
            );
            return Err(MiddlewareError::Status {
                url: request.full_url(),
                status: reply.status,
            });
        }

        let ctx = MappingContext::new(reply.body).with_headers(reply.headers);
        let value = ctx.evaluate(&middleware.response.response_map)?;

        debug!(middleware = %middleware.name, value = %value, "Resolved middleware value");
        Ok(value)
    }
}
