//! Resilient execution of signed requests.
//!
//! [`ResilientTransport`] sends a [`SignedRequest`] through an [`HttpSend`]
//! implementation with bounded retry:
//! - transport timeouts / connection failures → retry
//! - HTTP 5xx → retry, body kept for the final error
//! - HTTP 4xx → fail immediately (stale session, no point retrying)
//! - anything below 400 → success
//!
//! Backoff sleeps on the calling task; there is no separate retry scheduler.

pub mod activity;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use crate::auth::{AuthError, SignedRequest};

pub const MAX_ATTEMPTS: u32 = 3;
pub const BASE_BACKOFF: Duration = Duration::from_millis(500);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(15);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_MAX_IDLE_PER_HOST: usize = 10;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("failed to build request: {0}")]
    Build(#[from] AuthError),
    #[error("transport failed after {attempts} attempt(s): {source}")]
    Transport {
        attempts: u32,
        #[source]
        source: SendError,
    },
    #[error("server error {status} after {attempts} attempt(s): {body}")]
    Status {
        status: u16,
        attempts: u32,
        body: String,
    },
    #[error("request rejected with {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("API error state={state}: {msg}")]
    Api { state: String, msg: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    Timeout,
    Connect,
    Body,
    Other,
}

/// Failure below the HTTP status layer.
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct SendError {
    pub kind: SendErrorKind,
    pub message: String,
}

impl SendError {
    pub fn new(kind: SendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Only failures the network layer considers temporary are retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, SendErrorKind::Other)
    }
}

impl From<reqwest::Error> for SendError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            SendErrorKind::Timeout
        } else if e.is_connect() {
            SendErrorKind::Connect
        } else if e.is_body() || e.is_decode() {
            SendErrorKind::Body
        } else {
            SendErrorKind::Other
        };
        Self::new(kind, e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// The network seam: one attempt, no retry.
#[async_trait]
pub trait HttpSend: Send + Sync {
    async fn send(&self, request: &SignedRequest) -> Result<HttpResponse, SendError>;
}

#[async_trait]
impl<T: HttpSend + ?Sized> HttpSend for Arc<T> {
    async fn send(&self, request: &SignedRequest) -> Result<HttpResponse, SendError> {
        (**self).send(request).await
    }
}

/// [`HttpSend`] over a pooled `reqwest::Client`.
#[derive(Clone)]
pub struct ReqwestSender {
    client: reqwest::Client,
}

impl ReqwestSender {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpSend for ReqwestSender {
    async fn send(&self, request: &SignedRequest) -> Result<HttpResponse, SendError> {
        let resp = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone())
            .body(request.body.clone())
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await?.to_vec();
        Ok(HttpResponse { status, body })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            base_backoff: BASE_BACKOFF,
        }
    }
}

pub struct ResilientTransport<S> {
    sender: S,
    policy: RetryPolicy,
}

impl<S: HttpSend> ResilientTransport<S> {
    pub fn new(sender: S) -> Self {
        Self::with_policy(sender, RetryPolicy::default())
    }

    pub fn with_policy(sender: S, policy: RetryPolicy) -> Self {
        Self { sender, policy }
    }

    /// Execute with retry. Returns the response body on status < 400.
    pub async fn execute(&self, request: &SignedRequest) -> Result<Vec<u8>, ClientError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut backoff = self.policy.base_backoff;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let last = attempt >= max_attempts;

            let err = match self.sender.send(request).await {
                Ok(resp) if resp.status >= 500 => {
                    let body = String::from_utf8_lossy(&resp.body).into_owned();
                    ClientError::Status {
                        status: resp.status,
                        attempts: attempt,
                        body,
                    }
                }
                Ok(resp) if resp.status >= 400 => {
                    return Err(ClientError::Rejected {
                        status: resp.status,
                        body: String::from_utf8_lossy(&resp.body).into_owned(),
                    });
                }
                Ok(resp) => return Ok(resp.body),
                Err(e) if e.is_retryable() => ClientError::Transport {
                    attempts: attempt,
                    source: e,
                },
                Err(e) => {
                    return Err(ClientError::Transport {
                        attempts: attempt,
                        source: e,
                    })
                }
            };

            if last {
                return Err(err);
            }

            warn!(
                path = %request.path,
                attempt = attempt,
                delay = ?backoff,
                error = %err,
                "request failed, retrying"
            );
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }
}
