//! Retrying round trips to the supervised backend
//!
//! Every attempt is sent to the supervisor's current target. After each
//! attempt [`decide`] picks one of the [`Outcome`]s:
//!
//! - a 5xx on a retryable request is retried at once,
//! - transient and timeout network errors are retried after a backoff delay,
//! - fatal network errors (usually a dead backend) restart it first,
//! - anything else ends the round trip.
//!
//! Only GET, HEAD and OPTIONS requests with a buffered body are retried.
//! All attempts share one time budget.

use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_LENGTH, HOST};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::RelayConfig;
use crate::error::{NetworkErrorKind, RelayError};
use crate::process::Supervisor;
use crate::upstream::{Upstream, UpstreamBody, UpstreamClient};

/// Request body as held between attempts
#[derive(Debug)]
pub enum RequestBody {
    /// Read into memory; replayed on every attempt
    Buffered(Bytes),
    /// Too large to buffer; forwarded once
    Streaming(Option<Incoming>),
}

/// A client request prepared for one or more attempts
#[derive(Debug)]
pub struct RelayRequest {
    method: Method,
    path_and_query: String,
    headers: HeaderMap,
    body: RequestBody,
}

impl RelayRequest {
    /// Take apart an incoming request, buffering bodies up to `limit` bytes.
    ///
    /// A body whose declared length exceeds the limit is left streaming. A
    /// body without a declared length that turns out larger is rejected.
    pub async fn read(req: Request<Incoming>, limit: usize) -> Result<Self, RelayError> {
        let (parts, body) = req.into_parts();

        let declared = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());

        let body = match declared {
            Some(len) if len > limit as u64 => RequestBody::Streaming(Some(body)),
            _ => {
                let collected = Limited::new(body, limit).collect().await.map_err(|e| {
                    if e.is::<LengthLimitError>() {
                        RelayError::BodyTooLarge { limit }
                    } else {
                        RelayError::Body(e)
                    }
                })?;
                RequestBody::Buffered(collected.to_bytes())
            }
        };

        Ok(Self {
            method: parts.method,
            path_and_query: path_and_query(&parts.uri),
            headers: parts.headers,
            body,
        })
    }

    /// Build a request around an in-memory body
    pub fn buffered(method: Method, uri: &hyper::Uri, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            path_and_query: path_and_query(uri),
            headers,
            body: RequestBody::Buffered(body),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// GET, HEAD and OPTIONS
    pub fn is_idempotent(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }

    /// Whether the body can be sent again
    pub fn is_replayable(&self) -> bool {
        matches!(self.body, RequestBody::Buffered(_))
    }

    /// Build the request for one attempt against `target`.
    ///
    /// Buffered bodies are rewound from the stored bytes; a streaming body
    /// can be taken only once.
    pub fn outbound(&mut self, target: SocketAddr) -> Result<Request<UpstreamBody>, RelayError> {
        let body: UpstreamBody = match &mut self.body {
            RequestBody::Buffered(bytes) => Full::new(bytes.clone()).map_err(|e| match e {}).boxed(),
            RequestBody::Streaming(body) => body
                .take()
                .ok_or_else(|| RelayError::Request("request body was already sent".to_string()))?
                .boxed(),
        };

        let mut req = Request::builder()
            .method(self.method.clone())
            .uri(format!("http://{}{}", target, self.path_and_query))
            .body(body)
            .map_err(|e| RelayError::Request(e.to_string()))?;

        let host = HeaderValue::from_str(&target.to_string())
            .map_err(|e| RelayError::Request(e.to_string()))?;
        *req.headers_mut() = self.headers.clone();
        req.headers_mut().insert(HOST, host);

        Ok(req)
    }
}

fn path_and_query(uri: &hyper::Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string()
}

/// Limits shared by every round trip
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt; zero disables retrying
    pub attempts: u32,
    /// Budget for the whole round trip, retries included
    pub timeout: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn from_config(relay: &RelayConfig) -> Self {
        Self {
            attempts: relay.attempts(),
            timeout: relay.request_timeout(),
            backoff: relay.backoff.backoff(),
        }
    }
}

/// What one attempt produced, as far as retrying is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observed {
    Status(StatusCode),
    Network(NetworkErrorKind),
    /// A failure that did not come from the network
    Other,
}

/// Next step after an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Return the response
    Success,
    /// Sleep for the next backoff delay and try again
    RetryNetwork,
    /// Try again immediately
    RetryServerError,
    /// Restart the backend, then try again if the request allows it
    RestartAndRetry,
    /// Return the error
    GiveUp,
}

/// Pick the next step for attempt `attempt` (0-indexed).
///
/// `retryable` covers both the method and the body. A fatal network error
/// asks for a restart even when the request itself will not be retried, so
/// the next request finds a live backend.
pub fn decide(
    policy: &RetryPolicy,
    attempt: u32,
    elapsed: Duration,
    retryable: bool,
    observed: Observed,
) -> Outcome {
    let exhausted = policy.attempts == 0 || attempt >= policy.attempts || elapsed >= policy.timeout;

    match observed {
        Observed::Status(status) if status.is_server_error() && retryable && !exhausted => {
            Outcome::RetryServerError
        }
        Observed::Status(_) => Outcome::Success,
        Observed::Network(NetworkErrorKind::Transient | NetworkErrorKind::Timeout)
            if retryable && !exhausted =>
        {
            Outcome::RetryNetwork
        }
        Observed::Network(NetworkErrorKind::Fatal) if !exhausted => Outcome::RestartAndRetry,
        Observed::Network(_) | Observed::Other => Outcome::GiveUp,
    }
}

/// Sends requests to the supervised backend, retrying and restarting it
pub struct Transport<C = UpstreamClient> {
    client: C,
    policy: RetryPolicy,
}

impl<C: Upstream> Transport<C> {
    pub fn new(client: C, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// Send `req` to the backend until an outcome ends the round trip.
    ///
    /// Terminal outcomes return the last response or error unchanged,
    /// except for a failed restart, which reports both errors.
    pub async fn round_trip(
        &self,
        supervisor: &mut Supervisor,
        mut req: RelayRequest,
    ) -> Result<Response<C::Body>, RelayError> {
        let start = Instant::now();
        let budget = self.policy.timeout;
        let retryable = req.is_idempotent() && req.is_replayable();
        let mut backoff = self.policy.backoff.clone();
        backoff.reset();
        let mut attempt: u32 = 0;

        loop {
            if supervisor.is_closed() {
                return Err(RelayError::ShuttingDown);
            }

            let target = supervisor.target();
            let outbound = req.outbound(target)?;

            let remaining = budget.saturating_sub(start.elapsed());
            let result = match tokio::time::timeout(remaining, self.client.send(outbound)).await {
                Ok(result) => result,
                Err(elapsed) => Err(RelayError::Network {
                    kind: NetworkErrorKind::Timeout,
                    source: Box::new(elapsed),
                }),
            };

            let observed = match &result {
                Ok(res) => Observed::Status(res.status()),
                Err(e) => e.network_kind().map_or(Observed::Other, Observed::Network),
            };
            let outcome = decide(&self.policy, attempt, start.elapsed(), retryable, observed);
            debug!(attempt, %target, ?observed, ?outcome, "Attempt finished");

            match (outcome, result) {
                (Outcome::RetryServerError, Ok(res)) => {
                    warn!(
                        attempt,
                        status = res.status().as_u16(),
                        method = %req.method(),
                        "Retrying after server error"
                    );
                }
                (Outcome::RetryNetwork, Err(e)) => {
                    let delay = backoff.duration();
                    let remaining = budget.saturating_sub(start.elapsed());
                    if delay >= remaining {
                        debug!(attempt, ?delay, ?remaining, "Backoff delay exceeds budget");
                        return Err(e);
                    }
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying after network error");
                    tokio::time::sleep(delay).await;
                }
                (Outcome::RestartAndRetry, Err(trigger)) => {
                    if let Err(e) = supervisor.restart().await {
                        if matches!(e, RelayError::ShuttingDown) {
                            return Err(e);
                        }
                        error!(trigger = %trigger, error = %e, "Backend restart failed");
                        return Err(RelayError::Restart {
                            trigger: Box::new(trigger),
                            source: Box::new(e),
                        });
                    }

                    if !retryable {
                        info!(method = %req.method(), error = %trigger, "Not retrying request after restart");
                        return Err(trigger);
                    }
                    if start.elapsed() >= budget {
                        return Err(trigger);
                    }
                    info!(attempt, target = %supervisor.target(), "Retrying on restarted backend");
                }
                (_, result) => return result,
            }

            attempt += 1;
        }
    }
}
