//! HTTP client for the supervised backend
//!
//! Connections are not kept idle between requests. The backend behind the
//! target address may be replaced at any moment, and a pooled connection to
//! a retired process would turn into a spurious failure on the next request.

use async_trait::async_trait;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

use crate::error::RelayError;

/// Body type sent to the backend
pub type UpstreamBody = BoxBody<Bytes, hyper::Error>;

/// Sends a single attempt to the backend.
///
/// The retrying transport is written against this trait; [`UpstreamClient`]
/// is the implementation used when serving.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Response body handed back to the caller
    type Body: Send;

    /// Send one request, classifying network failures.
    async fn send(&self, req: Request<UpstreamBody>) -> Result<Response<Self::Body>, RelayError>;
}

/// Settings for the upstream connector
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Limit on establishing a TCP connection
    pub connect_timeout: Duration,
    /// TCP keepalive interval
    pub keepalive: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            keepalive: Duration::from_secs(2),
        }
    }
}

/// Client used for every attempt against the backend
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client<HttpConnector, UpstreamBody>,
}

impl UpstreamClient {
    pub fn new(config: UpstreamConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        connector.set_connect_timeout(Some(config.connect_timeout));
        connector.set_keepalive(Some(config.keepalive));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        debug!(
            connect_timeout_ms = config.connect_timeout.as_millis() as u64,
            keepalive_ms = config.keepalive.as_millis() as u64,
            "Upstream client initialized"
        );

        Self { client }
    }
}

#[async_trait]
impl Upstream for UpstreamClient {
    type Body = Incoming;

    async fn send(&self, req: Request<UpstreamBody>) -> Result<Response<Incoming>, RelayError> {
        self.client
            .request(req)
            .await
            .map_err(|e| RelayError::upstream(Box::new(e)))
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new(UpstreamConfig::default())
    }
}
