use crate::config::Config;
use crate::error::{json_error_response, ProxyErrorCode, RelayError};
use crate::process::{Supervisor, SupervisorConfig};
use crate::reaper::Reaper;
use crate::transport::{RelayRequest, RetryPolicy, Transport};
use crate::upstream::UpstreamClient;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::{HeaderName, HeaderValue, CONNECTION};
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Headers that only apply to a single connection
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The supervised backend together with the transport in front of it
///
/// Requests are served one at a time, from reading the first attempt until
/// the last byte of the response body. The supervisor lives inside the lock,
/// so a restart can never race with another request reading the target.
pub struct Relay {
    supervisor: Arc<Mutex<Supervisor>>,
    transport: Transport,
    reaper_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    max_body_bytes: usize,
    request_timeout: Duration,
}

impl Relay {
    /// Start the backend and wait for it to listen.
    ///
    /// Fails if the first start fails; a half-started process is reaped
    /// before the error is returned.
    pub async fn new(config: &Config) -> Result<Arc<Self>, RelayError> {
        config.relay.validate().map_err(|e| RelayError::Config(format!("relay{}", e)))?;
        let levels = config
            .logs
            .levels()
            .map_err(|e| RelayError::Config(format!("logs{}", e)))?;

        let (reaper, reaper_task) = Reaper::spawn(config.relay.shutdown_timeout());
        let mut supervisor =
            Supervisor::new(SupervisorConfig::from_relay(&config.relay, levels), reaper);

        if let Err(e) = supervisor.start().await {
            error!(command = %config.relay.command, error = %e, "Initial backend start failed");
            supervisor.shutdown().await;
            let _ = reaper_task.await;
            return Err(e);
        }

        let policy = RetryPolicy::from_config(&config.relay);
        info!(
            attempts = policy.attempts,
            timeout_secs = policy.timeout.as_secs(),
            target = %supervisor.target(),
            "Relay ready"
        );

        Ok(Arc::new(Self {
            supervisor: Arc::new(Mutex::new(supervisor)),
            transport: Transport::new(UpstreamClient::default(), policy),
            reaper_task: parking_lot::Mutex::new(Some(reaper_task)),
            max_body_bytes: config.relay.max_body_bytes,
            request_timeout: config.relay.request_timeout(),
        }))
    }

    /// Proxy one client request to the backend.
    pub async fn serve(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let started = Instant::now();

        // Generate or propagate request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let method = req.method().clone();
        let uri = req.uri().clone();
        prepare_request_headers(req.headers_mut(), &request_id, client_addr);

        debug!(%method, %uri, request_id, "Incoming request");

        let relay_req = match RelayRequest::read(req, self.max_body_bytes).await {
            Ok(r) => r,
            Err(e) => {
                warn!(%method, %uri, request_id, error = %e, "Rejecting request body");
                return self.error_response(&e);
            }
        };

        let mut supervisor = Arc::clone(&self.supervisor).lock_owned().await;
        let result = self.transport.round_trip(&mut supervisor, relay_req).await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                info!(%method, %uri, status = parts.status.as_u16(), elapsed_ms, request_id, "Request completed");
                Response::from_parts(parts, LockedBody::new(body.boxed(), supervisor).boxed())
            }
            Err(e) => {
                supervisor.flush_logs();
                drop(supervisor);
                // Log detailed error internally, return generic message externally
                error!(%method, %uri, elapsed_ms, request_id, error = %e, "Request failed");
                self.error_response(&e)
            }
        }
    }

    fn error_response(&self, err: &RelayError) -> Response<BoxBody<Bytes, hyper::Error>> {
        let code = err.error_code();
        let message = match code {
            ProxyErrorCode::ConnectionFailed => "Failed to get a response from the backend".to_string(),
            ProxyErrorCode::RequestTimeout => format!(
                "Request timed out after {} seconds",
                self.request_timeout.as_secs()
            ),
            ProxyErrorCode::BackendRestartFailed => "Backend unavailable".to_string(),
            ProxyErrorCode::InvalidRequestBody => "Failed to read request body".to_string(),
            ProxyErrorCode::PayloadTooLarge => err.to_string(),
            ProxyErrorCode::InternalError => "Internal relay error".to_string(),
            ProxyErrorCode::ShuttingDown => "Relay is shutting down".to_string(),
        };
        json_error_response(code, message)
    }

    /// Retire the backend and wait for the cleanup queue to drain.
    pub async fn shutdown(&self) {
        self.supervisor.lock().await.shutdown().await;

        let task = self.reaper_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Cleanup task failed");
            }
        }
        info!("Relay stopped");
    }

    /// Address of the current backend
    pub async fn target(&self) -> SocketAddr {
        self.supervisor.lock().await.target()
    }

    pub async fn pid(&self) -> Option<u32> {
        self.supervisor.lock().await.pid()
    }

    pub async fn restarts(&self) -> u64 {
        self.supervisor.lock().await.restarts()
    }
}

/// Response body that holds the relay lock until it has been sent
///
/// The lock is released, and backend output flushed, when the body ends,
/// fails, or is dropped by a client that went away.
struct LockedBody {
    inner: BoxBody<Bytes, hyper::Error>,
    guard: Option<OwnedMutexGuard<Supervisor>>,
}

impl LockedBody {
    fn new(inner: BoxBody<Bytes, hyper::Error>, guard: OwnedMutexGuard<Supervisor>) -> Self {
        Self {
            inner,
            guard: Some(guard),
        }
    }

    fn release(&mut self) {
        if let Some(supervisor) = self.guard.take() {
            supervisor.flush_logs();
        }
    }
}

impl Body for LockedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let polled = Pin::new(&mut self.inner).poll_frame(cx);
        if matches!(polled, Poll::Ready(None) | Poll::Ready(Some(Err(_)))) {
            self.release();
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for LockedBody {
    fn drop(&mut self) {
        self.release();
    }
}

/// Request ID and forwarding headers, minus anything hop-by-hop
fn prepare_request_headers(headers: &mut HeaderMap, request_id: &str, client_addr: SocketAddr) {
    strip_hop_by_hop(headers);

    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    // Append the client IP to any chain set by earlier proxies
    let client_ip = client_addr.ip().to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.trim().is_empty() => format!("{}, {}", prior, client_ip),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
}

/// Remove hop-by-hop headers, including any listed in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// The public HTTP listener
pub struct ProxyServer {
    bind_addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, relay: Arc<Relay>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            relay,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "Relay listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let relay = Arc::clone(&self.relay);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, relay).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Relay server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, addr: SocketAddr, relay: Arc<Relay>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let relay = Arc::clone(&relay);
        async move { Ok::<_, Infallible>(relay.serve(req, addr).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
