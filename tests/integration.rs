//! Integration tests for Spawnrelay
//!
//! Every test runs a relay in front of the `mock-backend` binary and talks to
//! it over plain TCP.
#![cfg(unix)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use spawnrelay::config::Config;
use spawnrelay::error::RelayError;
use spawnrelay::proxy::{ProxyServer, Relay};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn mock_backend_command() -> String {
    format!("exec '{}'", env!("CARGO_BIN_EXE_mock-backend"))
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.relay.command = mock_backend_command();
    config.relay.listen_timeout = 5;
    config.relay.shutdown_timeout = 2;
    config
}

struct TestRelay {
    relay: Arc<Relay>,
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    server: JoinHandle<()>,
}

impl TestRelay {
    async fn start(config: Config) -> Self {
        let relay = Relay::new(&config).await.expect("relay should start");

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = ProxyServer::new(addr, Arc::clone(&relay), shutdown_rx);
        let server = tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        Self {
            relay,
            addr,
            shutdown_tx,
            server,
        }
    }

    async fn get(&self, path: &str) -> HttpResponse {
        http_request(self.addr, "GET", path, "").await
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        self.relay.shutdown().await;
        let _ = tokio::time::timeout(Duration::from_secs(5), self.server).await;
    }
}

#[derive(Debug)]
struct HttpResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: String,
}

/// Send a request with `Connection: close` and read the whole response
async fn http_request(addr: SocketAddr, method: &str, path: &str, body: &str) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).await.expect("relay should accept");

    let request = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        method,
        path,
        addr,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();
    parse_response(&raw)
}

fn parse_response(raw: &str) -> HttpResponse {
    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
    let mut lines = head.split("\r\n");
    let status = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let headers = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    HttpResponse {
        status,
        headers,
        body: body.to_string(),
    }
}

fn process_exists(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Wait for a process to be gone
async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if !process_exists(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

// ============================================================================
// Forwarding
// ============================================================================

#[tokio::test]
async fn test_simple_get() {
    let relay = TestRelay::start(test_config()).await;

    let res = relay.get("/hello").await;
    assert_eq!(res.status, 200);
    assert_eq!(res.body, "Hello World");
    assert_eq!(res.headers.get("x-mock-backend").map(String::as_str), Some("true"));

    relay.stop().await;
}

#[tokio::test]
async fn test_post_body_and_host_rewrite() {
    let relay = TestRelay::start(test_config()).await;
    let target = relay.relay.target().await;

    let res = http_request(relay.addr, "POST", "/echo?x=1", "hello relay").await;
    assert_eq!(res.status, 200);

    let echo: serde_json::Value = serde_json::from_str(&res.body).unwrap();
    assert_eq!(echo["method"], "POST");
    assert_eq!(echo["url"], "/echo?x=1");
    assert_eq!(echo["body"], "hello relay");
    assert_eq!(echo["host"], target.to_string());
    assert_eq!(echo["x-forwarded-for"], "127.0.0.1");

    relay.stop().await;
}

#[tokio::test]
async fn test_backend_environment() {
    let relay = TestRelay::start(test_config()).await;
    let target = relay.relay.target().await;

    let res = relay.get("/env?key=PORT").await;
    assert_eq!(res.body, target.port().to_string());

    let res = relay.get("/env?key=UP_RESTARTS").await;
    assert_eq!(res.body, "0");

    let res = relay.get("/env?key=PATH").await;
    assert!(res.body.starts_with("node_modules/.bin:"), "{}", res.body);

    relay.stop().await;
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test]
async fn test_server_errors_retried_for_get() {
    let relay = TestRelay::start(test_config()).await;

    let res = relay.get("/hello?fail=2").await;
    assert_eq!(res.status, 200);
    assert_eq!(res.body, "Hello World");

    assert_eq!(relay.get("/hits").await.body, "3");
    relay.stop().await;
}

#[tokio::test]
async fn test_server_errors_exhaust_attempts() {
    let relay = TestRelay::start(test_config()).await;

    let res = relay.get("/hello?fail=100").await;
    assert_eq!(res.status, 500);

    // First attempt plus three retries
    assert_eq!(relay.get("/hits").await.body, "4");
    relay.stop().await;
}

#[tokio::test]
async fn test_post_server_error_not_retried() {
    let relay = TestRelay::start(test_config()).await;

    let res = http_request(relay.addr, "POST", "/hello?fail=1", "data").await;
    assert_eq!(res.status, 500);

    assert_eq!(relay.get("/hits").await.body, "1");
    relay.stop().await;
}

#[tokio::test]
async fn test_retries_disabled() {
    let mut config = test_config();
    config.relay.retry = Some(false);
    let relay = TestRelay::start(config).await;

    let res = relay.get("/hello?fail=1").await;
    assert_eq!(res.status, 500);

    assert_eq!(relay.get("/hits").await.body, "1");
    relay.stop().await;
}

#[tokio::test]
async fn test_body_replayed_on_retry() {
    let relay = TestRelay::start(test_config()).await;

    let res = http_request(relay.addr, "GET", "/echo?fail=2", "replay me").await;
    assert_eq!(res.status, 200);

    let echo: serde_json::Value = serde_json::from_str(&res.body).unwrap();
    assert_eq!(echo["body"], "replay me");
    assert_eq!(relay.get("/hits").await.body, "3");

    relay.stop().await;
}

#[tokio::test]
async fn test_time_budget_bounds_request() {
    let mut config = test_config();
    config.relay.timeout = 2;
    let relay = TestRelay::start(config).await;

    let start = Instant::now();
    let res = relay.get("/slow?ms=10000").await;
    let elapsed = start.elapsed();

    assert_eq!(res.status, 504);
    assert_eq!(
        res.headers.get("x-proxy-error").map(String::as_str),
        Some("REQUEST_TIMEOUT")
    );
    assert!(elapsed >= Duration::from_secs(2), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "{:?}", elapsed);

    relay.stop().await;
}

// ============================================================================
// Restarts
// ============================================================================

#[tokio::test]
async fn test_crash_on_get_restarts_and_retries() {
    let relay = TestRelay::start(test_config()).await;
    let old_target = relay.relay.target().await;
    let old_pid = relay.relay.pid().await.unwrap();

    let res = relay.get("/throw/env?restarts=1").await;
    assert_eq!(res.status, 200);
    assert_eq!(res.body, "Hello");

    assert_eq!(relay.relay.restarts().await, 1);
    assert_ne!(relay.relay.target().await, old_target);
    assert_ne!(relay.relay.pid().await.unwrap(), old_pid);

    relay.stop().await;
}

#[tokio::test]
async fn test_crash_on_post_returns_error_but_restarts() {
    let relay = TestRelay::start(test_config()).await;
    let old_target = relay.relay.target().await;

    let res = http_request(relay.addr, "POST", "/throw", "payload").await;
    assert_eq!(res.status, 502);
    assert_eq!(
        res.headers.get("x-proxy-error").map(String::as_str),
        Some("CONNECTION_FAILED")
    );

    assert_eq!(relay.relay.restarts().await, 1);
    assert_ne!(relay.relay.target().await, old_target);

    let res = relay.get("/hello").await;
    assert_eq!(res.status, 200);

    relay.stop().await;
}

#[tokio::test]
async fn test_crash_every_attempt_gives_up() {
    let relay = TestRelay::start(test_config()).await;

    let res = relay.get("/throw").await;
    assert_eq!(res.status, 502);
    assert_eq!(relay.relay.restarts().await, 3);

    // The last attempt killed the backend again; the next request revives it
    assert_eq!(relay.get("/hello").await.status, 200);
    assert_eq!(relay.relay.restarts().await, 4);

    relay.stop().await;
}

#[tokio::test]
async fn test_failed_restart_returns_gateway_error() {
    let mut config = test_config();
    config.relay.command = format!(
        "[ \"$UP_RESTARTS\" = 0 ] || exit 1; {}",
        mock_backend_command()
    );
    let relay = TestRelay::start(config).await;

    let res = relay.get("/throw").await;
    assert_eq!(res.status, 502);
    assert_eq!(
        res.headers.get("x-proxy-error").map(String::as_str),
        Some("BACKEND_RESTART_FAILED")
    );
    assert_eq!(relay.relay.restarts().await, 1);
    assert!(relay.relay.pid().await.is_none());

    relay.stop().await;
}

#[tokio::test]
async fn test_unresponsive_backend_replaced() {
    let relay = TestRelay::start(test_config()).await;
    let old_pid = relay.relay.pid().await.unwrap();

    assert_eq!(relay.get("/close").await.status, 200);

    let res = relay.get("/hello").await;
    assert_eq!(res.status, 200);
    assert_eq!(relay.relay.restarts().await, 1);

    assert!(
        wait_for_exit(old_pid, Duration::from_secs(5)).await,
        "retired backend {} should be reaped",
        old_pid
    );

    relay.stop().await;
}

// ============================================================================
// Serialization
// ============================================================================

#[tokio::test]
async fn test_requests_wait_for_streaming_response() {
    let relay = TestRelay::start(test_config()).await;
    let addr = relay.addr;
    let start = Instant::now();

    // Five chunks, 300ms apart
    let streaming = tokio::spawn(async move {
        let res = http_request(addr, "GET", "/stream?chunks=5&ms=300", "").await;
        (res, start.elapsed())
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    let res = relay.get("/hello").await;
    let hello_done = start.elapsed();

    let (streamed, stream_done) = streaming.await.unwrap();
    assert_eq!(streamed.status, 200);
    assert!(streamed.body.contains("4\n"), "{:?}", streamed.body);
    assert!(stream_done >= Duration::from_millis(1500), "{:?}", stream_done);

    assert_eq!(res.status, 200);
    assert!(
        hello_done >= Duration::from_millis(1400),
        "second request finished at {:?}, before the stream ended",
        hello_done
    );

    relay.stop().await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_no_backend_started_after_shutdown() {
    let relay = TestRelay::start(test_config()).await;
    let pid = relay.relay.pid().await.unwrap();

    // The listener is still accepting
    relay.relay.shutdown().await;
    assert!(wait_for_exit(pid, Duration::from_secs(2)).await);

    let res = relay.get("/hello").await;
    assert_eq!(res.status, 503);
    assert_eq!(
        res.headers.get("x-proxy-error").map(String::as_str),
        Some("SHUTTING_DOWN")
    );
    assert!(relay.relay.pid().await.is_none());
    assert_eq!(relay.relay.restarts().await, 0);

    relay.stop().await;
}

#[tokio::test]
async fn test_shutdown_stops_backend() {
    let relay = TestRelay::start(test_config()).await;
    let pid = relay.relay.pid().await.unwrap();
    assert!(process_exists(pid));

    relay.stop().await;

    assert!(wait_for_exit(pid, Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_signal_ignoring_backend_is_killed() {
    let mut config = test_config();
    config.relay.command = format!("export MOCK_IGNORE_SIGINT=1; {}", mock_backend_command());
    config.relay.shutdown_timeout = 1;
    let relay = TestRelay::start(config).await;
    let pid = relay.relay.pid().await.unwrap();

    let start = Instant::now();
    relay.stop().await;
    let elapsed = start.elapsed();

    assert!(elapsed >= Duration::from_secs(1), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(5), "{:?}", elapsed);
    assert!(wait_for_exit(pid, Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_start_fails_when_backend_never_listens() {
    let mut config = test_config();
    config.relay.command = "exec sleep 30".to_string();
    config.relay.listen_timeout = 1;
    config.relay.shutdown_timeout = 1;

    let start = Instant::now();
    let err = match Relay::new(&config).await {
        Ok(_) => panic!("relay should not start"),
        Err(e) => e,
    };

    assert!(matches!(err, RelayError::ListenTimeout { .. }), "{}", err);
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_start_fails_when_command_missing() {
    let mut config = test_config();
    config.relay.command = "exec ./definitely-not-a-backend".to_string();

    let err = match Relay::new(&config).await {
        Ok(_) => panic!("relay should not start"),
        Err(e) => e,
    };

    assert!(matches!(err, RelayError::ProcessExited { .. }), "{}", err);
}
