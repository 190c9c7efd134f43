//! Mock backend for integration testing
//!
//! Environment variables:
//! - PORT: Port to listen on (required)
//! - UP_RESTARTS: Restart count set by the relay (default: 0)
//! - MOCK_IGNORE_SIGINT: When set, SIGINT is logged and ignored
//! - STARTUP_DELAY_MS: Delay before binding (default: 0)
//!
//! Routes:
//! - `/hello`: "Hello World"
//! - `/pid`: process id
//! - `/env?key=NAME`: value of an environment variable
//! - `/echo`: JSON with method, url, headers of interest and body
//! - `/status/NNN`: responds with that status
//! - `/slow?ms=N`: responds after a delay
//! - `/stream?chunks=N&ms=M`: chunked body, one chunk every M milliseconds
//! - `/throw`: exits without responding
//! - `/throw/env?restarts=N`: exits unless UP_RESTARTS equals N
//! - `/close`: stops accepting connections but keeps running
//! - `/hits`: number of requests counted by `fail`
//!
//! Any route accepts `fail=K`, which answers 500 for the first K such
//! requests this process sees.

use hyper::StatusCode;
use serde_json::json;
use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

/// Largest header block accepted
const MAX_HEADER_BYTES: usize = 8192;

struct State {
    restarts: u64,
    hits: AtomicU64,
    close: Notify,
}

struct ParsedRequest {
    method: String,
    target: String,
    path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

#[tokio::main]
async fn main() {
    let port: u16 = env::var("PORT")
        .expect("PORT environment variable required")
        .parse()
        .expect("PORT must be a valid port number");

    let restarts: u64 = env::var("UP_RESTARTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let startup_delay: u64 = env::var("STARTUP_DELAY_MS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    #[cfg(unix)]
    {
        if env::var_os("MOCK_IGNORE_SIGINT").is_some() {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint =
                signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
            tokio::spawn(async move {
                while sigint.recv().await.is_some() {
                    eprintln!("Mock backend: ignoring SIGINT");
                }
            });
        }
    }

    if startup_delay > 0 {
        eprintln!("Mock backend: sleeping for {}ms before starting", startup_delay);
        tokio::time::sleep(Duration::from_millis(startup_delay)).await;
    }

    let listener = TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind");

    println!("Mock backend: listening on port {} (restarts={})", port, restarts);

    let state = Arc::new(State {
        restarts,
        hits: AtomicU64::new(0),
        close: Notify::new(),
    });

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, _)) => {
                    let state = Arc::clone(&state);
                    tokio::spawn(async move {
                        handle_connection(stream, state).await;
                    });
                }
                Err(e) => eprintln!("Mock backend: accept error: {}", e),
            },
            _ = state.close.notified() => break,
        }
    }

    drop(listener);
    println!("Mock backend: listener closed");
    std::future::pending::<()>().await;
}

async fn handle_connection(mut stream: TcpStream, state: Arc<State>) {
    let req = match read_request(&mut stream).await {
        Some(req) => req,
        None => return,
    };

    println!("Mock backend: {} {}", req.method, req.target);

    if let Some(fail) = req.query.get("fail").and_then(|v| v.parse::<u64>().ok()) {
        let hit = state.hits.fetch_add(1, Ordering::SeqCst) + 1;
        if hit <= fail {
            respond(&mut stream, 500, "text/plain", format!("failure {}", hit)).await;
            return;
        }
    }

    match req.path.as_str() {
        "/hello" => respond(&mut stream, 200, "text/plain", "Hello World".to_string()).await,
        "/pid" => respond(&mut stream, 200, "text/plain", std::process::id().to_string()).await,
        "/env" => {
            let value = req
                .query
                .get("key")
                .and_then(|k| env::var(k).ok())
                .unwrap_or_default();
            respond(&mut stream, 200, "text/plain", value).await
        }
        "/echo" => {
            let body = json!({
                "method": req.method,
                "url": req.target,
                "host": req.headers.get("host"),
                "x-forwarded-for": req.headers.get("x-forwarded-for"),
                "body": String::from_utf8_lossy(&req.body),
            });
            respond(&mut stream, 200, "application/json", body.to_string()).await
        }
        "/slow" => {
            let ms = req
                .query
                .get("ms")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            respond(&mut stream, 200, "text/plain", "slow response".to_string()).await
        }
        "/stream" => {
            let chunks = req
                .query
                .get("chunks")
                .and_then(|v| v.parse().ok())
                .unwrap_or(5);
            let ms = req
                .query
                .get("ms")
                .and_then(|v| v.parse().ok())
                .unwrap_or(200);
            stream_chunks(&mut stream, chunks, Duration::from_millis(ms)).await
        }
        "/throw" => {
            eprintln!("Mock backend: crashing on request");
            std::process::exit(1);
        }
        "/throw/env" => {
            let wanted = req.query.get("restarts").and_then(|v| v.parse::<u64>().ok());
            if wanted != Some(state.restarts) {
                eprintln!("Mock backend: crashing at restarts={}", state.restarts);
                std::process::exit(1);
            }
            respond(&mut stream, 200, "text/plain", "Hello".to_string()).await
        }
        "/close" => {
            state.close.notify_one();
            respond(&mut stream, 200, "text/plain", "closing".to_string()).await
        }
        "/hits" => {
            let hits = state.hits.load(Ordering::SeqCst);
            respond(&mut stream, 200, "text/plain", hits.to_string()).await
        }
        path => match path.strip_prefix("/status/").and_then(|s| s.parse::<u16>().ok()) {
            Some(code) => respond(&mut stream, code, "text/plain", format!("status {}", code)).await,
            None => respond(&mut stream, 404, "text/plain", "not found".to_string()).await,
        },
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<ParsedRequest> {
    let mut buf = Vec::new();
    let mut temp = [0u8; 1024];

    // Read HTTP request headers
    let header_end = loop {
        let n = match stream.read(&mut temp).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => n,
        };
        buf.extend_from_slice(&temp[..n]);

        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return None;
        }
    };

    let head = std::str::from_utf8(&buf[..header_end]).ok()?;
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();

    let headers: HashMap<String, String> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = match stream.read(&mut temp).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => n,
        };
        body.extend_from_slice(&temp[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), parse_query(query)),
        None => (target.clone(), HashMap::new()),
    };

    Some(ParsedRequest {
        method,
        target,
        path,
        query,
        headers,
        body,
    })
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

async fn respond(stream: &mut TcpStream, code: u16, content_type: &str, body: String) {
    let reason = StatusCode::from_u16(code)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown");

    let response = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         X-Mock-Backend: true\r\n\
         \r\n\
         {}",
        code,
        reason,
        content_type,
        body.len(),
        body
    );

    let _ = stream.write_all(response.as_bytes()).await;
}

async fn stream_chunks(stream: &mut TcpStream, chunks: u64, delay: Duration) {
    let head = "HTTP/1.1 200 OK\r\n\
                Content-Type: text/plain\r\n\
                Transfer-Encoding: chunked\r\n\
                Connection: close\r\n\
                X-Mock-Backend: true\r\n\
                \r\n";
    if stream.write_all(head.as_bytes()).await.is_err() {
        return;
    }

    for i in 0..chunks {
        tokio::time::sleep(delay).await;
        let line = format!("{}\n", i);
        let chunk = format!("{:x}\r\n{}\r\n", line.len(), line);
        if stream.write_all(chunk.as_bytes()).await.is_err() {
            return;
        }
    }

    let _ = stream.write_all(b"0\r\n\r\n").await;
}
