//! Relay errors, network error classification, and JSON error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::process::ExitStatus;
use std::time::Duration;

/// Boxed error from the network stack
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Errors produced while supervising the backend or relaying a request
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// No free loopback port could be obtained
    #[error("getting free port: {0}")]
    PortAllocation(#[source] io::Error),

    /// The backend did not accept connections in time
    #[error("waiting for {target} to be in listening state: timed out after {timeout:?}")]
    ListenTimeout { target: SocketAddr, timeout: Duration },

    /// The backend command could not be spawned
    #[error("running command: {0}")]
    ProcessStart(#[source] io::Error),

    /// The backend exited before it started listening
    #[error("backend exited during startup ({status})")]
    ProcessExited { status: ExitStatus },

    /// The round trip to the backend failed at the network level
    #[error("{kind} network error: {source}")]
    Network {
        kind: NetworkErrorKind,
        #[source]
        source: BoxError,
    },

    /// The round trip failed for a reason unrelated to the network
    #[error("upstream request failed: {0}")]
    Upstream(#[source] BoxError),

    /// The outbound request could not be built
    #[error("building upstream request: {0}")]
    Request(String),

    /// The client's request body could not be read
    #[error("reading request body: {0}")]
    Body(#[source] BoxError),

    /// The client's request body is larger than the configured limit
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// A restart triggered by a network failure did not succeed
    #[error("restarting after `{trigger}`: {source}")]
    Restart {
        trigger: Box<RelayError>,
        #[source]
        source: Box<RelayError>,
    },

    /// The configuration could not be applied
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The relay has shut down and no longer starts backends
    #[error("relay is shutting down")]
    ShuttingDown,
}

impl RelayError {
    /// Wrap an error from the upstream client, classifying network failures.
    pub fn upstream(err: BoxError) -> Self {
        match NetworkErrorKind::classify(err.as_ref()) {
            Some(kind) => RelayError::Network { kind, source: err },
            None => RelayError::Upstream(err),
        }
    }

    /// The network classification, if this is a network failure
    pub fn network_kind(&self) -> Option<NetworkErrorKind> {
        match self {
            RelayError::Network { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// The error code surfaced to clients for this error
    pub fn error_code(&self) -> ProxyErrorCode {
        match self {
            RelayError::Network {
                kind: NetworkErrorKind::Timeout,
                ..
            } => ProxyErrorCode::RequestTimeout,
            RelayError::Network { .. } | RelayError::Upstream(_) => ProxyErrorCode::ConnectionFailed,
            RelayError::Restart { .. }
            | RelayError::PortAllocation(_)
            | RelayError::ListenTimeout { .. }
            | RelayError::ProcessStart(_)
            | RelayError::ProcessExited { .. } => ProxyErrorCode::BackendRestartFailed,
            RelayError::Body(_) => ProxyErrorCode::InvalidRequestBody,
            RelayError::BodyTooLarge { .. } => ProxyErrorCode::PayloadTooLarge,
            RelayError::Request(_) | RelayError::Config(_) => ProxyErrorCode::InternalError,
            RelayError::ShuttingDown => ProxyErrorCode::ShuttingDown,
        }
    }
}

/// Closed classification of network failures seen by the retrying transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Worth retrying after a short delay
    Transient,
    /// The operation ran out of time
    Timeout,
    /// The backend is unreachable, typically because it died
    Fatal,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkErrorKind::Transient => write!(f, "transient"),
            NetworkErrorKind::Timeout => write!(f, "timeout"),
            NetworkErrorKind::Fatal => write!(f, "fatal"),
        }
    }
}

impl NetworkErrorKind {
    /// Classify an error by walking its source chain.
    ///
    /// Returns `None` when nothing in the chain comes from the network, so
    /// callers can tell protocol or usage errors apart from connectivity.
    pub fn classify(err: &(dyn StdError + 'static)) -> Option<Self> {
        let mut connect = false;
        let mut current = Some(err);

        while let Some(e) = current {
            if let Some(io_err) = e.downcast_ref::<io::Error>() {
                return Some(Self::from_io_kind(io_err.kind()));
            }

            if e.is::<tokio::time::error::Elapsed>() {
                return Some(NetworkErrorKind::Timeout);
            }

            if let Some(hyper_err) = e.downcast_ref::<hyper::Error>() {
                if hyper_err.is_timeout() {
                    return Some(NetworkErrorKind::Timeout);
                }
                if hyper_err.is_incomplete_message()
                    || hyper_err.is_canceled()
                    || hyper_err.is_closed()
                {
                    return Some(NetworkErrorKind::Fatal);
                }
            }

            if let Some(client_err) = e.downcast_ref::<hyper_util::client::legacy::Error>() {
                connect |= client_err.is_connect();
            }

            current = e.source();
        }

        connect.then_some(NetworkErrorKind::Fatal)
    }

    /// Map an IO error kind onto the classification
    pub fn from_io_kind(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => NetworkErrorKind::Timeout,
            io::ErrorKind::Interrupted
            | io::ErrorKind::AddrInUse
            | io::ErrorKind::AddrNotAvailable => NetworkErrorKind::Transient,
            _ => NetworkErrorKind::Fatal,
        }
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Failed to get a response from the backend
    ConnectionFailed,
    /// Request ran out of its time budget
    RequestTimeout,
    /// Backend could not be restarted after a failure
    BackendRestartFailed,
    /// Request body could not be read
    InvalidRequestBody,
    /// Request body exceeds the buffering limit
    PayloadTooLarge,
    /// Internal relay error
    InternalError,
    /// Relay is shutting down
    ShuttingDown,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::BackendRestartFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InvalidRequestBody => StatusCode::BAD_REQUEST,
            ProxyErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::BackendRestartFailed => "BACKEND_RESTART_FAILED",
            ProxyErrorCode::InvalidRequestBody => "INVALID_REQUEST_BODY",
            ProxyErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
            ProxyErrorCode::ShuttingDown => "SHUTTING_DOWN",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Wrapper(io::Error);

    impl fmt::Display for Wrapper {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "wrapped")
        }
    }

    impl StdError for Wrapper {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_io_kinds_classification() {
        use io::ErrorKind::*;
        assert_eq!(NetworkErrorKind::from_io_kind(TimedOut), NetworkErrorKind::Timeout);
        assert_eq!(NetworkErrorKind::from_io_kind(WouldBlock), NetworkErrorKind::Timeout);
        assert_eq!(NetworkErrorKind::from_io_kind(Interrupted), NetworkErrorKind::Transient);
        assert_eq!(NetworkErrorKind::from_io_kind(AddrNotAvailable), NetworkErrorKind::Transient);
        assert_eq!(NetworkErrorKind::from_io_kind(ConnectionRefused), NetworkErrorKind::Fatal);
        assert_eq!(NetworkErrorKind::from_io_kind(ConnectionReset), NetworkErrorKind::Fatal);
        assert_eq!(NetworkErrorKind::from_io_kind(UnexpectedEof), NetworkErrorKind::Fatal);
    }

    #[test]
    fn test_classify_walks_source_chain() {
        let err = Wrapper(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        assert_eq!(NetworkErrorKind::classify(&err), Some(NetworkErrorKind::Fatal));

        let err = Wrapper(io::Error::new(io::ErrorKind::TimedOut, "connect timeout"));
        assert_eq!(NetworkErrorKind::classify(&err), Some(NetworkErrorKind::Timeout));
    }

    #[test]
    fn test_classify_non_network_error() {
        let err = RelayError::Request("bad uri".to_string());
        assert_eq!(NetworkErrorKind::classify(&err), None);
    }

    #[tokio::test]
    async fn test_classify_elapsed_as_timeout() {
        let elapsed = tokio::time::timeout(Duration::from_millis(1), std::future::pending::<()>())
            .await
            .unwrap_err();
        assert_eq!(NetworkErrorKind::classify(&elapsed), Some(NetworkErrorKind::Timeout));
    }

    #[test]
    fn test_upstream_wraps_network_errors() {
        let err = RelayError::upstream(Box::new(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "refused",
        )));
        assert_eq!(err.network_kind(), Some(NetworkErrorKind::Fatal));
        assert_eq!(err.error_code(), ProxyErrorCode::ConnectionFailed);

        let err = RelayError::upstream("protocol violation".into());
        assert!(matches!(err, RelayError::Upstream(_)));
        assert_eq!(err.network_kind(), None);
    }

    #[test]
    fn test_restart_error_keeps_trigger_visible() {
        let trigger = RelayError::Network {
            kind: NetworkErrorKind::Fatal,
            source: Box::new(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
        };
        let err = RelayError::Restart {
            trigger: Box::new(trigger),
            source: Box::new(RelayError::ListenTimeout {
                target: "127.0.0.1:4000".parse().unwrap(),
                timeout: Duration::from_secs(1),
            }),
        };

        let msg = err.to_string();
        assert!(msg.contains("fatal network error: refused"), "{}", msg);
        assert!(msg.contains("127.0.0.1:4000"), "{}", msg);
        assert_eq!(err.error_code(), ProxyErrorCode::BackendRestartFailed);
    }

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ProxyErrorCode::ConnectionFailed.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(ProxyErrorCode::RequestTimeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ProxyErrorCode::PayloadTooLarge.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            ProxyErrorCode::InvalidRequestBody.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::ShuttingDown.error_code().status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_timeout_maps_to_gateway_timeout() {
        let err = RelayError::Network {
            kind: NetworkErrorKind::Timeout,
            source: "deadline".into(),
        };
        assert_eq!(err.error_code(), ProxyErrorCode::RequestTimeout);
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::ConnectionFailed, "Backend unreachable");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"CONNECTION_FAILED\""));
        assert!(json.contains("\"message\":\"Backend unreachable\""));
        assert!(json.contains("\"status\":502"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::RequestTimeout, "Request timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "REQUEST_TIMEOUT"
        );
    }
}
