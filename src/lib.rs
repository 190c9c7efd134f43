//! Spawnrelay - A reverse proxy that supervises a single backend process
//!
//! This library provides a development-style relay that:
//! - Launches the backend through `sh -c` on a freshly allocated loopback port
//! - Waits for the backend to listen before routing traffic to it
//! - Retries idempotent requests on server errors and network failures
//! - Restarts the backend when it stops accepting connections
//! - Retires replaced backends with SIGINT, escalating to SIGKILL
//! - Forwards the backend's output into structured logs

pub mod backoff;
pub mod config;
pub mod error;
pub mod net;
pub mod output;
pub mod process;
pub mod proxy;
pub mod reaper;
pub mod transport;
pub mod upstream;

/// Package name reported at startup
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
/// Package version reported at startup
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
