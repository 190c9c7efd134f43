//! Loopback port allocation and listen detection

use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::debug;

use crate::backoff::Backoff;
use crate::error::RelayError;

/// Upper bound on a single connection probe
const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Ask the OS for a free loopback port.
///
/// The listener is released before returning, so another process may take
/// the port before the backend binds it. Callers treat a failed listen-wait
/// as the signal for that race.
pub fn allocate_port() -> Result<u16, RelayError> {
    let listener =
        TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(RelayError::PortAllocation)?;
    let port = listener
        .local_addr()
        .map_err(RelayError::PortAllocation)?
        .port();
    Ok(port)
}

/// Loopback socket address for a port
pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Check whether something accepts TCP connections at `addr`.
pub async fn is_listening(addr: SocketAddr) -> bool {
    matches!(timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await, Ok(Ok(_)))
}

/// Poll `addr` until it accepts connections or `limit` elapses.
pub async fn wait_for_listen(addr: SocketAddr, limit: Duration) -> Result<(), RelayError> {
    let deadline = Instant::now() + limit;
    let mut backoff = Backoff::new(
        Duration::from_millis(100),
        Duration::from_secs(1),
        1.5,
        false,
    );

    loop {
        if is_listening(addr).await {
            debug!(%addr, probes = backoff.attempt() + 1, "Backend is listening");
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(RelayError::ListenTimeout {
                target: addr,
                timeout: limit,
            });
        }

        let delay = backoff.duration().min(deadline - now);
        tokio::time::sleep(delay).await;
    }
}
