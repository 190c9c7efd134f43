//! Retired backend cleanup
//!
//! Backends that are replaced or shut down are handed to a single background
//! task through a small bounded queue. The task asks each one to stop with
//! SIGINT, waits up to the shutdown timeout, and then sends SIGKILL. When the
//! queue is full, the caller waits for room.

use std::process::ExitStatus;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Retired processes that may wait for cleanup at once
pub const CLEANUP_QUEUE_CAPACITY: usize = 3;

/// Result of reaping one process
#[derive(Debug)]
pub struct Reaped {
    pub pid: Option<u32>,
    pub status: Option<ExitStatus>,
    /// Whether SIGKILL was needed
    pub killed: bool,
}

/// Sending side of the cleanup queue
#[derive(Debug, Clone)]
pub struct ReaperHandle {
    tx: Option<mpsc::Sender<Child>>,
    shutdown_timeout: Duration,
}

impl ReaperHandle {
    /// Queue a process for cleanup, waiting while the queue is full.
    ///
    /// If the reaper is gone the process is stopped inline instead.
    pub async fn retire(&self, child: Child) {
        let child = match &self.tx {
            Some(tx) => match tx.send(child).await {
                Ok(()) => return,
                Err(mpsc::error::SendError(child)) => child,
            },
            None => child,
        };

        warn!(pid = ?child.id(), "Cleanup queue closed, stopping backend inline");
        reap(child, self.shutdown_timeout).await;
    }

    /// Drop this handle's sender so the reaper can finish once drained.
    pub fn close(&mut self) {
        self.tx = None;
    }
}

/// Background cleanup task
pub struct Reaper;

impl Reaper {
    /// Start the reaper, returning its queue handle and task.
    ///
    /// The task ends after every handle is closed or dropped and the queue
    /// is drained.
    pub fn spawn(shutdown_timeout: Duration) -> (ReaperHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Child>(CLEANUP_QUEUE_CAPACITY);

        let task = tokio::spawn(async move {
            while let Some(child) = rx.recv().await {
                reap(child, shutdown_timeout).await;
            }
            debug!("Cleanup queue drained");
        });

        let handle = ReaperHandle {
            tx: Some(tx),
            shutdown_timeout,
        };
        (handle, task)
    }
}

/// Stop one process: SIGINT, wait up to `shutdown_timeout`, then SIGKILL.
pub async fn reap(mut child: Child, shutdown_timeout: Duration) -> Reaped {
    // Already exited and reaped
    let Some(pid) = child.id() else {
        return Reaped {
            pid: None,
            status: child.try_wait().ok().flatten(),
            killed: false,
        };
    };

    debug!(pid, "Sending SIGINT to backend");
    signal(pid, Signal::Interrupt);

    let (status, killed) = match tokio::time::timeout(shutdown_timeout, child.wait()).await {
        Ok(Ok(status)) => {
            info!(pid, %status, "Backend exited");
            (Some(status), false)
        }
        Ok(Err(e)) => {
            warn!(pid, error = %e, "Error waiting for backend to exit");
            (None, false)
        }
        Err(_) => {
            warn!(
                pid,
                shutdown_timeout_secs = shutdown_timeout.as_secs_f64(),
                "Shutdown timeout exceeded, sending SIGKILL"
            );
            signal(pid, Signal::Kill);
            if let Err(e) = child.kill().await {
                debug!(pid, error = %e, "Kill after SIGKILL failed");
            }
            (child.try_wait().ok().flatten(), true)
        }
    };

    Reaped {
        pid: Some(pid),
        status,
        killed,
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Interrupt,
    Kill,
}

/// Signal the backend's process group, falling back to the process itself.
#[cfg(unix)]
fn signal(pid: u32, sig: Signal) {
    let sig = match sig {
        Signal::Interrupt => libc::SIGINT,
        Signal::Kill => libc::SIGKILL,
    };
    let pid = pid as libc::pid_t;

    // SAFETY: kill has no memory-safety requirements; a stale pid only
    // yields ESRCH.
    unsafe {
        if libc::kill(-pid, sig) != 0 {
            libc::kill(pid, sig);
        }
    }
}

#[cfg(not(unix))]
fn signal(_pid: u32, _sig: Signal) {}
