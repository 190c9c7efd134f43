//! Backend process supervision
//!
//! The supervisor owns the one running backend. Every start picks a fresh
//! loopback port, so requests can be routed to the new process while the
//! old one is still shutting down in the reaper.

use std::env;
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::{LogLevels, RelayConfig};
use crate::error::RelayError;
use crate::net::{allocate_port, loopback, wait_for_listen};
use crate::output::OutputCapture;
use crate::reaper::ReaperHandle;

/// Settings needed to launch the backend
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Shell command run through `sh -c`
    pub command: String,
    /// Directory prepended to PATH, skipped when empty
    pub bin_dir: String,
    pub listen_timeout: Duration,
    pub levels: LogLevels,
}

impl SupervisorConfig {
    pub fn from_relay(relay: &RelayConfig, levels: LogLevels) -> Self {
        Self {
            command: relay.command.clone(),
            bin_dir: relay.bin_dir.clone(),
            listen_timeout: relay.listen_timeout(),
            levels,
        }
    }
}

/// The backend that currently receives traffic
struct Backend {
    child: Child,
    output: OutputCapture,
}

/// Owner of the running backend process
pub struct Supervisor {
    config: SupervisorConfig,
    current: Option<Backend>,
    target: SocketAddr,
    restarts: u64,
    reaper: ReaperHandle,
    closed: bool,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, reaper: ReaperHandle) -> Self {
        Self {
            config,
            current: None,
            target: loopback(0),
            restarts: 0,
            reaper,
            closed: false,
        }
    }

    /// Launch the backend on a fresh port and wait until it listens.
    ///
    /// Nothing is recorded as current unless the backend came up. A process
    /// that spawned but failed to listen is handed to the reaper.
    pub async fn start(&mut self) -> Result<(), RelayError> {
        if self.closed {
            return Err(RelayError::ShuttingDown);
        }

        let port = allocate_port()?;
        let target = loopback(port);

        info!(command = %self.config.command, port, restarts = self.restarts, "Starting backend");

        let mut child = self.command(port).spawn().map_err(RelayError::ProcessStart)?;
        let pid = child.id();
        debug!(?pid, port, "Backend process spawned");

        let output = OutputCapture::attach(&mut child, self.config.levels);

        let ready = tokio::select! {
            res = wait_for_listen(target, self.config.listen_timeout) => res,
            status = child.wait() => Err(match status {
                Ok(status) => RelayError::ProcessExited { status },
                Err(e) => RelayError::ProcessStart(e),
            }),
        };

        if let Err(e) = ready {
            output.flush();
            warn!(?pid, port, error = %e, "Backend failed to start");
            self.reaper.retire(child).await;
            return Err(e);
        }

        info!(?pid, %target, "Backend is ready");

        let previous = self.current.replace(Backend { child, output });
        self.target = target;

        if let Some(previous) = previous {
            self.retire(previous).await;
        }

        Ok(())
    }

    /// Replace the current backend with a new one.
    ///
    /// The old process is queued for cleanup before the new one starts. On
    /// failure there is no current backend and the target is left as it was.
    pub async fn restart(&mut self) -> Result<(), RelayError> {
        if self.closed {
            return Err(RelayError::ShuttingDown);
        }

        self.restarts += 1;
        warn!(restarts = self.restarts, target = %self.target, "Restarting backend");

        if let Some(previous) = self.current.take() {
            self.retire(previous).await;
        }

        self.start().await?;
        warn!(restarts = self.restarts, target = %self.target, "Backend restarted");
        Ok(())
    }

    /// Retire the current backend and release the cleanup queue.
    ///
    /// No backend can be started afterwards.
    pub async fn shutdown(&mut self) {
        self.closed = true;
        if let Some(previous) = self.current.take() {
            info!(pid = ?previous.child.id(), "Stopping backend");
            self.retire(previous).await;
        }
        self.reaper.close();
    }

    async fn retire(&self, backend: Backend) {
        backend.output.flush();
        self.reaper.retire(backend.child).await;
    }

    /// Emit buffered backend output now.
    pub fn flush_logs(&self) {
        if let Some(backend) = &self.current {
            backend.output.flush();
        }
    }

    /// Address of the backend that receives traffic
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn pid(&self) -> Option<u32> {
        self.current.as_ref().and_then(|b| b.child.id())
    }

    pub fn restarts(&self) -> u64 {
        self.restarts
    }

    fn command(&self, port: u16) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.config.command);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        cmd.env("PORT", port.to_string());
        cmd.env("UP_RESTARTS", self.restarts.to_string());
        if let Some(path) = search_path(&self.config.bin_dir) {
            cmd.env("PATH", path);
        }

        // Own process group, so signals reach the shell's children too
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.kill_on_drop(true);
        cmd
    }
}

/// PATH with `bin_dir` in front of the inherited entries
fn search_path(bin_dir: &str) -> Option<OsString> {
    if bin_dir.is_empty() {
        return None;
    }

    let mut dirs = vec![PathBuf::from(bin_dir)];
    if let Some(path) = env::var_os("PATH") {
        dirs.extend(env::split_paths(&path));
    }

    match env::join_paths(dirs) {
        Ok(path) => Some(path),
        Err(e) => {
            warn!(bin_dir, error = %e, "Cannot prepend bin_dir to PATH");
            None
        }
    }
}
