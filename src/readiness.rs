use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::info;

use crate::config::{DEFAULT_POLL_INTERVAL, DEFAULT_STARTUP_TIMEOUT};
use crate::error::{InstanceError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const CANCEL_CHECK_SLICE: Duration = Duration::from_millis(50);

/// Shared flag that aborts an in-progress readiness wait.
///
/// Clones observe the same state.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// What made the server count as reachable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Socket,
    Port,
}

/// Polls for a server's socket file or TCP port with a bounded wait.
#[derive(Clone, Debug)]
pub struct ReadinessWaiter {
    timeout: Duration,
    interval: Duration,
    cancel: Option<CancellationToken>,
}

impl Default for ReadinessWaiter {
    fn default() -> Self {
        Self::new(DEFAULT_STARTUP_TIMEOUT, DEFAULT_POLL_INTERVAL)
    }
}

impl ReadinessWaiter {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Blocks until `socket` exists or `port` accepts a connection.
    ///
    /// `exited` is consulted once per poll and returns a description of the
    /// server's exit status once it has died. The server is never touched on
    /// failure.
    pub fn wait(
        &self,
        socket: &Path,
        port: u16,
        mut exited: impl FnMut() -> Option<String>,
    ) -> Result<Readiness> {
        let start = Instant::now();
        loop {
            let elapsed = start.elapsed();
            if socket.exists() {
                info!(
                    "socket {} is available after {elapsed:?} of waiting",
                    socket.display()
                );
                return Ok(Readiness::Socket);
            }
            if is_port_open(port) {
                info!("port {port} is available after {elapsed:?} of waiting");
                return Ok(Readiness::Port);
            }
            if let Some(status) = exited() {
                return Err(InstanceError::ServerExited { port, status });
            }
            if elapsed > self.timeout {
                return Err(InstanceError::StartupTimeout {
                    port,
                    socket: socket.to_path_buf(),
                    elapsed,
                });
            }
            self.pause(port, start)?;
        }
    }

    fn pause(&self, port: u16, start: Instant) -> Result<()> {
        let resume = Instant::now() + self.interval;
        loop {
            if self
                .cancel
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
            {
                return Err(InstanceError::Interrupted {
                    port,
                    elapsed: start.elapsed(),
                });
            }
            let now = Instant::now();
            if now >= resume {
                return Ok(());
            }
            thread::sleep(CANCEL_CHECK_SLICE.min(resume - now));
        }
    }
}

/// True when something accepts TCP connections on the loopback `port`.
pub fn is_port_open(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_ok()
}
