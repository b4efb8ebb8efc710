//! Error types for instance provisioning.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while preparing, launching, or stopping a MySQL instance.
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("MySQL distribution directory doesn't exist: {}", .path.display())]
    DistributionNotFound { path: PathBuf },

    #[error("port {port} is already busy")]
    PortConflict { port: u16 },

    #[error("command {name} not found in {}{}", .dist.display(), format_tried(.tried))]
    CommandNotFound {
        name: String,
        dist: PathBuf,
        tried: Vec<PathBuf>,
    },

    #[error("bootstrap step '{step}' failed: {message}")]
    BootstrapFailure { step: String, message: String },

    #[error("failed to spawn {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "socket {} is not available on port {port} after {elapsed:?} of waiting",
        .socket.display()
    )]
    StartupTimeout {
        port: u16,
        socket: PathBuf,
        elapsed: Duration,
    },

    #[error("waiting for port {port} interrupted after {elapsed:?}")]
    Interrupted { port: u16, elapsed: Duration },

    #[error("server on port {port} exited before becoming ready ({status})")]
    ServerExited { port: u16, status: String },

    #[error("instance on port {port} was stopped while starting")]
    StoppedDuringStartup { port: u16 },

    #[error("invalid {field}: {message}")]
    InvalidConfig { field: String, message: String },

    #[error("IO error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for instance operations.
pub type Result<T> = std::result::Result<T, InstanceError>;

impl InstanceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        InstanceError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn bootstrap(step: impl Into<String>, message: impl Into<String>) -> Self {
        InstanceError::BootstrapFailure {
            step: step.into(),
            message: message.into(),
        }
    }
}

fn format_tried(tried: &[PathBuf]) -> String {
    let mut message = String::new();
    if !tried.is_empty() {
        message.push_str("\nTried:");
        for path in tried {
            message.push_str(&format!("\n  - {}", path.display()));
        }
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_socket_and_elapsed() {
        let err = InstanceError::StartupTimeout {
            port: 13306,
            socket: PathBuf::from("/tmp/mysql.sock"),
            elapsed: Duration::from_secs(2),
        };
        let message = err.to_string();
        assert!(message.contains("/tmp/mysql.sock"));
        assert!(message.contains("13306"));
        assert!(message.contains("2s"));
    }

    #[test]
    fn command_not_found_lists_candidates() {
        let err = InstanceError::CommandNotFound {
            name: "bin/mysqld".to_string(),
            dist: PathBuf::from("/dist"),
            tried: vec![PathBuf::from("/dist/bin/mysqld"), PathBuf::from("/dist/bin/mysqld.exe")],
        };
        let message = err.to_string();
        assert!(message.contains("Tried:"));
        assert!(message.contains("/dist/bin/mysqld.exe"));
    }
}
