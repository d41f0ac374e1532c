//! Error types for worker supervision and the wire protocol

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Errors surfaced by workers, pools, and exchanges.
///
/// I/O causes are held behind `Arc` so errors can travel through the
/// worker event channels, which require `Clone`.
#[derive(Debug, Clone)]
pub enum WorkerError {
    /// The runtime configuration file did not exist when spawn was requested
    ConfigMissing(PathBuf),
    /// The worker program was not found via `RACKGATE_WORKER` or PATH
    ProgramMissing,
    /// FIFO creation, pipe open, or the spawn call itself failed
    SpawnIo(Arc<io::Error>),
    /// The child reported a boot failure through the handshake pipe
    SpawnFailed(String),
    /// The worker was not in a state that allows the requested operation
    InvalidState(&'static str),
    /// Malformed frame or JSON on the response stream
    Protocol(String),
    /// The socket closed before the exchange completed
    ConnectionLost,
    /// Write attempted after the outbound sentinel was sent
    WriteAfterEnd,
    /// Socket-level I/O failure during an exchange
    Io(Arc<io::Error>),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerError::ConfigMissing(path) => {
                write!(f, "configuration file not found: {}", path.display())
            }
            WorkerError::ProgramMissing => write!(f, "worker program not found"),
            WorkerError::SpawnIo(e) => write!(f, "failed to spawn worker: {}", e),
            WorkerError::SpawnFailed(message) => write!(f, "worker failed to boot: {}", message),
            WorkerError::InvalidState(what) => write!(f, "{}", what),
            WorkerError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            WorkerError::ConnectionLost => {
                write!(f, "connection closed before the exchange completed")
            }
            WorkerError::WriteAfterEnd => write!(f, "write after end of request"),
            WorkerError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerError::SpawnIo(e) | WorkerError::Io(e) => Some(&**e),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkerError {
    fn from(err: io::Error) -> Self {
        WorkerError::Io(Arc::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_the_boot_message() {
        let err = WorkerError::SpawnFailed("b00m".to_string());
        assert_eq!(err.to_string(), "worker failed to boot: b00m");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "gone");
        let err: WorkerError = io_err.into();
        assert!(matches!(err, WorkerError::Io(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_config_missing_names_the_path() {
        let err = WorkerError::ConfigMissing(PathBuf::from("/tmp/app.toml"));
        assert!(err.to_string().contains("/tmp/app.toml"));
    }
}
