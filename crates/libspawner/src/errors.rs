//! Error taxonomy for the spawner.

use std::ffi::NulError;
use std::io;

use nix::errno;
use nix::sys::signal::Signal;
use thiserror::Error;

/// Unified result type across the spawner.
pub type SpawnResult<T> = Result<T, SpawnError>;

/// Error cases
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The child could not be created or its image could not be executed.
    #[error("cannot run program \"{command}\": {reason}")]
    Launch { command: String, reason: String },

    /// A feature that only the native backend provides was requested.
    #[error("unsupported without the native spawner: {0}")]
    Unsupported(&'static str),

    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("failed to send {signal} to pid {pid}: {source}")]
    Signal {
        signal: Signal,
        pid: i32,
        #[source]
        source: errno::Errno,
    },

    #[error("system call failed: {0}")]
    SysCall(#[from] errno::Errno),

    #[error("C string error: {0}")]
    CStringError(#[from] NulError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl SpawnError {
    pub(crate) fn launch(command: impl Into<String>, reason: impl Into<String>) -> Self {
        SpawnError::Launch {
            command: command.into(),
            reason: reason.into(),
        }
    }
}

impl From<SpawnError> for io::Error {
    fn from(err: SpawnError) -> Self {
        let kind = match &err {
            SpawnError::Unsupported(_) => io::ErrorKind::Unsupported,
            SpawnError::Launch { reason, .. } if reason.ends_with("No such file or directory") => {
                io::ErrorKind::NotFound
            }
            SpawnError::Launch { reason, .. } if reason.ends_with("Permission denied") => {
                io::ErrorKind::PermissionDenied
            }
            _ => io::ErrorKind::Other,
        };
        match err {
            SpawnError::Io(inner) => inner,
            SpawnError::SysCall(errno) => errno.into(),
            other => io::Error::new(kind, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_failures_keep_their_io_kind() {
        let err: io::Error = SpawnError::launch("nope", "No such file or directory").into();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("\"nope\""));

        let err: io::Error = SpawnError::launch("x", "exec: Permission denied").into();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn unsupported_maps_to_unsupported_kind() {
        let err: io::Error = SpawnError::Unsupported("pty").into();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
