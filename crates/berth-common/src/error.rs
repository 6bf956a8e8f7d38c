//! Unified error types for the berth workspace.
//!
//! Every error carries a machine-readable kind and a human message; wrapped
//! OS errors preserve their original cause through the `source` chain.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum BerthError {
    /// An underlying kernel or OS call failed.
    #[error("{call}: {source}")]
    System {
        /// Name of the failed call.
        call: &'static str,
        /// Underlying errno.
        source: nix::errno::Errno,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The operation requires a stopped container, but an init is alive.
    #[error("container {id} is not stopped")]
    ContainerNotStopped {
        /// Identifier of the still-running container.
        id: String,
    },

    /// The child reported a structured error during the bootstrap handshake.
    #[error("container init failed: {message}")]
    InitFailed {
        /// Message relayed from the child over the control pipe.
        message: String,
    },

    /// The configuration requires a capability the namespace set cannot
    /// provide.
    #[error("configuration mismatch: {message}")]
    ConfigMismatch {
        /// Description of the conflicting requirement.
        message: String,
    },

    /// The operation's contract is defined but its implementation is
    /// incomplete.
    #[error("not implemented: {operation}")]
    NotImplemented {
        /// Name of the unimplemented operation.
        operation: &'static str,
    },

    /// A spawned helper or intermediate process exited unsuccessfully.
    #[error("{process} exited with status {status}")]
    ProcessExited {
        /// Role of the process that failed.
        process: &'static str,
        /// Synthesized exit status.
        status: i32,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl BerthError {
    /// Wraps a failed OS call, preserving the errno as the cause.
    #[must_use]
    pub fn system(call: &'static str, source: nix::errno::Errno) -> Self {
        Self::System { call, source }
    }

    /// Wraps a failed I/O operation on a path.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, BerthError>;
