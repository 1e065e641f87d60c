//! Unified error types for the Stagehand workspace.
//!
//! Every role process reports failures through [`StagehandError`]. Syscall
//! failures are mapped into the domain variants with a formatted message at
//! the call site, so this crate does not depend on `nix`.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum StagehandError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path (or endpoint description) where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A bounded field of the shared configuration would overflow.
    #[error("{field} exceeds capacity: {len} > {max}")]
    Capacity {
        /// Name of the bounded field.
        field: &'static str,
        /// Length that was requested.
        len: usize,
        /// Fixed capacity of the field.
        max: usize,
    },

    /// The JSON payload names an engine that is not registered.
    #[error("no engine registered under name {name:?}")]
    UnknownEngine {
        /// Engine name found in the payload.
        name: String,
    },

    /// A privileged operation was refused by the kernel.
    #[error("permission denied: {message}")]
    PermissionDenied {
        /// Description of the denied operation.
        message: String,
    },

    /// The container payload could not be executed.
    #[error("failed to execute {program}: {source}")]
    Exec {
        /// Program that was passed to `execve(2)`.
        program: String,
        /// Errno reported by the exec call.
        source: std::io::Error,
    },

    /// The RPC exchange itself failed (framing, unknown method, bad params).
    #[error("rpc transport error in {method}: {message}")]
    RpcTransport {
        /// Fully qualified method name.
        method: String,
        /// Description of the transport failure.
        message: String,
    },

    /// The remote method ran and reported its own failure.
    #[error("rpc call {method} failed: {message}")]
    RpcCall {
        /// Fully qualified method name.
        method: String,
        /// Error message reported by the server.
        message: String,
    },

    /// The master socket protocol was violated.
    #[error("synchronization error: {message}")]
    Sync {
        /// Description of the protocol violation.
        message: String,
    },

    /// Container monitoring failed (reaping or signal forwarding).
    #[error("monitor error: {message}")]
    Monitor {
        /// Description of the monitoring failure.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl StagehandError {
    /// Exit code a container process should use when it terminates on this error.
    ///
    /// Exec failures follow the shell convention (127 for a missing program,
    /// 126 for one that cannot be executed); everything else maps to the
    /// reserved fatal code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exec { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => 127,
                std::io::ErrorKind::PermissionDenied => 126,
                _ if source.raw_os_error() == Some(ENOEXEC) => 126,
                _ => crate::constants::FATAL_EXIT_CODE,
            },
            _ => crate::constants::FATAL_EXIT_CODE,
        }
    }
}

/// `ENOEXEC` on Linux; kept local so the crate stays free of `libc`.
const ENOEXEC: i32 = 8;

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, StagehandError>;
