//! Error types for the shim and guest init.
//!
//! Every error maps to a gRPC-style [`Code`] so RPC boundaries (containerd
//! on one side, the guest services on the other) report a single consistent
//! taxonomy. Retry policy hangs off [`Error::is_transient`]: only
//! `Unavailable` errors are ever retried, with the backoff constants from
//! [`crate::constants`].

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for shim and guest operations.
pub type Result<T> = std::result::Result<T, Error>;

/// gRPC-style status codes used across RPC boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    /// Key, container, or process unknown.
    NotFound,
    /// Wrong state, stdin closed, invalid transition.
    FailedPrecondition,
    /// Malformed input (empty bundle path, illegal file name, bad key).
    InvalidArgument,
    /// Transient failure; eligible for retry with backoff.
    Unavailable,
    /// A bounded resource ran out (IPAM pool exhausted).
    ResourceExhausted,
    /// A bounded wait expired.
    DeadlineExceeded,
    /// Everything else.
    Internal,
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Code::NotFound => "not found",
            Code::FailedPrecondition => "failed precondition",
            Code::InvalidArgument => "invalid argument",
            Code::Unavailable => "unavailable",
            Code::ResourceExhausted => "resource exhausted",
            Code::DeadlineExceeded => "deadline exceeded",
            Code::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Errors produced by the shim and guest init.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Lookup / State Errors
    // =========================================================================
    /// Process not registered for the given key.
    #[error("process not found: {container_id}/{exec_id}")]
    ProcessNotFound {
        container_id: String,
        exec_id: String,
    },

    /// Container unknown to this shim.
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Container already exists.
    #[error("container already exists: {0}")]
    ContainerAlreadyExists(String),

    /// A process is already registered under the key.
    #[error("process already registered: {container_id}/{exec_id}")]
    ProcessAlreadyRegistered {
        container_id: String,
        exec_id: String,
    },

    /// Stdin already closed or never attached.
    #[error("stdin unavailable for {container_id}/{exec_id}: {reason}")]
    StdinUnavailable {
        container_id: String,
        exec_id: String,
        reason: String,
    },

    /// Container is in the wrong state for the operation.
    #[error("container '{id}' is in state '{state}', expected '{expected}'")]
    InvalidState {
        id: String,
        state: String,
        expected: String,
    },

    /// VM state transition rejected.
    #[error("invalid VM state transition from '{from}' to '{to}'")]
    InvalidVmTransition { from: String, to: String },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Bundle is malformed or missing required pieces.
    #[error("invalid bundle at {path}: {reason}")]
    InvalidBundle { path: PathBuf, reason: String },

    /// A caller-supplied argument is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Transient Errors
    // =========================================================================
    /// Vsock endpoint unreachable (guest still booting, stale fd).
    #[error("vsock unavailable (cid {cid}, port {port}): {reason}")]
    VsockUnavailable { cid: u32, port: u32, reason: String },

    /// Guest RPC failed in a retriable way.
    #[error("guest rpc unavailable: {0}")]
    RpcUnavailable(String),

    /// CNI reported a conflict that looks like an orphaned allocation.
    #[error("network setup conflict for '{id}': {reason}")]
    NetworkConflict { id: String, reason: String },

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// IPAM pool exhausted; create must fail.
    #[error("network resources exhausted: {0}")]
    NetworkExhausted(String),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// A bounded wait expired.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// The hypervisor child died unexpectedly.
    #[error("hypervisor exited unexpectedly for container '{0}'")]
    HypervisorDied(String),

    /// Hypervisor binary not found.
    #[error("hypervisor not available: {0}")]
    HypervisorUnavailable(String),

    /// The OCI runtime failed to create or control a process.
    #[error("runtime operation '{operation}' failed for '{id}': {reason}")]
    RuntimeFailed {
        operation: String,
        id: String,
        reason: String,
    },

    // =========================================================================
    // Wire / I/O Errors
    // =========================================================================
    /// Remote side returned a coded error over the wire.
    #[error("remote error ({code}): {message}")]
    Remote { code: Code, message: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal invariant violated (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Maps this error to its RPC status code.
    #[must_use]
    pub fn code(&self) -> Code {
        match self {
            Error::ProcessNotFound { .. } | Error::ContainerNotFound(_) => Code::NotFound,
            Error::ContainerAlreadyExists(_)
            | Error::ProcessAlreadyRegistered { .. }
            | Error::StdinUnavailable { .. }
            | Error::InvalidState { .. }
            | Error::InvalidVmTransition { .. } => Code::FailedPrecondition,
            Error::InvalidBundle { .. } | Error::InvalidArgument(_) => Code::InvalidArgument,
            Error::VsockUnavailable { .. }
            | Error::RpcUnavailable(_)
            | Error::NetworkConflict { .. }
            | Error::HypervisorDied(_) => Code::Unavailable,
            Error::NetworkExhausted(_) => Code::ResourceExhausted,
            Error::Timeout { .. } => Code::DeadlineExceeded,
            Error::Remote { code, .. } => *code,
            Error::Io(err) => match err.raw_os_error() {
                Some(libc::EBADF) | Some(libc::ENODEV) | Some(libc::ECONNRESET) => {
                    Code::Unavailable
                }
                _ => Code::Internal,
            },
            Error::HypervisorUnavailable(_)
            | Error::RuntimeFailed { .. }
            | Error::Serialization(_)
            | Error::Internal(_) => Code::Internal,
        }
    }

    /// Returns true if the operation may be retried with backoff.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.code() == Code::Unavailable
    }

    /// Constructs a remote error from a wire code and message.
    #[must_use]
    pub fn remote(code: Code, message: impl Into<String>) -> Self {
        Error::Remote {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_not_found() {
        let err = Error::ProcessNotFound {
            container_id: "c1".into(),
            exec_id: String::new(),
        };
        assert_eq!(err.code(), Code::NotFound);
        assert!(!err.is_transient());
    }

    #[test]
    fn vsock_unavailable_is_transient() {
        let err = Error::VsockUnavailable {
            cid: 3,
            port: 2962,
            reason: "ENODEV".into(),
        };
        assert_eq!(err.code(), Code::Unavailable);
        assert!(err.is_transient());
    }

    #[test]
    fn io_ebadf_is_transient() {
        let err = Error::Io(std::io::Error::from_raw_os_error(libc::EBADF));
        assert!(err.is_transient());
    }

    #[test]
    fn io_other_is_internal() {
        let err = Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(err.code(), Code::Internal);
    }

    #[test]
    fn timeout_is_not_retried() {
        let err = Error::Timeout {
            operation: "subscriber barrier".into(),
            duration: Duration::from_secs(10),
        };
        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert!(!err.is_transient());
    }

    #[test]
    fn remote_code_round_trip() {
        let err = Error::remote(Code::FailedPrecondition, "stdin closed");
        assert_eq!(err.code(), Code::FailedPrecondition);
        let msg = err.to_string();
        assert!(msg.contains("failed precondition"));
        assert!(msg.contains("stdin closed"));
    }
}
