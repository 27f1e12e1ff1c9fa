//! Error taxonomy for VM lifecycle operations
//!
//! Four classes cover everything the controller can report:
//! - [`VmError::ConfigUnsupported`] - the host lacks a capability the
//!   configuration asks for (no CPU controller, no KVM, ...)
//! - [`VmError::OperationInvalid`] - caller misuse (starting an active VM,
//!   per-vCPU pinning before vCPU thread ids are known)
//! - [`VmError::Internal`] - protocol or parse failures, missing fields in
//!   monitor responses
//! - [`VmError::System`] - syscall failures (socket, poll, recv, affinity,
//!   scheduler, cgroup filesystem)

use thiserror::Error;

pub type VmResult<T> = Result<T, VmError>;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("unsupported configuration: {0}")]
    ConfigUnsupported(String),

    #[error("operation is not valid: {0}")]
    OperationInvalid(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{context}: {source}")]
    System {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl VmError {
    /// Wrap an I/O error with the operation that produced it.
    pub fn system(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::System {
            context: context.into(),
            source,
        }
    }

    /// Wrap a raw errno (from nix) with the operation that produced it.
    pub fn errno(context: impl Into<String>, errno: nix::errno::Errno) -> Self {
        Self::System {
            context: context.into(),
            source: std::io::Error::from_raw_os_error(errno as i32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_error_carries_context() {
        let err = VmError::system(
            "connect to monitor socket",
            std::io::Error::from_raw_os_error(libc::ECONNREFUSED),
        );
        let msg = err.to_string();
        assert!(msg.contains("connect to monitor socket"));
    }

    #[test]
    fn test_errno_roundtrip() {
        let err = VmError::errno("poll on socket", nix::errno::Errno::EBUSY);
        match err {
            VmError::System { source, .. } => {
                assert_eq!(source.raw_os_error(), Some(libc::EBUSY));
            }
            _ => panic!("expected System variant"),
        }
    }
}
