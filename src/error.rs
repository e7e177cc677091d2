//! WgMesh Error Types

use thiserror::Error;

/// Result type alias for WgMesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// WgMesh error types
#[derive(Error, Debug)]
pub enum Error {
    // Admission errors
    #[error("invalid join token")]
    Auth,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("no free address left in subnet {subnet}")]
    Exhausted { subnet: ipnet::Ipv4Net },

    // Device control errors
    #[error("device operation '{op}' failed on {device}: {reason}")]
    Device {
        op: &'static str,
        device: String,
        reason: String,
    },

    // Persistence errors
    #[error("membership config corrupt: {0}")]
    ConfigCorrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Agent-side errors
    #[error("network error: {0}")]
    Network(String),

    #[error("server error ({status}): {body}")]
    Server { status: u16, body: String },
}

impl Error {
    /// Build a device-control error with operation and device context.
    pub(crate) fn device(op: &'static str, device: &str, reason: impl Into<String>) -> Self {
        Error::Device {
            op,
            device: device.to_string(),
            reason: reason.into(),
        }
    }

    /// Check if this error is a missing-file condition (no membership
    /// config exists yet, so the caller should bootstrap a fresh one).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
