//! Error types for the relay process.

use thiserror::Error;

/// Errors that can stop the relay process.
///
/// Per-connection failures never surface here; they are logged and turned
/// into deregistration inside the connection task.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Address the relay failed to bind, if this is a bind failure.
    pub fn bind_addr(&self) -> Option<&str> {
        match self {
            RelayError::Bind { addr, .. } => Some(addr.as_str()),
            _ => None,
        }
    }
}
