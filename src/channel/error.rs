//! Handshake error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("Authentication failed: handshake digest mismatch")]
    AuthFailure,

    #[error("Handshake timestamp expired: clock skew of {skew_secs}s")]
    ReplayOrClockSkew { skew_secs: i64 },

    #[error("Handshake IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HandshakeError {
    /// Short label for structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            HandshakeError::AuthFailure => "auth_failure",
            HandshakeError::ReplayOrClockSkew { .. } => "clock_skew",
            HandshakeError::Io(_) => "io",
        }
    }
}
