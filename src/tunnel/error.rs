//! Tunnel error types

use thiserror::Error;

use crate::channel::HandshakeError;
use crate::config::ConfigError;
use crate::dial::DialError;

/// Errors that stop a listener or the whole tunnel set
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to listen on {addr}: {reason}")]
    Listen {
        addr: String,
        reason: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Accept failed: {0}")]
    Accept(#[source] std::io::Error),
}

impl TunnelError {
    /// Map a bind failure to a readable reason
    pub fn listen(addr: &str, source: std::io::Error) -> Self {
        let reason = match source.kind() {
            std::io::ErrorKind::AddrInUse => {
                "port already in use, another process may be listening".to_string()
            }
            std::io::ErrorKind::PermissionDenied => {
                "permission denied, ports below 1024 require elevated privileges".to_string()
            }
            std::io::ErrorKind::AddrNotAvailable => {
                "address not available on this system".to_string()
            }
            _ => source.to_string(),
        };
        TunnelError::Listen {
            addr: addr.to_string(),
            reason,
            source,
        }
    }
}

/// Why a single connection ended before pumping
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("inbound authentication failed: {0}")]
    InboundAuth(#[source] HandshakeError),

    #[error("dial failed: {0}")]
    Dial(#[from] DialError),

    #[error("outbound authentication failed: {0}")]
    OutboundAuth(#[source] HandshakeError),
}
