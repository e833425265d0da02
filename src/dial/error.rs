//! Dial error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DialError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid target address: {0}")]
    InvalidAddress(String),

    #[error("SSH connection to {server} failed: {reason}")]
    SshConnect { server: String, reason: String },

    #[error("SSH authentication as {user}@{server} rejected")]
    SshAuth { server: String, user: String },

    #[error("SSH channel to {addr} failed: {reason}")]
    SshChannelOpen { addr: String, reason: String },

    #[error("host key mismatch, server send {key_type} {key_base64}")]
    HostKeyMismatch { key_type: String, key_base64: String },

    #[error("SSH protocol error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("Timeout: {0}")]
    Timeout(String),
}

impl DialError {
    /// Which step of the dial failed, for logs
    pub fn step(&self) -> &'static str {
        match self {
            DialError::Connect { .. } | DialError::InvalidAddress(_) => "connect",
            DialError::SshConnect { .. }
            | DialError::SshAuth { .. }
            | DialError::HostKeyMismatch { .. }
            | DialError::Ssh(_)
            | DialError::Timeout(_) => "ssh_connect",
            DialError::SshChannelOpen { .. } => "ssh_channel_open",
        }
    }
}
