//! Dial Strategy
//!
//! How a tunnel reaches its target: a plain TCP dial, or a `direct-tcpip`
//! channel over a shared SSH connection to a jump host.

mod direct;
mod error;
pub mod ssh;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use direct::DirectDialer;
pub use error::DialError;
pub use ssh::{HostKeyPolicy, SshDialer};

use crate::config::{ConfigError, TunnelConfig};

/// Any duplex byte stream the engine can relay
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens outbound connections for a tunnel
#[async_trait]
pub trait Dial: Send + Sync {
    async fn dial(&self, addr: &str) -> Result<BoxedStream, DialError>;

    /// Release shared resources (the SSH client, if any)
    async fn close(&self) {}

    fn kind(&self) -> &'static str;
}

/// Pick the dial strategy for a tunnel: SSH when an `ssh` block is configured
pub fn build_dialer(config: &TunnelConfig) -> Result<Arc<dyn Dial>, ConfigError> {
    match &config.ssh {
        Some(ssh) => Ok(Arc::new(SshDialer::from_config(ssh)?)),
        None => Ok(Arc::new(DirectDialer::default())),
    }
}

/// Split `host:port`, accepting `[v6]:port`
pub fn split_host_port(addr: &str) -> Result<(String, u16), DialError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| DialError::InvalidAddress(addr.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| DialError::InvalidAddress(addr.to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(DialError::InvalidAddress(addr.to_string()));
    }
    Ok((host.to_string(), port))
}
