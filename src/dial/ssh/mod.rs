//! SSH jump-host dialing
//!
//! One [`SshDialer`] per tunnel. All dials of that tunnel share a single SSH
//! connection, opened on first use and reopened after it drops.

mod client;
mod connection;
mod host_keys;

use async_trait::async_trait;
use tracing::debug;

pub use client::{JumpAuth, JumpHandler, RusshTransport};
pub use connection::{JumpCommand, JumpHandle, JumpTransport, SshConnection};
pub use host_keys::HostKeyPolicy;

use super::{split_host_port, BoxedStream, Dial, DialError};
use crate::config::{ConfigError, SshOutboundConfig};

/// Dials targets through `direct-tcpip` channels of a shared SSH client
pub struct SshDialer<T: JumpTransport = RusshTransport> {
    connection: SshConnection<T>,
}

impl SshDialer<RusshTransport> {
    pub fn from_config(config: &SshOutboundConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(RusshTransport::from_config(config)?))
    }
}

impl<T: JumpTransport> SshDialer<T> {
    pub fn new(transport: T) -> Self {
        Self {
            connection: SshConnection::new(transport),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }
}

#[async_trait]
impl<T: JumpTransport> Dial for SshDialer<T> {
    async fn dial(&self, addr: &str) -> Result<BoxedStream, DialError> {
        let (host, port) = split_host_port(addr)?;
        let stream = self.connection.open(&host, port).await?;
        debug!("Opened {} via SSH {}", addr, self.connection.server());
        Ok(stream)
    }

    async fn close(&self) {
        self.connection.close().await;
    }

    fn kind(&self) -> &'static str {
        "ssh"
    }
}
