//! Tunnel listener
//!
//! Owns the bound socket of one tunnel. The accept loop and every session run
//! as supervised tasks; a reporter logs the live connection count at a fixed
//! interval. An accept error ends the loop for this listener only.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::counter::LiveCounter;
use super::error::TunnelError;
use super::session::{ConnectionSession, SessionContext};
use crate::config::TunnelConfig;
use crate::dial::Dial;
use crate::task::spawn_supervised;

pub struct TunnelListener {
    tag: String,
    local_addr: SocketAddr,
    counter: LiveCounter,
    dialer: Arc<dyn Dial>,
    shutdown: CancellationToken,
}

impl TunnelListener {
    /// Bind the listen address and start accepting.
    pub async fn bind(config: &TunnelConfig, dialer: Arc<dyn Dial>) -> Result<Self, TunnelError> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|e| TunnelError::listen(&config.listen_addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TunnelError::listen(&config.listen_addr, e))?;

        let ctx = Arc::new(SessionContext::from_config(config, dialer.clone()));
        let tag = ctx.tag.clone();
        let counter = ctx.counter.clone();
        let shutdown = CancellationToken::new();

        info!(
            "[{}] tunnel tcp listening on {} -> {} ({})",
            tag,
            local_addr,
            config.target_addr,
            dialer.kind()
        );

        spawn_reporter(tag.clone(), counter.clone(), config, shutdown.clone());
        spawn_accept_loop(listener, local_addr, ctx, shutdown.clone());

        Ok(Self {
            tag,
            local_addr,
            counter,
            dialer,
            shutdown,
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn live_connections(&self) -> usize {
        self.counter.current()
    }

    /// Whether the accept loop is still running
    pub fn is_accepting(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Stop accepting and release the dialer. Sessions already pumping run
    /// until one side closes.
    pub async fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("[{}] tunnel on {} stopping", self.tag, self.local_addr);
            // Accept loop and reporter both watch this token
            self.shutdown.cancel();
        }
        // Shared SSH client goes last, after new sessions can no longer dial
        self.dialer.close().await;
    }
}

impl Drop for TunnelListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn spawn_accept_loop(
    listener: TcpListener,
    local_addr: SocketAddr,
    ctx: Arc<SessionContext>,
    shutdown: CancellationToken,
) {
    let tag = ctx.tag.clone();
    spawn_supervised(format!("[{}] accept loop", tag), async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("[{}] accept loop stopped", ctx.tag);
                    break;
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }
                        // Sessions are detached; a panic in one never reaches this loop
                        let session = ConnectionSession::new(ctx.clone(), peer, local_addr);
                        spawn_supervised(format!("[{}] session {}", ctx.tag, peer), session.run(stream));
                    }
                    Err(e) => {
                        error!("[{}] {}", ctx.tag, TunnelError::Accept(e));
                        // Also stops the reporter
                        shutdown.cancel();
                        break;
                    }
                }
            }
        }
    });
}

fn spawn_reporter(tag: String, counter: LiveCounter, config: &TunnelConfig, shutdown: CancellationToken) {
    let period = config.report_interval();
    spawn_supervised(format!("[{}] reporter", tag), async move {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    info!("[{}] tunnel tcp live connections: {}", tag, counter.current());
                }
            }
        }
    });
}
