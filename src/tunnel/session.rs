//! Connection session
//!
//! Drives one accepted socket through
//! `Accepted → (Authenticating) → Dialing → (OutboundAuthenticating) → Pumping → Closed`.
//! The authenticating states are skipped for a leg with no password. Any
//! failure before pumping closes whatever legs are open and ends the session.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use super::counter::LiveCounter;
use super::error::SessionError;
use super::pump::Pump;
use crate::buffer::BufferPool;
use crate::channel::{KeyDerivation, SecureChannel};
use crate::config::TunnelConfig;
use crate::dial::Dial;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    Authenticating,
    Dialing,
    OutboundAuthenticating,
    Pumping,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Accepted => "accepted",
            SessionState::Authenticating => "authenticating",
            SessionState::Dialing => "dialing",
            SessionState::OutboundAuthenticating => "outbound_authenticating",
            SessionState::Pumping => "pumping",
            SessionState::Closed => "closed",
        })
    }
}

/// Per-tunnel settings shared by all of its sessions
pub struct SessionContext {
    pub tag: String,
    pub target_addr: String,
    pub inbound_secret: Option<Vec<u8>>,
    pub target_secret: Option<Vec<u8>>,
    pub compression: bool,
    pub key_derivation: KeyDerivation,
    pub idle_timeout: Duration,
    pub dialer: Arc<dyn Dial>,
    pub counter: LiveCounter,
    pub pool: BufferPool,
}

impl SessionContext {
    pub fn from_config(config: &TunnelConfig, dialer: Arc<dyn Dial>) -> Self {
        Self {
            tag: config.display_tag().to_string(),
            target_addr: config.target_addr.clone(),
            inbound_secret: config.inbound_secret().map(<[u8]>::to_vec),
            target_secret: config.target_secret().map(<[u8]>::to_vec),
            compression: config.compression,
            key_derivation: config.key_derivation,
            idle_timeout: config.idle_timeout(),
            dialer,
            counter: LiveCounter::new(),
            pool: BufferPool::default(),
        }
    }
}

/// One relayed connection
pub struct ConnectionSession {
    ctx: Arc<SessionContext>,
    peer: SocketAddr,
    local: SocketAddr,
}

impl ConnectionSession {
    pub fn new(ctx: Arc<SessionContext>, peer: SocketAddr, local: SocketAddr) -> Self {
        Self { ctx, peer, local }
    }

    fn enter(&self, state: SessionState) {
        debug!(
            tag = %self.ctx.tag,
            peer = %self.peer,
            target = %self.ctx.target_addr,
            "session {}",
            state
        );
    }

    /// Run the session to completion. Errors are already logged.
    pub async fn run<S>(self, stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ctx = self.ctx.clone();
        self.enter(SessionState::Accepted);
        let mut inbound = SecureChannel::with_idle_timeout(stream, ctx.idle_timeout);

        if let Some(secret) = ctx.inbound_secret.as_deref() {
            self.enter(SessionState::Authenticating);
            match inbound.authenticate_as_responder(secret).await {
                Ok(negotiated) => {
                    inbound.upgrade(&negotiated.session_key(secret, ctx.key_derivation), ctx.compression);
                }
                // Nothing dialed yet; only the inbound leg to drop
                Err(e) => {
                    warn!(
                        "[{}] conn {} authenticate failed ({}): {}",
                        ctx.tag,
                        self.peer,
                        e.kind(),
                        e
                    );
                    let _ = inbound.close().await;
                    self.enter(SessionState::Closed);
                    return Err(SessionError::InboundAuth(e));
                }
            }
        }

        self.enter(SessionState::Dialing);
        let stream = match ctx.dialer.dial(&ctx.target_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    "[{}] conn {} dial {} via {} failed at {}: {}",
                    ctx.tag,
                    self.peer,
                    ctx.target_addr,
                    ctx.dialer.kind(),
                    e.step(),
                    e
                );
                let _ = inbound.close().await;
                self.enter(SessionState::Closed);
                return Err(SessionError::Dial(e));
            }
        };
        let mut outbound = SecureChannel::with_idle_timeout(stream, ctx.idle_timeout);

        if let Some(secret) = ctx.target_secret.as_deref() {
            self.enter(SessionState::OutboundAuthenticating);
            match outbound.authenticate_as_initiator(secret).await {
                Ok(negotiated) => {
                    outbound.upgrade(&negotiated.session_key(secret, ctx.key_derivation), ctx.compression);
                }
                Err(e) => {
                    warn!(
                        "[{}] conn {} outbound authenticate to {} failed: {}",
                        ctx.tag, self.peer, ctx.target_addr, e
                    );
                    // Both legs are open at this point
                    let _ = inbound.close().await;
                    let _ = outbound.close().await;
                    self.enter(SessionState::Closed);
                    return Err(SessionError::OutboundAuth(e));
                }
            }
        }

        self.enter(SessionState::Pumping);
        // Counted from here until the pump releases, not until the tasks exit
        let live = ctx.counter.enter();
        info!(
            "[{}] conn {} - {} connected [{}]",
            ctx.tag, self.peer, self.local, ctx.target_addr
        );

        let label = format!("[{}] {}", ctx.tag, self.peer);
        let (tag, peer, local) = (ctx.tag.clone(), self.peer, self.local);
        let pump = Pump::start(&label, inbound, outbound, &ctx.pool, move |end| {
            drop(live);
            info!(
                "[{}] conn {} - {} released by {} ({})",
                tag,
                peer,
                local,
                end.direction(),
                end
            );
        });
        // Both writers are shut down once this returns
        pump.join().await;

        self.enter(SessionState::Closed);
        Ok(())
    }
}
