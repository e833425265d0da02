//! Shared, lazily connected SSH client
//!
//! # Architecture
//!
//! A single owner task holds the live SSH handle. Dialers talk to it through
//! a cloneable [`JumpHandle`] that sends commands over an mpsc channel. When
//! the owner task exits (server closed the connection, transport error, or an
//! explicit disconnect) the command channel closes.
//!
//! [`SshConnection`] caches at most one `JumpHandle`:
//!
//! - fast path: read-lock the cache, reuse a handle that is still open
//! - slow path: take the connect mutex, re-check, connect, cache, and spawn a
//!   watcher that clears the cache (under the same mutex) once the handle's
//!   owner task is gone, so the next dial reconnects

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::dial::{BoxedStream, DialError};
use crate::task::spawn_supervised;

/// Commands sent to the owner task of one SSH connection
pub enum JumpCommand {
    /// Open a direct-tcpip channel to `host:port`
    OpenDirectTcpip {
        host: String,
        port: u16,
        reply_tx: oneshot::Sender<Result<BoxedStream, DialError>>,
    },

    /// Disconnect and stop the owner task
    Disconnect,
}

/// Controller for one live SSH connection
#[derive(Clone)]
pub struct JumpHandle {
    cmd_tx: mpsc::Sender<JumpCommand>,
}

impl JumpHandle {
    pub fn new(cmd_tx: mpsc::Sender<JumpCommand>) -> Self {
        Self { cmd_tx }
    }

    pub async fn open_direct_tcpip(&self, host: &str, port: u16) -> Result<BoxedStream, DialError> {
        let addr = format!("{}:{}", host, port);
        let closed = || DialError::SshChannelOpen {
            addr: addr.clone(),
            reason: "SSH connection closed".to_string(),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(JumpCommand::OpenDirectTcpip {
                host: host.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| closed())?;
        reply_rx.await.map_err(|_| closed())?
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(JumpCommand::Disconnect).await;
    }

    /// Resolves once the owner task has exited
    pub async fn closed(&self) {
        self.cmd_tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    fn same_connection(&self, other: &JumpHandle) -> bool {
        self.cmd_tx.same_channel(&other.cmd_tx)
    }
}

const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Establishes new SSH connections; the real one speaks russh, tests inject fakes
#[async_trait]
pub trait JumpTransport: Send + Sync + 'static {
    async fn connect(&self) -> Result<JumpHandle, DialError>;

    /// Upper bound for one direct-tcpip open
    fn open_timeout(&self) -> Duration {
        DEFAULT_OPEN_TIMEOUT
    }

    /// Jump host address, for logs
    fn server(&self) -> &str;
}

struct Shared<T> {
    transport: T,
    cached: RwLock<Option<JumpHandle>>,
    connect_lock: Mutex<()>,
}

/// At most one live SSH client per instance, reconnecting on demand
pub struct SshConnection<T: JumpTransport> {
    shared: Arc<Shared<T>>,
}

impl<T: JumpTransport> SshConnection<T> {
    pub fn new(transport: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                cached: RwLock::new(None),
                connect_lock: Mutex::new(()),
            }),
        }
    }

    pub fn server(&self) -> &str {
        self.shared.transport.server()
    }

    pub fn is_connected(&self) -> bool {
        self.live_handle().is_some()
    }

    fn live_handle(&self) -> Option<JumpHandle> {
        self.shared
            .cached
            .read()
            .as_ref()
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Return the cached client, connecting first if needed.
    pub async fn client(&self) -> Result<JumpHandle, DialError> {
        if let Some(handle) = self.live_handle() {
            return Ok(handle);
        }

        let _guard = self.shared.connect_lock.lock().await;
        // Another caller may have connected while we waited for the lock
        if let Some(handle) = self.live_handle() {
            return Ok(handle);
        }

        debug!("Connecting to SSH server {}", self.server());
        let handle = self.shared.transport.connect().await?;
        *self.shared.cached.write() = Some(handle.clone());
        spawn_watcher(Arc::downgrade(&self.shared), handle.clone(), self.server().to_string());

        info!("SSH connection to {} established", self.server());
        Ok(handle)
    }

    /// Open a channel to `host:port` through the jump host.
    pub async fn open(&self, host: &str, port: u16) -> Result<BoxedStream, DialError> {
        let handle = self.client().await?;
        // A target the jump host never answers for must not hang the session
        tokio::time::timeout(
            self.shared.transport.open_timeout(),
            handle.open_direct_tcpip(host, port),
        )
        .await
        .map_err(|_| DialError::Timeout(format!("direct-tcpip {}:{} via {}", host, port, self.server())))?
    }

    /// Disconnect the cached client, if any.
    pub async fn close(&self) {
        let handle = {
            let _guard = self.shared.connect_lock.lock().await;
            self.shared.cached.write().take()
        };
        if let Some(handle) = handle {
            info!("Closing SSH connection to {}", self.server());
            handle.disconnect().await;
        }
    }
}

fn spawn_watcher<T: JumpTransport>(shared: Weak<Shared<T>>, handle: JumpHandle, server: String) {
    spawn_supervised(format!("ssh watcher {}", server), async move {
        handle.closed().await;

        // Connection dropped along with its dialer
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let _guard = shared.connect_lock.lock().await;
        let mut cached = shared.cached.write();
        // Leave a newer connection alone
        if cached
            .as_ref()
            .is_some_and(|current| current.same_connection(&handle))
        {
            *cached = None;
            warn!("SSH connection to {} lost, will reconnect on next dial", server);
        }
    });
}
