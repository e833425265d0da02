//! russh transport for the jump host

use std::borrow::Cow;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{Algorithm, PrivateKey, PublicKey};
use russh::{Disconnect, Preferred, SshId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::connection::{JumpCommand, JumpHandle, JumpTransport};
use super::host_keys::HostKeyPolicy;
use crate::config::{ConfigError, SshOutboundConfig};
use crate::dial::{BoxedStream, DialError};
use crate::task::spawn_supervised;

const DEFAULT_USER: &str = "root";

/// Ordered authentication methods, tried until one succeeds
#[derive(Clone)]
pub enum JumpAuth {
    Password(String),
    PublicKey(Arc<PrivateKey>),
}

impl std::fmt::Debug for JumpAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JumpAuth::Password(_) => f.write_str("Password(<redacted>)"),
            JumpAuth::PublicKey(key) => write!(f, "PublicKey({})", key.algorithm().as_str()),
        }
    }
}

/// Expand `~` and `$VAR` / `${VAR}` in a key path
fn expand_path(path: &str) -> String {
    let path = expand_tilde(path);
    let mut expanded = String::with_capacity(path.len());
    let mut rest = path.as_str();

    while let Some(idx) = rest.find('$') {
        expanded.push_str(&rest[..idx]);
        let after = &rest[idx + 1..];
        let (name, tail) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], &braced[end + 1..]),
                None => (braced, ""),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], &after[end..])
        };
        expanded.push_str(&std::env::var(name).unwrap_or_default());
        rest = tail;
    }
    expanded.push_str(rest);
    expanded
}

fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// Randomized OpenSSH-looking client version
fn random_client_version() -> String {
    let mut rng = rand::thread_rng();
    if rng.gen_bool(0.5) {
        format!("SSH-2.0-OpenSSH_7.{}", rng.gen_range(0..10))
    } else {
        format!("SSH-2.0-OpenSSH_8.{}", rng.gen_range(0..9))
    }
}

/// Connects to the jump host with russh
pub struct RusshTransport {
    server_addr: String,
    user: String,
    auth: Vec<JumpAuth>,
    host_keys: Arc<HostKeyPolicy>,
    host_key_algorithms: Vec<Algorithm>,
    client_version: String,
    connect_timeout: Duration,
}

impl RusshTransport {
    pub fn from_config(config: &SshOutboundConfig) -> Result<Self, ConfigError> {
        let mut auth = Vec::new();

        if let Some(password) = config.password.as_deref().filter(|p| !p.is_empty()) {
            auth.push(JumpAuth::Password(password.to_string()));
        }

        let key_text = match (config.private_key.as_deref(), config.private_key_path.as_deref()) {
            (Some(inline), _) if !inline.is_empty() => Some(inline.to_string()),
            (_, Some(path)) if !path.is_empty() => {
                let path = expand_path(path);
                Some(std::fs::read_to_string(&path).map_err(|e| {
                    ConfigError::Ssh(format!("read private key {}: {}", path, e))
                })?)
            }
            _ => None,
        };
        if let Some(text) = key_text {
            let passphrase = config
                .private_key_passphrase
                .as_deref()
                .filter(|p| !p.is_empty());
            let key = russh::keys::decode_secret_key(&text, passphrase)
                .map_err(|e| ConfigError::Ssh(format!("parse private key: {}", e)))?;
            auth.push(JumpAuth::PublicKey(Arc::new(key)));
        }

        if auth.is_empty() {
            return Err(ConfigError::Ssh(format!(
                "no authentication method configured for {}",
                config.server_addr
            )));
        }

        let host_key_algorithms = config
            .host_key_algorithms
            .iter()
            .map(|name| {
                Algorithm::from_str(name).map_err(|e| {
                    ConfigError::Ssh(format!("unknown host key algorithm {}: {}", name, e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            server_addr: config.server_addr.clone(),
            user: config.effective_user().to_string(),
            auth,
            host_keys: Arc::new(HostKeyPolicy::from_authorized_keys(&config.host_key)?),
            host_key_algorithms,
            client_version: config
                .client_version
                .clone()
                .filter(|v| !v.is_empty())
                .unwrap_or_else(random_client_version),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        })
    }

    fn client_config(&self) -> client::Config {
        let mut preferred = Preferred::default();
        if !self.host_key_algorithms.is_empty() {
            preferred.key = Cow::Owned(self.host_key_algorithms.clone());
        }

        client::Config {
            client_id: SshId::Standard(self.client_version.clone().into()),
            preferred,
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        }
    }

    async fn establish(&self, handler: JumpHandler) -> Result<Handle<JumpHandler>, DialError> {
        let mut handle =
            client::connect(Arc::new(self.client_config()), self.server_addr.as_str(), handler)
                .await
                .map_err(|e| match e {
                    DialError::Ssh(e) => DialError::SshConnect {
                        server: self.server_addr.clone(),
                        reason: e.to_string(),
                    },
                    other => other,
                })?;

        debug!("SSH handshake with {} completed", self.server_addr);
        self.authenticate(&mut handle).await?;
        info!("SSH authenticated as {}@{}", self.user, self.server_addr);
        Ok(handle)
    }

    async fn authenticate(&self, handle: &mut Handle<JumpHandler>) -> Result<(), DialError> {
        for method in &self.auth {
            let result = match method {
                JumpAuth::Password(password) => {
                    handle.authenticate_password(&self.user, password).await
                }
                JumpAuth::PublicKey(key) => {
                    handle
                        .authenticate_publickey(
                            &self.user,
                            PrivateKeyWithHashAlg::new(key.clone(), None),
                        )
                        .await
                }
            }
            .map_err(|e| DialError::SshConnect {
                server: self.server_addr.clone(),
                reason: e.to_string(),
            })?;

            if result.success() {
                debug!("SSH authentication with {:?} accepted", method);
                return Ok(());
            }
            debug!("SSH authentication with {:?} rejected", method);
        }

        Err(DialError::SshAuth {
            server: self.server_addr.clone(),
            user: self.user.clone(),
        })
    }
}

#[async_trait]
impl JumpTransport for RusshTransport {
    async fn connect(&self) -> Result<JumpHandle, DialError> {
        let (alive_tx, alive_rx) = oneshot::channel();
        let handler = JumpHandler {
            host_keys: self.host_keys.clone(),
            _alive: alive_tx,
        };

        // Handshake and authentication share one deadline; a server that
        // stalls mid-auth must not pin the connect lock forever.
        let handle = tokio::time::timeout(self.connect_timeout, self.establish(handler))
            .await
            .map_err(|_| DialError::Timeout(format!("SSH connect to {}", self.server_addr)))??;

        Ok(spawn_handle_owner_task(handle, alive_rx, self.server_addr.clone()))
    }

    fn open_timeout(&self) -> Duration {
        self.connect_timeout
    }

    fn server(&self) -> &str {
        &self.server_addr
    }
}

/// russh callbacks for the jump host connection
pub struct JumpHandler {
    host_keys: Arc<HostKeyPolicy>,
    /// Dropped together with the handler when the session ends
    _alive: oneshot::Sender<()>,
}

impl client::Handler for JumpHandler {
    type Error = DialError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        self.host_keys.verify(server_public_key)?;
        Ok(true)
    }
}

/// Single owner of the russh `Handle`; exits when the session ends or on
/// an explicit disconnect. Channel opens run in their own tasks so one slow
/// target never holds up the others.
fn spawn_handle_owner_task(
    handle: Handle<JumpHandler>,
    mut alive_rx: oneshot::Receiver<()>,
    server: String,
) -> JumpHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<JumpCommand>(64);
    let handle = Arc::new(handle);

    tokio::spawn(async move {
        debug!("Handle owner task started for {}", server);

        loop {
            tokio::select! {
                // Handler dropped: russh tore the session down
                _ = &mut alive_rx => {
                    info!("SSH session to {} ended", server);
                    break;
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(JumpCommand::OpenDirectTcpip { host, port, reply_tx }) => {
                        let handle = handle.clone();
                        spawn_supervised(format!("direct-tcpip {}:{}", host, port), async move {
                            let result = handle
                                .channel_open_direct_tcpip(host.as_str(), port as u32, "127.0.0.1", 0)
                                .await
                                .map(|channel| Box::new(channel.into_stream()) as BoxedStream)
                                .map_err(|e| DialError::SshChannelOpen {
                                    addr: format!("{}:{}", host, port),
                                    reason: e.to_string(),
                                });
                            if reply_tx.send(result).is_err() {
                                warn!("Caller dropped before receiving direct_tcpip result");
                            }
                        });
                    }
                    Some(JumpCommand::Disconnect) => {
                        info!("Disconnect requested for {}", server);
                        break;
                    }
                    // Every JumpHandle dropped
                    None => break,
                }
            }
        }

        // Fail whatever queued up behind the exit
        cmd_rx.close();
        while let Ok(cmd) = cmd_rx.try_recv() {
            if let JumpCommand::OpenDirectTcpip { host, port, reply_tx } = cmd {
                let _ = reply_tx.send(Err(DialError::SshChannelOpen {
                    addr: format!("{}:{}", host, port),
                    reason: "SSH connection closed".to_string(),
                }));
            }
        }

        let _ = handle
            .disconnect(Disconnect::ByApplication, "tunnel closed", "en")
            .await;
        debug!("Handle owner task terminated for {}", server);
    });

    JumpHandle::new(cmd_tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh_config() -> SshOutboundConfig {
        SshOutboundConfig {
            server_addr: "jump.example.com:22".into(),
            password: Some("pw".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_random_client_version_shape() {
        for _ in 0..50 {
            let version = random_client_version();
            assert!(
                version.starts_with("SSH-2.0-OpenSSH_7.") || version.starts_with("SSH-2.0-OpenSSH_8."),
                "{}",
                version
            );
        }
    }

    #[test]
    fn test_defaults_applied() {
        let transport = RusshTransport::from_config(&ssh_config()).unwrap();
        assert_eq!(transport.user, DEFAULT_USER);
        assert!(transport.client_version.starts_with("SSH-2.0-OpenSSH_"));
        assert!(transport.host_keys.is_permissive());
        assert!(matches!(transport.auth.as_slice(), [JumpAuth::Password(_)]));
    }

    #[test]
    fn test_explicit_client_version_kept() {
        let mut config = ssh_config();
        config.client_version = Some("SSH-2.0-Custom".into());
        config.user = Some("deploy".into());
        let transport = RusshTransport::from_config(&config).unwrap();
        assert_eq!(transport.client_version, "SSH-2.0-Custom");
        assert_eq!(transport.user, "deploy");
    }

    #[test]
    fn test_missing_auth_rejected() {
        let mut config = ssh_config();
        config.password = None;
        assert!(matches!(
            RusshTransport::from_config(&config),
            Err(ConfigError::Ssh(_))
        ));
    }

    #[test]
    fn test_unreadable_key_path_rejected() {
        let mut config = ssh_config();
        config.private_key_path = Some("/nonexistent/oxitun/id_ed25519".into());
        assert!(matches!(
            RusshTransport::from_config(&config),
            Err(ConfigError::Ssh(_))
        ));
    }

    #[test]
    fn test_expand_path() {
        std::env::set_var("OXITUN_TEST_KEYDIR", "/keys");
        assert_eq!(expand_path("$OXITUN_TEST_KEYDIR/id"), "/keys/id");
        assert_eq!(expand_path("${OXITUN_TEST_KEYDIR}/id"), "/keys/id");
        assert_eq!(expand_path("/plain/path"), "/plain/path");
    }

    #[test]
    fn test_expand_path_home() {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        assert_eq!(
            expand_path("~/.ssh/id_ed25519"),
            home.join(".ssh/id_ed25519").to_string_lossy()
        );
        assert_eq!(expand_path("~"), home.to_string_lossy());
        assert_eq!(expand_path("/etc/~/id"), "/etc/~/id");
    }
}
