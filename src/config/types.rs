//! Configuration types

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

use super::error::ConfigError;
use crate::channel::KeyDerivation;

/// Tunnel transport protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelProtocol {
    Tcp,
}

impl TunnelProtocol {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "tcp" => Ok(TunnelProtocol::Tcp),
            other => Err(ConfigError::UnknownTunnelType(other.to_string())),
        }
    }
}

/// One listen address / target address pair
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TunnelConfig {
    /// Only `tcp` is recognized
    #[serde(rename = "type")]
    pub protocol: String,

    /// Label used in logs
    #[serde(default)]
    pub tag: String,

    #[serde(rename = "addr")]
    pub listen_addr: String,

    /// Shared secret clients must present; empty or missing disables inbound auth
    #[serde(rename = "password", default, skip_serializing_if = "Option::is_none")]
    pub inbound_password: Option<String>,

    pub target_addr: String,

    /// Shared secret presented to the target; empty or missing disables outbound auth
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_password: Option<String>,

    #[serde(default)]
    pub compression: bool,

    /// Reach the target through this SSH jump host instead of dialing it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshOutboundConfig>,

    #[serde(default)]
    pub key_derivation: KeyDerivation,

    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_report_interval() -> u64 {
    10
}

impl TunnelConfig {
    /// Plain TCP tunnel with no auth and no compression
    pub fn tcp(listen_addr: impl Into<String>, target_addr: impl Into<String>) -> Self {
        Self {
            protocol: "tcp".to_string(),
            tag: String::new(),
            listen_addr: listen_addr.into(),
            inbound_password: None,
            target_addr: target_addr.into(),
            target_password: None,
            compression: false,
            ssh: None,
            key_derivation: KeyDerivation::default(),
            idle_timeout_secs: default_idle_timeout(),
            report_interval_secs: default_report_interval(),
        }
    }

    pub fn protocol(&self) -> Result<TunnelProtocol, ConfigError> {
        TunnelProtocol::parse(&self.protocol)
    }

    /// Tag for logs, falling back to the listen address
    pub fn display_tag(&self) -> &str {
        if self.tag.is_empty() {
            &self.listen_addr
        } else {
            &self.tag
        }
    }

    pub fn inbound_secret(&self) -> Option<&[u8]> {
        non_empty(&self.inbound_password)
    }

    pub fn target_secret(&self) -> Option<&[u8]> {
        non_empty(&self.target_password)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.protocol()?;

        if self.listen_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("addr is required".into()));
        }
        if self.target_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("target_addr is required".into()));
        }
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid("idle_timeout_secs must be positive".into()));
        }
        if self.report_interval_secs == 0 {
            return Err(ConfigError::Invalid("report_interval_secs must be positive".into()));
        }
        if let Some(ssh) = &self.ssh {
            ssh.validate()?;
        }
        Ok(())
    }
}

fn non_empty(value: &Option<String>) -> Option<&[u8]> {
    value
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::as_bytes)
}

/// SSH jump host used to reach a tunnel's target
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshOutboundConfig {
    /// `host:port` of the SSH server
    pub server_addr: String,

    /// Login user (default: root)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Inline private key text (OpenSSH or PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    /// Private key file; `~` and `$VAR` are expanded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_passphrase: Option<String>,

    /// Accepted host keys in authorized_keys format; empty accepts any key
    #[serde(default, deserialize_with = "one_or_many")]
    pub host_key: Vec<String>,

    #[serde(default, deserialize_with = "one_or_many")]
    pub host_key_algorithms: Vec<String>,

    /// SSH identification string; randomized when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    30
}

impl Default for SshOutboundConfig {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            user: None,
            password: None,
            private_key: None,
            private_key_path: None,
            private_key_passphrase: None,
            host_key: Vec::new(),
            host_key_algorithms: Vec::new(),
            client_version: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl SshOutboundConfig {
    pub fn effective_user(&self) -> &str {
        self.user
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or("root")
    }

    fn has_auth(&self) -> bool {
        [&self.password, &self.private_key, &self.private_key_path]
            .iter()
            .any(|v| v.as_deref().is_some_and(|s| !s.is_empty()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_addr.trim().is_empty() {
            return Err(ConfigError::Ssh("server_addr is required".into()));
        }
        if !self.has_auth() {
            return Err(ConfigError::Ssh(format!(
                "{}: password, private_key or private_key_path is required",
                self.server_addr
            )));
        }
        if self.host_key_algorithms.iter().any(|a| a.trim().is_empty()) {
            return Err(ConfigError::Ssh("empty host key algorithm".into()));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::Ssh("connect_timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Standalone SSH inbound: a passwordless tunnel that always dials through `ssh`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InboundConfig {
    pub addr: String,
    pub target_addr: String,
    pub ssh: SshOutboundConfig,
}

impl From<InboundConfig> for TunnelConfig {
    fn from(inbound: InboundConfig) -> Self {
        let mut tunnel = TunnelConfig::tcp(inbound.addr, inbound.target_addr);
        tunnel.ssh = Some(inbound.ssh);
        tunnel
    }
}

/// Top-level configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,

    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,
}

impl AppConfig {
    /// All configured tunnels, inbounds converted, in file order
    pub fn into_tunnels(self) -> Vec<TunnelConfig> {
        let mut tunnels = self.tunnels;
        tunnels.extend(self.inbounds.into_iter().map(TunnelConfig::from));
        tunnels
    }
}

/// Accept either a single string or a list of strings
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
    })
}
