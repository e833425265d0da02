//! Configuration errors

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Unknown tunnel type: {0}")]
    UnknownTunnelType(String),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Invalid SSH config: {0}")]
    Ssh(String),

    #[error("Invalid host key {entry:?}: {reason}")]
    HostKey { entry: String, reason: String },

    #[error("Tunnel #{index}: {source}")]
    Tunnel {
        index: usize,
        #[source]
        source: Box<ConfigError>,
    },
}

impl ConfigError {
    pub fn in_tunnel(self, index: usize) -> Self {
        ConfigError::Tunnel {
            index,
            source: Box::new(self),
        }
    }
}
