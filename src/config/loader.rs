//! YAML loading

use std::path::Path;

use tracing::{debug, info};

use super::error::ConfigError;
use super::types::AppConfig;

impl AppConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml_str(&text)?;
        info!(
            "Loaded {} tunnel(s) and {} inbound(s) from {}",
            config.tunnels.len(),
            config.inbounds.len(),
            path.display()
        );
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, tunnel) in self.tunnels.iter().enumerate() {
            tunnel.validate().map_err(|e| e.in_tunnel(index))?;
        }
        for (index, inbound) in self.inbounds.iter().enumerate() {
            inbound
                .ssh
                .validate()
                .map_err(|e| e.in_tunnel(self.tunnels.len() + index))?;
        }
        debug!("Config validated");
        Ok(())
    }
}
