//! Tunnel set: the running engine
//!
//! Built from the list of tunnel configs, then started and stopped as a unit.
//! A reload is `stop()` on the old set followed by `start()` on a new one.

use std::sync::Arc;

use tracing::{error, info};

use super::error::TunnelError;
use super::listener::TunnelListener;
use crate::config::{AppConfig, ConfigError, TunnelConfig};
use crate::dial::{build_dialer, Dial};

struct TunnelDefinition {
    config: TunnelConfig,
    dialer: Arc<dyn Dial>,
}

pub struct TunnelSet {
    definitions: Vec<TunnelDefinition>,
    listeners: Vec<TunnelListener>,
}

impl TunnelSet {
    /// Validate every tunnel and build its dialer. Nothing is bound yet.
    pub fn new(configs: Vec<TunnelConfig>) -> Result<Self, ConfigError> {
        let definitions = configs
            .into_iter()
            .enumerate()
            .map(|(index, config)| {
                config.validate().map_err(|e| e.in_tunnel(index))?;
                let dialer = build_dialer(&config).map_err(|e| e.in_tunnel(index))?;
                Ok::<_, ConfigError>(TunnelDefinition { config, dialer })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            definitions,
            listeners: Vec::new(),
        })
    }

    pub fn from_config(config: AppConfig) -> Result<Self, ConfigError> {
        Self::new(config.into_tunnels())
    }

    /// Bind every listener. Returns once all are listening; on the first
    /// failure the listeners already started are shut down again.
    pub async fn start(&mut self) -> Result<(), TunnelError> {
        if !self.listeners.is_empty() {
            return Ok(());
        }

        let mut failure = None;
        for definition in &self.definitions {
            match TunnelListener::bind(&definition.config, definition.dialer.clone()).await {
                Ok(listener) => self.listeners.push(listener),
                Err(e) => {
                    error!(
                        "[{}] failed to start tunnel: {}",
                        definition.config.display_tag(),
                        e
                    );
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failure {
            self.stop().await;
            return Err(e);
        }

        info!("{} tunnel(s) started", self.listeners.len());
        Ok(())
    }

    /// Shut down every listener and its dialer.
    pub async fn stop(&mut self) {
        if self.listeners.is_empty() {
            return;
        }
        for listener in self.listeners.drain(..) {
            listener.shutdown().await;
        }
        info!("All tunnels stopped");
    }

    pub fn listeners(&self) -> &[TunnelListener] {
        &self.listeners
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Live connections across all listeners
    pub fn live_connections(&self) -> usize {
        self.listeners.iter().map(TunnelListener::live_connections).sum()
    }
}
