//! Configuration
//!
//! YAML document with a `tunnels` list and an optional `inbounds` list of
//! standalone SSH inbounds. Unknown fields are rejected.

mod error;
mod loader;
mod types;

pub use error::ConfigError;
pub use types::{AppConfig, InboundConfig, SshOutboundConfig, TunnelConfig, TunnelProtocol};
