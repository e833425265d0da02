//! oxitun - TCP tunnel relay
//!
//! Accepts inbound TCP connections, optionally authenticates and encrypts them
//! with a timestamp/IV handshake, dials the target directly or through an SSH
//! jump host, and pumps bytes both ways until either side closes.
//!
//! ```text
//! client ──▶ TunnelListener ──▶ ConnectionSession ──▶ Dial (direct | ssh) ──▶ target
//!                                  │                        │
//!                             SecureChannel            SecureChannel
//!                                  └────────── pump ────────┘
//! ```

pub mod buffer;
pub mod channel;
pub mod config;
pub mod dial;
pub mod task;
pub mod tunnel;

pub use config::{AppConfig, ConfigError, SshOutboundConfig, TunnelConfig};
pub use tunnel::{TunnelError, TunnelSet};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
///
/// `RUST_LOG` overrides the default `info` filter.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
