//! Tunnel engine
//!
//! [`TunnelSet`] owns one [`TunnelListener`] per configured tunnel. Each
//! accepted socket becomes a [`ConnectionSession`] that authenticates, dials,
//! upgrades and finally hands both legs to a [`Pump`].

mod counter;
mod error;
mod listener;
mod pump;
mod session;
mod set;

#[cfg(test)]
mod e2e_tests;

pub use counter::{LiveCounter, LiveGuard};
pub use error::{SessionError, TunnelError};
pub use listener::TunnelListener;
pub use pump::{Direction, Pump, PumpEnd, ReleaseGate};
pub use session::{ConnectionSession, SessionContext, SessionState};
pub use set::TunnelSet;
