//! Tunnel connection manager and forwarding proxies
//!
//! A [`Tunnel`] owns exactly one active transport connection at a time,
//! multiplexes forwarding traffic over it, keeps it honest with an
//! application-level keepalive, and owns the RADIUS proxy when one is
//! configured. Both endpoints of a tunnel (client and server role) use the
//! same type; which side listens and which side dials is decided by the
//! forwarding rules and the capability flags, not the type.

pub mod config;
pub mod proxy;
pub mod relay;
pub mod tunnel;

pub use config::{RadiusSettings, TunnelConfig};
pub use proxy::Proxy;
pub use tunnel::Tunnel;

use portcullis_transport::TransportError;
use thiserror::Error;

/// Tunnel-level errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("No forwarding rules")]
    NoRemotes,

    #[error("Inbound connections blocked")]
    InboundBlocked,

    #[error("Failed to bind {addr}: {source}")]
    BindFailed {
        addr: String,
        source: std::io::Error,
    },

    #[error("Accept failed on {addr}: {source}")]
    AcceptFailed {
        addr: String,
        source: std::io::Error,
    },

    #[error("No active connection")]
    NotConnected,

    #[error("Forwarder task failed: {0}")]
    TaskFailed(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
