//! Session-sticky RADIUS proxy
//!
//! Proxies authentication packets to a dynamically changing pool of backend
//! servers while keeping multi-round exchanges pinned to one backend. The
//! correlation key is the packet's Proxy-State attribute; packets without it
//! carry no affinity and are balanced freely.

pub mod backend;
pub mod discovery;
pub mod packet;
pub mod proxy;
pub mod session;

pub use backend::{Backend, BackendPool, BackendSelector, RotatingSelector};
pub use discovery::{run_discovery_pump, DiscoveryEvent};
pub use proxy::{RadiusProxy, RadiusProxyConfig, RadiusProxyError};
pub use session::{SessionExpired, SessionStore};

/// Fixed RADIUS authentication port backends listen on
pub const RADIUS_AUTH_PORT: u16 = 1812;
