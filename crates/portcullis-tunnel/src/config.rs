//! Tunnel configuration

use portcullis_radius::RadiusProxyConfig;
use std::net::SocketAddr;
use std::time::Duration;

/// Settings for the tunnel-owned RADIUS proxy
#[derive(Debug, Clone)]
pub struct RadiusSettings {
    /// UDP address the proxy listens on
    pub listen: SocketAddr,

    /// Proxy configuration (secret, backends, session timeout)
    pub proxy: RadiusProxyConfig,
}

/// Configuration for one tunnel endpoint
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Whether this endpoint may bind forwarding rules (listen locally)
    pub inbound: bool,

    /// Whether this endpoint may dial targets for the peer's channels
    pub outbound: bool,

    /// Application-level keepalive interval; zero disables the loop
    pub keepalive: Duration,

    /// How long `active_conn` waits for an activation in progress
    pub activation_wait: Duration,

    /// RADIUS proxy, when this endpoint fronts the authentication backends
    pub radius: Option<RadiusSettings>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            inbound: false,
            outbound: false,
            keepalive: Duration::ZERO,
            activation_wait: Duration::from_secs(35),
            radius: None,
        }
    }
}

impl TunnelConfig {
    pub fn with_inbound(mut self, inbound: bool) -> Self {
        self.inbound = inbound;
        self
    }

    pub fn with_outbound(mut self, outbound: bool) -> Self {
        self.outbound = outbound;
        self
    }

    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval;
        self
    }

    pub fn with_activation_wait(mut self, wait: Duration) -> Self {
        self.activation_wait = wait;
        self
    }

    pub fn with_radius(mut self, settings: RadiusSettings) -> Self {
        self.radius = Some(settings);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TunnelConfig::default();
        assert!(!config.inbound);
        assert!(!config.outbound);
        assert!(config.keepalive.is_zero());
        assert_eq!(config.activation_wait, Duration::from_secs(35));
        assert!(config.radius.is_none());
    }

    #[test]
    fn test_builder_style() {
        let config = TunnelConfig::default()
            .with_inbound(true)
            .with_keepalive(Duration::from_secs(5));
        assert!(config.inbound);
        assert_eq!(config.keepalive, Duration::from_secs(5));
    }
}
