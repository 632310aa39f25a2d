//! Packet-level RADIUS proxying

use crate::backend::{Backend, BackendPool};
use crate::packet;
use crate::session::SessionStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Largest datagram RFC 2865 allows
const MAX_PACKET_SIZE: usize = 4096;

/// Errors from a single proxied exchange
#[derive(Debug, Error)]
pub enum RadiusProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No reply from backend {0} within timeout")]
    ReplyTimeout(String),
}

/// RADIUS proxy configuration
#[derive(Debug, Clone)]
pub struct RadiusProxyConfig {
    /// Shared secret of the secure sessions (carried for the deployment
    /// surface; the proxy relays packets without re-signing them)
    pub secret: String,

    /// Initial backend addresses (`host:port`)
    pub addrs: Vec<String>,

    /// Sticky session timeout
    pub session_timeout: Duration,

    /// How often expired sessions are swept
    pub sweep_interval: Duration,

    /// How long to wait for a backend's reply before dropping the exchange
    pub reply_timeout: Duration,
}

impl RadiusProxyConfig {
    pub fn new(secret: impl Into<String>, addrs: Vec<String>) -> Self {
        Self {
            secret: secret.into(),
            addrs,
            session_timeout: Duration::from_secs(20),
            sweep_interval: Duration::from_secs(10),
            reply_timeout: Duration::from_secs(10),
        }
    }
}

/// Session-sticky packet proxy
///
/// Routes each inbound datagram to a backend: by live session when the
/// packet carries a known Proxy-State token, by pool policy otherwise.
#[derive(Debug)]
pub struct RadiusProxy {
    config: RadiusProxyConfig,
    sessions: Arc<SessionStore>,
    pool: Arc<BackendPool>,
}

impl RadiusProxy {
    pub fn new(config: RadiusProxyConfig) -> Self {
        let pool = Arc::new(BackendPool::new(config.addrs.iter().cloned()));
        Self {
            config,
            sessions: Arc::new(SessionStore::new()),
            pool,
        }
    }

    /// Pool handle for the discovery feed
    pub fn pool(&self) -> Arc<BackendPool> {
        self.pool.clone()
    }

    pub fn sessions(&self) -> Arc<SessionStore> {
        self.sessions.clone()
    }

    /// Resolve the backend for one inbound packet
    ///
    /// A packet without a Proxy-State token bypasses session logic entirely.
    /// A token miss (absent or expired session) selects a fresh backend and
    /// installs a new session for the token.
    pub fn backend_for(&self, packet: &[u8]) -> Option<Arc<Backend>> {
        let token = match packet::proxy_state(packet) {
            Some(token) => token,
            None => return self.pool.select(),
        };

        if let Some(backend) = self.sessions.lookup(&token) {
            trace!(token = %token, backend = %backend, "Routing by session");
            return Some(backend);
        }

        let backend = self.pool.select()?;
        self.sessions
            .create(&token, self.config.session_timeout, backend.clone());
        Some(backend)
    }

    /// Proxy datagrams on `socket` until `stop` fires
    ///
    /// Owns the session sweeper for its store; each exchange is forwarded on
    /// its own task so one slow backend never stalls the receive loop.
    pub async fn run(self: Arc<Self>, socket: UdpSocket, stop: CancellationToken) {
        tokio::spawn(
            self.sessions
                .clone()
                .run_sweeper(self.config.sweep_interval, stop.child_token()),
        );

        let socket = Arc::new(socket);
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                result = socket.recv_from(&mut buf) => {
                    let (len, client) = match result {
                        Ok(received) => received,
                        Err(e) => {
                            error!(error = %e, "UDP receive failed");
                            continue;
                        }
                    };

                    let datagram = buf[..len].to_vec();
                    let backend = match self.backend_for(&datagram) {
                        Some(backend) => backend,
                        None => {
                            warn!(client = %client, "No backend available, dropping packet");
                            continue;
                        }
                    };

                    let socket = socket.clone();
                    let reply_timeout = self.config.reply_timeout;
                    tokio::spawn(async move {
                        if let Err(e) =
                            forward_exchange(socket, datagram, client, backend.clone(), reply_timeout)
                                .await
                        {
                            debug!(backend = %backend, error = %e, "Exchange dropped");
                        }
                    });
                }
            }
        }

        debug!("RADIUS proxy stopped");
    }
}

/// Forward one request to `backend` and relay its reply back to `client`
///
/// An ephemeral socket per exchange keeps the backend's reply correlated to
/// this request without tracking identifiers.
async fn forward_exchange(
    socket: Arc<UdpSocket>,
    datagram: Vec<u8>,
    client: SocketAddr,
    backend: Arc<Backend>,
    reply_timeout: Duration,
) -> Result<(), RadiusProxyError> {
    let upstream = UdpSocket::bind("0.0.0.0:0").await?;
    upstream.send_to(&datagram, backend.addr()).await?;

    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let (len, _) = tokio::time::timeout(reply_timeout, upstream.recv_from(&mut buf))
        .await
        .map_err(|_| RadiusProxyError::ReplyTimeout(backend.addr().to_string()))??;

    socket.send_to(&buf[..len], client).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn proxy_with_backends(addrs: &[&str]) -> RadiusProxy {
        RadiusProxy::new(RadiusProxyConfig::new(
            "secret",
            addrs.iter().map(|a| a.to_string()).collect(),
        ))
    }

    fn packet_with_token(token: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; 20];
        packet[0] = 1;
        packet.push(packet::PROXY_STATE_TYPE);
        packet.push((token.len() + 2) as u8);
        packet.extend_from_slice(token);
        let len = packet.len() as u16;
        packet[2..4].copy_from_slice(&len.to_be_bytes());
        packet
    }

    fn packet_without_token() -> Vec<u8> {
        let mut packet = vec![0u8; 20];
        packet[0] = 1;
        packet[2..4].copy_from_slice(&20u16.to_be_bytes());
        packet
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_pins_backend_across_rounds() {
        let proxy = proxy_with_backends(&["10.0.0.1:1812", "10.0.0.2:1812", "10.0.0.3:1812"]);
        let packet = packet_with_token(b"S1");

        let first = proxy.backend_for(&packet).unwrap();
        for _ in 0..5 {
            advance(Duration::from_secs(2)).await;
            assert_eq!(proxy.backend_for(&packet).unwrap().addr(), first.addr());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_is_reselected() {
        let proxy = proxy_with_backends(&["10.0.0.1:1812"]);
        let packet = packet_with_token(b"S1");

        proxy.backend_for(&packet).unwrap();
        assert_eq!(proxy.sessions.len(), 1);

        // Past the 20s window with no refresh: treated as a new session
        advance(Duration::from_secs(40)).await;
        assert!(proxy.backend_for(&packet).is_some());
        let hit = proxy.sessions.lookup("S1").unwrap();
        assert_eq!(hit.addr(), "10.0.0.1:1812");
    }

    #[tokio::test]
    async fn test_packet_without_token_skips_sessions() {
        let proxy = proxy_with_backends(&["10.0.0.1:1812", "10.0.0.2:1812"]);

        assert!(proxy.backend_for(&packet_without_token()).is_some());
        assert!(proxy.backend_for(&packet_without_token()).is_some());
        assert!(proxy.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_empty_pool_drops_packet() {
        let proxy = proxy_with_backends(&[]);
        assert!(proxy.backend_for(&packet_with_token(b"S1")).is_none());
        assert!(proxy.sessions.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_survives_backend_removal() {
        // Decision: a live session keeps routing to its backend even after
        // the discovery feed removes it from the pool.
        let proxy = proxy_with_backends(&["10.0.0.1:1812"]);
        let packet = packet_with_token(b"S1");

        let bound = proxy.backend_for(&packet).unwrap();
        proxy.pool().delete_backend("10.0.0.1:1812");

        advance(Duration::from_secs(2)).await;
        assert_eq!(proxy.backend_for(&packet).unwrap().addr(), bound.addr());
    }
}
