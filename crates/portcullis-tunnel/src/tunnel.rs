//! Single-connection tunnel lifecycle

use crate::config::TunnelConfig;
use crate::proxy::Proxy;
use crate::relay;
use crate::TunnelError;
use bytes::Bytes;
use portcullis_proto::{Remote, TunnelMessage, CHANNEL_KIND_TUNNEL, PING_REQUEST, PONG_PAYLOAD};
use portcullis_radius::RadiusProxy;
use portcullis_transport::{TransportConnection, TransportStream};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The installed connection together with its cancellation scope
#[derive(Debug)]
struct ActiveConn<C> {
    conn: Arc<C>,
    scope: CancellationToken,
}

/// Tunnel endpoint: owns at most one active transport connection and
/// everything multiplexed over it
///
/// Forwarding rules map 1:1 to [`Proxy`] instances; proxies listen locally
/// and relay through whichever connection is active when their clients
/// arrive, so they survive reconnects. The RADIUS proxy, when configured,
/// runs for the tunnel's whole lifetime independent of any one connection.
#[derive(Debug)]
pub struct Tunnel<C: TransportConnection> {
    config: TunnelConfig,
    active: RwLock<Option<ActiveConn<C>>>,
    /// Bumped on every install and clear; `active_conn` waiters re-check on
    /// each change
    activated: watch::Sender<u64>,
    proxy_count: AtomicUsize,
    conns_open: AtomicUsize,
    conns_total: AtomicUsize,
    radius: Option<Arc<RadiusProxy>>,
    shutdown: CancellationToken,
}

impl<C: TransportConnection> Tunnel<C> {
    pub fn new(config: TunnelConfig) -> Self {
        let radius = config
            .radius
            .as_ref()
            .map(|settings| Arc::new(RadiusProxy::new(settings.proxy.clone())));
        let (activated, _) = watch::channel(0u64);

        debug!(
            inbound = config.inbound,
            outbound = config.outbound,
            radius = radius.is_some(),
            "Tunnel created"
        );

        Self {
            config,
            active: RwLock::new(None),
            activated,
            proxy_count: AtomicUsize::new(0),
            conns_open: AtomicUsize::new(0),
            conns_total: AtomicUsize::new(0),
            radius,
            shutdown: CancellationToken::new(),
        }
    }

    /// Install `conn` as the active transport and serve it until it dies
    ///
    /// Spawns the stream acceptor, the request and channel dispatch loops,
    /// and (if configured) the keepalive loop, then blocks until the peer
    /// closes, the connection errors, or `ctx` is cancelled. The active
    /// handle is cleared before returning, so a new connection may be bound
    /// afterwards.
    ///
    /// # Panics
    ///
    /// Panics if a connection is already installed. That is a caller bug,
    /// not a runtime condition to recover from.
    pub async fn bind(self: Arc<Self>, ctx: CancellationToken, conn: C) -> Result<(), TunnelError> {
        let conn = Arc::new(conn);
        let scope = ctx.child_token();

        {
            let mut active = self.active.write().unwrap();
            if active.is_some() {
                drop(active);
                panic!("double bind: a transport connection is already installed");
            }
            *active = Some(ActiveConn {
                conn: conn.clone(),
                scope: scope.clone(),
            });
        }
        self.activated.send_modify(|epoch| *epoch += 1);
        debug!(conn = %conn.connection_id(), "Transport connected");

        // Context cancellation closes the connection
        {
            let conn = conn.clone();
            let scope = scope.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = scope.cancelled() => {
                        conn.close(0, "context cancelled").await;
                        debug!("Transport cancelled");
                    }
                    _ = conn.closed() => {}
                }
            });
        }

        let (request_tx, request_rx) = mpsc::channel(32);
        let (channel_tx, channel_rx) = mpsc::channel(32);
        tokio::spawn(accept_loop(
            conn.clone(),
            request_tx,
            channel_tx,
            scope.clone(),
        ));
        tokio::spawn(request_loop::<C>(request_rx));
        tokio::spawn(self.clone().channel_loop(channel_rx));

        if !self.config.keepalive.is_zero() {
            tokio::spawn(keepalive_loop(
                conn.clone(),
                self.config.keepalive,
                scope.clone(),
            ));
        }

        // Block until the connection is no longer usable
        let result = conn.closed().await;
        debug!("Transport disconnected");

        *self.active.write().unwrap() = None;
        self.activated.send_modify(|epoch| *epoch += 1);
        scope.cancel();

        result.map_err(TunnelError::from)
    }

    fn current_conn(&self) -> Option<Arc<C>> {
        self.active
            .read()
            .unwrap()
            .as_ref()
            .map(|active| active.conn.clone())
    }

    /// The active connection, waiting out an activation in progress
    ///
    /// Returns immediately when a connection is installed; otherwise waits
    /// up to the configured activation timeout, racing `ctx`. `None` means
    /// cancelled or timed out. Callable repeatedly across reconnects.
    pub async fn active_conn(&self, ctx: &CancellationToken) -> Option<Arc<C>> {
        if ctx.is_cancelled() {
            return None;
        }

        let mut activated = self.activated.subscribe();
        tokio::time::timeout(self.config.activation_wait, async {
            loop {
                if let Some(conn) = self.current_conn() {
                    return Some(conn);
                }
                tokio::select! {
                    _ = ctx.cancelled() => return None,
                    changed = activated.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                    }
                }
            }
        })
        .await
        .unwrap_or(None)
    }

    pub fn is_active(&self) -> bool {
        self.active.read().unwrap().is_some()
    }

    /// Convert forwarding rules into proxies and run them to completion
    ///
    /// All-or-none fan-out: proxies start concurrently under one joined
    /// cancellation scope, the first proxy error cancels its siblings and is
    /// returned, and caller cancellation propagates the same way.
    pub async fn bind_remotes(
        self: Arc<Self>,
        ctx: CancellationToken,
        remotes: &[Remote],
    ) -> Result<(), TunnelError> {
        if remotes.is_empty() {
            return Err(TunnelError::NoRemotes);
        }
        if !self.config.inbound {
            return Err(TunnelError::InboundBlocked);
        }

        let scope = ctx.child_token();
        let mut proxies = JoinSet::new();
        for remote in remotes {
            let index = self.proxy_count.fetch_add(1, Ordering::Relaxed);
            let proxy = Proxy::new(self.clone(), index, remote.clone());
            let scope = scope.clone();
            proxies.spawn(async move { proxy.run(scope).await });
        }
        debug!(count = remotes.len(), "Bound proxies");

        let mut first_error = None;
        while let Some(joined) = proxies.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(TunnelError::TaskFailed(e.to_string())),
            };
            if let Err(e) = result {
                if first_error.is_none() {
                    scope.cancel();
                    first_error = Some(e);
                }
            }
        }
        debug!("Unbound proxies");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Bind rules under the scope of the currently active connection
    pub async fn bind_dynamic_remotes(
        self: Arc<Self>,
        remotes: &[Remote],
    ) -> Result<(), TunnelError> {
        let scope = self
            .active
            .read()
            .unwrap()
            .as_ref()
            .map(|active| active.scope.clone())
            .ok_or(TunnelError::NotConnected)?;
        self.bind_remotes(scope, remotes).await
    }

    /// Handle to the RADIUS proxy, for the discovery feed
    pub fn radius_proxy(&self) -> Option<Arc<RadiusProxy>> {
        self.radius.clone()
    }

    /// Start the RADIUS proxy loop, if one is configured
    ///
    /// Resolves once the UDP socket is bound, returning its local address.
    /// The proxy runs until [`Tunnel::shutdown`].
    pub async fn start_radius_proxy(&self) -> Result<Option<SocketAddr>, TunnelError> {
        let (Some(radius), Some(settings)) = (self.radius.clone(), self.config.radius.as_ref())
        else {
            return Ok(None);
        };

        let socket =
            UdpSocket::bind(settings.listen)
                .await
                .map_err(|e| TunnelError::BindFailed {
                    addr: settings.listen.to_string(),
                    source: e,
                })?;
        let local = socket.local_addr().map_err(|e| TunnelError::BindFailed {
            addr: settings.listen.to_string(),
            source: e,
        })?;

        tokio::spawn(radius.run(socket, self.shutdown.child_token()));
        info!(listen = %local, "RADIUS proxy listening");
        Ok(Some(local))
    }

    /// Stop the tunnel's process-lifetime tasks (RADIUS proxy, sweeper)
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn open_connections(&self) -> usize {
        self.conns_open.load(Ordering::Relaxed)
    }

    pub fn total_connections(&self) -> usize {
        self.conns_total.load(Ordering::Relaxed)
    }

    pub(crate) fn conn_opened(&self) -> usize {
        self.conns_open.fetch_add(1, Ordering::Relaxed);
        self.conns_total.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn conn_done(&self) {
        self.conns_open.fetch_sub(1, Ordering::Relaxed);
    }

    /// Consume inbound channel-open headers: dial the target and relay
    async fn channel_loop(self: Arc<Self>, mut channels: mpsc::Receiver<InboundChannel<C::Stream>>) {
        while let Some(InboundChannel {
            kind,
            target,
            stream,
        }) = channels.recv().await
        {
            if !self.config.outbound {
                warn!(target = %target, "Outbound connections blocked, refusing channel");
                continue;
            }
            if kind != CHANNEL_KIND_TUNNEL {
                warn!(kind = %kind, "Unknown channel kind, refusing");
                continue;
            }

            let tunnel = self.clone();
            tokio::spawn(async move {
                tunnel.handle_channel(stream, target).await;
            });
        }
        debug!("Channel dispatcher stopped");
    }

    async fn handle_channel(&self, stream: C::Stream, target: String) {
        let socket = match TcpStream::connect(&target).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(target = %target, error = %e, "Dial failed, dropping channel");
                return;
            }
        };

        let id = self.conn_opened();
        debug!(conn = id, target = %target, "Channel open");

        let (sent, received) = relay::pipe(stream, socket).await;

        self.conn_done();
        debug!(conn = id, sent, received, "Channel closed");
    }
}

struct InboundRequest<S> {
    name: String,
    #[allow(dead_code)]
    payload: Vec<u8>,
    stream: S,
}

struct InboundChannel<S> {
    kind: String,
    target: String,
    stream: S,
}

/// Accept inbound streams and route them to the dispatch loops by header
async fn accept_loop<C: TransportConnection>(
    conn: Arc<C>,
    request_tx: mpsc::Sender<InboundRequest<C::Stream>>,
    channel_tx: mpsc::Sender<InboundChannel<C::Stream>>,
    scope: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = scope.cancelled() => break,
            accepted = conn.accept_stream() => match accepted {
                Ok(Some(stream)) => stream,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Accept failed");
                    break;
                }
            }
        };

        // Classify off the accept path so a slow header cannot stall
        // acceptance of other streams
        let request_tx = request_tx.clone();
        let channel_tx = channel_tx.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            match stream.recv_message().await {
                Ok(Some(TunnelMessage::Request { name, payload })) => {
                    let _ = request_tx
                        .send(InboundRequest {
                            name,
                            payload,
                            stream,
                        })
                        .await;
                }
                Ok(Some(TunnelMessage::ChannelOpen { kind, target })) => {
                    let _ = channel_tx
                        .send(InboundChannel {
                            kind,
                            target,
                            stream,
                        })
                        .await;
                }
                Ok(Some(other)) => warn!(header = ?other, "Unexpected stream header"),
                Ok(None) => {}
                Err(e) => debug!(error = %e, "Failed to read stream header"),
            }
        });
    }
    debug!("Stream acceptor stopped");
}

/// Answer out-of-band requests; today that is the keepalive ping
async fn request_loop<C: TransportConnection>(
    mut requests: mpsc::Receiver<InboundRequest<C::Stream>>,
) {
    while let Some(request) = requests.recv().await {
        let InboundRequest {
            name, mut stream, ..
        } = request;
        match name.as_str() {
            PING_REQUEST => {
                let _ = stream
                    .send_message(&TunnelMessage::Response {
                        payload: PONG_PAYLOAD.to_vec(),
                    })
                    .await;
                let _ = stream.finish().await;
            }
            other => {
                warn!(name = %other, "Unknown request");
                let _ = stream.finish().await;
            }
        }
    }
    debug!("Request dispatcher stopped");
}

/// Ping the peer on every interval; any failure kills the connection
///
/// A send error or a reply that is neither empty nor exactly `pong` force-
/// closes the transport: a silently half-dead connection is worse than a
/// clean reconnect.
async fn keepalive_loop<C: TransportConnection>(
    conn: Arc<C>,
    every: Duration,
    scope: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = scope.cancelled() => return,
            _ = tokio::time::sleep(every) => {}
        }

        match conn.request(PING_REQUEST, Bytes::new()).await {
            Ok(reply) if reply.is_empty() || reply.as_ref() == PONG_PAYLOAD => {}
            Ok(_) => {
                debug!("Strange ping response");
                break;
            }
            Err(e) => {
                debug!(error = %e, "Keepalive ping failed");
                break;
            }
        }
    }

    conn.close(1, "keepalive failed").await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use portcullis_transport::memory::{self, MemoryConnection};
    use portcullis_transport::TransportConnection;
    use tokio::net::TcpListener;

    fn tunnel(config: TunnelConfig) -> Arc<Tunnel<MemoryConnection>> {
        Arc::new(Tunnel::new(config))
    }

    async fn wait_active(t: &Arc<Tunnel<MemoryConnection>>) {
        while !t.is_active() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_bind_remotes_rejects_empty_rule_set() {
        let t = tunnel(TunnelConfig::default().with_inbound(true));
        let err = t
            .bind_remotes(CancellationToken::new(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::NoRemotes));
    }

    #[tokio::test]
    async fn test_bind_remotes_rejects_inbound_disabled() {
        let t = tunnel(TunnelConfig::default());
        let remotes = vec![Remote::parse("127.0.0.1:0:target:80").unwrap()];
        let err = t
            .bind_remotes(CancellationToken::new(), &remotes)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::InboundBlocked));
    }

    #[tokio::test]
    async fn test_double_bind_panics() {
        let t = tunnel(TunnelConfig::default());
        let (conn_a, _peer_a) = memory::pair();
        let (conn_c, _peer_c) = memory::pair();

        let first = {
            let t = t.clone();
            tokio::spawn(async move { t.bind(CancellationToken::new(), conn_a).await })
        };
        wait_active(&t).await;

        let second = {
            let t = t.clone();
            tokio::spawn(async move { t.bind(CancellationToken::new(), conn_c).await })
        };
        assert!(second.await.unwrap_err().is_panic());

        first.abort();
    }

    #[tokio::test]
    async fn test_rebind_after_clean_unbind() {
        let t = tunnel(TunnelConfig::default());

        let (conn_a, peer_a) = memory::pair();
        let first = {
            let t = t.clone();
            tokio::spawn(async move { t.bind(CancellationToken::new(), conn_a).await })
        };
        wait_active(&t).await;

        peer_a.close(0, "peer done").await;
        assert!(first.await.unwrap().is_ok());
        assert!(!t.is_active());

        let (conn_b, _peer_b) = memory::pair();
        let second = {
            let t = t.clone();
            tokio::spawn(async move { t.bind(CancellationToken::new(), conn_b).await })
        };
        wait_active(&t).await;

        second.abort();
    }

    #[tokio::test]
    async fn test_context_cancellation_unbinds() {
        let t = tunnel(TunnelConfig::default());
        let ctx = CancellationToken::new();

        let (conn_a, _peer_a) = memory::pair();
        let bound = {
            let t = t.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { t.bind(ctx, conn_a).await })
        };
        wait_active(&t).await;

        ctx.cancel();
        assert!(bound.await.unwrap().is_ok());
        assert!(!t.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_active_conn_times_out_without_activation() {
        let t = tunnel(TunnelConfig::default().with_activation_wait(Duration::from_secs(35)));
        let ctx = CancellationToken::new();

        let started = tokio::time::Instant::now();
        assert!(t.active_conn(&ctx).await.is_none());
        assert!(started.elapsed() >= Duration::from_secs(35));
    }

    #[tokio::test]
    async fn test_active_conn_unblocks_on_activation() {
        let t = tunnel(TunnelConfig::default());
        let ctx = CancellationToken::new();

        let waiter = {
            let t = t.clone();
            tokio::spawn(async move { t.active_conn(&ctx).await.is_some() })
        };

        let (conn_a, _peer_a) = memory::pair();
        let bound = {
            let t = t.clone();
            tokio::spawn(async move { t.bind(CancellationToken::new(), conn_a).await })
        };

        assert!(waiter.await.unwrap());
        bound.abort();
    }

    #[tokio::test]
    async fn test_active_conn_cancelled_returns_none() {
        let t = tunnel(TunnelConfig::default());
        let ctx = CancellationToken::new();
        ctx.cancel();
        assert!(t.active_conn(&ctx).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_failure_closes_transport() {
        let t = tunnel(TunnelConfig::default().with_keepalive(Duration::from_secs(5)));
        let (conn_a, peer) = memory::pair();

        // Peer answers the ping with a payload that is not "pong"
        tokio::spawn(async move {
            if let Ok(Some(mut stream)) = peer.accept_stream().await {
                let _ = stream.recv_message().await;
                let _ = stream
                    .send_message(&TunnelMessage::Response {
                        payload: b"garbage".to_vec(),
                    })
                    .await;
                let _ = stream.finish().await;
            }
        });

        let bound = {
            let t = t.clone();
            tokio::spawn(async move { t.bind(CancellationToken::new(), conn_a).await })
        };

        // The strange reply forces the transport closed and bind returns
        assert!(bound.await.unwrap().is_ok());
        assert!(!t.is_active());
    }

    #[tokio::test]
    async fn test_fan_out_first_failure_cancels_batch() {
        let t = tunnel(TunnelConfig::default().with_inbound(true));

        // Occupy a port so the second rule's listener fails to bind
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let remotes = vec![
            Remote::parse("127.0.0.1:0:target-one:80").unwrap(),
            Remote::parse(&format!("127.0.0.1:{}:target-two:80", taken)).unwrap(),
        ];

        let err = t
            .bind_remotes(CancellationToken::new(), &remotes)
            .await
            .unwrap_err();
        match err {
            TunnelError::BindFailed { addr, .. } => {
                assert_eq!(addr, format!("127.0.0.1:{}", taken));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bind_remotes_caller_cancellation_is_clean() {
        let t = tunnel(TunnelConfig::default().with_inbound(true));
        let ctx = CancellationToken::new();

        let remotes = vec![Remote::parse("127.0.0.1:0:target:80").unwrap()];
        let bound = {
            let t = t.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { t.bind_remotes(ctx, &remotes).await })
        };

        tokio::task::yield_now().await;
        ctx.cancel();
        assert!(bound.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_proxy_ordinals_strictly_increase_across_batches() {
        let t = tunnel(TunnelConfig::default().with_inbound(true));

        for _ in 0..2 {
            let ctx = CancellationToken::new();
            let remotes = vec![
                Remote::parse("127.0.0.1:0:a:1").unwrap(),
                Remote::parse("127.0.0.1:0:b:2").unwrap(),
            ];
            let bound = {
                let t = t.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move { t.bind_remotes(ctx, &remotes).await })
            };
            tokio::task::yield_now().await;
            ctx.cancel();
            bound.await.unwrap().unwrap();
        }

        assert_eq!(t.proxy_count.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn test_bind_dynamic_remotes_requires_connection() {
        let t = tunnel(TunnelConfig::default().with_inbound(true));
        let remotes = vec![Remote::parse("127.0.0.1:0:target:80").unwrap()];
        let err = t.bind_dynamic_remotes(&remotes).await.unwrap_err();
        assert!(matches!(err, TunnelError::NotConnected));
    }
}
