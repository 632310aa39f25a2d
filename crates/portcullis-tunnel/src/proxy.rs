//! Per-rule forwarding proxy
//!
//! A [`Proxy`] binds the local endpoint of one forwarding rule, accepts TCP
//! connections, and relays each one through a logical channel opened over
//! the tunnel's currently active transport.

use crate::relay;
use crate::tunnel::Tunnel;
use crate::TunnelError;
use portcullis_proto::{Remote, CHANNEL_KIND_TUNNEL};
use portcullis_transport::TransportConnection;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Runtime unit bound to one forwarding rule
#[derive(Debug)]
pub struct Proxy<C: TransportConnection> {
    tunnel: Arc<Tunnel<C>>,
    /// Ordinal assigned by the binder; never reused
    index: usize,
    remote: Remote,
}

impl<C: TransportConnection> Proxy<C> {
    pub(crate) fn new(tunnel: Arc<Tunnel<C>>, index: usize, remote: Remote) -> Self {
        Self {
            tunnel,
            index,
            remote,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn remote(&self) -> &Remote {
        &self.remote
    }

    /// Listen and forward until `scope` is cancelled or accepting fails
    ///
    /// A failed accept is unrecoverable and terminates the proxy; a failed
    /// individual connection is dropped and the loop keeps going.
    pub(crate) async fn run(self, scope: CancellationToken) -> Result<(), TunnelError> {
        let local_addr = self.remote.local_addr();
        let listener =
            TcpListener::bind(&local_addr)
                .await
                .map_err(|e| TunnelError::BindFailed {
                    addr: local_addr.clone(),
                    source: e,
                })?;

        info!(
            proxy = self.index,
            listen = %local_addr,
            target = %self.remote.remote_addr(),
            "Forwarder listening"
        );

        loop {
            tokio::select! {
                _ = scope.cancelled() => break,
                accepted = listener.accept() => {
                    let (socket, peer) = accepted.map_err(|e| TunnelError::AcceptFailed {
                        addr: local_addr.clone(),
                        source: e,
                    })?;

                    debug!(proxy = self.index, peer = %peer, "Accepted connection");

                    let tunnel = self.tunnel.clone();
                    let target = self.remote.remote_addr();
                    let index = self.index;
                    let scope = scope.clone();
                    tokio::spawn(async move {
                        handle_connection(tunnel, index, target, socket, scope).await;
                    });
                }
            }
        }

        debug!(proxy = self.index, "Forwarder stopped");
        Ok(())
    }
}

/// Relay one accepted connection through the tunnel
///
/// The active transport is resolved here, at accept time, so the forwarder
/// rides out reconnects: if no transport activates within the configured
/// wait, only this connection is dropped.
async fn handle_connection<C: TransportConnection>(
    tunnel: Arc<Tunnel<C>>,
    index: usize,
    target: String,
    socket: TcpStream,
    scope: CancellationToken,
) {
    let Some(conn) = tunnel.active_conn(&scope).await else {
        warn!(proxy = index, "No active transport, dropping connection");
        return;
    };

    let stream = match conn.open_channel(CHANNEL_KIND_TUNNEL, &target).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(proxy = index, target = %target, error = %e, "Failed to open channel, dropping connection");
            return;
        }
    };

    let id = tunnel.conn_opened();
    debug!(proxy = index, conn = id, target = %target, "Channel open");

    let (sent, received) = relay::pipe(stream, socket).await;

    tunnel.conn_done();
    debug!(
        proxy = index,
        conn = id,
        sent,
        received,
        "Channel closed"
    );
}
