//! End-to-end forwarding through a pair of tunnel endpoints

use portcullis_proto::Remote;
use portcullis_transport::memory;
use portcullis_tunnel::{Tunnel, TunnelConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Reserve a local port by binding and dropping a listener
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn spawn_echo_server() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_forward_roundtrip_through_tunnel_pair() {
    let echo_addr = spawn_echo_server().await;

    let (conn_in, conn_out) = memory::pair();

    // Inbound endpoint binds the forwarding rules; outbound endpoint dials
    // the targets. Keepalive on the inbound side exercises the ping path.
    let inbound = Arc::new(Tunnel::new(
        TunnelConfig::default()
            .with_inbound(true)
            .with_keepalive(Duration::from_millis(50)),
    ));
    let outbound = Arc::new(Tunnel::new(TunnelConfig::default().with_outbound(true)));

    let ctx = CancellationToken::new();
    let inbound_bind = {
        let tunnel = inbound.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { tunnel.bind(ctx, conn_in).await })
    };
    let outbound_bind = {
        let tunnel = outbound.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { tunnel.bind(ctx, conn_out).await })
    };

    let port = free_port().await;
    let remotes = vec![Remote::parse(&format!("127.0.0.1:{}:{}", port, echo_addr)).unwrap()];

    let remotes_ctx = CancellationToken::new();
    let bound_remotes = {
        let tunnel = inbound.clone();
        let ctx = remotes_ctx.clone();
        tokio::spawn(async move { tunnel.bind_remotes(ctx, &remotes).await })
    };

    // Give the forwarder a moment to bind its listener
    let mut client = loop {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(client) => break client,
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    };

    client.write_all(b"ping through the stack").await.unwrap();
    client.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    client.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping through the stack");

    assert_eq!(outbound.total_connections(), 1);

    // Tear down: cancel the batch, then the connection context
    remotes_ctx.cancel();
    bound_remotes.await.unwrap().unwrap();

    ctx.cancel();
    assert!(inbound_bind.await.unwrap().is_ok());
    assert!(outbound_bind.await.unwrap().is_ok());
    assert!(!inbound.is_active());
    assert!(!outbound.is_active());
}

#[tokio::test]
async fn test_forwarder_drops_connection_without_transport() {
    // A forwarder whose tunnel never activates drops individual connections
    // after the activation wait but keeps listening.
    let tunnel: Arc<Tunnel<memory::MemoryConnection>> = Arc::new(Tunnel::new(
        TunnelConfig::default()
            .with_inbound(true)
            .with_activation_wait(Duration::from_millis(50)),
    ));

    let port = free_port().await;
    let remotes = vec![Remote::parse(&format!("127.0.0.1:{}:unreachable:1", port)).unwrap()];

    let remotes_ctx = CancellationToken::new();
    let bound = {
        let tunnel = tunnel.clone();
        let ctx = remotes_ctx.clone();
        tokio::spawn(async move { tunnel.bind_remotes(ctx, &remotes).await })
    };

    let mut client = loop {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Ok(client) => break client,
            Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    };

    // With no transport, the accepted connection is closed after the wait
    let mut buf = [0u8; 1];
    let read = client.read(&mut buf).await.unwrap();
    assert_eq!(read, 0);

    // The forwarder itself is still alive and accepting
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_ok());

    remotes_ctx.cancel();
    bound.await.unwrap().unwrap();
}
