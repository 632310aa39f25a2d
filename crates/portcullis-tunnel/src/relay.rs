//! Bidirectional byte relay between a TCP socket and a tunnel stream

use portcullis_transport::{StreamRecvHalf, StreamSendHalf, TransportStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

const RELAY_BUFFER_SIZE: usize = 16384;

/// Copy bytes both ways until either side closes
///
/// Each direction runs to its own EOF independently; errors end that
/// direction the same way a close does. Returns
/// `(bytes_to_tunnel, bytes_to_tcp)`.
pub async fn pipe<S: TransportStream>(stream: S, tcp: TcpStream) -> (u64, u64) {
    let (mut stream_send, mut stream_recv) = stream.into_split();
    let (mut tcp_read, mut tcp_write) = tcp.into_split();

    let to_tunnel = async move {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            match tcp_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if stream_send.send_bytes(&buf[..n]).await.is_err() {
                        break;
                    }
                    total += n as u64;
                }
                Err(e) => {
                    trace!(error = %e, "TCP read ended");
                    break;
                }
            }
        }
        let _ = stream_send.finish().await;
        total
    };

    let to_tcp = async move {
        let mut total = 0u64;
        loop {
            match stream_recv.recv_bytes(RELAY_BUFFER_SIZE).await {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => {
                    if tcp_write.write_all(&chunk).await.is_err() {
                        break;
                    }
                    total += chunk.len() as u64;
                }
                Err(e) => {
                    trace!(error = %e, "Tunnel read ended");
                    break;
                }
            }
        }
        let _ = tcp_write.shutdown().await;
        total
    };

    tokio::join!(to_tunnel, to_tcp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use portcullis_transport::memory;
    use portcullis_transport::{TransportConnection, TransportStream};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_pipe_relays_both_directions() {
        let (conn_a, conn_b) = memory::pair();

        // Echo server standing in for the forward target
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (mut read, mut write) = socket.split();
            tokio::io::copy(&mut read, &mut write).await.unwrap();
        });

        // Remote side: accept the channel and pipe it to the echo server
        let remote = tokio::spawn(async move {
            let mut stream = conn_b.accept_stream().await.unwrap().unwrap();
            stream.recv_message().await.unwrap(); // channel header
            let tcp = TcpStream::connect(addr).await.unwrap();
            pipe(stream, tcp).await
        });

        // Local side: open the channel and run a client conversation over it
        let client_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let local = tokio::spawn(async move {
            let (socket, _) = client_listener.accept().await.unwrap();
            let stream = conn_a.open_channel("tunnel", "echo").await.unwrap();
            pipe(stream, socket).await
        });

        let mut client = TcpStream::connect(client_addr).await.unwrap();
        client.write_all(b"hello through the tunnel").await.unwrap();
        client.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello through the tunnel");

        let (to_tunnel, _) = local.await.unwrap();
        assert_eq!(to_tunnel, b"hello through the tunnel".len() as u64);
        remote.await.unwrap();
    }
}
