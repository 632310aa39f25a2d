//! In-process paired transport
//!
//! [`pair`] returns two connected [`MemoryConnection`] halves backed by plain
//! channels. Used by the test suites and for wiring both tunnel endpoints
//! into one process; it carries no authentication and must never cross a
//! process boundary.

use crate::{
    StreamRecvHalf, StreamSendHalf, TransportConnection, TransportError, TransportResult,
    TransportStream,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use portcullis_proto::{TunnelCodec, TunnelMessage};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

/// Create a connected pair of in-memory connections
pub fn pair() -> (MemoryConnection, MemoryConnection) {
    let (a_incoming_tx, a_incoming_rx) = mpsc::unbounded_channel();
    let (b_incoming_tx, b_incoming_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = watch::channel(false);
    let closed_tx = Arc::new(closed_tx);

    let a = MemoryConnection {
        id: "mem-a".to_string(),
        peer_incoming: b_incoming_tx,
        incoming: Mutex::new(a_incoming_rx),
        // Side A allocates even stream IDs, side B odd ones
        next_stream_id: AtomicU64::new(0),
        closed_tx: closed_tx.clone(),
        closed_rx: closed_rx.clone(),
    };
    let b = MemoryConnection {
        id: "mem-b".to_string(),
        peer_incoming: a_incoming_tx,
        incoming: Mutex::new(b_incoming_rx),
        next_stream_id: AtomicU64::new(1),
        closed_tx,
        closed_rx,
    };
    (a, b)
}

fn stream_pair(id: u64) -> (MemoryStream, MemoryStream) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (MemoryStream::new(id, a_tx, a_rx), MemoryStream::new(id, b_tx, b_rx))
}

/// One half of an in-memory stream pair
#[derive(Debug)]
pub struct MemoryStream {
    stream_id: u64,
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    recv_buffer: BytesMut,
}

impl MemoryStream {
    fn new(
        stream_id: u64,
        tx: mpsc::UnboundedSender<Bytes>,
        rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            stream_id,
            tx: Some(tx),
            rx,
            recv_buffer: BytesMut::with_capacity(8192),
        }
    }
}

#[async_trait]
impl TransportStream for MemoryStream {
    type SendHalf = MemorySendHalf;
    type RecvHalf = MemoryRecvHalf;

    async fn send_message(&mut self, message: &TunnelMessage) -> TransportResult<()> {
        let encoded = TunnelCodec::encode(message)
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;
        self.send_bytes(&encoded).await
    }

    async fn recv_message(&mut self) -> TransportResult<Option<TunnelMessage>> {
        loop {
            if let Some(msg) = TunnelCodec::decode(&mut self.recv_buffer)
                .map_err(|e| TransportError::ProtocolError(e.to_string()))?
            {
                return Ok(Some(msg));
            }

            match self.rx.recv().await {
                Some(chunk) => self.recv_buffer.extend_from_slice(&chunk),
                None if self.recv_buffer.is_empty() => return Ok(None),
                None => {
                    return Err(TransportError::ProtocolError(
                        "Incomplete message in buffer".to_string(),
                    ))
                }
            }
        }
    }

    async fn send_bytes(&mut self, data: &[u8]) -> TransportResult<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::StreamClosed)?;
        tx.send(Bytes::copy_from_slice(data))
            .map_err(|_| TransportError::StreamClosed)
    }

    async fn recv_bytes(&mut self, max_size: usize) -> TransportResult<Bytes> {
        // Bytes buffered while reading the header go out first
        if !self.recv_buffer.is_empty() {
            let n = self.recv_buffer.len().min(max_size);
            return Ok(self.recv_buffer.split_to(n).freeze());
        }

        match self.rx.recv().await {
            Some(chunk) if chunk.len() <= max_size => Ok(chunk),
            Some(chunk) => {
                self.recv_buffer.extend_from_slice(&chunk[max_size..]);
                Ok(chunk.slice(..max_size))
            }
            None => Ok(Bytes::new()),
        }
    }

    async fn finish(&mut self) -> TransportResult<()> {
        self.tx = None;
        Ok(())
    }

    fn stream_id(&self) -> u64 {
        self.stream_id
    }

    fn is_closed(&self) -> bool {
        self.tx.is_none()
    }

    fn into_split(self) -> (Self::SendHalf, Self::RecvHalf) {
        (
            MemorySendHalf { tx: self.tx },
            MemoryRecvHalf {
                rx: self.rx,
                recv_buffer: self.recv_buffer,
            },
        )
    }
}

/// Send half of a split in-memory stream
#[derive(Debug)]
pub struct MemorySendHalf {
    tx: Option<mpsc::UnboundedSender<Bytes>>,
}

#[async_trait]
impl StreamSendHalf for MemorySendHalf {
    async fn send_bytes(&mut self, data: &[u8]) -> TransportResult<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::StreamClosed)?;
        tx.send(Bytes::copy_from_slice(data))
            .map_err(|_| TransportError::StreamClosed)
    }

    async fn finish(&mut self) -> TransportResult<()> {
        self.tx = None;
        Ok(())
    }
}

/// Receive half of a split in-memory stream
#[derive(Debug)]
pub struct MemoryRecvHalf {
    rx: mpsc::UnboundedReceiver<Bytes>,
    recv_buffer: BytesMut,
}

#[async_trait]
impl StreamRecvHalf for MemoryRecvHalf {
    async fn recv_bytes(&mut self, max_size: usize) -> TransportResult<Bytes> {
        if !self.recv_buffer.is_empty() {
            let n = self.recv_buffer.len().min(max_size);
            return Ok(self.recv_buffer.split_to(n).freeze());
        }

        match self.rx.recv().await {
            Some(chunk) if chunk.len() <= max_size => Ok(chunk),
            Some(chunk) => {
                self.recv_buffer.extend_from_slice(&chunk[max_size..]);
                Ok(chunk.slice(..max_size))
            }
            None => Ok(Bytes::new()),
        }
    }
}

/// One half of an in-memory connection pair
#[derive(Debug)]
pub struct MemoryConnection {
    id: String,
    peer_incoming: mpsc::UnboundedSender<MemoryStream>,
    incoming: Mutex<mpsc::UnboundedReceiver<MemoryStream>>,
    next_stream_id: AtomicU64,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
}

impl MemoryConnection {
    fn open_stream(&self) -> TransportResult<MemoryStream> {
        if self.is_closed() {
            return Err(TransportError::ConnectionError(
                "Connection closed".to_string(),
            ));
        }
        let id = self.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let (local, remote) = stream_pair(id);
        self.peer_incoming
            .send(remote)
            .map_err(|_| TransportError::ConnectionError("Peer gone".to_string()))?;
        Ok(local)
    }
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    type Stream = MemoryStream;

    async fn request(&self, name: &str, payload: Bytes) -> TransportResult<Bytes> {
        let mut stream = self.open_stream()?;
        stream
            .send_message(&TunnelMessage::Request {
                name: name.to_string(),
                payload: payload.to_vec(),
            })
            .await?;
        stream.finish().await?;

        match stream.recv_message().await? {
            Some(TunnelMessage::Response { payload }) => Ok(Bytes::from(payload)),
            Some(other) => Err(TransportError::ProtocolError(format!(
                "Unexpected reply to request: {:?}",
                other
            ))),
            None => Err(TransportError::ConnectionError(
                "Request stream closed without response".to_string(),
            )),
        }
    }

    async fn open_channel(&self, kind: &str, target: &str) -> TransportResult<Self::Stream> {
        let mut stream = self.open_stream()?;
        stream
            .send_message(&TunnelMessage::ChannelOpen {
                kind: kind.to_string(),
                target: target.to_string(),
            })
            .await?;
        Ok(stream)
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        if self.is_closed() {
            return Ok(None);
        }

        let mut incoming = self.incoming.lock().await;
        let mut closed = self.closed_rx.clone();
        tokio::select! {
            stream = incoming.recv() => Ok(stream),
            _ = closed.wait_for(|c| *c) => Ok(None),
        }
    }

    async fn close(&self, _error_code: u32, _reason: &str) {
        self.closed_tx.send_replace(true);
    }

    async fn closed(&self) -> TransportResult<()> {
        let mut rx = self.closed_rx.clone();
        // An in-memory close is always clean
        let _ = rx.wait_for(|c| *c).await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    fn remote_address(&self) -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn connection_id(&self) -> String {
        self.id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_header_then_raw_bytes() {
        let (a, b) = pair();

        let mut opened = a.open_channel("tunnel", "10.0.0.5:80").await.unwrap();
        opened.send_bytes(b"payload after header").await.unwrap();

        let mut accepted = b.accept_stream().await.unwrap().unwrap();
        match accepted.recv_message().await.unwrap() {
            Some(TunnelMessage::ChannelOpen { target, .. }) => {
                assert_eq!(target, "10.0.0.5:80");
            }
            other => panic!("unexpected header: {:?}", other),
        }

        let data = accepted.recv_bytes(1024).await.unwrap();
        assert_eq!(&data[..], b"payload after header");
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let (a, b) = pair();

        let server = tokio::spawn(async move {
            let mut stream = b.accept_stream().await.unwrap().unwrap();
            match stream.recv_message().await.unwrap() {
                Some(TunnelMessage::Request { name, .. }) => assert_eq!(name, "ping"),
                other => panic!("unexpected: {:?}", other),
            }
            stream
                .send_message(&TunnelMessage::Response {
                    payload: b"pong".to_vec(),
                })
                .await
                .unwrap();
            stream.finish().await.unwrap();
        });

        let reply = a.request("ping", Bytes::new()).await.unwrap();
        assert_eq!(&reply[..], b"pong");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_unblocks_accept_and_closed() {
        let (a, b) = pair();

        let acceptor = tokio::spawn(async move {
            let next = b.accept_stream().await.unwrap();
            assert!(next.is_none());
            b.closed().await.unwrap();
        });

        a.close(0, "test over").await;
        assert!(a.is_closed());
        acceptor.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_after_close_fails() {
        let (a, _b) = pair();
        a.close(0, "done").await;
        assert!(a.open_channel("tunnel", "x:1").await.is_err());
    }

    #[tokio::test]
    async fn test_finish_closes_send_side_only() {
        let (a, b) = pair();

        let mut opened = a.open_channel("tunnel", "t:1").await.unwrap();
        opened.finish().await.unwrap();
        assert!(opened.is_closed());
        assert!(opened.send_bytes(b"x").await.is_err());

        let mut accepted = b.accept_stream().await.unwrap().unwrap();
        // Header still readable, then EOF
        assert!(matches!(
            accepted.recv_message().await.unwrap(),
            Some(TunnelMessage::ChannelOpen { .. })
        ));
        assert_eq!(accepted.recv_bytes(64).await.unwrap().len(), 0);

        // Reverse direction stays open
        accepted.send_bytes(b"reply").await.unwrap();
        let got = opened.recv_bytes(64).await.unwrap();
        assert_eq!(&got[..], b"reply");
    }
}
