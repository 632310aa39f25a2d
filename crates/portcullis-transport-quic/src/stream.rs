//! QUIC stream implementation

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use portcullis_proto::{TunnelCodec, TunnelMessage};
use portcullis_transport::{
    StreamRecvHalf, StreamSendHalf, TransportError, TransportResult, TransportStream,
};
use quinn::{RecvStream, SendStream};
use tracing::trace;

/// QUIC stream wrapper
///
/// Framed control messages and raw relay bytes share the receive buffer:
/// whatever arrived behind a decoded header is handed out by `recv_bytes`
/// before the stream is read again.
#[derive(Debug)]
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
    stream_id: u64,
    send_closed: bool,
    recv_closed: bool,
    recv_buffer: BytesMut,
}

impl QuicStream {
    pub fn new(send: SendStream, recv: RecvStream) -> Self {
        let stream_id = send.id().index();
        Self {
            send,
            recv,
            stream_id,
            send_closed: false,
            recv_closed: false,
            recv_buffer: BytesMut::with_capacity(8192),
        }
    }

    async fn fill_recv_buffer(&mut self) -> TransportResult<bool> {
        match self.recv.read_chunk(8192, true).await {
            Ok(Some(chunk)) => {
                self.recv_buffer.extend_from_slice(&chunk.bytes);
                Ok(true)
            }
            Ok(None) => {
                self.recv_closed = true;
                Ok(false)
            }
            Err(quinn::ReadError::ConnectionLost(e)) => {
                self.recv_closed = true;
                Err(TransportError::ConnectionError(format!(
                    "Connection lost: {}",
                    e
                )))
            }
            Err(e) => {
                self.recv_closed = true;
                Err(TransportError::ConnectionError(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl TransportStream for QuicStream {
    type SendHalf = QuicSendHalf;
    type RecvHalf = QuicRecvHalf;

    async fn send_message(&mut self, message: &TunnelMessage) -> TransportResult<()> {
        let encoded = TunnelCodec::encode(message)
            .map_err(|e| TransportError::ProtocolError(e.to_string()))?;

        self.send_bytes(&encoded).await?;

        trace!("Sent message on stream {}: {:?}", self.stream_id, message);

        Ok(())
    }

    async fn recv_message(&mut self) -> TransportResult<Option<TunnelMessage>> {
        loop {
            if let Some(msg) = TunnelCodec::decode(&mut self.recv_buffer)
                .map_err(|e| TransportError::ProtocolError(e.to_string()))?
            {
                trace!("Received message on stream {}: {:?}", self.stream_id, msg);
                return Ok(Some(msg));
            }

            if self.recv_closed {
                if self.recv_buffer.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::ProtocolError(
                    "Incomplete message in buffer".to_string(),
                ));
            }

            if !self.fill_recv_buffer().await? && self.recv_buffer.is_empty() {
                return Ok(None);
            }
        }
    }

    async fn send_bytes(&mut self, data: &[u8]) -> TransportResult<()> {
        if self.send_closed {
            return Err(TransportError::StreamClosed);
        }

        self.send
            .write_all(data)
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        Ok(())
    }

    async fn recv_bytes(&mut self, max_size: usize) -> TransportResult<Bytes> {
        if !self.recv_buffer.is_empty() {
            let n = self.recv_buffer.len().min(max_size);
            return Ok(self.recv_buffer.split_to(n).freeze());
        }

        if self.recv_closed {
            return Ok(Bytes::new());
        }

        match self.recv.read_chunk(max_size, true).await {
            Ok(Some(chunk)) => Ok(chunk.bytes),
            Ok(None) => {
                self.recv_closed = true;
                Ok(Bytes::new())
            }
            Err(quinn::ReadError::ConnectionLost(e)) => {
                self.recv_closed = true;
                Err(TransportError::ConnectionError(format!(
                    "Connection lost: {}",
                    e
                )))
            }
            Err(e) => {
                self.recv_closed = true;
                Err(TransportError::ConnectionError(e.to_string()))
            }
        }
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.send_closed {
            return Ok(());
        }

        self.send
            .finish()
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        self.send_closed = true;

        Ok(())
    }

    fn stream_id(&self) -> u64 {
        self.stream_id
    }

    fn is_closed(&self) -> bool {
        self.send_closed
    }

    fn into_split(self) -> (Self::SendHalf, Self::RecvHalf) {
        (
            QuicSendHalf {
                send: self.send,
                closed: self.send_closed,
            },
            QuicRecvHalf {
                recv: self.recv,
                closed: self.recv_closed,
                recv_buffer: self.recv_buffer,
            },
        )
    }
}

/// Send half of a split QUIC stream
#[derive(Debug)]
pub struct QuicSendHalf {
    send: SendStream,
    closed: bool,
}

#[async_trait]
impl StreamSendHalf for QuicSendHalf {
    async fn send_bytes(&mut self, data: &[u8]) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::StreamClosed);
        }

        self.send
            .write_all(data)
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        Ok(())
    }

    async fn finish(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }

        self.send
            .finish()
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        self.closed = true;

        Ok(())
    }
}

/// Receive half of a split QUIC stream
#[derive(Debug)]
pub struct QuicRecvHalf {
    recv: RecvStream,
    closed: bool,
    recv_buffer: BytesMut,
}

#[async_trait]
impl StreamRecvHalf for QuicRecvHalf {
    async fn recv_bytes(&mut self, max_size: usize) -> TransportResult<Bytes> {
        // Bytes buffered while reading the header go out first
        if !self.recv_buffer.is_empty() {
            let n = self.recv_buffer.len().min(max_size);
            return Ok(self.recv_buffer.split_to(n).freeze());
        }

        if self.closed {
            return Ok(Bytes::new());
        }

        match self.recv.read_chunk(max_size, true).await {
            Ok(Some(chunk)) => Ok(chunk.bytes),
            Ok(None) => {
                self.closed = true;
                Ok(Bytes::new())
            }
            Err(quinn::ReadError::ConnectionLost(e)) => {
                self.closed = true;
                Err(TransportError::ConnectionError(format!(
                    "Connection lost: {}",
                    e
                )))
            }
            Err(e) => {
                self.closed = true;
                Err(TransportError::ConnectionError(e.to_string()))
            }
        }
    }
}
