//! QUIC connection implementation

use async_trait::async_trait;
use bytes::Bytes;
use portcullis_proto::TunnelMessage;
use portcullis_transport::{
    TransportConnection, TransportError, TransportResult, TransportStream,
};
use quinn::Connection;
use std::net::SocketAddr;
use tracing::{debug, error, trace};

use crate::stream::QuicStream;

/// QUIC connection wrapper
#[derive(Debug, Clone)]
pub struct QuicConnection {
    inner: Connection,
    connection_id: String,
}

impl QuicConnection {
    pub fn new(connection: Connection) -> Self {
        let connection_id = format!("quic-{}", connection.stable_id());

        Self {
            inner: connection,
            connection_id,
        }
    }

    async fn open_stream(&self) -> TransportResult<QuicStream> {
        let (send, recv) = self
            .inner
            .open_bi()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        trace!("Opened bidirectional stream: {}", send.id().index());

        Ok(QuicStream::new(send, recv))
    }
}

#[async_trait]
impl TransportConnection for QuicConnection {
    type Stream = QuicStream;

    async fn request(&self, name: &str, payload: Bytes) -> TransportResult<Bytes> {
        let mut stream = self.open_stream().await?;
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
        let mut stream = self.open_stream().await?;
        stream
            .send_message(&TunnelMessage::ChannelOpen {
                kind: kind.to_string(),
                target: target.to_string(),
            })
            .await?;
        Ok(stream)
    }

    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>> {
        match self.inner.accept_bi().await {
            Ok((send, recv)) => {
                trace!("Accepted bidirectional stream: {}", send.id().index());
                Ok(Some(QuicStream::new(send, recv)))
            }
            Err(quinn::ConnectionError::ApplicationClosed(_)) => {
                debug!("Connection closed by application");
                Ok(None)
            }
            Err(quinn::ConnectionError::ConnectionClosed(_)) => {
                debug!("Connection closed by peer");
                Ok(None)
            }
            Err(quinn::ConnectionError::LocallyClosed) => {
                debug!("Connection closed locally");
                Ok(None)
            }
            Err(quinn::ConnectionError::TimedOut) => {
                debug!("Connection timed out");
                Ok(None)
            }
            Err(e) => {
                error!("Error accepting stream: {}", e);
                Ok(None)
            }
        }
    }

    async fn close(&self, error_code: u32, reason: &str) {
        self.inner
            .close(quinn::VarInt::from_u32(error_code), reason.as_bytes());

        debug!(
            "QUIC connection {} closed: {} (code: {})",
            self.connection_id, reason, error_code
        );
    }

    async fn closed(&self) -> TransportResult<()> {
        match self.inner.closed().await {
            quinn::ConnectionError::ApplicationClosed(_)
            | quinn::ConnectionError::ConnectionClosed(_)
            | quinn::ConnectionError::LocallyClosed => Ok(()),
            e => Err(TransportError::ConnectionError(e.to_string())),
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.close_reason().is_some()
    }

    fn remote_address(&self) -> SocketAddr {
        self.inner.remote_address()
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_connection_id_format() {
        // Real connections need a full endpoint pair; covered by the
        // integration tests. This only pins the ID scheme.
        let id = format!("quic-{}", 12345);
        assert!(id.starts_with("quic-"));
    }
}
