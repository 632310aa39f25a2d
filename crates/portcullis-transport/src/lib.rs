//! Transport abstraction for tunnel connections
//!
//! The tunnel core consumes an already-authenticated, multiplexed transport
//! and never negotiates authentication itself. These traits describe exactly
//! what it needs from such a transport:
//!
//! 1. an out-of-band request/response primitive ([`TransportConnection::request`]),
//!    used by the keepalive loop,
//! 2. a stream of inbound logical streams ([`TransportConnection::accept_stream`]),
//! 3. the ability to open outbound logical channels given a type tag and a
//!    target description ([`TransportConnection::open_channel`]).
//!
//! `portcullis-transport-quic` provides the QUIC implementation; the
//! [`memory`] module provides an in-process pair used by tests and local
//! wiring.

use async_trait::async_trait;
use bytes::Bytes;
use portcullis_proto::TunnelMessage;
use std::fmt::Debug;
use std::net::SocketAddr;
use thiserror::Error;

pub mod memory;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A bidirectional logical stream over a transport connection
///
/// Streams begin with one framed [`TunnelMessage`] header; after a
/// `ChannelOpen` header the stream degrades to a plain byte pipe driven by
/// `send_bytes`/`recv_bytes`.
#[async_trait]
pub trait TransportStream: Send + Debug {
    /// Owned send half produced by [`TransportStream::into_split`]
    type SendHalf: StreamSendHalf + 'static;

    /// Owned receive half produced by [`TransportStream::into_split`]
    type RecvHalf: StreamRecvHalf + 'static;

    /// Send a framed control message on this stream
    async fn send_message(&mut self, message: &TunnelMessage) -> TransportResult<()>;

    /// Receive a framed control message from this stream
    ///
    /// Returns `None` if the stream was closed gracefully by the peer.
    async fn recv_message(&mut self) -> TransportResult<Option<TunnelMessage>>;

    /// Send raw bytes (relay payload after the channel header)
    async fn send_bytes(&mut self, data: &[u8]) -> TransportResult<()>;

    /// Receive raw bytes, up to `max_size`
    ///
    /// Bytes buffered while reading the header are yielded first. Returns
    /// empty bytes once the stream is finished.
    async fn recv_bytes(&mut self, max_size: usize) -> TransportResult<Bytes>;

    /// Close the sending side of the stream
    async fn finish(&mut self) -> TransportResult<()>;

    /// Stream ID, unique within its connection
    fn stream_id(&self) -> u64;

    /// Whether the stream is closed
    fn is_closed(&self) -> bool;

    /// Split into independently owned send and receive halves
    ///
    /// Relaying needs both directions moving at once without a lock around
    /// the whole stream.
    fn into_split(self) -> (Self::SendHalf, Self::RecvHalf);
}

/// Owned send half of a split stream
#[async_trait]
pub trait StreamSendHalf: Send {
    async fn send_bytes(&mut self, data: &[u8]) -> TransportResult<()>;

    /// Close the sending side
    async fn finish(&mut self) -> TransportResult<()>;
}

/// Owned receive half of a split stream
#[async_trait]
pub trait StreamRecvHalf: Send {
    /// Receive raw bytes, up to `max_size`; empty bytes signal EOF
    async fn recv_bytes(&mut self, max_size: usize) -> TransportResult<Bytes>;
}

/// One authenticated, multiplexed connection to the peer endpoint
#[async_trait]
pub trait TransportConnection: Send + Sync + Debug + 'static {
    /// The stream type carried by this connection
    type Stream: TransportStream + 'static;

    /// Send an out-of-band request and wait for the peer's reply payload
    async fn request(&self, name: &str, payload: Bytes) -> TransportResult<Bytes>;

    /// Open an outbound logical channel of the given type tag toward `target`
    async fn open_channel(&self, kind: &str, target: &str) -> TransportResult<Self::Stream>;

    /// Accept the next inbound logical stream
    ///
    /// The stream's header has not been read yet; dispatch happens above the
    /// transport. Returns `None` once the connection is closed and no more
    /// streams will arrive.
    async fn accept_stream(&self) -> TransportResult<Option<Self::Stream>>;

    /// Close the connection
    async fn close(&self, error_code: u32, reason: &str);

    /// Wait until the connection is no longer usable
    ///
    /// Resolves `Ok(())` on a clean close (local or peer-initiated) and
    /// `Err` when the connection died abnormally.
    async fn closed(&self) -> TransportResult<()>;

    /// Whether the connection is closed
    fn is_closed(&self) -> bool;

    /// Remote peer address
    fn remote_address(&self) -> SocketAddr;

    /// Stable identifier for logging and correlation
    fn connection_id(&self) -> String;
}
