//! QUIC implementation of the portcullis transport
//!
//! quinn gives us the authenticated, multiplexed secure channel the tunnel
//! core expects: logical channels map to bidirectional QUIC streams, and the
//! out-of-band request primitive rides a short-lived stream per exchange.

pub mod config;
pub mod connection;
pub mod listener;
pub mod stream;

pub use config::QuicConfig;
pub use connection::QuicConnection;
pub use listener::{QuicConnector, QuicListener};
pub use stream::{QuicRecvHalf, QuicSendHalf, QuicStream};
