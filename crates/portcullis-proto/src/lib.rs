//! Portcullis protocol definitions
//!
//! Control messages, framing codec, and forwarding-rule descriptors shared by
//! the tunnel endpoints.

pub mod codec;
pub mod messages;
pub mod remote;

pub use codec::{CodecError, TunnelCodec};
pub use messages::TunnelMessage;
pub use remote::{Remote, RemoteParseError};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Channel type tag for proxied forwarding connections
pub const CHANNEL_KIND_TUNNEL: &str = "tunnel";

/// Request name used by the keepalive loop
pub const PING_REQUEST: &str = "ping";

/// Exact payload a healthy peer answers a ping with
pub const PONG_PAYLOAD: &[u8] = b"pong";
