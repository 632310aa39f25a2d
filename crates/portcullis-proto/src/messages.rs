//! Control message types
//!
//! Every logical stream opened over the transport starts with exactly one of
//! these messages. After a `ChannelOpen` header the stream carries raw bytes.

use serde::{Deserialize, Serialize};

/// Main control message enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TunnelMessage {
    /// Out-of-band request (e.g. keepalive ping). The peer answers with a
    /// `Response` on the same stream and finishes it.
    Request {
        name: String,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Reply to a `Request`
    Response {
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },

    /// Open a logical forwarding channel. `target` is the `host:port` the
    /// receiving endpoint dials; everything after this message is relayed
    /// verbatim in both directions.
    ChannelOpen { kind: String, target: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip_through_serde() {
        let msg = TunnelMessage::Request {
            name: "ping".to_string(),
            payload: Vec::new(),
        };
        let bytes = bincode::serialize(&msg).unwrap();
        let back: TunnelMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_channel_open_carries_target() {
        let msg = TunnelMessage::ChannelOpen {
            kind: crate::CHANNEL_KIND_TUNNEL.to_string(),
            target: "10.0.0.5:8080".to_string(),
        };
        let bytes = bincode::serialize(&msg).unwrap();
        match bincode::deserialize(&bytes).unwrap() {
            TunnelMessage::ChannelOpen { kind, target } => {
                assert_eq!(kind, "tunnel");
                assert_eq!(target, "10.0.0.5:8080");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
