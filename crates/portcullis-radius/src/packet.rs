//! Minimal RADIUS packet inspection
//!
//! The proxy relays datagrams verbatim; the only parsing it does is scanning
//! the attribute list for the Proxy-State correlation token. Anything
//! malformed is treated as carrying no token.

/// RADIUS Proxy-State attribute type (RFC 2865 §5.33)
pub const PROXY_STATE_TYPE: u8 = 33;

/// Fixed RADIUS header length: code, identifier, length, authenticator
const HEADER_LEN: usize = 20;

/// Extract the first Proxy-State attribute value from a raw datagram
///
/// Returns `None` for malformed packets, packets without the attribute, and
/// empty attribute values — all of which mean "no affinity requested".
pub fn proxy_state(packet: &[u8]) -> Option<String> {
    if packet.len() < HEADER_LEN {
        return None;
    }

    let declared = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if declared < HEADER_LEN || declared > packet.len() {
        return None;
    }

    let mut attrs = &packet[HEADER_LEN..declared];
    while attrs.len() >= 2 {
        let attr_type = attrs[0];
        let attr_len = attrs[1] as usize;
        if attr_len < 2 || attr_len > attrs.len() {
            return None;
        }
        if attr_type == PROXY_STATE_TYPE {
            let value = &attrs[2..attr_len];
            if value.is_empty() {
                return None;
            }
            return Some(String::from_utf8_lossy(value).into_owned());
        }
        attrs = &attrs[attr_len..];
    }

    None
}
