//! Forwarding-rule descriptors
//!
//! A [`Remote`] describes one port-forward to establish through the tunnel:
//! a local bind spec, a remote target spec, and a direction flag. Rules are
//! supplied by configuration as strings and treated as opaque data by the
//! core; the accepted forms are
//!
//! ```text
//! <remote-host>:<remote-port>
//! <local-port>:<remote-host>:<remote-port>
//! <local-host>:<local-port>:<remote-host>:<remote-port>
//! ```
//!
//! optionally prefixed with `R:` to mark the rule as reverse (bound on the
//! peer endpoint instead of this one). Which endpoint a rule is handed to is
//! the caller's concern; the descriptor itself is direction-agnostic data.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors produced while parsing a forwarding-rule string
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RemoteParseError {
    #[error("Empty forwarding rule")]
    Empty,

    #[error("Invalid port '{0}'")]
    InvalidPort(String),

    #[error("Too many components in forwarding rule '{0}'")]
    TooManyComponents(String),
}

/// One declarative forwarding rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    /// Host the proxy listens on
    pub local_host: String,
    /// Port the proxy listens on
    pub local_port: u16,
    /// Host the peer endpoint dials
    pub remote_host: String,
    /// Port the peer endpoint dials
    pub remote_port: u16,
    /// Reverse rules are bound by the peer endpoint
    pub reverse: bool,
}

impl Remote {
    /// Parse a rule string in `ssh -L`-style syntax
    pub fn parse(s: &str) -> Result<Self, RemoteParseError> {
        if s.is_empty() {
            return Err(RemoteParseError::Empty);
        }

        let (reverse, rest) = match s.strip_prefix("R:") {
            Some(rest) => (true, rest),
            None => (false, s),
        };

        let parts: Vec<&str> = rest.split(':').collect();
        let parse_port = |p: &str| {
            p.parse::<u16>()
                .map_err(|_| RemoteParseError::InvalidPort(p.to_string()))
        };

        let remote = match parts.as_slice() {
            [rh, rp] => {
                let port = parse_port(rp)?;
                Remote {
                    local_host: "0.0.0.0".to_string(),
                    local_port: port,
                    remote_host: rh.to_string(),
                    remote_port: port,
                    reverse,
                }
            }
            [lp, rh, rp] => Remote {
                local_host: "0.0.0.0".to_string(),
                local_port: parse_port(lp)?,
                remote_host: rh.to_string(),
                remote_port: parse_port(rp)?,
                reverse,
            },
            [lh, lp, rh, rp] => Remote {
                local_host: lh.to_string(),
                local_port: parse_port(lp)?,
                remote_host: rh.to_string(),
                remote_port: parse_port(rp)?,
                reverse,
            },
            [] | [_] => return Err(RemoteParseError::Empty),
            _ => return Err(RemoteParseError::TooManyComponents(s.to_string())),
        };

        Ok(remote)
    }

    /// The `host:port` the proxy binds locally
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    /// The `host:port` the peer endpoint dials
    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reverse {
            write!(f, "R:")?;
        }
        write!(
            f,
            "{}:{}:{}:{}",
            self.local_host, self.local_port, self.remote_host, self.remote_port
        )
    }
}

impl std::str::FromStr for Remote {
    type Err = RemoteParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Remote::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_form() {
        let r = Remote::parse("127.0.0.1:2222:10.0.0.5:22").unwrap();
        assert_eq!(r.local_host, "127.0.0.1");
        assert_eq!(r.local_port, 2222);
        assert_eq!(r.remote_host, "10.0.0.5");
        assert_eq!(r.remote_port, 22);
        assert!(!r.reverse);
    }

    #[test]
    fn test_parse_three_part_form_defaults_bind_host() {
        let r = Remote::parse("8080:example.internal:80").unwrap();
        assert_eq!(r.local_host, "0.0.0.0");
        assert_eq!(r.local_port, 8080);
        assert_eq!(r.remote_addr(), "example.internal:80");
    }

    #[test]
    fn test_parse_two_part_form_mirrors_port() {
        let r = Remote::parse("10.0.0.5:443").unwrap();
        assert_eq!(r.local_port, 443);
        assert_eq!(r.remote_port, 443);
    }

    #[test]
    fn test_parse_reverse_prefix() {
        let r = Remote::parse("R:3000:localhost:3000").unwrap();
        assert!(r.reverse);
        assert_eq!(r.local_port, 3000);
    }

    #[test]
    fn test_parse_rejects_bad_port() {
        assert_eq!(
            Remote::parse("70000:host:80"),
            Err(RemoteParseError::InvalidPort("70000".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_extra_components() {
        assert!(matches!(
            Remote::parse("a:1:b:2:c:3"),
            Err(RemoteParseError::TooManyComponents(_))
        ));
    }

    #[test]
    fn test_display_roundtrip() {
        for s in ["0.0.0.0:8080:example.internal:80", "R:0.0.0.0:3000:localhost:3000"] {
            let r = Remote::parse(s).unwrap();
            assert_eq!(r.to_string(), s);
            assert_eq!(Remote::parse(&r.to_string()).unwrap(), r);
        }
    }
}
