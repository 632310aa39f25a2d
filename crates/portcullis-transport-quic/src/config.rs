//! QUIC transport configuration

use portcullis_transport::{TransportError, TransportResult};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// QUIC-specific configuration
///
/// QUIC's own keep-alive here is transport plumbing; the tunnel runs its own
/// application-level ping/pong on top of it.
#[derive(Debug, Clone)]
pub struct QuicConfig {
    /// Whether to verify the server's TLS certificate
    pub verify_server_cert: bool,

    /// Custom root CA certificates, DER encoded (empty = system roots)
    pub root_certs: Vec<Vec<u8>>,

    /// Server certificate path (PEM, for servers)
    pub server_cert_path: Option<String>,

    /// Server private key path (PEM, for servers)
    pub server_key_path: Option<String>,

    /// Generate an in-memory self-signed certificate instead of loading files
    pub server_self_signed: bool,

    /// ALPN protocols
    pub alpn_protocols: Vec<String>,

    /// QUIC-level keep-alive interval
    pub keep_alive_interval: Duration,

    /// Maximum idle timeout
    pub max_idle_timeout: Duration,

    /// Maximum number of concurrent bidirectional streams
    pub max_concurrent_streams: u64,
}

impl QuicConfig {
    fn base() -> Self {
        Self {
            verify_server_cert: true,
            root_certs: Vec::new(),
            server_cert_path: None,
            server_key_path: None,
            server_self_signed: false,
            alpn_protocols: vec!["portcullis-v1".to_string()],
            keep_alive_interval: Duration::from_secs(10),
            max_idle_timeout: Duration::from_secs(30),
            max_concurrent_streams: 1000,
        }
    }

    /// Client configuration verifying against system root CAs
    pub fn client_default() -> Self {
        Self::base()
    }

    /// Client configuration trusting one extra root certificate (DER)
    ///
    /// Pairs with [`QuicConfig::server_self_signed`] servers, whose
    /// certificate is exposed by the listener.
    pub fn client_with_root_cert(cert_der: Vec<u8>) -> Self {
        let mut config = Self::base();
        config.root_certs.push(cert_der);
        config
    }

    /// Client configuration that skips certificate verification
    ///
    /// Development only; vulnerable to MITM.
    pub fn client_insecure() -> Self {
        let mut config = Self::base();
        config.verify_server_cert = false;
        config
    }

    /// Server configuration loading PEM certificate and key files
    pub fn server_from_files(cert_path: &str, key_path: &str) -> Self {
        let mut config = Self::base();
        config.server_cert_path = Some(cert_path.to_string());
        config.server_key_path = Some(key_path.to_string());
        config
    }

    /// Server configuration with a freshly generated self-signed certificate
    ///
    /// The certificate DER is exposed through the listener so clients can be
    /// pointed at it with [`QuicConfig::client_with_root_cert`].
    pub fn server_self_signed() -> Self {
        let mut config = Self::base();
        config.server_self_signed = true;
        config
    }

    /// Set the QUIC-level keep-alive interval
    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Set the idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.max_idle_timeout = timeout;
        self
    }

    /// Set the maximum number of concurrent bidirectional streams
    pub fn with_max_streams(mut self, max: u64) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.keep_alive_interval.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Keep-alive interval must be > 0".to_string(),
            ));
        }

        if self.max_idle_timeout < self.keep_alive_interval * 2 {
            return Err(TransportError::ConfigurationError(
                "Idle timeout must be at least 2x keep-alive interval".to_string(),
            ));
        }

        Ok(())
    }

    fn transport_config(&self) -> TransportResult<quinn::TransportConfig> {
        let mut transport = quinn::TransportConfig::default();
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.max_idle_timeout(Some(self.max_idle_timeout.try_into().map_err(|_| {
            TransportError::ConfigurationError("Idle timeout out of range".to_string())
        })?));
        transport.max_concurrent_bidi_streams(
            u32::try_from(self.max_concurrent_streams)
                .map_err(|_| {
                    TransportError::ConfigurationError(
                        "Stream limit out of range".to_string(),
                    )
                })?
                .into(),
        );
        Ok(transport)
    }

    /// Build a quinn ClientConfig
    pub(crate) fn build_client_config(&self) -> TransportResult<quinn::ClientConfig> {
        self.validate()?;

        let mut roots = quinn::rustls::RootCertStore::empty();
        if self.root_certs.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        } else {
            for cert_der in &self.root_certs {
                roots
                    .add(quinn::rustls::pki_types::CertificateDer::from(
                        cert_der.clone(),
                    ))
                    .map_err(|e| {
                        TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                    })?;
            }
        }

        let mut client_crypto = if self.verify_server_cert {
            quinn::rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            quinn::rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        };

        client_crypto.alpn_protocols = self
            .alpn_protocols
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect();

        let mut client_config = quinn::ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));

        client_config.transport_config(Arc::new(self.transport_config()?));

        Ok(client_config)
    }

    /// Build a quinn ServerConfig
    ///
    /// Returns the server configuration and, for self-signed servers, the
    /// generated certificate DER for distribution to clients.
    pub(crate) fn build_server_config(
        &self,
    ) -> TransportResult<(quinn::ServerConfig, Option<Vec<u8>>)> {
        self.validate()?;

        let (certs, key, cert_der) = if self.server_self_signed {
            let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
                .map_err(|e| TransportError::TlsError(format!("Cert generation failed: {}", e)))?;
            let cert_der = cert
                .serialize_der()
                .map_err(|e| TransportError::TlsError(format!("Cert encoding failed: {}", e)))?;
            let key = quinn::rustls::pki_types::PrivateKeyDer::Pkcs8(
                cert.serialize_private_key_der().into(),
            );
            let chain = vec![quinn::rustls::pki_types::CertificateDer::from(
                cert_der.clone(),
            )];
            (chain, key, Some(cert_der))
        } else {
            let cert_path = self.server_cert_path.as_ref().ok_or_else(|| {
                TransportError::ConfigurationError("Server cert path required".to_string())
            })?;
            let key_path = self.server_key_path.as_ref().ok_or_else(|| {
                TransportError::ConfigurationError("Server key path required".to_string())
            })?;
            (
                load_certs(Path::new(cert_path))?,
                load_private_key(Path::new(key_path))?,
                None,
            )
        };

        let mut server_crypto = quinn::rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

        server_crypto.alpn_protocols = self
            .alpn_protocols
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .collect();

        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .map_err(|e| TransportError::TlsError(e.to_string()))?,
        ));

        server_config.transport_config(Arc::new(self.transport_config()?));

        Ok((server_config, cert_der))
    }
}

fn load_certs(
    path: &Path,
) -> TransportResult<Vec<quinn::rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open cert file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))
}

fn load_private_key(
    path: &Path,
) -> TransportResult<quinn::rustls::pki_types::PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open key file: {}", e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

// Certificate verifier that skips verification (development only)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl quinn::rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &quinn::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[quinn::rustls::pki_types::CertificateDer<'_>],
        _server_name: &quinn::rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: quinn::rustls::pki_types::UnixTime,
    ) -> Result<quinn::rustls::client::danger::ServerCertVerified, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &quinn::rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &quinn::rustls::pki_types::CertificateDer<'_>,
        _dss: &quinn::rustls::DigitallySignedStruct,
    ) -> Result<quinn::rustls::client::danger::HandshakeSignatureValid, quinn::rustls::Error> {
        Ok(quinn::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<quinn::rustls::SignatureScheme> {
        use quinn::rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default() {
        let config = QuicConfig::client_default();
        assert!(config.verify_server_cert);
        assert!(config.validate().is_ok());
        assert_eq!(config.alpn_protocols, vec!["portcullis-v1"]);
    }

    #[test]
    fn test_invalid_idle_timeout_rejected() {
        let config = QuicConfig::client_default().with_idle_timeout(Duration::from_secs(1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_self_signed_server_yields_cert() {
        let config = QuicConfig::server_self_signed();
        let (_server_config, cert_der) = config.build_server_config().unwrap();
        assert!(cert_der.is_some());
    }

    #[test]
    fn test_server_without_cert_paths_rejected() {
        let config = QuicConfig::base();
        assert!(config.build_server_config().is_err());
    }
}
