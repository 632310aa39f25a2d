//! QUIC listener and connector

use portcullis_transport::{TransportError, TransportResult};
use quinn::Endpoint;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::QuicConfig;
use crate::connection::QuicConnection;

/// QUIC listener for accepting incoming tunnel connections
#[derive(Debug)]
pub struct QuicListener {
    endpoint: Endpoint,
    cert_der: Option<Vec<u8>>,
}

impl QuicListener {
    pub fn bind(bind_addr: SocketAddr, config: Arc<QuicConfig>) -> TransportResult<Self> {
        let (server_config, cert_der) = config.build_server_config()?;

        let endpoint =
            Endpoint::server(server_config, bind_addr).map_err(TransportError::IoError)?;

        let local_addr = endpoint.local_addr().map_err(TransportError::IoError)?;

        info!("QUIC listener bound to {}", local_addr);

        Ok(Self { endpoint, cert_der })
    }

    /// The generated certificate, when running with a self-signed config
    pub fn cert_der(&self) -> Option<&[u8]> {
        self.cert_der.as_deref()
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.endpoint.local_addr().map_err(TransportError::IoError)
    }

    /// Accept the next incoming connection
    pub async fn accept(&self) -> TransportResult<(QuicConnection, SocketAddr)> {
        loop {
            match self.endpoint.accept().await {
                Some(connecting) => {
                    let remote = connecting.remote_address();

                    debug!("Incoming QUIC connection from {}", remote);

                    match connecting.await {
                        Ok(connection) => {
                            info!("QUIC connection established from {}", remote);
                            return Ok((QuicConnection::new(connection), remote));
                        }
                        Err(e) => {
                            error!("Failed to establish QUIC connection from {}: {}", remote, e);
                            continue;
                        }
                    }
                }
                None => {
                    return Err(TransportError::ConnectionError(
                        "QUIC endpoint closed".to_string(),
                    ));
                }
            }
        }
    }

    pub async fn close(&self) {
        self.endpoint.close(0u32.into(), b"Listener closed");
        info!("QUIC listener closed");
    }
}

/// QUIC connector for establishing outgoing tunnel connections
#[derive(Debug)]
pub struct QuicConnector {
    endpoint: Endpoint,
}

impl QuicConnector {
    pub fn new(config: Arc<QuicConfig>) -> TransportResult<Self> {
        let client_config = config.build_client_config()?;

        let mut endpoint =
            Endpoint::client("0.0.0.0:0".parse().unwrap()).map_err(TransportError::IoError)?;

        endpoint.set_default_client_config(client_config);

        debug!("QUIC connector created");

        Ok(Self { endpoint })
    }

    pub async fn connect(
        &self,
        addr: SocketAddr,
        server_name: &str,
    ) -> TransportResult<QuicConnection> {
        debug!("Connecting to QUIC server: {} ({})", server_name, addr);

        let connecting = self
            .endpoint
            .connect(addr, server_name)
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        let connection = connecting
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        info!("QUIC connection established to {} ({})", server_name, addr);

        Ok(QuicConnection::new(connection))
    }
}
