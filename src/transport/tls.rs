use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{TransportError, TransportResult};

/// Any bidirectional byte stream a leaf transport can run on
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl <T: AsyncRead + AsyncWrite + Send + Unpin + 'static> ByteStream for T {}

/// Wraps a freshly connected socket before the leaf transport takes it over, e.g. by performing
///  a TLS handshake.
#[async_trait]
pub trait StreamSecurer: Send + Sync + 'static {
    async fn secure(&self, host: &str, stream: TcpStream) -> TransportResult<Box<dyn ByteStream>>;
}

pub struct RustlsSecurer {
    connector: tokio_rustls::TlsConnector,
}
impl RustlsSecurer {
    pub fn new(client_config: Arc<rustls::ClientConfig>) -> RustlsSecurer {
        RustlsSecurer {
            connector: tokio_rustls::TlsConnector::from(client_config),
        }
    }
}

#[async_trait]
impl StreamSecurer for RustlsSecurer {
    async fn secure(&self, host: &str, stream: TcpStream) -> TransportResult<Box<dyn ByteStream>> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| TransportError::Config(format!("invalid TLS server name {:?}: {}", host, e)))?;

        debug!("starting TLS handshake with {}", host);
        let tls_stream = self.connector.connect(server_name, stream).await
            .map_err(|e| TransportError::ConnectionFailed(format!("TLS handshake with {} failed: {}", host, e)))?;
        Ok(Box::new(tls_stream))
    }
}
