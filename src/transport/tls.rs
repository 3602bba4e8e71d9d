//! TLS client configuration
//!
//! Builds a rustls connector with the webpki trust anchors for `ssl://`
//! server URIs.

use std::io;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// TLS configuration for client connections
#[derive(Clone)]
pub struct TlsConfig {
    connector: TlsConnector,
}

impl TlsConfig {
    /// A connector trusting the standard webpki roots.
    pub fn new() -> io::Result<Self> {
        let root_store = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Wrap a TCP stream in a TLS session for the given server name.
    pub async fn connect(
        &self,
        stream: TcpStream,
        domain: &str,
    ) -> io::Result<TlsStream<TcpStream>> {
        let domain = ServerName::try_from(domain.to_string())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid domain name"))?;

        self.connector.connect(domain, stream).await
    }
}
