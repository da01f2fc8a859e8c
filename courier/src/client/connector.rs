use std::sync::Arc;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tracing::debug;
use courier_protocol::error::CourierError;
use courier_protocol::stream::BoxedStream;
use courier_protocol::tls::{client_config, default_root_store, load_certificates, load_private_key, load_root_store};
use crate::client::client_config::{ClientConfig, ClientTransport};

/// Establishes the byte stream a client connection runs on. Each call opens a new stream, the
///  client calls it again for every reconnect.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<BoxedStream, CourierError>;

    /// the remote endpoint for logging
    fn describe(&self) -> String;
}

pub struct TcpConnector {
    address: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, port: u16) -> TcpConnector {
        TcpConnector {
            address: address.into(),
            port,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<BoxedStream, CourierError> {
        let stream = TcpStream::connect((self.address.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

pub struct TlsConnector {
    tcp: TcpConnector,
    server_name: ServerName<'static>,
    connector: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    pub fn new(config: &ClientConfig) -> anyhow::Result<TlsConnector> {
        let roots = match &config.ssl_ca {
            Some(ca) => load_root_store(ca)?,
            None => default_root_store(),
        };
        let identity = match (&config.ssl_certificate, &config.ssl_key) {
            (Some(cert), Some(key)) => Some((load_certificates(cert)?, load_private_key(key, config.ssl_key_passphrase.as_deref())?)),
            _ => None,
        };
        let tls_config = client_config(roots, identity, config.min_tls_version)?;

        let server_name = ServerName::try_from(config.address().to_string())
            .map_err(|e| anyhow::anyhow!("'{}' is not a valid TLS server name: {}", config.address(), e))?;

        Ok(TlsConnector {
            tcp: TcpConnector::new(config.address(), config.port),
            server_name,
            connector: tokio_rustls::TlsConnector::from(tls_config),
        })
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self) -> Result<BoxedStream, CourierError> {
        let stream = TcpStream::connect((self.tcp.address.as_str(), self.tcp.port)).await?;
        stream.set_nodelay(true)?;
        debug!("TCP connection established, starting TLS handshake");

        let stream = self.connector.connect(self.server_name.clone(), stream).await
            .map_err(|e| CourierError::Tls(e.to_string()))?;
        Ok(Box::new(stream))
    }

    fn describe(&self) -> String {
        self.tcp.describe()
    }
}

pub fn connector_for(config: &ClientConfig) -> anyhow::Result<Arc<dyn Connector>> {
    match config.transport {
        ClientTransport::Tcp => Ok(Arc::new(TcpConnector::new(config.address(), config.port))),
        ClientTransport::Tls => Ok(Arc::new(TlsConnector::new(config)?)),
    }
}
