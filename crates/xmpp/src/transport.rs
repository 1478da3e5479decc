use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::error::{map_io_error, ClientError};

/// A bidirectional byte stream the client can frame stanzas over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub type BoxedStream = Box<dyn AsyncStream>;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub tcp_nodelay: bool,
    pub timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Opens the raw connection to a server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        options: TransportOptions,
    ) -> Result<BoxedStream, ClientError>;
}

/// Wraps an established stream in TLS after `<proceed/>`.
#[async_trait]
pub trait TlsUpgrader: Send + Sync + 'static {
    async fn upgrade(&self, stream: BoxedStream, domain: &str) -> Result<BoxedStream, ClientError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        options: TransportOptions,
    ) -> Result<BoxedStream, ClientError> {
        let stream = tokio::time::timeout(options.timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(map_io_error)?;

        if let Err(error) = stream.set_nodelay(options.tcp_nodelay) {
            warn!(%error, "failed to set TCP_NODELAY");
        }

        debug!(host, port, "TCP connection established");
        Ok(Box::new(stream))
    }
}

#[derive(Clone)]
enum TrustRoots {
    Native,
    Config(Arc<ClientConfig>),
}

/// STARTTLS upgrade via rustls, verifying the certificate against the
/// stream domain.
#[derive(Clone)]
pub struct RustlsUpgrader {
    roots: TrustRoots,
    timeout: Duration,
}

impl RustlsUpgrader {
    /// Trusts the platform's native root certificates.
    pub fn native() -> Self {
        Self {
            roots: TrustRoots::Native,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_config(config: Arc<ClientConfig>) -> Self {
        Self {
            roots: TrustRoots::Config(config),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn connector(&self) -> Result<TlsConnector, ClientError> {
        match &self.roots {
            TrustRoots::Config(config) => Ok(TlsConnector::from(Arc::clone(config))),
            TrustRoots::Native => native_connector(),
        }
    }
}

impl Default for RustlsUpgrader {
    fn default() -> Self {
        Self::native()
    }
}

fn native_connector() -> Result<TlsConnector, ClientError> {
    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    for error in &native_certs.errors {
        warn!(%error, "failed to load a native root certificate");
    }
    if native_certs.certs.is_empty() {
        return Err(ClientError::Tls(
            "no system root certificates found".to_string(),
        ));
    }
    for cert in native_certs.certs {
        root_store
            .add(cert)
            .map_err(|e| ClientError::Tls(format!("failed to add root certificate: {e}")))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

#[async_trait]
impl TlsUpgrader for RustlsUpgrader {
    async fn upgrade(&self, stream: BoxedStream, domain: &str) -> Result<BoxedStream, ClientError> {
        let connector = self.connector()?;
        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| ClientError::Tls(format!("invalid server name {domain}: {e}")))?;

        let tls = tokio::time::timeout(self.timeout, connector.connect(server_name, stream))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|e| ClientError::Tls(format!("handshake with {domain} failed: {e}")))?;

        debug!(domain, "TLS upgrade complete");
        Ok(Box::new(tls))
    }
}
