//! # TLS Transport Layer
//!
//! Mutually authenticated TLS for RPC connections.
//!
//! ## Responsibilities
//! - Load certificates, keys and trust anchors from PEM (files or inline)
//! - Build `rustls` server configs with optional or required client auth
//! - Build client configs with explicit trust anchors, an optional client
//!   identity and a strict authority (server name) check
//! - Hand back framed streams ready for the packet codec

use std::fs::File;
use std::io::{BufRead, BufReader, Cursor};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::server::{AllowAnyAnonymousOrAuthenticatedClient, AllowAnyAuthenticatedClient};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig, ServerName};
use rustls_pemfile::Item;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

use crate::core::codec::PacketCodec;
use crate::error::{ProtocolError, Result};

/// Where PEM material comes from
#[derive(Debug, Clone)]
pub enum PemSource {
    File(PathBuf),
    Inline(Vec<u8>),
}

impl PemSource {
    /// PEM text held in memory
    pub fn pem(data: impl Into<Vec<u8>>) -> Self {
        PemSource::Inline(data.into())
    }

    fn reader(&self) -> Result<Box<dyn BufRead + '_>> {
        match self {
            PemSource::File(path) => {
                let file = File::open(path).map_err(|e| {
                    ProtocolError::TlsError(format!("Failed to open {}: {e}", path.display()))
                })?;
                Ok(Box::new(BufReader::new(file)))
            }
            PemSource::Inline(data) => Ok(Box::new(Cursor::new(data.as_slice()))),
        }
    }

    fn describe(&self) -> String {
        match self {
            PemSource::File(path) => path.display().to_string(),
            PemSource::Inline(_) => "inline PEM".to_string(),
        }
    }
}

impl From<PathBuf> for PemSource {
    fn from(path: PathBuf) -> Self {
        PemSource::File(path)
    }
}

impl From<&std::path::Path> for PemSource {
    fn from(path: &std::path::Path) -> Self {
        PemSource::File(path.to_path_buf())
    }
}

impl From<&str> for PemSource {
    fn from(path: &str) -> Self {
        PemSource::File(PathBuf::from(path))
    }
}

impl From<String> for PemSource {
    fn from(path: String) -> Self {
        PemSource::File(PathBuf::from(path))
    }
}

/// Read every certificate in `source`; an empty bundle is an error
pub fn load_certs(source: &PemSource) -> Result<Vec<Certificate>> {
    let mut reader = source.reader()?;
    let certs = rustls_pemfile::certs(&mut reader).map_err(|_| {
        ProtocolError::TlsError(format!("Failed to parse certificates from {}", source.describe()))
    })?;

    if certs.is_empty() {
        return Err(ProtocolError::TlsError(format!(
            "No certificates found in {}",
            source.describe()
        )));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

/// Read the first private key in `source` (PKCS#8, PKCS#1 or SEC1)
pub fn load_private_key(source: &PemSource) -> Result<PrivateKey> {
    let mut reader = source.reader()?;
    let items = rustls_pemfile::read_all(&mut reader).map_err(|_| {
        ProtocolError::TlsError(format!("Failed to parse private key from {}", source.describe()))
    })?;

    items
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| {
            ProtocolError::TlsError(format!("No private key found in {}", source.describe()))
        })
}

fn root_store(source: &PemSource) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(source)? {
        roots
            .add(&cert)
            .map_err(|e| ProtocolError::TlsError(format!("Failed to add trust anchor: {e}")))?;
    }
    Ok(roots)
}

/// TLS server configuration
#[derive(Debug, Clone)]
pub struct TlsServerConfig {
    cert: PemSource,
    key: PemSource,
    /// Client CA bundle for mTLS
    client_ca: Option<PemSource>,
    /// Whether to require client certificates (mTLS)
    require_client_auth: bool,
}

impl TlsServerConfig {
    pub fn new(cert: impl Into<PemSource>, key: impl Into<PemSource>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
            client_ca: None,
            require_client_auth: false,
        }
    }

    /// Verify client certificates against `client_ca`; required unless relaxed
    pub fn with_client_auth(mut self, client_ca: impl Into<PemSource>) -> Self {
        self.client_ca = Some(client_ca.into());
        self.require_client_auth = true;
        self
    }

    /// Set whether client authentication is required (true) or optional (false)
    pub fn require_client_auth(mut self, required: bool) -> Self {
        self.require_client_auth = required;
        self
    }

    pub fn load_server_config(&self) -> Result<ServerConfig> {
        let cert_chain = load_certs(&self.cert)?;
        let private_key = load_private_key(&self.key)?;

        let builder = ServerConfig::builder().with_safe_defaults();

        let config = match &self.client_ca {
            Some(client_ca) => {
                let roots = root_store(client_ca)?;
                let verifier = if self.require_client_auth {
                    AllowAnyAuthenticatedClient::new(roots).boxed()
                } else {
                    AllowAnyAnonymousOrAuthenticatedClient::new(roots).boxed()
                };
                debug!(required = self.require_client_auth, "Client certificate verification enabled");
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(cert_chain, private_key)
            }
            None => builder
                .with_no_client_auth()
                .with_single_cert(cert_chain, private_key),
        };

        config.map_err(|e| ProtocolError::TlsError(format!("Invalid server certificate: {e}")))
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.load_server_config()?)))
    }
}

/// TLS client configuration
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    /// Trust anchors for the server certificate
    ca: PemSource,
    /// Client identity for mTLS
    client_identity: Option<(PemSource, PemSource)>,
    /// Name checked against the server certificate instead of the dialed host
    authority: Option<String>,
}

impl TlsClientConfig {
    pub fn new(ca: impl Into<PemSource>) -> Self {
        Self {
            ca: ca.into(),
            client_identity: None,
            authority: None,
        }
    }

    /// Present this certificate and key to servers that ask for one
    pub fn with_client_certificate(
        mut self,
        cert: impl Into<PemSource>,
        key: impl Into<PemSource>,
    ) -> Self {
        self.client_identity = Some((cert.into(), key.into()));
        self
    }

    /// Verify the server certificate against `authority` rather than the host
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    pub fn authority(&self) -> Option<&str> {
        self.authority.as_deref()
    }

    pub fn load_client_config(&self) -> Result<ClientConfig> {
        let builder = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(root_store(&self.ca)?);

        match &self.client_identity {
            Some((cert, key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
                .map_err(|e| {
                    ProtocolError::TlsError(format!("Failed to set client certificate: {e}"))
                }),
            None => Ok(builder.with_no_client_auth()),
        }
    }

    /// Server name to verify when dialing `host`
    pub fn server_name(&self, host: &str) -> Result<ServerName> {
        let name = self.authority.as_deref().unwrap_or(host);
        ServerName::try_from(name)
            .map_err(|_| ProtocolError::TlsError(format!("Invalid server name: {name}")))
    }
}

/// Client side of a framed TLS connection
pub type ClientFramed = Framed<ClientTlsStream<TcpStream>, PacketCodec>;

/// Dial `host:port`, run the TLS handshake and wrap the stream in the packet codec
#[instrument(skip(config, tls, codec), fields(authority = ?config.authority()))]
pub async fn connect(
    host: &str,
    port: u16,
    config: &TlsClientConfig,
    tls: Arc<ClientConfig>,
    codec: PacketCodec,
) -> Result<(ClientFramed, SocketAddr)> {
    let server_name = config.server_name(host)?;
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| ProtocolError::Connection(format!("Failed to connect to {host}:{port}: {e}")))?;
    let peer = stream.peer_addr()?;
    stream.set_nodelay(true)?;

    let tls_stream = TlsConnector::from(tls)
        .connect(server_name, stream)
        .await
        .map_err(|e| ProtocolError::TlsError(format!("TLS connection failed: {e}")))?;

    debug!(%peer, "TLS handshake complete");
    Ok((Framed::new(tls_stream, codec), peer))
}
