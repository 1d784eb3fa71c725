//! Shared fixtures: an in-memory PKI and a loopback greet server.

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use secure_rpc::config::ServerConfig;
use secure_rpc::greet::GreetService;
use secure_rpc::protocol::auth::{AuthInterceptor, StaticToken};
use secure_rpc::protocol::dispatcher::Service;
use secure_rpc::service::{Channel, ChannelBuilder, Server};
use secure_rpc::transport::{PemSource, TlsClientConfig, TlsServerConfig};
use secure_rpc::utils::Metrics;

pub const TOKEN: &str = "valid-token";

pub struct Identity {
    pub cert: String,
    pub key: String,
}

/// A CA plus a server identity for `localhost` and a client identity
pub struct TestPki {
    pub ca: String,
    pub server: Identity,
    pub client: Identity,
}

fn authority(common_name: &str) -> (Certificate, KeyPair) {
    let mut params = CertificateParams::new(Vec::<String>::new()).expect("ca params");
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    let key = KeyPair::generate().expect("ca key");
    let cert = params.self_signed(&key).expect("self-signed ca");
    (cert, key)
}

fn leaf(
    common_name: &str,
    names: &[&str],
    usage: ExtendedKeyUsagePurpose,
    issuer: &Certificate,
    issuer_key: &KeyPair,
) -> Identity {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let mut params = CertificateParams::new(names).expect("leaf params");
    params.distinguished_name.push(DnType::CommonName, common_name);
    params.extended_key_usages = vec![usage];
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    let key = KeyPair::generate().expect("leaf key");
    let cert = params.signed_by(&key, issuer, issuer_key).expect("signed leaf");
    Identity {
        cert: cert.pem(),
        key: key.serialize_pem(),
    }
}

impl TestPki {
    pub fn generate() -> Self {
        let (ca, ca_key) = authority("secure-rpc test CA");
        Self {
            ca: ca.pem(),
            server: leaf(
                "localhost",
                &["localhost", "127.0.0.1"],
                ExtendedKeyUsagePurpose::ServerAuth,
                &ca,
                &ca_key,
            ),
            client: leaf(
                "greet-client",
                &["greet-client"],
                ExtendedKeyUsagePurpose::ClientAuth,
                &ca,
                &ca_key,
            ),
        }
    }

    pub fn server_tls(&self) -> TlsServerConfig {
        TlsServerConfig::new(
            PemSource::pem(self.server.cert.clone()),
            PemSource::pem(self.server.key.clone()),
        )
        .with_client_auth(PemSource::pem(self.ca.clone()))
    }

    /// Client config trusting the CA and presenting the client identity
    pub fn client_tls(&self) -> TlsClientConfig {
        self.anonymous_client_tls().with_client_certificate(
            PemSource::pem(self.client.cert.clone()),
            PemSource::pem(self.client.key.clone()),
        )
    }

    /// Client config trusting the CA without a client certificate
    pub fn anonymous_client_tls(&self) -> TlsClientConfig {
        TlsClientConfig::new(PemSource::pem(self.ca.clone())).with_authority("localhost")
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub metrics: Arc<Metrics>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<secure_rpc::Result<()>>>,
}

impl TestServer {
    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    /// Trigger graceful shutdown and wait for the server to stop
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .expect("server stopped in time")
                .expect("server task")
                .expect("server result");
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Greet service with a short streaming interval
pub fn greet_service() -> Service {
    GreetService::new(Duration::from_millis(10))
        .into_service()
        .expect("greet service")
}

pub async fn start_server(pki: &TestPki, service: Service) -> TestServer {
    start_server_with(pki, service, ServerConfig::default()).await
}

pub async fn start_server_with(pki: &TestPki, service: Service, config: ServerConfig) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let server = Server::builder(service)
        .tls(pki.server_tls())
        .interceptor(AuthInterceptor::with_static_token(TOKEN))
        .config(config)
        .build()
        .expect("server");
    let metrics = server.metrics();

    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(server.serve_with_shutdown(listener, async {
        let _ = rx.await;
    }));

    TestServer {
        addr,
        metrics,
        shutdown: Some(tx),
        handle: Some(handle),
    }
}

pub fn channel_builder(pki: &TestPki, token: &str) -> ChannelBuilder {
    Channel::builder(pki.client_tls())
        .credentials(StaticToken::new(token))
        .connect_timeout(Duration::from_secs(5))
}

/// Channel with the client identity and the accepted token
pub async fn connect(pki: &TestPki, server: &TestServer) -> Channel {
    channel_builder(pki, TOKEN)
        .open(&server.address())
        .await
        .expect("channel open")
}
