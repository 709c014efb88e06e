//! TLS contexts and the raw TLS transport.
//!
//! A [`TlsContext`] wraps a rustls server or client configuration built on
//! the ring provider. Transports that need a specific ALPN token (`dot`,
//! `h2`) derive their own copy with [`TlsContext::with_alpn`].

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{NetError, Result};
use crate::manager::Manager;
use crate::net::handle::{AcceptCb, ConnectCompletion, Handle};
use crate::net::quota::Quota;
use crate::net::socket::{Socket, SocketKind};
use crate::net::tcp::{self, ConnectRequest, ListenSpec};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn read_pem(path: &Path, what: &str) -> Result<Vec<u8>> {
    if !path.exists() {
        return Err(NetError::Tls(format!("{what} file not found: {}", path.display())));
    }
    Ok(std::fs::read(path)?)
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..]).collect::<std::io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(NetError::Tls("no certificates found in PEM input".into()));
    }
    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])?
        .ok_or_else(|| NetError::Tls("no private key found in PEM input".into()))
}

/// Server or client TLS configuration.
#[derive(Clone)]
pub enum TlsContext {
    Server(Arc<ServerConfig>),
    Client {
        config: Arc<ClientConfig>,
        /// Name to verify; the peer's IP address when unset.
        server_name: Option<ServerName<'static>>,
    },
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsContext::Server(config) => f
                .debug_struct("TlsContext::Server")
                .field("alpn", &config.alpn_protocols)
                .finish(),
            TlsContext::Client {
                config,
                server_name,
            } => f
                .debug_struct("TlsContext::Client")
                .field("alpn", &config.alpn_protocols)
                .field("server_name", server_name)
                .finish(),
        }
    }
}

impl TlsContext {
    /// Server context from a PEM certificate chain and private key.
    pub fn server_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certs = parse_certs(cert_pem)?;
        let key = parse_key(key_pem)?;
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(TlsContext::Server(Arc::new(config)))
    }

    pub fn server_from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert = read_pem(cert_path, "Certificate")?;
        let key = read_pem(key_path, "Private key")?;
        Self::server_from_pem(&cert, &key)
    }

    /// Client context trusting the CA certificates in `ca_pem`.
    pub fn client_from_pem(ca_pem: &[u8]) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for cert in parse_certs(ca_pem)? {
            roots.add(cert)?;
        }
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(TlsContext::Client {
            config: Arc::new(config),
            server_name: None,
        })
    }

    pub fn client_from_ca_file(ca_path: &Path) -> Result<Self> {
        let ca = read_pem(ca_path, "CA certificate")?;
        Self::client_from_pem(&ca)
    }

    /// Client context that accepts any server certificate.
    pub fn client_insecure() -> Result<Self> {
        let provider = provider();
        let verifier = Arc::new(AcceptAnyServerCert {
            provider: provider.clone(),
        });
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth();
        Ok(TlsContext::Client {
            config: Arc::new(config),
            server_name: None,
        })
    }

    /// Copy of this context advertising `protocols` via ALPN.
    pub fn with_alpn<P: AsRef<[u8]>>(&self, protocols: &[P]) -> Self {
        let alpn: Vec<Vec<u8>> = protocols.iter().map(|p| p.as_ref().to_vec()).collect();
        match self {
            TlsContext::Server(config) => {
                let mut config = (**config).clone();
                config.alpn_protocols = alpn;
                TlsContext::Server(Arc::new(config))
            }
            TlsContext::Client {
                config,
                server_name,
            } => {
                let mut config = (**config).clone();
                config.alpn_protocols = alpn;
                TlsContext::Client {
                    config: Arc::new(config),
                    server_name: server_name.clone(),
                }
            }
        }
    }

    /// Verify the server against `name` instead of its IP address.
    pub fn with_server_name(&self, name: &str) -> Result<Self> {
        match self {
            TlsContext::Client { config, .. } => {
                let name = ServerName::try_from(name.to_string())
                    .map_err(|e| NetError::Tls(format!("invalid server name {name:?}: {e}")))?;
                Ok(TlsContext::Client {
                    config: config.clone(),
                    server_name: Some(name),
                })
            }
            TlsContext::Server(_) => Err(NetError::Tls("server name on a server context".into())),
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, TlsContext::Server(_))
    }

    pub(crate) fn acceptor(&self) -> Result<TlsAcceptor> {
        match self {
            TlsContext::Server(config) => Ok(TlsAcceptor::from(config.clone())),
            TlsContext::Client { .. } => Err(NetError::Tls("client context used to listen".into())),
        }
    }

    pub(crate) fn connector(&self, peer: SocketAddr) -> Result<(TlsConnector, ServerName<'static>)> {
        match self {
            TlsContext::Client {
                config,
                server_name,
            } => {
                let name = server_name
                    .clone()
                    .unwrap_or_else(|| ServerName::IpAddress(peer.ip().into()));
                Ok((TlsConnector::from(config.clone()), name))
            }
            TlsContext::Server(_) => Err(NetError::Tls("server context used to connect".into())),
        }
    }
}

#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl Manager {
    /// Listen for raw TLS streams.
    pub fn listen_tls<A>(
        &self,
        iface: SocketAddr,
        accept: A,
        backlog: i32,
        quota: Option<Quota>,
        tls: &TlsContext,
    ) -> Result<Socket>
    where
        A: Fn(&Handle) -> Result<()> + Send + Sync + 'static,
    {
        let accept: AcceptCb = Arc::new(accept);
        tcp::listen_stream(
            self.core(),
            iface,
            backlog,
            ListenSpec {
                kind: SocketKind::Tls,
                accept: Some(accept),
                recv: None,
                quota,
                tls: Some(tls.acceptor()?),
                http: None,
            },
        )
    }

    /// Connect and complete a TLS handshake. A zero `timeout` uses the
    /// initial timeout.
    pub fn tls_connect<F>(
        &self,
        local: SocketAddr,
        peer: SocketAddr,
        cb: F,
        tls: &TlsContext,
        timeout: Duration,
    ) where
        F: FnOnce(Result<Handle>) + Send + 'static,
    {
        tcp::connect_stream(
            self.core(),
            ConnectRequest {
                kind: SocketKind::Tls,
                local,
                peer,
                timeout,
                tls: Some(tls.clone()),
                http: None,
            },
            ConnectCompletion::new(cb),
        );
    }
}
