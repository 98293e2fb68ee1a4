//! TLS with ALPN based protocol selection, on `rustls` and `tokio-rustls`.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{RootCertStore, ServerConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{HttpProtocol, NegotiationError, ProtocolPolicy};

pub use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Installs the `ring` crypto provider as the process default, unless one is installed already.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Client trust anchors, from a PEM file or inline PEM text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientTlsConfig {
    pub ca_cert_file: Option<PathBuf>,
    pub ca_cert_pem: Option<String>,
}

impl ClientTlsConfig {
    pub fn root_store(&self) -> Result<RootCertStore, NegotiationError> {
        let mut pem = Vec::new();
        if let Some(path) = &self.ca_cert_file {
            pem = fs::read(path).map_err(|e| NegotiationError::tls(format!("failed to read {}: {e}", path.display())))?;
        }
        if let Some(inline) = &self.ca_cert_pem {
            pem.extend_from_slice(inline.as_bytes());
        }
        root_store(&load_certs(&pem)?)
    }
}

/// Server identity: certificate chain and private key PEM files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTlsConfig {
    pub cert_chain_file: PathBuf,
    pub private_key_file: PathBuf,
}

impl ServerTlsConfig {
    pub fn load(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), NegotiationError> {
        let read = |path: &PathBuf| {
            fs::read(path).map_err(|e| NegotiationError::tls(format!("failed to read {}: {e}", path.display())))
        };
        let certs = load_certs(&read(&self.cert_chain_file)?)?;
        let key = load_private_key(&read(&self.private_key_file)?)?;
        Ok((certs, key))
    }
}

pub fn load_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, NegotiationError> {
    let mut reader = pem;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| NegotiationError::tls(format!("invalid certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(NegotiationError::tls("no certificates found in PEM"));
    }
    Ok(certs)
}

pub fn load_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, NegotiationError> {
    let mut reader = pem;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| NegotiationError::tls(format!("invalid private key PEM: {e}")))?
        .ok_or_else(|| NegotiationError::tls("no private key found in PEM"))
}

pub fn root_store(certs: &[CertificateDer<'static>]) -> Result<RootCertStore, NegotiationError> {
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert.clone()).map_err(|e| NegotiationError::tls(format!("failed to add CA cert: {e}")))?;
    }
    Ok(roots)
}

/// Client configuration offering the ALPN identifiers of `policy`.
pub fn client_config(roots: RootCertStore, policy: &ProtocolPolicy) -> Arc<rustls::ClientConfig> {
    install_crypto_provider();
    let mut config = rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth();
    config.alpn_protocols = policy.alpn_offer();
    Arc::new(config)
}

/// Server configuration announcing `protocols` through ALPN, in the given order of preference.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    protocols: &[HttpProtocol],
) -> Result<Arc<ServerConfig>, NegotiationError> {
    install_crypto_provider();
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| NegotiationError::tls(format!("failed to set server cert: {e}")))?;
    config.alpn_protocols = protocols.iter().map(|protocol| protocol.alpn_id().to_vec()).collect();
    Ok(Arc::new(config))
}

pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, NegotiationError> {
    ServerName::try_from(host.to_string()).map_err(|e| NegotiationError::tls(format!("invalid server name {host}: {e}")))
}

/// Checks the protocol the server selected against the client's policy. No ALPN answer means
/// HTTP/1.1.
pub(crate) fn check_negotiated(policy: &ProtocolPolicy, alpn: Option<&[u8]>) -> Result<HttpProtocol, NegotiationError> {
    let negotiated = alpn.unwrap_or(super::ALPN_HTTP11);
    debug!(negotiated = %String::from_utf8_lossy(negotiated), "ALPN completed");
    match HttpProtocol::from_alpn_id(negotiated) {
        Some(protocol) if policy.accepts(protocol) => Ok(protocol),
        _ => Err(NegotiationError::UnsupportedProtocol { negotiated: String::from_utf8_lossy(negotiated).into_owned() }),
    }
}

/// Protocol a server speaks on an accepted TLS connection.
pub(crate) fn accepted_protocol(alpn: Option<&[u8]>) -> HttpProtocol {
    alpn.and_then(HttpProtocol::from_alpn_id).unwrap_or(HttpProtocol::Http11)
}
