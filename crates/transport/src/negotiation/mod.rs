//! Selection between HTTP/1.1 and HTTP/2 when a connection is established.
//!
//! Clear text connections negotiate through the HTTP/1.1 `Upgrade: h2c` mechanism (see [`h2c`]),
//! TLS connections through ALPN (see [`tls`]). A client whose [`ProtocolPolicy`] cannot be honoured
//! fails connection creation with a [`NegotiationError`], which reaches the caller as the root cause
//! of the failed call.

pub mod h2c;
pub mod tls;

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use http::StatusCode;
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpProtocol {
    #[serde(rename = "http/1.1")]
    Http11,
    #[serde(rename = "h2")]
    Http2,
}

impl HttpProtocol {
    pub fn alpn_id(self) -> &'static [u8] {
        match self {
            Self::Http11 => ALPN_HTTP11,
            Self::Http2 => ALPN_H2,
        }
    }

    pub fn from_alpn_id(id: &[u8]) -> Option<Self> {
        match id {
            ALPN_HTTP11 => Some(Self::Http11),
            ALPN_H2 => Some(Self::Http2),
            _ => None,
        }
    }
}

impl fmt::Display for HttpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http11 => f.write_str("HTTP/1.1"),
            Self::Http2 => f.write_str("HTTP/2"),
        }
    }
}

/// Which protocol a client asks for, and whether it settles for HTTP/1.1 when the server does not
/// speak HTTP/2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolPolicy {
    pub preferred: HttpProtocol,
    pub allow_fallback: bool,
}

impl Default for ProtocolPolicy {
    fn default() -> Self {
        Self { preferred: HttpProtocol::Http11, allow_fallback: true }
    }
}

impl ProtocolPolicy {
    pub fn http11() -> Self {
        Self::default()
    }

    /// HTTP/2 only, failing against HTTP/1.1 servers.
    pub fn http2() -> Self {
        Self { preferred: HttpProtocol::Http2, allow_fallback: false }
    }

    /// HTTP/2 when the server supports it, HTTP/1.1 otherwise.
    pub fn http2_with_fallback() -> Self {
        Self { preferred: HttpProtocol::Http2, allow_fallback: true }
    }

    pub fn accepts(&self, protocol: HttpProtocol) -> bool {
        protocol == self.preferred || (self.allow_fallback && protocol == HttpProtocol::Http11)
    }

    /// ALPN identifiers offered in the TLS handshake, most preferred first.
    pub fn alpn_offer(&self) -> Vec<Vec<u8>> {
        match self.preferred {
            HttpProtocol::Http2 => vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()],
            HttpProtocol::Http11 => vec![ALPN_HTTP11.to_vec()],
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum NegotiationError {
    #[error("HTTP/2 clear text upgrade failed, server only speaks HTTP/1.1 (responded {status})")]
    UpgradeFailed { status: StatusCode },

    #[error("Unsupported protocol negotiated: {negotiated}")]
    UnsupportedProtocol { negotiated: String },

    #[error("TLS failure: {reason}")]
    Tls { reason: String },

    #[error("SSL session rejected: {reason}")]
    SessionRejected { reason: String },
}

impl NegotiationError {
    pub fn tls<S: ToString>(reason: S) -> Self {
        Self::Tls { reason: reason.to_string() }
    }
}

/// What a [`SslSessionValidator`] gets to see of an established TLS connection.
#[derive(Debug, Clone)]
pub struct SslSession {
    pub server_name: String,
    pub protocol: HttpProtocol,
    /// end entity certificate first
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

/// Application check of the TLS session a call is about to use, run on every lease of a pooled
/// connection before the request is written.
pub trait SslSessionValidator: Send + Sync {
    fn validate(&self, session: &SslSession) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Stored in the request context under [`crate::context::keys::SSL_SESSION_VALIDATOR`].
pub type SslSessionValidatorRef = Arc<dyn SslSessionValidator>;

impl<F> SslSessionValidator for F
where
    F: Fn(&SslSession) -> Result<(), Box<dyn Error + Send + Sync>> + Send + Sync,
{
    fn validate(&self, session: &SslSession) -> Result<(), Box<dyn Error + Send + Sync>> {
        self(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_acceptance() {
        assert!(ProtocolPolicy::http2().accepts(HttpProtocol::Http2));
        assert!(!ProtocolPolicy::http2().accepts(HttpProtocol::Http11));
        assert!(ProtocolPolicy::http2_with_fallback().accepts(HttpProtocol::Http11));
        assert!(!ProtocolPolicy::http11().accepts(HttpProtocol::Http2));
    }

    #[test]
    fn error_messages_name_the_server_protocol() {
        let err = NegotiationError::UpgradeFailed { status: StatusCode::OK };
        assert_eq!(err.to_string(), "HTTP/2 clear text upgrade failed, server only speaks HTTP/1.1 (responded 200 OK)");

        let err = NegotiationError::UnsupportedProtocol { negotiated: "http/1.1".into() };
        assert_eq!(err.to_string(), "Unsupported protocol negotiated: http/1.1");
    }

    #[test]
    fn policy_from_json() {
        let policy: ProtocolPolicy = serde_json::from_str(r#"{"preferred":"h2"}"#).unwrap();
        assert_eq!(policy, ProtocolPolicy::http2_with_fallback());
        assert_eq!(HttpProtocol::from_alpn_id(b"http/1.1"), Some(HttpProtocol::Http11));
    }
}
