use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::connection::{BoxedIo, ClientConnection, Http1ClientConnection, Http2ClientConnection, Upgrade};
use crate::error::TransportError;
use crate::negotiation::tls::{self, TlsConnector};
use crate::negotiation::{HttpProtocol, NegotiationError, ProtocolPolicy, SslSession};
use crate::pool::{Lifecycle, PoolKey};

/// Opens connections and settles their protocol: h2c upgrade on clear text, ALPN on TLS.
#[derive(Debug)]
pub(crate) struct Connector {
    policy: ProtocolPolicy,
    tls: Option<Arc<rustls::ClientConfig>>,
    max_header_bytes: usize,
}

impl Connector {
    pub(crate) fn new(policy: ProtocolPolicy, tls: Option<Arc<rustls::ClientConfig>>, max_header_bytes: usize) -> Self {
        Self { policy, tls, max_header_bytes }
    }

    pub(crate) async fn connect(&self, key: &PoolKey) -> Result<ClientConnection, TransportError> {
        let tcp = self.tcp(key).await?;
        if key.tls { self.connect_tls(key, tcp).await } else { self.connect_plain(key, tcp).await }
    }

    async fn tcp(&self, key: &PoolKey) -> Result<TcpStream, TransportError> {
        let host = key.host.trim_start_matches('[').trim_end_matches(']');
        let tcp = TcpStream::connect((host, key.port)).await?;
        tcp.set_nodelay(true)?;
        Ok(tcp)
    }

    async fn connect_plain(&self, key: &PoolKey, tcp: TcpStream) -> Result<ClientConnection, TransportError> {
        let connection = Http1ClientConnection::new(Box::new(tcp), self.max_header_bytes);
        if self.policy.preferred == HttpProtocol::Http11 {
            return Ok(ClientConnection::http1(connection, None));
        }

        let authority = format!("{}:{}", key.host, key.port);
        match connection.request_upgrade(&authority).await? {
            Upgrade::Switched(io) => {
                let connection = Http2ClientConnection::handshake(io, true).await?;
                Ok(ClientConnection::http2(connection, None))
            }
            Upgrade::Declined { status, mut connection } => {
                if !self.policy.allow_fallback {
                    connection.close().await;
                    return Err(NegotiationError::UpgradeFailed { status }.into());
                }
                info!(pool = %key, %status, "server declined h2c, falling back to HTTP/1.1");
                if connection.is_open() {
                    return Ok(ClientConnection::http1(connection, None));
                }
                let tcp: BoxedIo = Box::new(self.tcp(key).await?);
                Ok(ClientConnection::http1(Http1ClientConnection::new(tcp, self.max_header_bytes), None))
            }
        }
    }

    async fn connect_tls(&self, key: &PoolKey, tcp: TcpStream) -> Result<ClientConnection, TransportError> {
        let config = self.tls.clone().ok_or_else(|| NegotiationError::tls("no TLS configuration for https destination"))?;
        let server_name = tls::server_name(&key.host)?;
        let mut stream = TlsConnector::from(config)
            .connect(server_name, tcp)
            .await
            .map_err(|e| NegotiationError::tls(format!("handshake with {key} failed: {e}")))?;

        let (negotiated, peer_certificates) = {
            let (_, session) = stream.get_ref();
            let peer_certificates = session.peer_certificates().map(<[_]>::to_vec).unwrap_or_default();
            (tls::check_negotiated(&self.policy, session.alpn_protocol()), peer_certificates)
        };
        let protocol = match negotiated {
            Ok(protocol) => protocol,
            Err(e) => {
                warn!(pool = %key, cause = %e, "closing connection with unsupported protocol");
                let _ = stream.shutdown().await;
                return Err(e.into());
            }
        };

        let session = SslSession { server_name: key.host.clone(), protocol, peer_certificates };
        match protocol {
            HttpProtocol::Http2 => {
                let connection = Http2ClientConnection::handshake(stream, false).await?;
                Ok(ClientConnection::http2(connection, Some(session)))
            }
            HttpProtocol::Http11 => {
                let connection = Http1ClientConnection::new(Box::new(stream), self.max_header_bytes);
                Ok(ClientConnection::http1(connection, Some(session)))
            }
        }
    }
}

/// Pool lifecycle of the connections to one remote endpoint.
pub(crate) struct ConnectionLifecycle {
    key: PoolKey,
    connector: Arc<Connector>,
}

impl ConnectionLifecycle {
    pub(crate) fn new(key: PoolKey, connector: Arc<Connector>) -> Self {
        Self { key, connector }
    }
}

#[async_trait]
impl Lifecycle<ClientConnection> for ConnectionLifecycle {
    async fn create(&self) -> Result<ClientConnection, Box<dyn Error + Send + Sync>> {
        let connection = self.connector.connect(&self.key).await?;
        debug!(pool = %self.key, protocol = %connection.protocol(), "connection established");
        Ok(connection)
    }

    fn validate_get(&self, connection: &ClientConnection) -> bool {
        connection.is_open()
    }

    fn validate_put(&self, connection: &ClientConnection) -> bool {
        connection.is_open()
    }

    async fn destroy(&self, mut connection: ClientConnection, error: bool) {
        debug!(pool = %self.key, error, "closing connection");
        connection.close().await;
    }
}
