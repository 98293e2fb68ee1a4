//! The server side of the transport.
//!
//! A [`TransportServer`] accepts connections, speaks HTTP/1.1 or HTTP/2 on each (negotiated through
//! ALPN with TLS, through the `h2c` upgrade without), and runs every request through its filter
//! chain into a [`TransportDispatcher`]. Tunneled queries are restored before the first filter.

mod service;

pub(crate) use service::ServerService;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::{BoxedIo, ConnectionInfo, serve_connection};
use crate::dispatcher::TransportDispatcher;
use crate::filter::FilterChain;
use crate::negotiation::tls::{TlsAcceptor, accepted_protocol, install_crypto_provider, server_config};
use crate::negotiation::{HttpProtocol, NegotiationError};
use crate::tunnel::QueryTunnelDecodeFilter;

#[derive(Error, Debug)]
pub enum ServerBuildError {
    #[error("dispatcher must be set")]
    MissingDispatcher,
    #[error(transparent)]
    Tls(#[from] NegotiationError),
    #[error("failed to bind: {source}")]
    Bind {
        #[from]
        source: io::Error,
    },
}

pub struct TransportServerBuilder {
    config: ServerConfig,
    chain: FilterChain,
    dispatcher: Option<TransportDispatcher>,
    identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
}

impl TransportServerBuilder {
    fn new() -> Self {
        Self { config: ServerConfig::default(), chain: FilterChain::empty(), dispatcher: None, identity: None }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn filter_chain(mut self, chain: FilterChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn dispatcher(mut self, dispatcher: TransportDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Serves TLS with this certificate chain and key instead of the files named in the config.
    pub fn tls_identity(mut self, cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        self.identity = Some((cert_chain, key));
        self
    }

    pub fn build(self) -> Result<TransportServer, ServerBuildError> {
        let dispatcher = self.dispatcher.ok_or(ServerBuildError::MissingDispatcher)?;
        let identity = match (self.identity, &self.config.tls) {
            (Some(identity), _) => Some(identity),
            (None, Some(tls)) => Some(tls.load()?),
            (None, None) => None,
        };
        let acceptor = match identity {
            Some((certs, key)) => {
                install_crypto_provider();
                Some(TlsAcceptor::from(server_config(certs, key, &self.config.protocols)?))
            }
            None => None,
        };

        let chain = self.chain.to_builder().add_first(QueryTunnelDecodeFilter).build();
        let h2c = acceptor.is_none() && self.config.allows_h2c();
        let service = ServerService::new(chain, dispatcher, self.config.streaming_timeout(), h2c);
        Ok(TransportServer { config: self.config, service: Arc::new(service), acceptor })
    }
}

pub struct TransportServer {
    config: ServerConfig,
    service: Arc<ServerService>,
    acceptor: Option<TlsAcceptor>,
}

impl TransportServer {
    pub fn builder() -> TransportServerBuilder {
        TransportServerBuilder::new()
    }

    /// Binds the configured address and starts accepting connections in the background.
    pub async fn start(self) -> Result<ServerHandle, ServerBuildError> {
        let listener = TcpListener::bind(self.config.address).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, tls = self.acceptor.is_some(), "start listening");

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let acceptor = Acceptor {
            service: self.service,
            tls: self.acceptor,
            max_header_bytes: self.config.max_header_bytes,
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
        };
        tracker.spawn(acceptor.run(listener));

        Ok(ServerHandle { local_addr, shutdown, tracker })
    }
}

struct Acceptor {
    service: Arc<ServerService>,
    tls: Option<TlsAcceptor>,
    max_header_bytes: usize,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Acceptor {
    async fn run(self, listener: TcpListener) {
        let this = Arc::new(self);
        loop {
            let accepted = tokio::select! {
                () = this.shutdown.cancelled() => None,
                accepted = listener.accept() => Some(accepted),
            };
            let (tcp_stream, remote_addr) = match accepted {
                None => break,
                Some(Ok(stream_and_addr)) => stream_and_addr,
                Some(Err(e)) => {
                    warn!(cause = %e, "failed to accept");
                    continue;
                }
            };
            let connection = Arc::clone(&this);
            this.tracker.spawn(async move { connection.handle(tcp_stream, remote_addr).await });
        }
        info!("stop listening");
    }

    async fn handle(&self, tcp_stream: TcpStream, remote_addr: SocketAddr) {
        if let Err(e) = tcp_stream.set_nodelay(true) {
            debug!(cause = %e, "failed to set nodelay");
        }

        let (io, protocol): (BoxedIo, HttpProtocol) = match &self.tls {
            None => (Box::new(tcp_stream), HttpProtocol::Http11),
            Some(acceptor) => match acceptor.accept(tcp_stream).await {
                Ok(stream) => {
                    let protocol = accepted_protocol(stream.get_ref().1.alpn_protocol());
                    (Box::new(stream), protocol)
                }
                Err(e) => {
                    info!(cause = %e, %remote_addr, "TLS handshake failed");
                    return;
                }
            },
        };

        debug!(%remote_addr, %protocol, "connection accepted");
        let info = ConnectionInfo { remote_addr, protocol };
        serve_connection(io, info, Arc::clone(&self.service), self.shutdown.clone(), self.max_header_bytes).await;
    }
}

/// A running server.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and closes the open ones once their in-flight requests are
    /// answered. Returns whether every connection finished within `grace`.
    pub async fn shutdown(self, grace: Duration) -> bool {
        info!(local_addr = %self.local_addr, "shutting down server");
        self.shutdown.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_ok() {
            true
        } else {
            warn!(pending = self.tracker.len(), "connections still open after the shutdown grace period");
            false
        }
    }
}
