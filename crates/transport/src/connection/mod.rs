//! Connection handling for both ends of the transport.
//!
//! # Components
//!
//! - [`serve_connection`]: runs an accepted connection with the server's service, as HTTP/1.1 (with
//!   an optional switch to HTTP/2 over clear text) or as HTTP/2 when ALPN selected it
//! - [`ClientConnection`]: a pooled client connection speaking whichever protocol was negotiated
//!
//! Bodies move through [`crate::stream::EntityStream`]s in both directions and both protocols, so
//! backpressure reaches the socket: nothing is read off a connection before the body's reader asks
//! for it.

mod http1_client;
mod http1_server;
mod http2;
mod io;

pub(crate) use http1_client::{Http1ClientConnection, Upgrade};
pub(crate) use http2::Http2ClientConnection;
pub(crate) use io::BoxedIo;

use std::net::SocketAddr;
use std::sync::Arc;

use h2::RecvStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::connection::http1_server::{Http1Outcome, Http1ServerConnection};
use crate::error::TransportError;
use crate::message::StreamRequest;
use crate::negotiation::{HttpProtocol, SslSession};
use crate::protocol::ResponseHead;
use crate::server::ServerService;
use crate::stream::WriteHandle;

/// Facts about a server connection handed to every request it carries.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConnectionInfo {
    pub(crate) remote_addr: SocketAddr,
    pub(crate) protocol: HttpProtocol,
}

pub(crate) async fn serve_connection(
    io: BoxedIo,
    info: ConnectionInfo,
    service: Arc<ServerService>,
    shutdown: CancellationToken,
    max_header_bytes: usize,
) {
    if info.protocol == HttpProtocol::Http2 {
        if let Err(e) = http2::serve(io, service, info, shutdown).await {
            debug!(cause = %e, remote = %info.remote_addr, "http/2 connection failed");
        }
        return;
    }

    let connection = Http1ServerConnection::new(io, info, max_header_bytes);
    match connection.process(Arc::clone(&service), shutdown.clone()).await {
        Ok(Http1Outcome::Closed) => debug!(remote = %info.remote_addr, "connection closed"),
        Ok(Http1Outcome::Upgraded(io)) => {
            let info = ConnectionInfo { protocol: HttpProtocol::Http2, ..info };
            if let Err(e) = http2::serve(io, service, info, shutdown).await {
                debug!(cause = %e, remote = %info.remote_addr, "upgraded http/2 connection failed");
            }
        }
        Err(e) => info!(cause = %e, remote = %info.remote_addr, "connection failed"),
    }
}

enum Transport {
    Http1(Http1ClientConnection),
    Http2(Http2ClientConnection),
}

/// Response body still on the wire after [`ClientConnection::send`].
pub(crate) enum PendingBody {
    Http1,
    Http2(RecvStream),
}

/// A client connection as kept in a pool: leased to one call at a time.
pub(crate) struct ClientConnection {
    transport: Transport,
    ssl_session: Option<SslSession>,
}

impl ClientConnection {
    pub(crate) fn http1(connection: Http1ClientConnection, ssl_session: Option<SslSession>) -> Self {
        Self { transport: Transport::Http1(connection), ssl_session }
    }

    pub(crate) fn http2(connection: Http2ClientConnection, ssl_session: Option<SslSession>) -> Self {
        Self { transport: Transport::Http2(connection), ssl_session }
    }

    pub(crate) fn protocol(&self) -> HttpProtocol {
        match self.transport {
            Transport::Http1(_) => HttpProtocol::Http11,
            Transport::Http2(_) => HttpProtocol::Http2,
        }
    }

    pub(crate) fn ssl_session(&self) -> Option<&SslSession> {
        self.ssl_session.as_ref()
    }

    pub(crate) fn is_open(&self) -> bool {
        match &self.transport {
            Transport::Http1(connection) => connection.is_open(),
            Transport::Http2(connection) => connection.is_open(),
        }
    }

    /// Sends `request` and returns the response head. The request URI must be absolute.
    pub(crate) async fn send(&mut self, request: StreamRequest) -> Result<(ResponseHead, PendingBody), TransportError> {
        match &mut self.transport {
            Transport::Http1(connection) => Ok((connection.send(request).await?, PendingBody::Http1)),
            Transport::Http2(connection) => {
                let (head, recv) = connection.send(request).await?;
                Ok((head, PendingBody::Http2(recv)))
            }
        }
    }

    /// Moves the response body into `writer`. Returns whether the connection may be reused.
    pub(crate) async fn pump_body(&mut self, pending: PendingBody, writer: WriteHandle) -> bool {
        match (&mut self.transport, pending) {
            (Transport::Http1(connection), PendingBody::Http1) => connection.pump_body(writer).await,
            (Transport::Http2(connection), PendingBody::Http2(recv)) => {
                http2::pump_recv(recv, writer).await && connection.is_open()
            }
            _ => false,
        }
    }

    pub(crate) async fn close(&mut self) {
        match &mut self.transport {
            Transport::Http1(connection) => connection.close().await,
            Transport::Http2(connection) => connection.close(),
        }
    }
}
