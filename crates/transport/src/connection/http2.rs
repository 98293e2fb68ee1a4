//! HTTP/2 on top of the `h2` crate. Each HTTP/2 stream carries one call; its body is moved between
//! the `h2` flow controlled streams and an [`EntityStream`] chunk by chunk.

use std::future::poll_fn;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use h2::server::SendResponse;
use h2::{Reason, RecvStream, SendStream};
use http::header::{CONNECTION, HOST, TRANSFER_ENCODING, UPGRADE};
use http::{HeaderMap, Request, Response};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::ConnectionInfo;
use crate::error::TransportError;
use crate::message::StreamRequest;
use crate::negotiation::h2c::FIRST_STREAM_AFTER_UPGRADE;
use crate::protocol::ResponseHead;
use crate::server::ServerService;
use crate::stream::{EntityStream, StreamError, WriteHandle};

const HOP_BY_HOP: [&str; 4] = ["keep-alive", "proxy-connection", "http2-settings", "te"];

/// Removes the headers HTTP/2 forbids, they only make sense on an HTTP/1.1 hop.
fn strip_connection_headers(headers: &mut HeaderMap) {
    headers.remove(CONNECTION);
    headers.remove(TRANSFER_ENCODING);
    headers.remove(UPGRADE);
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Feeds `recv` into `writer`, releasing flow control capacity for every chunk handed on.
/// Returns whether the body completed normally.
pub(crate) async fn pump_recv(mut recv: RecvStream, mut writer: WriteHandle) -> bool {
    if recv.is_end_stream() {
        return writer.done().is_ok();
    }
    loop {
        if writer.write_possible().await.is_err() {
            return false;
        }
        let next = tokio::select! {
            next = recv.data() => next,
            () = writer.cancelled() => return false,
        };
        match next {
            Some(Ok(chunk)) => {
                let _ = recv.flow_control().release_capacity(chunk.len());
                if chunk.is_empty() {
                    continue;
                }
                if writer.write(chunk).is_err() {
                    return false;
                }
            }
            Some(Err(e)) => {
                debug!(cause = %e, "http/2 body failed");
                writer.error(StreamError::aborted(e));
                return false;
            }
            None => return writer.done().is_ok(),
        }
    }
}

/// Writes `body` to `send`, waiting for flow control capacity. A failing body resets the stream
/// with `INTERNAL_ERROR`, which is how the peer learns the message is incomplete.
pub(crate) async fn pump_send(body: EntityStream, mut send: SendStream<Bytes>) -> Result<(), TransportError> {
    let mut reader = body.set_reader()?;
    while let Some(item) = reader.next().await {
        let mut chunk = match item {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(cause = %e, "body failed, resetting http/2 stream");
                send.send_reset(Reason::INTERNAL_ERROR);
                return Err(TransportError::from_stream(e));
            }
        };
        while !chunk.is_empty() {
            send.reserve_capacity(chunk.len());
            let granted = match poll_fn(|cx| send.poll_capacity(cx)).await {
                Some(granted) => granted?,
                None => return Err(StreamError::aborted("http/2 stream closed by peer").into()),
            };
            if granted == 0 {
                continue;
            }
            let part = chunk.split_to(granted.min(chunk.len()));
            send.send_data(part, false)?;
        }
    }
    send.send_data(Bytes::new(), true)?;
    Ok(())
}

/// Serves HTTP/2 on `io` until the client goes away or `shutdown` fires, after which streams in
/// flight are allowed to finish.
pub(crate) async fn serve<T>(
    io: T,
    service: Arc<ServerService>,
    info: ConnectionInfo,
    shutdown: CancellationToken,
) -> Result<(), h2::Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut connection = h2::server::handshake(io).await?;
    let mut closing = false;
    loop {
        let next = tokio::select! {
            next = connection.accept() => Some(next),
            () = shutdown.cancelled(), if !closing => None,
        };
        let Some(next) = next else {
            debug!(remote = %info.remote_addr, "going away");
            connection.graceful_shutdown();
            closing = true;
            continue;
        };
        match next {
            Some(Ok((request, respond))) => {
                let service = Arc::clone(&service);
                tokio::spawn(async move { serve_stream(request, respond, &service, info).await });
            }
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        }
    }
}

async fn serve_stream(
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    service: &ServerService,
    info: ConnectionInfo,
) {
    let (parts, recv) = request.into_parts();
    let (body, writer) = EntityStream::with_writer();
    tokio::spawn(pump_recv(recv, writer));

    let response = service.serve(Request::from_parts(parts, body), info).await;
    let (parts, body) = response.into_parts();
    let mut head = ResponseHead::from_parts(parts, ());
    strip_connection_headers(head.headers_mut());

    let end_of_stream = body.exact_len() == Some(0);
    let send = match respond.send_response(head, end_of_stream) {
        Ok(send) => send,
        Err(e) => {
            debug!(cause = %e, "failed to send http/2 response head");
            return;
        }
    };
    if !end_of_stream {
        if let Err(e) = pump_send(body, send).await {
            debug!(cause = %e, "http/2 response body ended early");
        }
    }
}

/// Client side of an HTTP/2 connection. Cloning the send handle is cheap, but a pooled connection
/// is still leased to one call at a time.
#[derive(Debug)]
pub(crate) struct Http2ClientConnection {
    send_request: h2::client::SendRequest<Bytes>,
    driver: JoinHandle<()>,
}

impl Http2ClientConnection {
    /// `after_upgrade` skips stream 1, which the h2c upgrade request used.
    pub(crate) async fn handshake<T>(io: T, after_upgrade: bool) -> Result<Self, h2::Error>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let mut builder = h2::client::Builder::new();
        builder.enable_push(false);
        if after_upgrade {
            builder.initial_stream_id(FIRST_STREAM_AFTER_UPGRADE);
        }
        let (send_request, connection) = builder.handshake(io).await?;
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(cause = %e, "http/2 connection closed with error");
            }
        });
        Ok(Self { send_request, driver })
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.driver.is_finished()
    }

    /// Sends `request` and waits for the response head. The request body is written by a task of
    /// its own, so a server answering before reading the whole body is fine.
    pub(crate) async fn send(&mut self, request: StreamRequest) -> Result<(Response<()>, RecvStream), TransportError> {
        let mut send_request = self.send_request.clone().ready().await?;

        let (parts, body) = request.into_parts();
        let mut head = Request::from_parts(parts, ());
        strip_connection_headers(head.headers_mut());
        head.headers_mut().remove(HOST);

        let end_of_stream = body.exact_len() == Some(0);
        let (response, send) = send_request.send_request(head, end_of_stream)?;
        if !end_of_stream {
            tokio::spawn(async move {
                if let Err(e) = pump_send(body, send).await {
                    debug!(cause = %e, "http/2 request body ended early");
                }
            });
        }

        let (parts, recv) = response.await?.into_parts();
        Ok((Response::from_parts(parts, ()), recv))
    }

    pub(crate) fn close(&self) {
        self.driver.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::dispatcher::{StreamRequestHandler, TransportDispatcher};
    use crate::message::StreamResponse;
    use crate::filter::FilterChain;
    use crate::negotiation::HttpProtocol;
    use crate::stream::EntityStreams;
    use async_trait::async_trait;
    use http::StatusCode;
    use tokio::io::duplex;

    struct Echo;

    #[async_trait]
    impl StreamRequestHandler for Echo {
        async fn handle_request(
            &self,
            request: StreamRequest,
            _ctx: &mut RequestContext,
        ) -> Result<StreamResponse, TransportError> {
            Ok(Response::new(request.into_body()))
        }
    }

    async fn connected() -> (Http2ClientConnection, CancellationToken) {
        let (client, server) = duplex(64 * 1024);
        let dispatcher = TransportDispatcher::builder().add_stream_handler("/echo", Echo).build().unwrap();
        let service = Arc::new(ServerService::new(FilterChain::empty(), dispatcher, None, false));
        let info = ConnectionInfo { remote_addr: "127.0.0.1:40000".parse().unwrap(), protocol: HttpProtocol::Http2 };
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(server, service, info, shutdown.clone()));
        (Http2ClientConnection::handshake(client, false).await.unwrap(), shutdown)
    }

    async fn body(recv: RecvStream) -> Bytes {
        let (stream, writer) = EntityStream::with_writer();
        tokio::spawn(pump_recv(recv, writer));
        EntityStreams::collect(stream).await.unwrap()
    }

    #[tokio::test]
    async fn streams_bodies_both_ways() {
        let (mut connection, _shutdown) = connected().await;
        let chunks = vec![Bytes::from_static(b"hello "), Bytes::from_static(b"http/2")];
        let request = Request::post("http://localhost/echo").body(EntityStreams::from_chunks(chunks)).unwrap();

        let (head, recv) = connection.send(request).await.unwrap();
        assert_eq!(head.status(), StatusCode::OK);
        assert_eq!(&body(recv).await[..], b"hello http/2");
        assert!(connection.is_open());
    }

    #[tokio::test]
    async fn unknown_paths_are_404() {
        let (mut connection, _shutdown) = connected().await;
        let request = Request::get("http://localhost/missing").body(EntityStreams::empty()).unwrap();
        let (head, recv) = connection.send(request).await.unwrap();
        assert_eq!(head.status(), StatusCode::NOT_FOUND);
        assert!(String::from_utf8_lossy(&body(recv).await).contains("/missing"));
    }

    #[tokio::test]
    async fn failing_bodies_reset_the_stream() {
        let (mut connection, _shutdown) = connected().await;
        let source = EntityStream::new();
        let mut writer = source.set_writer().unwrap();
        let request = Request::post("http://localhost/echo").body(source).unwrap();

        tokio::spawn(async move {
            writer.send(Bytes::from_static(b"partial")).await.unwrap();
            writer.error(StreamError::aborted("producer failed"));
        });

        // the reset may overtake the response head
        match connection.send(request).await {
            Ok((_head, recv)) => {
                let (stream, writer) = EntityStream::with_writer();
                tokio::spawn(pump_recv(recv, writer));
                assert!(EntityStreams::collect(stream).await.is_err());
            }
            Err(e) => assert!(matches!(e, TransportError::H2 { .. })),
        }
    }
}
