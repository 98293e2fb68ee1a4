use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::header::{CONNECTION, CONTENT_LENGTH, EXPECT};
use http::{Method, Request, Response, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::select;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{RequestDecoder, ResponseEncoder};
use crate::connection::io::{BoxedIo, Rewind};
use crate::connection::ConnectionInfo;
use crate::negotiation::h2c;
use crate::protocol::{
    HttpError, Message, ParseError, PayloadItem, PayloadSize, RequestHead, ResponseHead, SendError, response_has_body,
};
use crate::server::ServerService;
use crate::stream::{EntityStream, StreamError, WriteHandle};

/// How an HTTP/1.1 server connection ended.
pub(crate) enum Http1Outcome {
    Closed,
    /// the client switched to HTTP/2 over clear text; the io continues as an HTTP/2 connection
    Upgraded(Rewind<BoxedIo>),
}

/// Server side of an HTTP/1.1 connection: decodes requests, feeds their bodies to the service while
/// it runs, and streams the responses back. Connections are kept alive unless either side asks
/// otherwise.
pub(crate) struct Http1ServerConnection {
    framed_read: FramedRead<ReadHalf<BoxedIo>, RequestDecoder>,
    framed_write: FramedWrite<WriteHalf<BoxedIo>, ResponseEncoder>,
    info: ConnectionInfo,
}

impl Http1ServerConnection {
    pub(crate) fn new(io: BoxedIo, info: ConnectionInfo, max_header_bytes: usize) -> Self {
        let (reader, writer) = tokio::io::split(io);
        Self {
            framed_read: FramedRead::with_capacity(
                reader,
                RequestDecoder::with_max_header_bytes(max_header_bytes),
                8 * 1024,
            ),
            framed_write: FramedWrite::new(writer, ResponseEncoder::new()),
            info,
        }
    }

    /// Serves requests until the connection closes. A fired `shutdown` closes the connection once
    /// the request in flight, if any, has been answered.
    pub(crate) async fn process(
        mut self,
        service: Arc<ServerService>,
        shutdown: CancellationToken,
    ) -> Result<Http1Outcome, HttpError> {
        loop {
            let next = select! {
                next = self.framed_read.next() => Some(next),
                () = shutdown.cancelled() => None,
            };
            let Some(next) = next else {
                debug!(remote = %self.info.remote_addr, "closing idle connection for shutdown");
                self.close().await;
                return Ok(Http1Outcome::Closed);
            };
            match next {
                Some(Ok(Message::Header((head, payload_size)))) => {
                    if service.allows_h2c() && payload_size.is_empty() && h2c::is_upgrade_request(&head) {
                        return self.upgrade().await;
                    }
                    if h2c::is_asterisk_options(&head) {
                        // a declined h2c upgrade, or a plain capability probe
                        self.skip_body().await?;
                        self.send_bodyless(StatusCode::OK).await?;
                        continue;
                    }

                    let keep_alive = self.do_process(head, &service).await?;
                    if !keep_alive {
                        self.close().await;
                        return Ok(Http1Outcome::Closed);
                    }
                }

                Some(Ok(Message::Payload(_))) => {
                    error!("received payload while expecting a request head");
                    self.send_bodyless(StatusCode::BAD_REQUEST).await?;
                    return Err(ParseError::invalid_body("body data where a request head was expected").into());
                }

                Some(Err(e)) => {
                    warn!(cause = %e, remote = %self.info.remote_addr, "can't decode next request");
                    if !e.is_disconnect() {
                        let _ = self.send_bodyless(StatusCode::BAD_REQUEST).await;
                    }
                    return Err(e.into());
                }

                None => {
                    debug!(remote = %self.info.remote_addr, "client closed the connection");
                    return Ok(Http1Outcome::Closed);
                }
            }
        }
    }

    async fn do_process(&mut self, head: RequestHead, service: &ServerService) -> Result<bool, HttpError> {
        let keep_alive = request_keep_alive(&head);
        let head_only = *head.method() == Method::HEAD;

        if let Some(value) = head.headers().get(EXPECT) {
            if value.as_bytes().len() >= 4 && value.as_bytes()[..4].eq_ignore_ascii_case(b"100-") {
                let writer = self.framed_write.get_mut();
                writer.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await.map_err(SendError::io)?;
                writer.flush().await.map_err(SendError::io)?;
                info!("receive expect request header, sent continue response");
            }
        }

        let (body, writer) = EntityStream::with_writer();
        let request = Request::from_parts(head.into_parts().0, body);
        let info = self.info;

        // The request body is pumped while the service runs and while the response is written, so a
        // handler that echoes the body never deadlocks against its own request.
        let pump = pump_request_body(&mut self.framed_read, writer);
        tokio::pin!(pump);
        let mut pumped: Option<Result<(), ParseError>> = None;

        let response = {
            let serve = service.serve(request, info);
            tokio::pin!(serve);
            loop {
                select! {
                    biased;
                    response = &mut serve => break response,
                    result = &mut pump, if pumped.is_none() => pumped = Some(result),
                }
            }
        };

        let response_keep_alive = response_keep_alive(&response);
        let sent = {
            let send = send_response(&mut self.framed_write, response, head_only);
            tokio::pin!(send);
            loop {
                select! {
                    biased;
                    sent = &mut send => break sent,
                    result = &mut pump, if pumped.is_none() => pumped = Some(result),
                }
            }
        };

        let pumped = match pumped {
            Some(result) => result,
            None => pump.await,
        };
        sent?;
        pumped?;
        Ok(keep_alive && response_keep_alive)
    }

    async fn upgrade(mut self) -> Result<Http1Outcome, HttpError> {
        self.skip_body().await?;
        let head = h2c::switching_protocols();
        self.framed_write.send(Message::<_, Bytes>::Header((head, PayloadSize::Empty))).await?;
        info!(remote = %self.info.remote_addr, "switching to HTTP/2 over clear text");

        let buffered = self.framed_read.read_buffer_mut().split().freeze();
        let io = self.framed_read.into_inner().unsplit(self.framed_write.into_inner());
        Ok(Http1Outcome::Upgraded(Rewind::new(buffered, io)))
    }

    async fn skip_body(&mut self) -> Result<(), ParseError> {
        loop {
            match self.framed_read.next().await {
                Some(Ok(Message::Payload(PayloadItem::Eof))) => return Ok(()),
                Some(Ok(Message::Payload(PayloadItem::Chunk(_)))) => {}
                Some(Ok(Message::Header(_))) => return Err(ParseError::invalid_body("request head inside a body")),
                Some(Err(e)) => return Err(e),
                None => return Err(ParseError::UnexpectedEof),
            }
        }
    }

    async fn send_bodyless(&mut self, status: StatusCode) -> Result<(), SendError> {
        let mut head = Response::new(());
        *head.status_mut() = status;
        self.framed_write.feed(Message::<_, Bytes>::Header((head, PayloadSize::Empty))).await?;
        self.framed_write.send(Message::Payload(PayloadItem::<Bytes>::Eof)).await
    }

    async fn close(&mut self) {
        if let Err(e) = self.framed_write.get_mut().shutdown().await {
            debug!(cause = %e, "failed to shut down connection");
        }
    }
}

/// Moves the current request's payload into `writer`. Once the reader goes away, the rest of the
/// body is still read off the connection and discarded, so the next request can be decoded.
async fn pump_request_body<R: AsyncRead + Unpin>(
    framed_read: &mut FramedRead<R, RequestDecoder>,
    mut writer: WriteHandle,
) -> Result<(), ParseError> {
    let mut discarding = false;
    loop {
        if !discarding && writer.write_possible().await.is_err() {
            discarding = true;
        }
        match framed_read.next().await {
            Some(Ok(Message::Payload(PayloadItem::Chunk(bytes)))) => {
                if !discarding && writer.write(bytes).is_err() {
                    discarding = true;
                }
            }
            Some(Ok(Message::Payload(PayloadItem::Eof))) => {
                if !discarding {
                    let _ = writer.done();
                }
                return Ok(());
            }
            Some(Ok(Message::Header(_))) => {
                let e = ParseError::invalid_body("request head inside a body");
                writer.error(StreamError::aborted(e.to_string()));
                return Err(e);
            }
            Some(Err(e)) => {
                writer.error(StreamError::aborted(e.to_string()));
                return Err(e);
            }
            None => {
                writer.error(StreamError::aborted(ParseError::UnexpectedEof));
                return Err(ParseError::UnexpectedEof);
            }
        }
    }
}

/// Writes `response`. A body that fails midway leaves the message truncated; the caller then
/// closes the connection, which is how the peer learns about the failure.
async fn send_response<W: AsyncWrite + Unpin>(
    framed_write: &mut FramedWrite<W, ResponseEncoder>,
    response: Response<EntityStream>,
    head_only: bool,
) -> Result<(), HttpError> {
    let (parts, body) = response.into_parts();
    let mut head = ResponseHead::from_parts(parts, ());
    *head.version_mut() = Version::HTTP_11;

    let request_method = if head_only { Method::HEAD } else { Method::GET };
    let payload_size = if response_has_body(&request_method, head.status()) {
        match body.exact_len() {
            Some(0) => PayloadSize::Empty,
            Some(length) => PayloadSize::Length(length),
            None => declared_length(&head).map_or(PayloadSize::Chunked, PayloadSize::Length),
        }
    } else {
        PayloadSize::Empty
    };

    if payload_size.is_empty() {
        drop(body);
        framed_write.feed(Message::<_, Bytes>::Header((head, payload_size))).await?;
        framed_write.send(Message::Payload(PayloadItem::<Bytes>::Eof)).await?;
        return Ok(());
    }

    framed_write.feed(Message::<_, Bytes>::Header((head, payload_size))).await?;
    let mut reader = body.set_reader().map_err(|e| SendError::invalid_body(e.to_string()))?;
    while let Some(item) = reader.next().await {
        match item {
            Ok(chunk) => framed_write.send(Message::Payload(PayloadItem::Chunk(chunk))).await?,
            Err(e) => {
                warn!(cause = %e, "response body failed, truncating the response");
                return Err(SendError::invalid_body(format!("response body failed: {e}")).into());
            }
        }
    }
    framed_write.send(Message::Payload(PayloadItem::<Bytes>::Eof)).await?;
    Ok(())
}

fn declared_length(head: &ResponseHead) -> Option<u64> {
    head.headers().get(CONTENT_LENGTH)?.to_str().ok()?.trim().parse().ok()
}

fn request_keep_alive(head: &RequestHead) -> bool {
    let connection = head.headers().get(CONNECTION).and_then(|value| value.to_str().ok()).unwrap_or("");
    let has = |token: &str| connection.split(',').any(|candidate| candidate.trim().eq_ignore_ascii_case(token));
    match head.version() {
        Version::HTTP_10 => has("keep-alive"),
        _ => !has("close"),
    }
}

fn response_keep_alive<B>(response: &Response<B>) -> bool {
    !response
        .headers()
        .get(CONNECTION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.split(',').any(|token| token.trim().eq_ignore_ascii_case("close")))
}
