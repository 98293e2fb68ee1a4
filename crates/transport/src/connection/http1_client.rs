use bytes::{Buf, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use http::header::{CONNECTION, HOST};
use http::{HeaderValue, Method, StatusCode, Version};
use tokio::io::AsyncWriteExt;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::debug;

use crate::codec::{RequestEncoder, ResponseDecoder};
use crate::connection::io::{BoxedIo, Rewind};
use crate::error::TransportError;
use crate::message::StreamRequest;
use crate::negotiation::h2c;
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHead, ResponseHead, SendError};
use crate::stream::{StreamError, WriteHandle};

struct ClientCodec {
    encoder: RequestEncoder,
    decoder: ResponseDecoder,
}

impl Decoder for ClientCodec {
    type Item = Message<(ResponseHead, PayloadSize)>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode_eof(src)
    }
}

impl<D: Buf> Encoder<Message<(RequestHead, PayloadSize), D>> for ClientCodec {
    type Error = SendError;

    fn encode(&mut self, item: Message<(RequestHead, PayloadSize), D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

/// Answer to an h2c upgrade attempt.
pub(crate) enum Upgrade {
    Switched(Rewind<BoxedIo>),
    /// the server stays on HTTP/1.1; the connection remains usable when it is still open
    Declined { status: StatusCode, connection: Http1ClientConnection },
}

/// Client side of an HTTP/1.1 connection, one exchange at a time: the request is written in full,
/// then the response head is read, then [`Http1ClientConnection::pump_body`] moves the response
/// body. The connection may be reused only once that body was read to its end.
pub(crate) struct Http1ClientConnection {
    framed: Framed<BoxedIo, ClientCodec>,
    open: bool,
    keep_alive: bool,
    response_size: PayloadSize,
}

impl Http1ClientConnection {
    pub(crate) fn new(io: BoxedIo, max_header_bytes: usize) -> Self {
        let codec =
            ClientCodec { encoder: RequestEncoder::new(), decoder: ResponseDecoder::with_max_header_bytes(max_header_bytes) };
        Self { framed: Framed::new(io, codec), open: true, keep_alive: true, response_size: PayloadSize::Empty }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open
    }

    /// Writes `request` and reads the response head.
    pub(crate) async fn send(&mut self, request: StreamRequest) -> Result<ResponseHead, TransportError> {
        let result = self.exchange(request).await;
        if result.is_err() {
            self.open = false;
        }
        result
    }

    async fn exchange(&mut self, request: StreamRequest) -> Result<ResponseHead, TransportError> {
        let (parts, body) = request.into_parts();
        let mut head = RequestHead::from_parts(parts, ());
        *head.version_mut() = Version::HTTP_11;
        if !head.headers().contains_key(HOST) {
            if let Some(host) = head.uri().authority().and_then(|authority| HeaderValue::from_str(authority.as_str()).ok()) {
                head.headers_mut().insert(HOST, host);
            }
        }

        self.keep_alive = !has_close(head.headers().get(CONNECTION));
        let payload_size = match body.exact_len() {
            Some(0) => PayloadSize::Empty,
            Some(length) => PayloadSize::Length(length),
            None => PayloadSize::Chunked,
        };
        self.framed.codec_mut().decoder.expect_response_to(head.method().clone());

        self.framed.feed(Message::<_, Bytes>::Header((head, payload_size))).await?;
        if payload_size.is_empty() {
            drop(body);
        } else {
            let mut reader = body.set_reader()?;
            while let Some(item) = reader.next().await {
                let chunk = item.map_err(TransportError::from_stream)?;
                self.framed.send(Message::Payload(PayloadItem::Chunk(chunk))).await?;
            }
        }
        self.framed.send(Message::Payload(PayloadItem::<Bytes>::Eof)).await?;

        self.read_head().await
    }

    async fn read_head(&mut self) -> Result<ResponseHead, TransportError> {
        loop {
            match self.framed.next().await {
                Some(Ok(Message::Header((head, payload_size)))) => {
                    if head.status().is_informational() && head.status() != StatusCode::SWITCHING_PROTOCOLS {
                        debug!(status = %head.status(), "skip interim response");
                        continue;
                    }
                    self.response_size = payload_size;
                    if matches!(payload_size, PayloadSize::UntilClose) || has_close(head.headers().get(CONNECTION)) {
                        self.keep_alive = false;
                    }
                    return Ok(head);
                }
                Some(Ok(Message::Payload(_))) => return Err(ParseError::invalid_body("payload before response head").into()),
                Some(Err(e)) => return Err(e.into()),
                None => return Err(ParseError::UnexpectedEof.into()),
            }
        }
    }

    /// Moves the response body into `writer`. Returns whether the connection can serve another
    /// exchange.
    pub(crate) async fn pump_body(&mut self, mut writer: WriteHandle) -> bool {
        let completed = self.read_body(&mut writer).await;
        if !completed {
            self.open = false;
        }
        completed && self.keep_alive && self.open
    }

    async fn read_body(&mut self, writer: &mut WriteHandle) -> bool {
        // an empty body completes without demand
        let needs_demand = !self.response_size.is_empty();
        loop {
            if needs_demand && writer.write_possible().await.is_err() {
                return false;
            }
            let next = tokio::select! {
                next = self.framed.next() => next,
                () = writer.cancelled() => return false,
            };
            match next {
                Some(Ok(Message::Payload(PayloadItem::Chunk(bytes)))) => {
                    if writer.write(bytes).is_err() {
                        return false;
                    }
                }
                Some(Ok(Message::Payload(PayloadItem::Eof))) => return writer.done().is_ok(),
                Some(Ok(Message::Header(_))) => {
                    writer.error(StreamError::aborted(ParseError::invalid_body("response head inside a body")));
                    return false;
                }
                Some(Err(e)) => {
                    debug!(cause = %e, "response body failed");
                    writer.error(StreamError::aborted(e));
                    return false;
                }
                None => {
                    writer.error(StreamError::aborted(ParseError::UnexpectedEof));
                    return false;
                }
            }
        }
    }

    async fn discard_body(&mut self) -> Result<(), ParseError> {
        loop {
            match self.framed.next().await {
                Some(Ok(Message::Payload(PayloadItem::Eof))) => return Ok(()),
                Some(Ok(Message::Payload(PayloadItem::Chunk(_)))) => {}
                Some(Ok(Message::Header(_))) => return Err(ParseError::invalid_body("response head inside a body")),
                Some(Err(e)) => return Err(e),
                None => return Err(ParseError::UnexpectedEof),
            }
        }
    }

    /// Asks the server to continue this connection as HTTP/2 over clear text.
    pub(crate) async fn request_upgrade(mut self, authority: &str) -> Result<Upgrade, TransportError> {
        self.keep_alive = true;
        self.framed.codec_mut().decoder.expect_response_to(Method::OPTIONS);
        self.framed.feed(Message::<_, Bytes>::Header((h2c::upgrade_request(authority), PayloadSize::Empty))).await?;
        self.framed.send(Message::Payload(PayloadItem::<Bytes>::Eof)).await?;

        let head = self.read_head().await?;
        if h2c::is_upgrade_response(&head) {
            debug!(authority, "server agreed to h2c upgrade");
            let parts = self.framed.into_parts();
            return Ok(Upgrade::Switched(Rewind::new(parts.read_buf.freeze(), parts.io)));
        }

        let status = head.status();
        debug!(authority, %status, "server declined h2c upgrade");
        if status.is_informational() {
            // a bare 101 for another protocol leaves the connection in an unknown state
            self.open = false;
        } else {
            self.discard_body().await?;
            self.open = self.keep_alive;
        }
        Ok(Upgrade::Declined { status, connection: self })
    }

    pub(crate) async fn close(&mut self) {
        self.open = false;
        if let Err(e) = self.framed.get_mut().shutdown().await {
            debug!(cause = %e, "failed to shut down connection");
        }
    }
}

fn has_close(value: Option<&HeaderValue>) -> bool {
    value
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.split(',').any(|token| token.trim().eq_ignore_ascii_case("close")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{EntityStream, EntityStreams};
    use http::Request;
    use tokio::io::{AsyncReadExt, duplex};

    async fn read_request(server: &mut tokio::io::DuplexStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = server.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn exchanges_and_reuses_the_connection() {
        let (client, mut server) = duplex(16 * 1024);
        let mut connection = Http1ClientConnection::new(Box::new(client), 8 * 1024);

        for round in 0..2 {
            let request = Request::post("http://localhost:8080/echo").body(EntityStreams::once(Bytes::from("ping"))).unwrap();
            let exchange = tokio::spawn(async move {
                let head = connection.send(request).await.unwrap();
                let (body, writer) = EntityStream::with_writer();
                let (reusable, body) = tokio::join!(connection.pump_body(writer), EntityStreams::collect(body));
                (connection, head, reusable, body.unwrap())
            });

            let request = read_request(&mut server).await;
            assert!(request.starts_with("POST /echo HTTP/1.1\r\n"));
            assert!(request.contains("host: localhost:8080\r\n"));
            assert!(request.ends_with("content-length: 4\r\n\r\nping"));
            server.write_all(format!("HTTP/1.1 200 OK\r\ncontent-length: 6\r\n\r\npong-{round}").as_bytes()).await.unwrap();

            let (returned, head, reusable, body) = exchange.await.unwrap();
            connection = returned;
            assert_eq!(head.status(), StatusCode::OK);
            assert!(reusable);
            assert_eq!(body, format!("pong-{round}"));
        }
    }

    #[tokio::test]
    async fn truncated_responses_fail_the_body() {
        let (client, mut server) = duplex(16 * 1024);
        let mut connection = Http1ClientConnection::new(Box::new(client), 8 * 1024);

        let request = Request::get("http://localhost/").body(EntityStreams::empty()).unwrap();
        let exchange = tokio::spawn(async move {
            let _head = connection.send(request).await.unwrap();
            let (body, writer) = EntityStream::with_writer();
            let (reusable, body) = tokio::join!(connection.pump_body(writer), EntityStreams::collect(body));
            (reusable, body)
        });

        let _ = read_request(&mut server).await;
        server.write_all(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n4\r\npart\r\n").await.unwrap();
        drop(server);

        let (reusable, body) = exchange.await.unwrap();
        assert!(!reusable);
        let err = body.unwrap_err();
        assert!(err.downcast_ref::<ParseError>().is_some_and(|e| matches!(e, ParseError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn declined_upgrade_keeps_the_connection() {
        let (client, mut server) = duplex(16 * 1024);
        let connection = Http1ClientConnection::new(Box::new(client), 8 * 1024);
        let upgrade = tokio::spawn(connection.request_upgrade("localhost:8080"));

        let request = read_request(&mut server).await;
        assert!(request.starts_with("OPTIONS * HTTP/1.1\r\n"));
        assert!(request.contains("upgrade: h2c\r\n"));
        server.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n").await.unwrap();

        match upgrade.await.unwrap().unwrap() {
            Upgrade::Declined { status, connection } => {
                assert_eq!(status, StatusCode::OK);
                assert!(connection.is_open());
            }
            Upgrade::Switched(_) => panic!("server declined the upgrade"),
        }
    }
}
