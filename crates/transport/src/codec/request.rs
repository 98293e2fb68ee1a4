//! Request side of the HTTP/1.1 codec: [`RequestDecoder`] for servers, [`RequestEncoder`] for
//! clients.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::error;

use crate::codec::body::{PayloadDecoder, PayloadEncoder};
use crate::codec::head::{DEFAULT_MAX_HEADER_BYTES, decode_request_head, encode_request_head};
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHead, SendError};

/// Decodes a stream of pipelined requests: a head, then its payload items up to `Eof`, then the
/// next head.
#[derive(Debug)]
pub struct RequestDecoder {
    max_header_bytes: usize,
    payload_decoder: Option<PayloadDecoder>,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Self::with_max_header_bytes(DEFAULT_MAX_HEADER_BYTES)
    }

    pub fn with_max_header_bytes(max_header_bytes: usize) -> Self {
        Self { max_header_bytes, payload_decoder: None }
    }
}

impl Default for RequestDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RequestDecoder {
    type Item = Message<(RequestHead, PayloadSize)>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let item = payload_decoder.decode(src)?;
            if matches!(item, Some(PayloadItem::Eof)) {
                self.payload_decoder = None;
            }
            return Ok(item.map(Message::Payload));
        }

        Ok(decode_request_head(src, self.max_header_bytes)?.map(|(head, payload_size)| {
            self.payload_decoder = Some(payload_size.into());
            Message::Header((head, payload_size))
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let item = payload_decoder.decode_eof(src)?;
            if matches!(item, Some(PayloadItem::Eof)) {
                self.payload_decoder = None;
            }
            return Ok(item.map(Message::Payload));
        }
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(ParseError::UnexpectedEof),
        }
    }
}

/// Encodes a request head followed by its payload items.
#[derive(Debug, Default)]
pub struct RequestEncoder {
    payload_encoder: Option<PayloadEncoder>,
}

impl RequestEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<D: Buf> Encoder<Message<(RequestHead, PayloadSize), D>> for RequestEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Message<(RequestHead, PayloadSize), D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Header((head, payload_size)) => {
                if self.payload_encoder.is_some() {
                    error!("expect payload item but receive request head");
                    return Err(SendError::invalid_body("request head written before the previous body ended"));
                }
                self.payload_encoder = Some(payload_size.into());
                encode_request_head(head, payload_size, dst)
            }
            Message::Payload(payload_item) => {
                let Some(encoder) = &mut self.payload_encoder else {
                    error!("expect request head but receive payload item");
                    return Err(SendError::invalid_body("payload written without a request head"));
                };
                let eof = payload_item.is_eof();
                let result = encoder.encode(payload_item, dst);
                if eof {
                    self.payload_encoder = None;
                }
                result
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{Method, Request};

    #[test]
    fn decodes_pipelined_requests() {
        let mut decoder = RequestDecoder::new();
        let mut src = BytesMut::from(
            &b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET /b HTTP/1.1\r\nHost: x\r\n\r\n"[..],
        );

        let Some(Message::Header((head, PayloadSize::Length(3)))) = decoder.decode(&mut src).unwrap() else {
            panic!("expected the first head");
        };
        assert_eq!(head.uri().path(), "/a");
        assert!(matches!(decoder.decode(&mut src).unwrap(), Some(Message::Payload(PayloadItem::Chunk(b))) if &b[..] == b"abc"));
        assert!(matches!(decoder.decode(&mut src).unwrap(), Some(Message::Payload(PayloadItem::Eof))));

        let Some(Message::Header((head, PayloadSize::Empty))) = decoder.decode(&mut src).unwrap() else {
            panic!("expected the second head");
        };
        assert_eq!(*head.method(), Method::GET);
        assert!(matches!(decoder.decode(&mut src).unwrap(), Some(Message::Payload(PayloadItem::Eof))));
        assert!(decoder.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn truncated_body_is_an_error_at_eof() {
        let mut decoder = RequestDecoder::new();
        let mut src = BytesMut::from(&b"POST /a HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc"[..]);
        assert!(decoder.decode(&mut src).unwrap().is_some());
        assert!(decoder.decode(&mut src).unwrap().is_some());
        assert!(matches!(decoder.decode_eof(&mut src), Err(ParseError::UnexpectedEof)));
    }

    #[test]
    fn encodes_head_then_body() {
        let mut encoder = RequestEncoder::new();
        let mut dst = BytesMut::new();
        let head = Request::builder().method(Method::PUT).uri("/x").header("host", "h").body(()).unwrap();

        encoder.encode(Message::<_, Bytes>::Header((head, PayloadSize::Length(2))), &mut dst).unwrap();
        encoder.encode(Message::<(RequestHead, PayloadSize), _>::Payload(PayloadItem::Chunk(Bytes::from_static(b"hi"))), &mut dst).unwrap();
        encoder.encode(Message::<(RequestHead, PayloadSize), Bytes>::Payload(PayloadItem::Eof), &mut dst).unwrap();

        assert_eq!(&dst[..], b"PUT /x HTTP/1.1\r\nhost: h\r\ncontent-length: 2\r\n\r\nhi");
    }
}
