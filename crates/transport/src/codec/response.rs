//! Response side of the HTTP/1.1 codec: [`ResponseEncoder`] for servers, [`ResponseDecoder`] for
//! clients.

use bytes::{Buf, BytesMut};
use http::Method;
use tokio_util::codec::{Decoder, Encoder};
use tracing::error;

use crate::codec::body::{PayloadDecoder, PayloadEncoder};
use crate::codec::head::{DEFAULT_MAX_HEADER_BYTES, decode_response_head, encode_response_head};
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, ResponseHead, SendError};

#[derive(Debug, Default)]
pub struct ResponseEncoder {
    payload_encoder: Option<PayloadEncoder>,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<D: Buf> Encoder<Message<(ResponseHead, PayloadSize), D>> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Message<(ResponseHead, PayloadSize), D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Header((head, payload_size)) => {
                if self.payload_encoder.is_some() {
                    error!("expect payload item but receive response head");
                    return Err(SendError::invalid_body("response head written before the previous body ended"));
                }
                // interim responses carry no payload of their own
                if !head.status().is_informational() {
                    self.payload_encoder = Some(payload_size.into());
                }
                encode_response_head(head, payload_size, dst)
            }
            Message::Payload(payload_item) => {
                let Some(encoder) = &mut self.payload_encoder else {
                    error!("expect response header but receive payload item");
                    return Err(SendError::invalid_body("payload written without a response head"));
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

/// Decodes one response per request. The decoder must be told the method of the request each
/// response answers, because responses to `HEAD` never carry a body.
#[derive(Debug)]
pub struct ResponseDecoder {
    max_header_bytes: usize,
    request_method: Method,
    payload_decoder: Option<PayloadDecoder>,
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self::with_max_header_bytes(DEFAULT_MAX_HEADER_BYTES)
    }

    pub fn with_max_header_bytes(max_header_bytes: usize) -> Self {
        Self { max_header_bytes, request_method: Method::GET, payload_decoder: None }
    }

    pub fn expect_response_to(&mut self, method: Method) {
        self.request_method = method;
    }
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ResponseDecoder {
    type Item = Message<(ResponseHead, PayloadSize)>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let item = payload_decoder.decode(src)?;
            if matches!(item, Some(PayloadItem::Eof)) {
                self.payload_decoder = None;
            }
            return Ok(item.map(Message::Payload));
        }

        Ok(decode_response_head(src, &self.request_method, self.max_header_bytes)?.map(|(head, payload_size)| {
            if !head.status().is_informational() {
                self.payload_decoder = Some(payload_size.into());
            }
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
