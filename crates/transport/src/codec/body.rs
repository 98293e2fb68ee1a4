//! Payload framing: `Content-Length`, chunked transfer encoding and read-until-close bodies.

use std::io::Write;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use crate::protocol::{ParseError, PayloadItem, PayloadSize, SendError};

/// Longest chunk size line (size plus extensions) accepted before giving up.
const MAX_CHUNK_LINE: usize = 4 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadDecoder {
    kind: DecoderKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DecoderKind {
    Length(u64),
    Chunked(ChunkedState),
    UntilClose,
    Empty,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

impl From<PayloadSize> for PayloadDecoder {
    fn from(payload_size: PayloadSize) -> Self {
        let kind = match payload_size {
            PayloadSize::Length(0) | PayloadSize::Empty => DecoderKind::Empty,
            PayloadSize::Length(n) => DecoderKind::Length(n),
            PayloadSize::Chunked => DecoderKind::Chunked(ChunkedState::Size),
            PayloadSize::UntilClose => DecoderKind::UntilClose,
        };
        Self { kind }
    }
}

impl PayloadDecoder {
    pub fn is_finished(&self) -> bool {
        self.kind == DecoderKind::Finished
    }

    /// Called when the peer closed the connection: a read-until-close body ends here, any other
    /// unfinished body is truncated.
    pub fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<PayloadItem>, ParseError> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        match self.kind {
            DecoderKind::UntilClose => {
                self.kind = DecoderKind::Finished;
                Ok(Some(PayloadItem::Eof))
            }
            DecoderKind::Finished => Ok(None),
            _ => Err(ParseError::UnexpectedEof),
        }
    }
}

impl Decoder for PayloadDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            DecoderKind::Empty => {
                self.kind = DecoderKind::Finished;
                Ok(Some(PayloadItem::Eof))
            }
            DecoderKind::Finished => Ok(None),
            DecoderKind::Length(remaining) => {
                if src.is_empty() {
                    return Ok(None);
                }
                let len = usize::try_from(*remaining).unwrap_or(usize::MAX).min(src.len());
                let bytes = src.split_to(len).freeze();
                *remaining -= len as u64;
                if *remaining == 0 {
                    // the final chunk goes out now, Eof on the next call
                    self.kind = DecoderKind::Empty;
                }
                Ok(Some(PayloadItem::Chunk(bytes)))
            }
            DecoderKind::UntilClose => {
                if src.is_empty() {
                    return Ok(None);
                }
                Ok(Some(PayloadItem::Chunk(src.split().freeze())))
            }
            DecoderKind::Chunked(state) => {
                let item = decode_chunked(state, src)?;
                if matches!(item, Some(PayloadItem::Eof)) {
                    self.kind = DecoderKind::Finished;
                }
                Ok(item)
            }
        }
    }
}

fn decode_chunked(state: &mut ChunkedState, src: &mut BytesMut) -> Result<Option<PayloadItem>, ParseError> {
    loop {
        match *state {
            ChunkedState::Size => {
                let Some(line) = take_line(src)? else { return Ok(None) };
                let size = parse_chunk_size(&line)?;
                trace!(size, "read chunk size");
                *state = if size == 0 { ChunkedState::Trailer } else { ChunkedState::Data(size) };
            }
            ChunkedState::Data(remaining) => {
                if src.is_empty() {
                    return Ok(None);
                }
                let len = usize::try_from(remaining).unwrap_or(usize::MAX).min(src.len());
                let bytes = src.split_to(len).freeze();
                let remaining = remaining - len as u64;
                *state = if remaining == 0 { ChunkedState::DataEnd } else { ChunkedState::Data(remaining) };
                return Ok(Some(PayloadItem::Chunk(bytes)));
            }
            ChunkedState::DataEnd => {
                if src.len() < 2 {
                    return Ok(None);
                }
                if &src[..2] != b"\r\n" {
                    return Err(ParseError::invalid_body("chunk data not followed by CRLF"));
                }
                src.advance(2);
                *state = ChunkedState::Size;
            }
            ChunkedState::Trailer => {
                let Some(line) = take_line(src)? else { return Ok(None) };
                if line.is_empty() {
                    trace!("finished reading chunked data");
                    return Ok(Some(PayloadItem::Eof));
                }
                // trailer fields are not surfaced
            }
        }
    }
}

/// Splits one CRLF terminated line off `src`, without the terminator.
fn take_line(src: &mut BytesMut) -> Result<Option<BytesMut>, ParseError> {
    match src.windows(2).position(|window| window == b"\r\n") {
        Some(end) => {
            let line = src.split_to(end);
            src.advance(2);
            Ok(Some(line))
        }
        None if src.len() > MAX_CHUNK_LINE => Err(ParseError::invalid_body("chunk size line too long")),
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let size = line.split(|b| *b == b';').next().unwrap_or_default().trim_ascii();
    if size.is_empty() {
        return Err(ParseError::invalid_body("empty chunk size"));
    }
    size.iter().try_fold(0u64, |acc, b| {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(ParseError::invalid_body("invalid chunk size")),
        };
        acc.checked_mul(16)
            .and_then(|acc| acc.checked_add(u64::from(digit)))
            .ok_or_else(|| ParseError::invalid_body("invalid overflow chunked length"))
    })
}

/// Frames payload items for the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadEncoder {
    kind: EncoderKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EncoderKind {
    Length(u64),
    Chunked { eof: bool },
    UntilClose { eof: bool },
    Empty,
}

impl From<PayloadSize> for PayloadEncoder {
    fn from(payload_size: PayloadSize) -> Self {
        let kind = match payload_size {
            PayloadSize::Length(0) | PayloadSize::Empty => EncoderKind::Empty,
            PayloadSize::Length(n) => EncoderKind::Length(n),
            PayloadSize::Chunked => EncoderKind::Chunked { eof: false },
            PayloadSize::UntilClose => EncoderKind::UntilClose { eof: false },
        };
        Self { kind }
    }
}

impl PayloadEncoder {
    pub fn is_finish(&self) -> bool {
        match &self.kind {
            EncoderKind::Length(remaining) => *remaining == 0,
            EncoderKind::Chunked { eof } | EncoderKind::UntilClose { eof } => *eof,
            EncoderKind::Empty => true,
        }
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for PayloadEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match (&mut self.kind, item) {
            (EncoderKind::Empty, PayloadItem::Chunk(bytes)) => {
                if bytes.has_remaining() {
                    return Err(SendError::invalid_body("body written to a message declared empty"));
                }
                Ok(())
            }
            (EncoderKind::Empty, PayloadItem::Eof) => Ok(()),

            (EncoderKind::Length(remaining), PayloadItem::Chunk(bytes)) => {
                let len = bytes.remaining() as u64;
                if len > *remaining {
                    return Err(SendError::invalid_body(format!(
                        "body exceeds the declared content-length by {} bytes",
                        len - *remaining
                    )));
                }
                dst.put(bytes);
                *remaining -= len;
                Ok(())
            }
            (EncoderKind::Length(remaining), PayloadItem::Eof) => {
                if *remaining > 0 {
                    warn!(remaining, "body ended before the declared content-length");
                    return Err(SendError::invalid_body("body shorter than the declared content-length"));
                }
                Ok(())
            }

            (EncoderKind::Chunked { eof: true } | EncoderKind::UntilClose { eof: true }, _) => Ok(()),
            (EncoderKind::Chunked { .. }, PayloadItem::Chunk(bytes)) => {
                if !bytes.has_remaining() {
                    return Ok(());
                }
                write!((&mut *dst).writer(), "{:X}\r\n", bytes.remaining())?;
                dst.put(bytes);
                dst.put_slice(b"\r\n");
                Ok(())
            }
            (EncoderKind::Chunked { eof }, PayloadItem::Eof) => {
                *eof = true;
                dst.put_slice(b"0\r\n\r\n");
                Ok(())
            }
            (EncoderKind::UntilClose { .. }, PayloadItem::Chunk(bytes)) => {
                dst.put(bytes);
                Ok(())
            }
            (EncoderKind::UntilClose { eof }, PayloadItem::Eof) => {
                *eof = true;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn decode_all(decoder: &mut PayloadDecoder, src: &mut BytesMut) -> Vec<PayloadItem> {
        let mut items = Vec::new();
        while let Some(item) = decoder.decode(src).unwrap() {
            let eof = item.is_eof();
            items.push(item);
            if eof {
                break;
            }
        }
        items
    }

    #[test]
    fn length_body() {
        let mut decoder = PayloadDecoder::from(PayloadSize::Length(10));
        let mut src = BytesMut::from(&b"0123456789GET / HTTP/1.1"[..]);

        let items = decode_all(&mut decoder, &mut src);
        assert_eq!(items, vec![PayloadItem::Chunk(Bytes::from_static(b"0123456789")), PayloadItem::Eof]);
        assert_eq!(&src[..], b"GET / HTTP/1.1");
        assert!(decoder.is_finished());
    }

    #[test]
    fn chunked_body_with_extensions_and_trailers() {
        let mut decoder = PayloadDecoder::from(PayloadSize::Chunked);
        let mut src = BytesMut::from(&b"5;ext=1\r\nhello\r\nA\r\n0123456789\r\n0\r\nExpires: never\r\n\r\nnext"[..]);

        let items = decode_all(&mut decoder, &mut src);
        assert_eq!(
            items,
            vec![
                PayloadItem::Chunk(Bytes::from_static(b"hello")),
                PayloadItem::Chunk(Bytes::from_static(b"0123456789")),
                PayloadItem::Eof
            ]
        );
        assert_eq!(&src[..], b"next");
    }

    #[test]
    fn chunked_body_split_across_reads() {
        let mut decoder = PayloadDecoder::from(PayloadSize::Chunked);
        let mut src = BytesMut::from(&b"4\r"[..]);
        assert_eq!(decoder.decode(&mut src).unwrap(), None);

        src.extend_from_slice(b"\nab");
        assert_eq!(decoder.decode(&mut src).unwrap(), Some(PayloadItem::Chunk(Bytes::from_static(b"ab"))));
        src.extend_from_slice(b"cd\r\n0\r\n\r\n");
        assert_eq!(decoder.decode(&mut src).unwrap(), Some(PayloadItem::Chunk(Bytes::from_static(b"cd"))));
        assert_eq!(decoder.decode(&mut src).unwrap(), Some(PayloadItem::Eof));
    }

    #[test]
    fn invalid_chunk_size() {
        let mut decoder = PayloadDecoder::from(PayloadSize::Chunked);
        let mut src = BytesMut::from(&b"zz\r\n"[..]);
        assert!(decoder.decode(&mut src).is_err());

        let mut decoder = PayloadDecoder::from(PayloadSize::Chunked);
        let mut src = BytesMut::from(&b"fffffffffffffffff\r\n"[..]);
        assert!(decoder.decode(&mut src).is_err());
    }

    #[test]
    fn eof_truncates_framed_bodies_only() {
        let mut decoder = PayloadDecoder::from(PayloadSize::Length(10));
        let mut src = BytesMut::from(&b"0123"[..]);
        assert!(decoder.decode_eof(&mut src).unwrap().is_some());
        assert!(matches!(decoder.decode_eof(&mut src), Err(ParseError::UnexpectedEof)));

        let mut decoder = PayloadDecoder::from(PayloadSize::UntilClose);
        let mut src = BytesMut::from(&b"rest"[..]);
        assert_eq!(decoder.decode_eof(&mut src).unwrap(), Some(PayloadItem::Chunk(Bytes::from_static(b"rest"))));
        assert_eq!(decoder.decode_eof(&mut src).unwrap(), Some(PayloadItem::Eof));
    }

    #[test]
    fn chunked_encoding() {
        let mut encoder = PayloadEncoder::from(PayloadSize::Chunked);
        let mut dst = BytesMut::new();
        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"0123456789abcdef")), &mut dst).unwrap();
        encoder.encode(PayloadItem::<Bytes>::Eof, &mut dst).unwrap();

        assert_eq!(&dst[..], b"10\r\n0123456789abcdef\r\n0\r\n\r\n");
        assert!(encoder.is_finish());
    }

    #[test]
    fn length_encoding_enforces_the_declared_length() {
        let mut encoder = PayloadEncoder::from(PayloadSize::Length(3));
        let mut dst = BytesMut::new();
        assert!(encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"abcd")), &mut dst).is_err());

        let mut encoder = PayloadEncoder::from(PayloadSize::Length(3));
        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"ab")), &mut dst).unwrap();
        assert!(encoder.encode(PayloadItem::<Bytes>::Eof, &mut dst).is_err());
    }
}
