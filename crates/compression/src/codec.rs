//! Streaming codecs over entity streams.
//!
//! Each codec runs one write-side encoder or decoder on a tokio task between two entity streams.
//! The task reads its input only while the output's reader has demand outstanding, so compressing
//! or decompressing a body never buffers more than the codec's own window.

use std::io::{self, Write};

use bytes::{Bytes, BytesMut};
use flate2::Compression;
use flate2::write::{GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder};
use futures::StreamExt;
use micro_transport::stream::{EntityStream, ReadHandle, StreamError, WriteHandle};
use tracing::{debug, trace};
use zstd::stream::write::{Decoder as ZstdDecoder, Encoder as ZstdEncoder};

use crate::EncodingType;

/// A content coding able to transform entity streams incrementally.
pub trait StreamingCompressor: Send + Sync {
    fn content_encoding(&self) -> EncodingType;

    /// Compresses `stream`; the returned stream is driven by a task on the current runtime.
    fn deflate(&self, stream: EntityStream) -> EntityStream;

    /// Decompresses `stream`; corrupt input fails the returned stream.
    fn inflate(&self, stream: EntityStream) -> EntityStream;
}

/// The [`StreamingCompressor`] of every coding in [`EncodingType::CODECS`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Codec {
    coding: EncodingType,
}

impl Codec {
    pub(crate) fn new(coding: EncodingType) -> Self {
        Self { coding }
    }
}

impl StreamingCompressor for Codec {
    fn content_encoding(&self) -> EncodingType {
        self.coding
    }

    fn deflate(&self, stream: EntityStream) -> EntityStream {
        transcode(stream, Coder::encoder(self.coding))
    }

    fn inflate(&self, stream: EntityStream) -> EntityStream {
        transcode(stream, Coder::decoder(self.coding))
    }
}

// inspired by actix-http
pub(crate) struct Writer {
    buf: BytesMut,
}

impl Writer {
    fn new() -> Self {
        Self { buf: BytesMut::with_capacity(4096) }
    }

    fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

impl io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Coder {
    GzipEncoder(GzEncoder<Writer>),
    DeflateEncoder(ZlibEncoder<Writer>),
    ZstdEncoder(ZstdEncoder<'static, Writer>),
    BrotliEncoder(Box<brotli::CompressorWriter<Writer>>),
    GzipDecoder(GzDecoder<Writer>),
    DeflateDecoder(ZlibDecoder<Writer>),
    ZstdDecoder(ZstdDecoder<'static, Writer>),
    BrotliDecoder(Box<brotli::DecompressorWriter<Writer>>),
}

impl Coder {
    fn encoder(coding: EncodingType) -> io::Result<Self> {
        Ok(match coding {
            EncodingType::Gzip => Self::GzipEncoder(GzEncoder::new(Writer::new(), Compression::default())),
            EncodingType::Deflate => Self::DeflateEncoder(ZlibEncoder::new(Writer::new(), Compression::default())),
            EncodingType::Zstd => Self::ZstdEncoder(ZstdEncoder::new(Writer::new(), 3)?),
            EncodingType::Brotli => Self::BrotliEncoder(Box::new(brotli::CompressorWriter::new(
                Writer::new(),
                32 * 1024, // buffer size
                5,         // quality
                22,        // window bits
            ))),
            EncodingType::Identity | EncodingType::Any => return Err(no_codec(coding)),
        })
    }

    fn decoder(coding: EncodingType) -> io::Result<Self> {
        Ok(match coding {
            EncodingType::Gzip => Self::GzipDecoder(GzDecoder::new(Writer::new())),
            EncodingType::Deflate => Self::DeflateDecoder(ZlibDecoder::new(Writer::new())),
            EncodingType::Zstd => Self::ZstdDecoder(ZstdDecoder::new(Writer::new())?),
            EncodingType::Brotli => Self::BrotliDecoder(Box::new(brotli::DecompressorWriter::new(Writer::new(), 32 * 1024))),
            EncodingType::Identity | EncodingType::Any => return Err(no_codec(coding)),
        })
    }

    /// Feeds `data` and returns whatever output the codec produced so far.
    fn transcode(&mut self, data: &[u8]) -> io::Result<Bytes> {
        match self {
            Self::GzipEncoder(encoder) => encoder.write_all(data)?,
            Self::DeflateEncoder(encoder) => encoder.write_all(data)?,
            Self::ZstdEncoder(encoder) => encoder.write_all(data)?,
            Self::BrotliEncoder(encoder) => encoder.write_all(data)?,
            Self::GzipDecoder(decoder) => {
                decoder.write_all(data)?;
                decoder.flush()?;
            }
            Self::DeflateDecoder(decoder) => {
                decoder.write_all(data)?;
                decoder.flush()?;
            }
            Self::ZstdDecoder(decoder) => {
                decoder.write_all(data)?;
                decoder.flush()?;
            }
            Self::BrotliDecoder(decoder) => {
                decoder.write_all(data)?;
                decoder.flush()?;
            }
        }
        Ok(self.take())
    }

    fn take(&mut self) -> Bytes {
        match self {
            Self::GzipEncoder(encoder) => encoder.get_mut().take(),
            Self::DeflateEncoder(encoder) => encoder.get_mut().take(),
            Self::ZstdEncoder(encoder) => encoder.get_mut().take(),
            Self::BrotliEncoder(encoder) => encoder.get_mut().take(),
            Self::GzipDecoder(decoder) => decoder.get_mut().take(),
            Self::DeflateDecoder(decoder) => decoder.get_mut().take(),
            Self::ZstdDecoder(decoder) => decoder.get_mut().take(),
            Self::BrotliDecoder(decoder) => decoder.get_mut().take(),
        }
    }

    /// Ends the coded stream and returns the remaining output.
    fn finish(self) -> io::Result<Bytes> {
        let mut writer = match self {
            Self::GzipEncoder(encoder) => encoder.finish()?,
            Self::DeflateEncoder(encoder) => encoder.finish()?,
            Self::ZstdEncoder(encoder) => encoder.finish()?,
            Self::BrotliEncoder(encoder) => encoder.into_inner(),
            Self::GzipDecoder(decoder) => decoder.finish()?,
            Self::DeflateDecoder(decoder) => decoder.finish()?,
            Self::ZstdDecoder(mut decoder) => {
                decoder.flush()?;
                decoder.into_inner()
            }
            Self::BrotliDecoder(decoder) => decoder
                .into_inner()
                .map_err(|_incomplete| io::Error::new(io::ErrorKind::UnexpectedEof, "truncated brotli stream"))?,
        };
        Ok(writer.take())
    }
}

fn no_codec(coding: EncodingType) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("{coding} has no codec"))
}

fn transcode(input: EntityStream, coder: io::Result<Coder>) -> EntityStream {
    let output = EntityStream::new();
    let Ok(mut writer) = output.set_writer() else {
        return output;
    };
    let reader = match input.set_reader() {
        Ok(reader) => reader,
        Err(e) => {
            writer.error(e);
            return output;
        }
    };
    match coder {
        Ok(coder) => {
            tokio::spawn(pump(reader, writer, coder));
        }
        Err(e) => writer.error(StreamError::aborted(e)),
    }
    output
}

async fn pump(mut reader: ReadHandle, mut writer: WriteHandle, coder: Coder) {
    let mut coder = Some(coder);
    while coder.is_some() {
        if writer.write_possible().await.is_err() {
            reader.cancel();
            return;
        }

        // read until the codec has something to hand downstream
        let produced = loop {
            let result = match (reader.next().await, coder.as_mut()) {
                (Some(Ok(chunk)), Some(active)) => active.transcode(&chunk),
                (Some(Err(e)), _) => {
                    writer.error(e);
                    return;
                }
                (None, Some(_)) => match coder.take() {
                    Some(finished) => finished.finish(),
                    None => return,
                },
                (_, None) => return,
            };
            match result {
                Ok(bytes) if bytes.is_empty() && coder.is_some() => {}
                Ok(bytes) => break bytes,
                Err(e) => {
                    debug!(cause = %e, "codec failed");
                    reader.cancel();
                    writer.error(StreamError::aborted(e));
                    return;
                }
            }
        };

        trace!(len = produced.len(), "codec produced chunk");
        if !produced.is_empty() && writer.write(produced).is_err() {
            reader.cancel();
            return;
        }
    }
    let _ = writer.done();
}
