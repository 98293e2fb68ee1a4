use bytes::{Bytes, BytesMut};
use tracing::trace;

use super::{EntityStream, ReadHandle, StreamError, WriteHandle};

/// Demand granted per round trip by the collecting and draining readers.
const BATCH_DEMAND: u64 = 16;

/// Constructors and adapters for [`EntityStream`].
#[derive(Debug)]
pub struct EntityStreams;

impl EntityStreams {
    /// A stream that completes without any chunk.
    pub fn empty() -> EntityStream {
        EntityStream::prefilled(std::iter::empty())
    }

    /// A stream carrying `bytes` as a single chunk, the REST to STREAM adapter.
    pub fn once(bytes: Bytes) -> EntityStream {
        EntityStream::prefilled(std::iter::once(bytes))
    }

    /// A stream carrying `chunks` in order.
    pub fn from_chunks<I: IntoIterator<Item = Bytes>>(chunks: I) -> EntityStream {
        EntityStream::prefilled(chunks)
    }

    /// Reads `stream` to completion and returns its content, the STREAM to REST adapter.
    pub async fn collect(stream: EntityStream) -> Result<Bytes, StreamError> {
        let reader = stream.set_reader()?;
        Self::collect_reader(reader).await
    }

    /// Reads an attached reader to completion.
    pub async fn collect_reader(mut reader: ReadHandle) -> Result<Bytes, StreamError> {
        let mut first: Option<Bytes> = None;
        let mut buf = BytesMut::new();
        loop {
            if reader.outstanding() == 0 {
                reader.request(BATCH_DEMAND)?;
            }
            match reader.read().await {
                Some(Ok(chunk)) => match first.take() {
                    // avoid copying single-chunk bodies
                    None if buf.is_empty() => first = Some(chunk),
                    Some(previous) => {
                        buf.extend_from_slice(&previous);
                        buf.extend_from_slice(&chunk);
                    }
                    None => buf.extend_from_slice(&chunk),
                },
                Some(Err(e)) => return Err(e),
                None => {
                    return Ok(match first {
                        Some(only) => only,
                        None => buf.freeze(),
                    });
                }
            }
        }
    }

    /// The drain reader: discards every chunk and reports how many bytes were thrown away.
    pub async fn drain(stream: EntityStream) -> Result<u64, StreamError> {
        let reader = stream.set_reader()?;
        Self::drain_reader(reader).await
    }

    pub async fn drain_reader(mut reader: ReadHandle) -> Result<u64, StreamError> {
        let mut drained = 0u64;
        loop {
            if reader.outstanding() == 0 {
                reader.request(BATCH_DEMAND)?;
            }
            match reader.read().await {
                Some(Ok(chunk)) => drained += chunk.len() as u64,
                Some(Err(e)) => return Err(e),
                None => {
                    trace!(bytes = drained, "drained entity stream");
                    return Ok(drained);
                }
            }
        }
    }

    /// Moves every chunk from `reader` to `writer`, requesting upstream only as fast as the
    /// downstream reader grants demand. Returns the number of bytes moved.
    ///
    /// Cancellation downstream cancels upstream; an upstream error is forwarded downstream.
    pub async fn pipe(mut reader: ReadHandle, mut writer: WriteHandle) -> Result<u64, StreamError> {
        let mut moved = 0u64;
        loop {
            if let Err(e) = writer.write_possible().await {
                reader.cancel();
                return Err(e);
            }
            if reader.outstanding() == 0 {
                reader.request(1)?;
            }
            match reader.read().await {
                Some(Ok(chunk)) => {
                    moved += chunk.len() as u64;
                    if let Err(e) = writer.write(chunk) {
                        reader.cancel();
                        return Err(e);
                    }
                }
                Some(Err(e)) => {
                    writer.error(e.clone());
                    return Err(e);
                }
                None => {
                    writer.done()?;
                    return Ok(moved);
                }
            }
        }
    }

    /// Concatenates `streams` into one stream, reading each input only after the previous one
    /// completed. The returned stream is driven by a task on the current tokio runtime.
    pub fn concat(streams: Vec<EntityStream>) -> EntityStream {
        let output = EntityStream::new();
        let writer = match output.set_writer() {
            Ok(writer) => writer,
            // a freshly created stream always accepts its writer
            Err(_) => return output,
        };
        tokio::spawn(concat_into(streams, writer));
        output
    }
}

async fn concat_into(streams: Vec<EntityStream>, mut writer: WriteHandle) {
    for input in streams {
        let mut reader = match input.set_reader() {
            Ok(reader) => reader,
            Err(e) => {
                writer.error(e);
                return;
            }
        };
        loop {
            if writer.write_possible().await.is_err() {
                reader.cancel();
                // remaining inputs are dropped unread, which cancels their writers
                return;
            }
            if reader.outstanding() == 0 && reader.request(1).is_err() {
                return;
            }
            match reader.read().await {
                Some(Ok(chunk)) => {
                    if writer.write(chunk).is_err() {
                        reader.cancel();
                        return;
                    }
                }
                Some(Err(e)) => {
                    writer.error(e);
                    return;
                }
                None => break,
            }
        }
    }
    let _ = writer.done();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collect_joins_chunks() {
        let stream = EntityStreams::from_chunks([Bytes::from_static(b"ab"), Bytes::from_static(b"cd")]);
        assert_eq!(&EntityStreams::collect(stream).await.unwrap()[..], b"abcd");

        let single = EntityStreams::once(Bytes::from_static(b"single"));
        assert_eq!(&EntityStreams::collect(single).await.unwrap()[..], b"single");

        assert!(EntityStreams::collect(EntityStreams::empty()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drain_discards_everything() {
        let stream = EntityStreams::from_chunks((0..100).map(|_| Bytes::from_static(b"0123456789")));
        assert_eq!(EntityStreams::drain(stream).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn pipe_forwards_and_completes() {
        let input = EntityStreams::from_chunks([Bytes::from_static(b"x"), Bytes::from_static(b"yz")]);
        let output = EntityStream::new();
        let writer = output.set_writer().unwrap();
        let reader = input.set_reader().unwrap();
        let pump = tokio::spawn(EntityStreams::pipe(reader, writer));

        assert_eq!(&EntityStreams::collect(output).await.unwrap()[..], b"xyz");
        assert_eq!(pump.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn pipe_cancels_upstream_when_downstream_cancels() {
        let input = EntityStream::new();
        let mut upstream = input.set_writer().unwrap();
        let output = EntityStream::new();
        let writer = output.set_writer().unwrap();
        let pump = tokio::spawn(EntityStreams::pipe(input.set_reader().unwrap(), writer));

        let mut downstream = output.set_reader().unwrap();
        downstream.request(1).unwrap();
        upstream.send(Bytes::from_static(b"first")).await.unwrap();
        assert_eq!(&downstream.read().await.unwrap().unwrap()[..], b"first");
        downstream.cancel();

        assert!(pump.await.unwrap().unwrap_err().is_cancelled());
        assert!(matches!(upstream.write_possible().await, Err(StreamError::Cancelled)));
    }

    #[tokio::test]
    async fn concat_preserves_order() {
        let joined = EntityStreams::concat(vec![
            EntityStreams::once(Bytes::from_static(b"head-")),
            EntityStreams::from_chunks([Bytes::from_static(b"mid-"), Bytes::from_static(b"tail")]),
            EntityStreams::empty(),
        ]);
        assert_eq!(&EntityStreams::collect(joined).await.unwrap()[..], b"head-mid-tail");
    }
}
