//! Reading just enough of a body to decide whether it is worth compressing.

use bytes::Bytes;
use micro_transport::stream::{EntityStream, EntityStreams, StreamError};

/// Outcome of [`read_partial`].
#[derive(Debug)]
pub(crate) enum PartialRead {
    /// the body ended below the threshold; these are all its chunks
    Complete(Vec<Bytes>),
    /// the body reached the threshold; the stream replays the chunks read so far followed by the
    /// unread rest
    Exceeds(EntityStream),
}

/// Reads `stream` until `threshold` bytes are buffered or the body ends.
pub(crate) async fn read_partial(stream: EntityStream, threshold: usize) -> Result<PartialRead, StreamError> {
    let mut reader = stream.set_reader()?;
    let mut chunks = Vec::new();
    let mut buffered = 0usize;
    while buffered < threshold {
        if reader.outstanding() == 0 {
            reader.request(1)?;
        }
        match reader.read().await {
            Some(Ok(chunk)) => {
                buffered += chunk.len();
                chunks.push(chunk);
            }
            Some(Err(e)) => return Err(e),
            None => return Ok(PartialRead::Complete(chunks)),
        }
    }

    let rest = EntityStream::new();
    let writer = rest.set_writer()?;
    tokio::spawn(EntityStreams::pipe(reader, writer));
    Ok(PartialRead::Exceeds(EntityStreams::concat(vec![EntityStreams::from_chunks(chunks), rest])))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunks(sizes: &[usize]) -> EntityStream {
        EntityStreams::from_chunks(sizes.iter().map(|&n| Bytes::from(vec![b'x'; n])))
    }

    #[tokio::test]
    async fn short_bodies_are_read_completely() {
        match read_partial(chunks(&[3, 3, 3]), 10).await.unwrap() {
            PartialRead::Complete(read) => assert_eq!(read.iter().map(Bytes::len).sum::<usize>(), 9),
            PartialRead::Exceeds(_) => panic!("9 bytes do not reach 10"),
        }
        assert!(matches!(read_partial(EntityStreams::empty(), 1).await.unwrap(), PartialRead::Complete(read) if read.is_empty()));
    }

    #[tokio::test]
    async fn long_bodies_are_replayed_whole() {
        match read_partial(chunks(&[4, 4, 4, 4]), 10).await.unwrap() {
            PartialRead::Exceeds(stream) => assert_eq!(EntityStreams::collect(stream).await.unwrap().len(), 16),
            PartialRead::Complete(_) => panic!("16 bytes reach 10"),
        }
        assert!(matches!(read_partial(chunks(&[10]), 10).await.unwrap(), PartialRead::Exceeds(_)));
    }

    #[tokio::test]
    async fn zero_threshold_reads_nothing() {
        let stream = chunks(&[5]);
        match read_partial(stream, 0).await.unwrap() {
            PartialRead::Exceeds(stream) => assert_eq!(EntityStreams::collect(stream).await.unwrap().len(), 5),
            PartialRead::Complete(_) => panic!("a zero threshold always compresses"),
        }
    }
}
