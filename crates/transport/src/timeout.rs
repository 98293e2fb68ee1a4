//! Request and streaming timeouts.
//!
//! A request timeout bounds the whole call: the time to the response head is bounded by
//! [`with_request_timeout`], the response body by the deadline the client pump carries. A streaming
//! timeout bounds the idle time between two chunks of an [`EntityStream`].

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::stream::{EntityStream, ReadHandle, StreamError, WriteHandle};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeoutError {
    #[error("Exceeded request timeout of {timeout_ms}ms")]
    Request { timeout_ms: u64 },

    #[error("Exceeded stream idle timeout of {timeout_ms}ms")]
    Streaming { timeout_ms: u64 },
}

impl TimeoutError {
    pub fn request(timeout: Duration) -> Self {
        Self::Request { timeout_ms: millis(timeout) }
    }

    pub fn streaming(timeout: Duration) -> Self {
        Self::Streaming { timeout_ms: millis(timeout) }
    }
}

pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Runs `future`, failing with [`TimeoutError::Request`] if it does not finish within `timeout`.
pub async fn with_request_timeout<F, T, E>(timeout: Duration, future: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<TimeoutError>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => {
            debug!(timeout_ms = millis(timeout), "request timed out");
            Err(TimeoutError::request(timeout).into())
        }
    }
}

/// Wraps `stream` so that it fails with [`TimeoutError::Streaming`] when no chunk arrives for
/// `idle`. The idle clock resets on every chunk; on expiry the upstream writer is cancelled.
///
/// The returned stream is driven by a task on the current tokio runtime.
pub fn with_streaming_timeout(stream: EntityStream, idle: Duration) -> EntityStream {
    with_deadline(stream, Deadline::Idle(idle))
}

pub(crate) fn with_deadline(stream: EntityStream, deadline: Deadline) -> EntityStream {
    let output = EntityStream::new();
    let (reader, writer) = match (stream.set_reader(), output.set_writer()) {
        (Ok(reader), Ok(writer)) => (reader, writer),
        (Err(e), Ok(mut writer)) => {
            writer.error(e);
            return output;
        }
        _ => return output,
    };
    tokio::spawn(pump_with_deadline(reader, writer, deadline));
    output
}

/// Deadline enforced by [`pump_with_deadline`].
#[derive(Debug, Clone, Copy)]
pub(crate) enum Deadline {
    /// maximum time between two chunks
    Idle(Duration),
    /// absolute deadline for the whole body
    At { deadline: Instant, timeout: Duration },
}

impl Deadline {
    fn next(&self) -> Instant {
        match self {
            Self::Idle(idle) => Instant::now() + *idle,
            Self::At { deadline, .. } => *deadline,
        }
    }

    fn error(&self) -> TimeoutError {
        match self {
            Self::Idle(idle) => TimeoutError::streaming(*idle),
            Self::At { timeout, .. } => TimeoutError::request(*timeout),
        }
    }
}

/// Moves chunks from `reader` to `writer` while enforcing `deadline`, forwarding demand one chunk
/// at a time. Waiting for downstream demand does not count against an idle deadline, but an
/// absolute deadline also expires while the consumer is not reading.
pub(crate) async fn pump_with_deadline(mut reader: ReadHandle, mut writer: WriteHandle, deadline: Deadline) {
    loop {
        let demand = match deadline {
            Deadline::Idle(_) => writer.write_possible().await,
            Deadline::At { deadline: at, .. } => tokio::select! {
                demand = writer.write_possible() => demand,
                () = sleep_until(at) => {
                    expire(&mut reader, &mut writer, &deadline);
                    return;
                }
            },
        };
        if demand.is_err() {
            reader.cancel();
            return;
        }
        if reader.outstanding() == 0 && reader.request(1).is_err() {
            return;
        }

        let next: Option<Result<Bytes, StreamError>> = tokio::select! {
            item = reader.read() => item,
            () = sleep_until(deadline.next()) => {
                expire(&mut reader, &mut writer, &deadline);
                return;
            }
        };

        match next {
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
            None => {
                let _ = writer.done();
                return;
            }
        }
    }
}

fn expire(reader: &mut ReadHandle, writer: &mut WriteHandle, deadline: &Deadline) {
    let error = deadline.error();
    debug!(cause = %error, "entity stream timed out");
    reader.cancel();
    writer.error(StreamError::aborted(error));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::stream::EntityStreams;

    #[tokio::test(start_paused = true)]
    async fn request_timeout_fires_between_3000_and_3500_ms() {
        let start = Instant::now();
        let result: Result<(), TransportError> = with_request_timeout(Duration::from_millis(3000), async {
            sleep_until(Instant::now() + Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        let elapsed = start.elapsed();
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "Exceeded request timeout of 3000ms");
        assert!(elapsed >= Duration::from_millis(3000));
        assert!(elapsed < Duration::from_millis(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn fast_futures_are_untouched() {
        let result: Result<u32, TransportError> =
            with_request_timeout(Duration::from_millis(100), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_timeout_resets_per_chunk() {
        let source = EntityStream::new();
        let mut writer = source.set_writer().unwrap();
        let guarded = with_streaming_timeout(source, Duration::from_millis(100));

        let producer = tokio::spawn(async move {
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(80)).await;
                writer.send(Bytes::from_static(b"tick")).await.unwrap();
            }
            writer.done().unwrap();
        });

        let body = EntityStreams::collect(guarded).await.unwrap();
        assert_eq!(body.len(), 20);
        producer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_timeout_fails_idle_streams_and_cancels_upstream() {
        let source = EntityStream::new();
        let mut writer = source.set_writer().unwrap();
        let guarded = with_streaming_timeout(source, Duration::from_millis(50));

        let err = EntityStreams::collect(guarded).await.unwrap_err();
        assert_eq!(err.to_string(), "Exceeded stream idle timeout of 50ms");
        assert!(err.downcast_ref::<TimeoutError>().is_some());
        assert!(matches!(writer.write_possible().await, Err(StreamError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn request_deadline_expires_while_nobody_reads() {
        let source = EntityStream::new();
        let mut upstream = source.set_writer().unwrap();
        let timeout = Duration::from_millis(100);
        let guarded = with_deadline(source, Deadline::At { deadline: Instant::now() + timeout, timeout });
        let mut reader = guarded.set_reader().unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(matches!(upstream.write_possible().await, Err(StreamError::Cancelled)));

        reader.request(1).unwrap();
        let err = reader.read().await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Exceeded request timeout of 100ms");
    }
}
