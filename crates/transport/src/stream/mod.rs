//! Backpressure-aware entity streams.
//!
//! An [`EntityStream`] moves a message body from exactly one writer to exactly one reader without
//! unbounded buffering. The reader drives the exchange: it grants demand through
//! [`ReadHandle::request`], and the writer may only push a chunk while outstanding demand is
//! positive. Cumulative chunks written therefore never exceed cumulative demand granted.
//!
//! # Components
//!
//! - [`EntityStream`]: the shared pipe, created in the `Created` state
//! - [`ReadHandle`]: reader capability (request demand, read chunks, cancel)
//! - [`WriteHandle`]: writer capability (wait for demand, write, done, error)
//! - [`Observer`]: passive listener that sees every chunk and the terminal signal
//! - [`EntityStreams`]: constructors and adapters (empty, once, collect, drain, concat, pipe)
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use micro_transport::stream::{EntityStream, EntityStreams};
//!
//! # async fn run() -> Result<(), micro_transport::stream::StreamError> {
//! let stream = EntityStream::new();
//! let mut writer = stream.set_writer()?;
//! tokio::spawn(async move {
//!     for chunk in ["hello", " ", "world"] {
//!         if writer.send(Bytes::from_static(chunk.as_bytes())).await.is_err() {
//!             return;
//!         }
//!     }
//!     let _ = writer.done();
//! });
//!
//! let body = EntityStreams::collect(stream).await?;
//! assert_eq!(&body[..], b"hello world");
//! # Ok(())
//! # }
//! ```

mod entity_stream;
mod streams;

pub use entity_stream::EntityStream;
pub use entity_stream::Observer;
pub use entity_stream::ReadHandle;
pub use entity_stream::StreamPhase;
pub use entity_stream::StreamStats;
pub use entity_stream::WriteHandle;
pub use streams::EntityStreams;

use std::error::Error;
use std::sync::Arc;
use thiserror::Error;

/// Errors observed by either end of an [`EntityStream`].
///
/// The type is cheap to clone because a single failure is reported to both the writer and the
/// reader (and to every observer).
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("illegal entity stream state: {reason}")]
    IllegalState { reason: &'static str },

    #[error("chunk written without outstanding demand")]
    WriteWithoutDemand,

    #[error("entity stream cancelled by reader")]
    Cancelled,

    #[error("entity stream writer dropped before completing")]
    WriterDropped,

    #[error(transparent)]
    Aborted(Arc<dyn Error + Send + Sync>),
}

impl StreamError {
    pub fn illegal_state(reason: &'static str) -> Self {
        Self::IllegalState { reason }
    }

    /// Wraps an arbitrary cause, e.g. a timeout or a decoding failure, as a stream abort.
    pub fn aborted<E: Into<Box<dyn Error + Send + Sync>>>(cause: E) -> Self {
        Self::Aborted(Arc::from(cause.into()))
    }

    /// Returns the abort cause if it is of type `E`.
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        match self {
            Self::Aborted(cause) => cause.downcast_ref::<E>(),
            _ => None,
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
