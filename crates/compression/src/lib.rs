//! Streaming body compression for micro-transport.
//!
//! Codecs transform [`EntityStream`](micro_transport::stream::EntityStream)s incrementally, so a
//! body is never buffered whole to be compressed. Two filters put them to work:
//!
//! - [`ClientCompressionFilter`] compresses request bodies above a threshold, sends
//!   `Accept-Encoding` and inflates responses
//! - [`ServerCompressionFilter`] inflates request bodies and compresses responses in the coding the
//!   client prefers
//!
//! Bodies below the threshold travel unmodified and without `Content-Encoding`.

mod accept;
mod client;
mod codec;
mod config;
mod encoding;
mod error;
mod partial;
mod server;

pub use accept::AcceptEncoding;
pub use client::ClientCompressionFilter;
pub use client::RESPONSE_COMPRESSION_THRESHOLD_HEADER;
pub use codec::StreamingCompressor;
pub use config::CompressionConfig;
pub use config::CompressionOption;
pub use encoding::EncodingType;
pub use error::CompressionError;
pub use server::ServerCompressionFilter;
