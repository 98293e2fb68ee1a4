use std::io;

use micro_transport::error::TransportError;
use thiserror::Error;

use crate::EncodingType;

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("Unsupported encoding referenced: {0}")]
    UnsupportedEncoding(String),

    #[error("Server returned unrecognized content encoding: {0}")]
    UnrecognizedResponseEncoding(String),

    #[error("invalid accept-encoding header: {0}")]
    InvalidAcceptEncoding(String),

    #[error("requests cannot be encoded with {0}")]
    InvalidRequestEncoding(EncodingType),

    #[error("codec failure: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl From<CompressionError> for TransportError {
    fn from(e: CompressionError) -> Self {
        TransportError::filter(e)
    }
}
