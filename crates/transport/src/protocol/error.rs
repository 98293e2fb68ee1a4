//! Framing failures of the HTTP/1.1 codec.
//!
//! [`ParseError`] is raised while reading a message off a connection, [`SendError`] while writing
//! one. Both surface to callers wrapped in [`crate::error::TransportError::Http`].

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("malformed message received: {source}")]
    Parse {
        #[from]
        source: ParseError,
    },

    #[error("message could not be sent: {source}")]
    Send {
        #[from]
        source: SendError,
    },
}

#[derive(Error, Debug)]
pub enum ParseError {
    /// the head did not end within the configured `max_header_bytes`
    #[error("message head of {current_size} bytes exceeds the limit of {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("more than {max_num} header fields")]
    TooManyHeaders { max_num: usize },

    #[error("invalid header field: {reason}")]
    InvalidHeader { reason: String },

    #[error("unsupported http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid request method")]
    InvalidMethod,

    #[error("invalid request target")]
    InvalidUri,

    #[error("invalid status code: {0:?}")]
    InvalidStatus(Option<u16>),

    #[error("invalid content-length: {reason}")]
    InvalidContentLength { reason: String },

    /// chunked framing violations and bodies on messages that cannot have one
    #[error("invalid message body: {reason}")]
    InvalidBody { reason: String },

    /// The peer closed the connection inside a message. This is how a peer that failed while
    /// writing a body shows up on HTTP/1.1.
    #[error("connection closed before the message was complete")]
    UnexpectedEof,

    #[error("reading from the connection failed: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(reason: S) -> Self {
        Self::InvalidHeader { reason: reason.to_string() }
    }

    pub fn invalid_body<S: ToString>(reason: S) -> Self {
        Self::InvalidBody { reason: reason.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(reason: S) -> Self {
        Self::InvalidContentLength { reason: reason.to_string() }
    }

    /// Whether the connection just went away, as opposed to the peer sending garbage.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::UnexpectedEof)
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid message body: {reason}")]
    InvalidBody { reason: String },

    #[error("cannot send {0:?} messages over this connection")]
    UnsupportedVersion(http::Version),

    #[error("writing to the connection failed: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(reason: S) -> Self {
        Self::InvalidBody { reason: reason.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}
