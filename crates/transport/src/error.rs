use std::any::Any;
use std::error::Error;
use std::io;

use http::StatusCode;
use thiserror::Error;

use crate::message::StreamResponse;
use crate::negotiation::NegotiationError;
use crate::pool::PoolError;
use crate::protocol::{HttpError, ParseError, SendError};
use crate::stream::StreamError;
use crate::timeout::TimeoutError;

/// The single error type delivered to callers of the transport.
///
/// Every failure produced below the transport boundary (stream contract violations, pool
/// exhaustion, negotiation failures, timeouts, handler failures and panics) is translated into one
/// of these variants; nothing escapes as an unwinding panic.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("no handler registered for path {path}")]
    HandlerNotFound { path: String },

    #[error("server error: {message}")]
    Application { message: String },

    #[error("{message}")]
    Disrupted { message: String },

    #[error("received error response with status {}", .0.status())]
    ErrorResponse(Box<StreamResponse>),

    #[error("http error: {source}")]
    Http {
        #[from]
        source: HttpError,
    },

    #[error("http/2 error: {source}")]
    H2 {
        #[from]
        source: h2::Error,
    },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("filter failed: {source}")]
    Filter { source: Box<dyn Error + Send + Sync> },

    #[error("panicked while processing the call: {message}")]
    Panic { message: String },

    #[error("transport is shut down")]
    ShutDown,
}

impl TransportError {
    pub fn application<S: ToString>(message: S) -> Self {
        Self::Application { message: message.to_string() }
    }

    pub fn disrupted<S: ToString>(message: S) -> Self {
        Self::Disrupted { message: message.to_string() }
    }

    pub fn invalid_request<S: ToString>(reason: S) -> Self {
        Self::InvalidRequest { reason: reason.to_string() }
    }

    pub fn filter<E: Into<Box<dyn Error + Send + Sync>>>(source: E) -> Self {
        Self::Filter { source: source.into() }
    }

    pub fn error_response(response: StreamResponse) -> Self {
        Self::ErrorResponse(Box::new(response))
    }

    /// Builds a [`TransportError::Panic`] from a caught panic payload.
    pub fn panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panic { message }
    }

    /// Status of an error response, if this error carries one.
    pub fn response_status(&self) -> Option<StatusCode> {
        match self {
            Self::ErrorResponse(response) => Some(response.status()),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Stream(e) => e.downcast_ref::<TimeoutError>().is_some(),
            _ => false,
        }
    }

    /// The innermost error of the `source()` chain.
    pub fn root_cause(&self) -> &(dyn Error + 'static) {
        let mut current: &(dyn Error + 'static) = self;
        while let Some(next) = current.source() {
            current = next;
        }
        current
    }

    /// The negotiation failure behind this error, looking through pool creation failures.
    pub fn negotiation_error(&self) -> Option<&NegotiationError> {
        match self {
            Self::Negotiation(e) => Some(e),
            Self::Pool(pool_error) => {
                let cause = pool_error.creation_cause()?;
                if let Some(e) = cause.downcast_ref::<NegotiationError>() {
                    return Some(e);
                }
                cause.downcast_ref::<TransportError>().and_then(TransportError::negotiation_error)
            }
            _ => None,
        }
    }

    /// Turns a stream failure back into the typed error it carries, when it carries one.
    pub fn from_stream(error: StreamError) -> Self {
        if let Some(timeout) = error.downcast_ref::<TimeoutError>() {
            return Self::Timeout(timeout.clone());
        }
        Self::Stream(error)
    }
}

impl From<ParseError> for TransportError {
    fn from(e: ParseError) -> Self {
        Self::Http { source: HttpError::from(e) }
    }
}

impl From<SendError> for TransportError {
    fn from(e: SendError) -> Self {
        Self::Http { source: HttpError::from(e) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn panic_payloads_become_messages() {
        let err = TransportError::panic(Box::new("static message"));
        assert_eq!(err.to_string(), "panicked while processing the call: static message");

        let err = TransportError::panic(Box::new(String::from("owned message")));
        assert_eq!(err.to_string(), "panicked while processing the call: owned message");
    }

    #[test]
    fn negotiation_error_is_found_through_pool_creation() {
        let cause = TransportError::from(NegotiationError::UnsupportedProtocol { negotiated: "http/1.1".into() });
        let pool_error = PoolError::Creation { pool: "p".into(), source: Arc::new(cause) };
        let err = TransportError::from(pool_error);

        assert!(err.negotiation_error().is_some());
        assert!(err.root_cause().to_string().contains("http/1.1"));
    }

    #[test]
    fn stream_timeouts_are_recovered() {
        let stream_error = StreamError::aborted(TimeoutError::Streaming { timeout_ms: 50 });
        let err = TransportError::from_stream(stream_error);
        assert!(matches!(err, TransportError::Timeout(TimeoutError::Streaming { timeout_ms: 50 })));
        assert!(err.is_timeout());
    }
}
