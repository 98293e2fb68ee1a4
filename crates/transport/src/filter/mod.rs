//! Bidirectional request/response/error processing.
//!
//! A [`FilterChain`] is an immutable, ordered list of [`StreamFilter`]s shared by every call of a
//! client or server. Requests visit the filters first to last and end at an [`Endpoint`] (the wire
//! on the client, the dispatcher on the server); responses and errors travel back in reverse
//! order, through exactly the filters the request went through.
//!
//! Buffered filters implement [`RestFilter`] and are adapted into the streaming chain by
//! [`FilterChainBuilder::add_last_rest`] and friends.

mod adapter;
mod chain;

pub use adapter::RestFilterAdapter;
pub use chain::FilterChain;
pub use chain::FilterChainBuilder;
pub(crate) use chain::guarded;

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::error::TransportError;
use crate::message::{RestRequest, RestResponse, StreamRequest, StreamResponse, WireAttributes};

/// Outcome of a filter's request hook.
#[derive(Debug)]
pub enum FilterFlow {
    /// hand the (possibly rewritten) request to the next filter
    Next(StreamRequest),
    /// complete the call here; the response travels back through the earlier filters only
    Respond(StreamResponse),
}

/// A filter over streaming messages. Every hook defaults to passing its input through untouched,
/// so a filter only implements the capabilities it has.
///
/// Filters are shared by concurrent calls and must keep any state of their own synchronized.
#[async_trait]
pub trait StreamFilter: Send + Sync {
    async fn on_request(
        &self,
        request: StreamRequest,
        _ctx: &mut RequestContext,
        _wire: &mut WireAttributes,
    ) -> Result<FilterFlow, TransportError> {
        Ok(FilterFlow::Next(request))
    }

    async fn on_response(
        &self,
        response: StreamResponse,
        _ctx: &mut RequestContext,
        _wire: &mut WireAttributes,
    ) -> Result<StreamResponse, TransportError> {
        Ok(response)
    }

    /// May recover from `error` by returning a response.
    async fn on_error(
        &self,
        error: TransportError,
        _ctx: &mut RequestContext,
        _wire: &mut WireAttributes,
    ) -> Result<StreamResponse, TransportError> {
        Err(error)
    }
}

#[derive(Debug)]
pub enum RestFlow {
    Next(RestRequest),
    Respond(RestResponse),
}

/// A filter over buffered messages.
#[async_trait]
pub trait RestFilter: Send + Sync {
    async fn on_request(
        &self,
        request: RestRequest,
        _ctx: &mut RequestContext,
        _wire: &mut WireAttributes,
    ) -> Result<RestFlow, TransportError> {
        Ok(RestFlow::Next(request))
    }

    async fn on_response(
        &self,
        response: RestResponse,
        _ctx: &mut RequestContext,
        _wire: &mut WireAttributes,
    ) -> Result<RestResponse, TransportError> {
        Ok(response)
    }

    async fn on_error(
        &self,
        error: TransportError,
        _ctx: &mut RequestContext,
        _wire: &mut WireAttributes,
    ) -> Result<RestResponse, TransportError> {
        Err(error)
    }
}

/// The end of a filter chain.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn handle(
        &self,
        request: StreamRequest,
        ctx: &mut RequestContext,
        wire: &mut WireAttributes,
    ) -> Result<StreamResponse, TransportError>;
}
