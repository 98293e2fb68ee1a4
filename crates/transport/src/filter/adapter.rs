use async_trait::async_trait;

use super::{FilterFlow, RestFilter, RestFlow, StreamFilter};
use crate::context::RequestContext;
use crate::error::TransportError;
use crate::message::{
    StreamRequest, StreamResponse, WireAttributes, to_rest_request, to_rest_response, to_stream_request,
    to_stream_response,
};

/// Runs a [`RestFilter`] inside a streaming chain by buffering each message to completion and
/// re-wrapping the result as a single chunk.
#[derive(Debug)]
pub struct RestFilterAdapter<F> {
    inner: F,
}

impl<F: RestFilter> RestFilterAdapter<F> {
    pub fn new(inner: F) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<F: RestFilter> StreamFilter for RestFilterAdapter<F> {
    async fn on_request(
        &self,
        request: StreamRequest,
        ctx: &mut RequestContext,
        wire: &mut WireAttributes,
    ) -> Result<FilterFlow, TransportError> {
        let request = to_rest_request(request).await.map_err(TransportError::from_stream)?;
        Ok(match self.inner.on_request(request, ctx, wire).await? {
            RestFlow::Next(request) => FilterFlow::Next(to_stream_request(request)),
            RestFlow::Respond(response) => FilterFlow::Respond(to_stream_response(response)),
        })
    }

    async fn on_response(
        &self,
        response: StreamResponse,
        ctx: &mut RequestContext,
        wire: &mut WireAttributes,
    ) -> Result<StreamResponse, TransportError> {
        let response = to_rest_response(response).await.map_err(TransportError::from_stream)?;
        let response = self.inner.on_response(response, ctx, wire).await?;
        Ok(to_stream_response(response))
    }

    async fn on_error(
        &self,
        error: TransportError,
        ctx: &mut RequestContext,
        wire: &mut WireAttributes,
    ) -> Result<StreamResponse, TransportError> {
        self.inner.on_error(error, ctx, wire).await.map(to_stream_response)
    }
}
