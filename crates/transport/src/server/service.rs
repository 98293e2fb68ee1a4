use std::time::Duration;

use http::Request;
use tokio::time::Instant;
use tracing::debug;

use crate::connection::ConnectionInfo;
use crate::context::{RequestContext, keys};
use crate::dispatcher::{TransportDispatcher, into_error_response};
use crate::filter::FilterChain;
use crate::message::{StreamRequest, StreamResponse, WireAttributes};
use crate::timeout::with_streaming_timeout;

/// What every server connection calls for a decoded request: the filter chain ending at the
/// dispatcher. Failures never escape; they become error responses.
#[derive(Debug)]
pub(crate) struct ServerService {
    chain: FilterChain,
    dispatcher: TransportDispatcher,
    streaming_timeout: Option<Duration>,
    h2c: bool,
}

impl ServerService {
    pub(crate) fn new(
        chain: FilterChain,
        dispatcher: TransportDispatcher,
        streaming_timeout: Option<Duration>,
        h2c: bool,
    ) -> Self {
        Self { chain, dispatcher, streaming_timeout, h2c }
    }

    /// Whether clear text connections may upgrade to HTTP/2.
    pub(crate) fn allows_h2c(&self) -> bool {
        self.h2c
    }

    pub(crate) async fn serve(&self, request: StreamRequest, info: ConnectionInfo) -> StreamResponse {
        let (mut parts, body) = request.into_parts();
        let body = match self.streaming_timeout {
            Some(idle) => with_streaming_timeout(body, idle),
            None => body,
        };

        let mut wire = WireAttributes::take_from_headers(&mut parts.headers);
        let mut ctx = RequestContext::new();
        ctx.put_local_attr(keys::REMOTE_ADDRESS, info.remote_addr);
        ctx.put_local_attr(keys::HTTP_PROTOCOL, info.protocol);
        ctx.put_local_attr(keys::REQUEST_START_TIME, Instant::now());

        debug!(method = %parts.method, uri = %parts.uri, protocol = %info.protocol, "serving request");
        let request = Request::from_parts(parts, body);
        let mut response =
            self.chain.process(request, &mut ctx, &mut wire, &self.dispatcher).await.unwrap_or_else(into_error_response);
        wire.write_headers(response.headers_mut());
        response
    }
}
