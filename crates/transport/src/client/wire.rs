use std::time::Duration;

use async_trait::async_trait;
use http::{Request, Response, Uri};
use tokio::time::{Instant, sleep_until, timeout_at};
use tracing::{debug, warn};

use crate::connection::{ClientConnection, PendingBody};
use crate::context::{RequestContext, keys};
use crate::disrupt::{DisruptContext, disrupt_request};
use crate::error::TransportError;
use crate::filter::Endpoint;
use crate::message::{StreamRequest, StreamResponse, WireAttributes};
use crate::negotiation::{NegotiationError, SslSessionValidatorRef};
use crate::pool::{Lease, PoolKey, PoolManager};
use crate::protocol::ResponseHead;
use crate::stream::EntityStream;
use crate::timeout::{Deadline, TimeoutError, with_deadline, with_streaming_timeout};

/// The end of the client filter chain: puts the request on a pooled connection.
///
/// The request timeout runs from the call's start time until the last byte of the response body,
/// the streaming timeout between two response body chunks. A response with an error status fails
/// the call with [`TransportError::ErrorResponse`].
pub(crate) struct WireEndpoint {
    pools: PoolManager<ClientConnection>,
    request_timeout: Duration,
    streaming_timeout: Option<Duration>,
}

impl WireEndpoint {
    pub(crate) fn new(
        pools: PoolManager<ClientConnection>,
        request_timeout: Duration,
        streaming_timeout: Option<Duration>,
    ) -> Self {
        Self { pools, request_timeout, streaming_timeout }
    }

    pub(crate) fn pools(&self) -> &PoolManager<ClientConnection> {
        &self.pools
    }

    async fn exchange(
        &self,
        key: &PoolKey,
        request: StreamRequest,
        validator: Option<SslSessionValidatorRef>,
    ) -> Result<(ResponseHead, PendingBody, Lease<ClientConnection>), TransportError> {
        let mut lease = self.pools.get(key).await?;
        if let Some(validator) = validator {
            let verdict = match lease.ssl_session() {
                Some(session) => validator.validate(session).map_err(|e| e.to_string()),
                None => Err("connection is not secured by TLS".to_string()),
            };
            if let Err(reason) = verdict {
                // the connection itself is healthy
                lease.put();
                return Err(NegotiationError::SessionRejected { reason }.into());
            }
        }

        match lease.send(request).await {
            Ok((head, pending)) => Ok((head, pending, lease)),
            Err(e) => {
                lease.dispose();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Endpoint for WireEndpoint {
    async fn handle(
        &self,
        request: StreamRequest,
        ctx: &mut RequestContext,
        wire: &mut WireAttributes,
    ) -> Result<StreamResponse, TransportError> {
        let release = match DisruptContext::take(ctx) {
            Some(disrupt) => disrupt_request(disrupt, ctx, self.request_timeout).await?,
            None => None,
        };

        let started = ctx.get_local_attr::<Instant>(keys::REQUEST_START_TIME).copied().unwrap_or_else(Instant::now);
        let deadline = started + self.request_timeout;
        let key = pool_key(request.uri())?;
        let validator = ctx.get_local_attr::<SslSessionValidatorRef>(keys::SSL_SESSION_VALIDATOR).cloned();

        let (mut parts, body) = request.into_parts();
        wire.write_headers(&mut parts.headers);
        debug!(method = %parts.method, uri = %parts.uri, pool = %key, "sending request");
        let request = Request::from_parts(parts, body);

        let (head, pending, mut lease) = timeout_at(deadline, self.exchange(&key, request, validator))
            .await
            .map_err(|_elapsed| TimeoutError::request(self.request_timeout))??;

        let (body, writer) = EntityStream::with_writer();
        tokio::spawn(async move {
            if lease.pump_body(pending, writer).await {
                lease.put();
            } else {
                lease.dispose();
            }
        });

        let mut body = with_deadline(body, Deadline::At { deadline, timeout: self.request_timeout });
        if let Some(idle) = self.streaming_timeout {
            body = with_streaming_timeout(body, idle);
        }

        let (parts, ()) = head.into_parts();
        let mut response = Response::from_parts(parts, body);
        *wire = WireAttributes::take_from_headers(response.headers_mut());

        if let Some(release) = release {
            sleep_until(release).await;
        }

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            warn!(%status, pool = %key, "call failed with an error response");
            return Err(TransportError::error_response(response));
        }
        Ok(response)
    }
}

/// The pool serving `uri`, which must be an absolute `http` or `https` URI.
pub(crate) fn pool_key(uri: &Uri) -> Result<PoolKey, TransportError> {
    let tls = match uri.scheme_str() {
        Some("http") => false,
        Some("https") => true,
        _ => return Err(TransportError::invalid_request(format!("{uri} is not an absolute http(s) URI"))),
    };
    let host = uri.host().ok_or_else(|| TransportError::invalid_request(format!("{uri} has no host")))?;
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    Ok(PoolKey::new(host, port, tls))
}
