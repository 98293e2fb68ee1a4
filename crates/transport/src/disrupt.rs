//! Per-call fault injection.
//!
//! A [`DisruptContext`] stored in the [`RequestContext`] under [`keys::DISRUPT_CONTEXT`] describes a
//! fault for that call only. It is consumed by whichever comes first: a [`DisruptFilter`] in the
//! chain or the client transport itself.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::debug;

use crate::context::{RequestContext, keys};
use crate::error::TransportError;
use crate::filter::{FilterFlow, StreamFilter};
use crate::message::{StreamRequest, StreamResponse, WireAttributes};
use crate::timeout::{TimeoutError, millis};

const MINIMUM_DELAY_DEADLINE: &str = "transport.disrupt.minimum_delay_deadline";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisruptContext {
    /// wait before sending the request
    Delay(Duration),
    /// hold the response until at least this long after the call was issued
    MinimumDelay(Duration),
    /// behave like a server that never answers
    Timeout,
    /// fail the call with [`TransportError::Disrupted`] after the delay
    Error(Duration),
}

impl DisruptContext {
    pub fn install(self, ctx: &mut RequestContext) {
        ctx.put_local_attr(keys::DISRUPT_CONTEXT, self);
    }

    /// Removes the disrupt context from `ctx`, so it applies at most once.
    pub fn take(ctx: &mut RequestContext) -> Option<Self> {
        ctx.remove_local_attr(keys::DISRUPT_CONTEXT)
    }
}

/// Applies the request side of a disrupt context: sleeps for delays and fails for timeouts and
/// errors. A minimum delay returns the instant the response may be released at.
pub(crate) async fn disrupt_request(
    disrupt: DisruptContext,
    ctx: &RequestContext,
    request_timeout: Duration,
) -> Result<Option<Instant>, TransportError> {
    debug!(?disrupt, "disrupting call");
    match disrupt {
        DisruptContext::Delay(delay) => {
            sleep(delay).await;
            Ok(None)
        }
        DisruptContext::MinimumDelay(delay) => {
            let started = ctx.get_local_attr::<Instant>(keys::REQUEST_START_TIME).copied().unwrap_or_else(Instant::now);
            Ok(Some(started + delay))
        }
        DisruptContext::Timeout => {
            sleep(request_timeout).await;
            Err(TimeoutError::request(request_timeout).into())
        }
        DisruptContext::Error(after) => {
            sleep(after).await;
            Err(TransportError::disrupted(format!("Disrupted with error after {}ms", millis(after))))
        }
    }
}

/// A filter that consumes the call's [`DisruptContext`].
#[derive(Debug, Clone)]
pub struct DisruptFilter {
    request_timeout: Duration,
}

impl DisruptFilter {
    /// `request_timeout` is how long a [`DisruptContext::Timeout`] call hangs before failing.
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    async fn pad(ctx: &mut RequestContext) {
        if let Some(deadline) = ctx.remove_local_attr::<Instant>(MINIMUM_DELAY_DEADLINE) {
            sleep_until(deadline).await;
        }
    }
}

#[async_trait]
impl StreamFilter for DisruptFilter {
    async fn on_request(
        &self,
        request: StreamRequest,
        ctx: &mut RequestContext,
        _wire: &mut WireAttributes,
    ) -> Result<FilterFlow, TransportError> {
        if let Some(disrupt) = DisruptContext::take(ctx) {
            if let Some(deadline) = disrupt_request(disrupt, ctx, self.request_timeout).await? {
                ctx.put_local_attr(MINIMUM_DELAY_DEADLINE, deadline);
            }
        }
        Ok(FilterFlow::Next(request))
    }

    async fn on_response(
        &self,
        response: StreamResponse,
        ctx: &mut RequestContext,
        _wire: &mut WireAttributes,
    ) -> Result<StreamResponse, TransportError> {
        Self::pad(ctx).await;
        Ok(response)
    }

    async fn on_error(
        &self,
        error: TransportError,
        ctx: &mut RequestContext,
        _wire: &mut WireAttributes,
    ) -> Result<StreamResponse, TransportError> {
        Self::pad(ctx).await;
        Err(error)
    }
}
