use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::error;

use super::{Endpoint, FilterFlow, RestFilter, RestFilterAdapter, StreamFilter};
use crate::context::RequestContext;
use crate::error::TransportError;
use crate::message::{StreamRequest, StreamResponse, WireAttributes};

/// An immutable, cheaply cloneable sequence of filters.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Arc<[Arc<dyn StreamFilter>]>,
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain").field("len", &self.filters.len()).finish()
    }
}

impl FilterChain {
    pub fn builder() -> FilterChainBuilder {
        FilterChainBuilder::default()
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// A builder seeded with this chain's filters, for deriving an extended chain.
    pub fn to_builder(&self) -> FilterChainBuilder {
        FilterChainBuilder { filters: self.filters.iter().cloned().collect() }
    }

    /// Runs `request` through the filters and `endpoint`, then the outcome back through the
    /// filters that saw the request.
    ///
    /// A filter that responds, fails or panics on the request path stops the forward pass; its
    /// outcome then visits only the filters before it. A panic in any hook is turned into
    /// [`TransportError::Panic`] and travels the error path.
    pub async fn process(
        &self,
        request: StreamRequest,
        ctx: &mut RequestContext,
        wire: &mut WireAttributes,
        endpoint: &dyn Endpoint,
    ) -> Result<StreamResponse, TransportError> {
        let mut visited = self.filters.len();
        let outcome = 'forward: {
            let mut request = request;
            for (index, filter) in self.filters.iter().enumerate() {
                match guarded(filter.on_request(request, ctx, wire)).await {
                    Ok(FilterFlow::Next(next)) => request = next,
                    Ok(FilterFlow::Respond(response)) => {
                        visited = index;
                        break 'forward Ok(response);
                    }
                    Err(e) => {
                        visited = index;
                        break 'forward Err(e);
                    }
                }
            }
            guarded(endpoint.handle(request, ctx, wire)).await
        };

        let mut outcome = outcome;
        for filter in self.filters[..visited].iter().rev() {
            outcome = match outcome {
                Ok(response) => guarded(filter.on_response(response, ctx, wire)).await,
                Err(e) => guarded(filter.on_error(e, ctx, wire)).await,
            };
        }
        outcome
    }
}

/// Awaits `future`, turning a panic into [`TransportError::Panic`].
pub(crate) async fn guarded<T, F>(future: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let e = TransportError::panic(payload);
            error!(cause = %e, "caught panic while processing the call");
            Err(e)
        }
    }
}

/// Collects filters in order and freezes them into a [`FilterChain`].
#[derive(Default)]
pub struct FilterChainBuilder {
    filters: VecDeque<Arc<dyn StreamFilter>>,
}

impl fmt::Debug for FilterChainBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChainBuilder").field("len", &self.filters.len()).finish()
    }
}

impl FilterChainBuilder {
    pub fn add_first<F: StreamFilter + 'static>(mut self, filter: F) -> Self {
        self.filters.push_front(Arc::new(filter));
        self
    }

    pub fn add_last<F: StreamFilter + 'static>(mut self, filter: F) -> Self {
        self.filters.push_back(Arc::new(filter));
        self
    }

    pub fn add_first_rest<F: RestFilter + 'static>(self, filter: F) -> Self {
        self.add_first(RestFilterAdapter::new(filter))
    }

    pub fn add_last_rest<F: RestFilter + 'static>(self, filter: F) -> Self {
        self.add_last(RestFilterAdapter::new(filter))
    }

    pub fn build(self) -> FilterChain {
        FilterChain { filters: self.filters.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{RestFlow, RestFilter};
    use crate::message::{RestRequest, RestResponse, to_rest_response, text_response};
    use crate::stream::EntityStreams;
    use async_trait::async_trait;
    use bytes::Bytes;
    use http::{Request, StatusCode};
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Copy, PartialEq)]
    enum Act {
        Pass,
        Respond,
        Fail,
        Panic,
        Recover,
    }

    struct Recording {
        name: &'static str,
        act: Act,
        log: Log,
    }

    impl Recording {
        fn record(&self, hook: &str) {
            self.log.lock().unwrap().push(format!("{}.{hook}", self.name));
        }
    }

    #[async_trait]
    impl StreamFilter for Recording {
        async fn on_request(
            &self,
            request: StreamRequest,
            _ctx: &mut RequestContext,
            _wire: &mut WireAttributes,
        ) -> Result<FilterFlow, TransportError> {
            self.record("request");
            match self.act {
                Act::Respond => Ok(FilterFlow::Respond(text_response(StatusCode::OK, self.name))),
                Act::Fail => Err(TransportError::application(self.name)),
                Act::Panic => panic!("filter {} exploded", self.name),
                Act::Pass | Act::Recover => Ok(FilterFlow::Next(request)),
            }
        }

        async fn on_response(
            &self,
            response: StreamResponse,
            _ctx: &mut RequestContext,
            _wire: &mut WireAttributes,
        ) -> Result<StreamResponse, TransportError> {
            self.record("response");
            Ok(response)
        }

        async fn on_error(
            &self,
            error: TransportError,
            _ctx: &mut RequestContext,
            _wire: &mut WireAttributes,
        ) -> Result<StreamResponse, TransportError> {
            self.record("error");
            if self.act == Act::Recover {
                return Ok(text_response(StatusCode::OK, "recovered"));
            }
            Err(error)
        }
    }

    struct Echo(Log);

    #[async_trait]
    impl Endpoint for Echo {
        async fn handle(
            &self,
            request: StreamRequest,
            _ctx: &mut RequestContext,
            _wire: &mut WireAttributes,
        ) -> Result<StreamResponse, TransportError> {
            self.0.lock().unwrap().push("endpoint".to_string());
            let (parts, body) = request.into_parts();
            let mut response = http::Response::new(body);
            *response.headers_mut() = parts.headers;
            Ok(response)
        }
    }

    fn chain(acts: &[(&'static str, Act)], log: &Log) -> FilterChain {
        acts.iter()
            .fold(FilterChain::builder(), |builder, &(name, act)| {
                builder.add_last(Recording { name, act, log: Arc::clone(log) })
            })
            .build()
    }

    async fn run(chain: &FilterChain, log: &Log) -> Result<StreamResponse, TransportError> {
        let request = Request::builder().uri("/echo").body(EntityStreams::once(Bytes::from_static(b"hi"))).unwrap();
        chain.process(request, &mut RequestContext::new(), &mut WireAttributes::new(), &Echo(Arc::clone(log))).await
    }

    fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn requests_forward_responses_reverse() {
        let log = Log::default();
        let chain = chain(&[("a", Act::Pass), ("b", Act::Pass), ("c", Act::Pass)], &log);

        let response = run(&chain, &log).await.unwrap();
        assert_eq!(&to_rest_response(response).await.unwrap().body()[..], b"hi");
        assert_eq!(
            entries(&log),
            ["a.request", "b.request", "c.request", "endpoint", "c.response", "b.response", "a.response"]
        );
    }

    #[tokio::test]
    async fn short_circuit_visits_earlier_filters_only() {
        let log = Log::default();
        let chain = chain(&[("a", Act::Pass), ("b", Act::Respond), ("c", Act::Pass)], &log);

        let response = to_rest_response(run(&chain, &log).await.unwrap()).await.unwrap();
        assert_eq!(&response.body()[..], b"b");
        assert_eq!(entries(&log), ["a.request", "b.request", "a.response"]);
    }

    #[tokio::test]
    async fn failures_travel_the_error_path() {
        let log = Log::default();
        let chain = chain(&[("a", Act::Pass), ("b", Act::Pass), ("c", Act::Fail)], &log);

        let err = run(&chain, &log).await.unwrap_err();
        assert_eq!(err.to_string(), "server error: c");
        assert_eq!(entries(&log), ["a.request", "b.request", "c.request", "b.error", "a.error"]);
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let log = Log::default();
        let chain = chain(&[("a", Act::Pass), ("b", Act::Panic)], &log);

        let err = run(&chain, &log).await.unwrap_err();
        assert!(matches!(err, TransportError::Panic { .. }));
        assert!(err.to_string().contains("filter b exploded"));
        assert_eq!(entries(&log), ["a.request", "b.request", "a.error"]);
    }

    #[tokio::test]
    async fn errors_may_be_recovered() {
        let log = Log::default();
        let chain = chain(&[("a", Act::Pass), ("b", Act::Recover), ("c", Act::Fail)], &log);

        let response = to_rest_response(run(&chain, &log).await.unwrap()).await.unwrap();
        assert_eq!(&response.body()[..], b"recovered");
        assert_eq!(entries(&log), ["a.request", "b.request", "c.request", "b.error", "a.response"]);
    }

    struct Upper;

    #[async_trait]
    impl RestFilter for Upper {
        async fn on_request(
            &self,
            request: RestRequest,
            _ctx: &mut RequestContext,
            _wire: &mut WireAttributes,
        ) -> Result<RestFlow, TransportError> {
            Ok(RestFlow::Next(request.map(|body| Bytes::from(body.to_ascii_uppercase()))))
        }

        async fn on_response(
            &self,
            mut response: RestResponse,
            _ctx: &mut RequestContext,
            _wire: &mut WireAttributes,
        ) -> Result<RestResponse, TransportError> {
            response.headers_mut().insert("x-upper", http::HeaderValue::from_static("done"));
            Ok(response)
        }
    }

    #[tokio::test]
    async fn rest_filters_run_in_stream_chains() {
        let log = Log::default();
        let chain = FilterChain::builder().add_last_rest(Upper).build();
        let derived = chain.to_builder().add_first(Recording { name: "a", act: Act::Pass, log: Arc::clone(&log) }).build();
        assert_eq!(derived.len(), 2);

        let response = to_rest_response(run(&derived, &log).await.unwrap()).await.unwrap();
        assert_eq!(&response.body()[..], b"HI");
        assert_eq!(response.headers()["x-upper"], "done");
    }
}
