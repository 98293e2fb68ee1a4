//! Path based routing of inbound requests to application handlers.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderValue, StatusCode};
use tracing::{debug, warn};

use crate::context::{RequestContext, keys};
use crate::error::TransportError;
use crate::filter::{Endpoint, guarded};
use crate::message::{
    RestRequest, RestResponse, StreamRequest, StreamResponse, WireAttributes, text_response, to_rest_request,
    to_stream_response,
};

/// Marks responses the transport produced from an error rather than the application.
pub const TRANSPORT_ERROR_HEADER: &str = "x-transport-error";

/// Application handler for buffered requests.
#[async_trait]
pub trait RestRequestHandler: Send + Sync {
    async fn handle_request(
        &self,
        request: RestRequest,
        ctx: &mut RequestContext,
    ) -> Result<RestResponse, TransportError>;
}

/// Application handler for streaming requests.
#[async_trait]
pub trait StreamRequestHandler: Send + Sync {
    async fn handle_request(
        &self,
        request: StreamRequest,
        ctx: &mut RequestContext,
    ) -> Result<StreamResponse, TransportError>;
}

#[derive(Clone)]
enum Handler {
    Rest(Arc<dyn RestRequestHandler>),
    Stream(Arc<dyn StreamRequestHandler>),
}

/// Routes requests by path. Handler failures, unknown paths and handler panics all come back as
/// [`TransportError`]s; nothing unwinds past the dispatcher.
pub struct TransportDispatcher {
    router: matchit::Router<Handler>,
    paths: Vec<String>,
}

impl fmt::Debug for TransportDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportDispatcher").field("paths", &self.paths).finish()
    }
}

impl TransportDispatcher {
    pub fn builder() -> TransportDispatcherBuilder {
        TransportDispatcherBuilder::default()
    }

    pub async fn dispatch(
        &self,
        request: StreamRequest,
        ctx: &mut RequestContext,
    ) -> Result<StreamResponse, TransportError> {
        let path = request.uri().path().to_string();
        let handler = match self.router.at(&path) {
            Ok(matched) => {
                let params: Vec<(String, String)> =
                    matched.params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
                if !params.is_empty() {
                    ctx.put_local_attr(keys::PATH_PARAMS, params);
                }
                matched.value.clone()
            }
            Err(_) => {
                debug!(path, "no handler registered");
                return Err(TransportError::HandlerNotFound { path });
            }
        };

        match handler {
            Handler::Stream(handler) => guarded(handler.handle_request(request, ctx)).await,
            Handler::Rest(handler) => {
                guarded(async {
                    let request = to_rest_request(request).await.map_err(TransportError::from_stream)?;
                    handler.handle_request(request, ctx).await.map(to_stream_response)
                })
                .await
            }
        }
    }
}

#[async_trait]
impl Endpoint for TransportDispatcher {
    async fn handle(
        &self,
        request: StreamRequest,
        ctx: &mut RequestContext,
        wire: &mut WireAttributes,
    ) -> Result<StreamResponse, TransportError> {
        let outcome = self.dispatch(request, ctx).await;
        // the response path starts with the response's own attributes
        wire.clear();
        outcome
    }
}

#[derive(Default)]
pub struct TransportDispatcherBuilder {
    routes: Vec<(String, Handler)>,
}

impl fmt::Debug for TransportDispatcherBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let paths: Vec<&str> = self.routes.iter().map(|(path, _)| path.as_str()).collect();
        f.debug_struct("TransportDispatcherBuilder").field("paths", &paths).finish()
    }
}

impl TransportDispatcherBuilder {
    /// Registers `handler` for `path`, which may use `{param}` and `{*rest}` segments.
    pub fn add_rest_handler<H: RestRequestHandler + 'static>(mut self, path: impl Into<String>, handler: H) -> Self {
        self.routes.push((path.into(), Handler::Rest(Arc::new(handler))));
        self
    }

    pub fn add_stream_handler<H: StreamRequestHandler + 'static>(mut self, path: impl Into<String>, handler: H) -> Self {
        self.routes.push((path.into(), Handler::Stream(Arc::new(handler))));
        self
    }

    /// Fails when two paths conflict.
    pub fn build(self) -> Result<TransportDispatcher, matchit::InsertError> {
        let mut router = matchit::Router::new();
        let mut paths = Vec::with_capacity(self.routes.len());
        for (path, handler) in self.routes {
            router.insert(path.clone(), handler)?;
            paths.push(path);
        }
        Ok(TransportDispatcher { router, paths })
    }
}

/// Turns a failed call into the response the server writes: 404 for unknown paths, the carried
/// response for [`TransportError::ErrorResponse`], 500 with the error message otherwise. Every
/// such response is marked with [`TRANSPORT_ERROR_HEADER`].
pub fn into_error_response(error: TransportError) -> StreamResponse {
    let mut response = match error {
        TransportError::ErrorResponse(response) => *response,
        TransportError::HandlerNotFound { path } => {
            text_response(StatusCode::NOT_FOUND, format!("no handler registered for path {path}"))
        }
        other => {
            warn!(cause = %other, "call failed, responding with 500");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    };
    response.headers_mut().insert(TRANSPORT_ERROR_HEADER, HeaderValue::from_static("true"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::to_rest_response;
    use crate::stream::EntityStreams;
    use bytes::Bytes;
    use http::{Request, Response};

    struct Hello;

    #[async_trait]
    impl RestRequestHandler for Hello {
        async fn handle_request(
            &self,
            request: RestRequest,
            _ctx: &mut RequestContext,
        ) -> Result<RestResponse, TransportError> {
            let name = String::from_utf8_lossy(request.body()).to_string();
            Ok(Response::new(Bytes::from(format!("hello {name}"))))
        }
    }

    struct Param;

    #[async_trait]
    impl StreamRequestHandler for Param {
        async fn handle_request(
            &self,
            _request: StreamRequest,
            ctx: &mut RequestContext,
        ) -> Result<StreamResponse, TransportError> {
            let params = ctx.get_local_attr::<Vec<(String, String)>>(keys::PATH_PARAMS).cloned().unwrap_or_default();
            let id = params.iter().find(|(k, _)| k == "id").map(|(_, v)| v.clone()).unwrap_or_default();
            Ok(Response::new(EntityStreams::once(Bytes::from(id))))
        }
    }

    struct Exploding;

    #[async_trait]
    impl StreamRequestHandler for Exploding {
        async fn handle_request(
            &self,
            _request: StreamRequest,
            _ctx: &mut RequestContext,
        ) -> Result<StreamResponse, TransportError> {
            panic!("handler bug")
        }
    }

    fn dispatcher() -> TransportDispatcher {
        TransportDispatcher::builder()
            .add_rest_handler("/hello", Hello)
            .add_stream_handler("/items/{id}", Param)
            .add_stream_handler("/boom", Exploding)
            .build()
            .unwrap()
    }

    fn request(path: &str, body: &'static [u8]) -> StreamRequest {
        Request::builder().uri(path).body(EntityStreams::once(Bytes::from_static(body))).unwrap()
    }

    async fn body(response: StreamResponse) -> Bytes {
        to_rest_response(response).await.unwrap().into_body()
    }

    #[tokio::test]
    async fn routes_rest_and_stream_handlers() {
        let dispatcher = dispatcher();
        let mut ctx = RequestContext::new();

        let response = dispatcher.dispatch(request("/hello", b"world"), &mut ctx).await.unwrap();
        assert_eq!(&body(response).await[..], b"hello world");

        let response = dispatcher.dispatch(request("/items/42", b""), &mut ctx).await.unwrap();
        assert_eq!(&body(response).await[..], b"42");
    }

    #[tokio::test]
    async fn unknown_path_is_handler_not_found() {
        let err = dispatcher().dispatch(request("/missing", b""), &mut RequestContext::new()).await.unwrap_err();
        assert!(matches!(&err, TransportError::HandlerNotFound { path } if path == "/missing"));

        let response = into_error_response(err);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[TRANSPORT_ERROR_HEADER], "true");
    }

    #[tokio::test]
    async fn handler_panics_are_contained() {
        let err = dispatcher().dispatch(request("/boom", b""), &mut RequestContext::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Panic { .. }));

        let response = into_error_response(err);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(String::from_utf8_lossy(&body(response).await).contains("handler bug"));
    }

    #[test]
    fn conflicting_paths_are_rejected() {
        let result = TransportDispatcher::builder().add_rest_handler("/a", Hello).add_rest_handler("/a", Hello).build();
        assert!(result.is_err());
    }
}
