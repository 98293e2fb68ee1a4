#![allow(dead_code, reason = "each test binary uses a different part of the helpers")]

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use micro_transport::config::{ClientConfig, ServerConfig};
use micro_transport::context::{RequestContext, keys};
use micro_transport::dispatcher::{RestRequestHandler, StreamRequestHandler, TransportDispatcher};
use micro_transport::error::TransportError;
use micro_transport::message::{RestRequest, RestResponse, StreamRequest, StreamResponse};
use micro_transport::negotiation::HttpProtocol;
use micro_transport::stream::EntityStream;
use micro_transport::{ServerHandle, TransportClient, TransportServer, TransportServerBuilder};

/// Answers with a line describing the request as the handler saw it, followed by the request body.
pub struct Describe;

#[async_trait]
impl RestRequestHandler for Describe {
    async fn handle_request(&self, request: RestRequest, ctx: &mut RequestContext) -> Result<RestResponse, TransportError> {
        let protocol = ctx.get_local_attr::<HttpProtocol>(keys::HTTP_PROTOCOL).copied().unwrap_or(HttpProtocol::Http11);
        let line = format!(
            "{} {} query={} tunneled={} protocol={}\n",
            request.method(),
            request.uri().path(),
            request.uri().query().unwrap_or_default(),
            ctx.flag(keys::IS_QUERY_TUNNELED),
            protocol,
        );
        let mut body = line.into_bytes();
        body.extend_from_slice(request.body());
        Ok(Response::new(Bytes::from(body)))
    }
}

/// Streams `count` numbered chunks, `interval` apart.
pub struct Ticker {
    pub count: usize,
    pub interval: Duration,
}

#[async_trait]
impl StreamRequestHandler for Ticker {
    async fn handle_request(&self, _request: StreamRequest, _ctx: &mut RequestContext) -> Result<StreamResponse, TransportError> {
        let body = EntityStream::new();
        let mut writer = body.set_writer()?;
        let (count, interval) = (self.count, self.interval);
        tokio::spawn(async move {
            for tick in 0..count {
                tokio::time::sleep(interval).await;
                if writer.send(Bytes::from(format!("tick-{tick};"))).await.is_err() {
                    return;
                }
            }
            let _ = writer.done();
        });
        Ok(Response::new(body))
    }
}

/// Sends one chunk, then holds the body open without writing anything else.
pub struct Stall;

#[async_trait]
impl StreamRequestHandler for Stall {
    async fn handle_request(&self, _request: StreamRequest, _ctx: &mut RequestContext) -> Result<StreamResponse, TransportError> {
        let body = EntityStream::new();
        let mut writer = body.set_writer()?;
        tokio::spawn(async move {
            if writer.send(Bytes::from_static(b"first;")).await.is_ok() {
                writer.cancelled().await;
            }
        });
        Ok(Response::new(body))
    }
}

/// Answers after the given delay.
pub struct Slow(pub Duration);

#[async_trait]
impl RestRequestHandler for Slow {
    async fn handle_request(&self, _request: RestRequest, _ctx: &mut RequestContext) -> Result<RestResponse, TransportError> {
        tokio::time::sleep(self.0).await;
        Ok(Response::new(Bytes::from_static(b"finally")))
    }
}

pub struct Fail;

#[async_trait]
impl RestRequestHandler for Fail {
    async fn handle_request(&self, _request: RestRequest, _ctx: &mut RequestContext) -> Result<RestResponse, TransportError> {
        Err(TransportError::application("boom"))
    }
}

pub fn dispatcher() -> TransportDispatcher {
    TransportDispatcher::builder()
        .add_rest_handler("/describe", Describe)
        .add_rest_handler("/describe/{*rest}", Describe)
        .add_stream_handler("/ticks", Ticker { count: 3, interval: Duration::from_millis(20) })
        .add_stream_handler("/slow-ticks", Ticker { count: 2, interval: Duration::from_millis(300) })
        .add_stream_handler("/stall", Stall)
        .add_rest_handler("/slow", Slow(Duration::from_millis(3500)))
        .add_rest_handler("/fail", Fail)
        .build()
        .unwrap()
}

pub fn server() -> TransportServerBuilder {
    TransportServer::builder().dispatcher(dispatcher())
}

pub async fn start(config: ServerConfig) -> ServerHandle {
    micro_transport::logging::init();
    server().config(config).build().unwrap().start().await.unwrap()
}

pub fn client(config: ClientConfig) -> TransportClient {
    TransportClient::builder().config(config).build().unwrap()
}

pub fn get(uri: impl AsRef<str>) -> RestRequest {
    Request::get(uri.as_ref()).body(Bytes::new()).unwrap()
}

pub fn post(uri: impl AsRef<str>, body: &'static str) -> RestRequest {
    Request::post(uri.as_ref()).body(Bytes::from_static(body.as_bytes())).unwrap()
}

pub fn text(response: &RestResponse) -> &str {
    std::str::from_utf8(response.body()).unwrap()
}
