//! Request and response envelopes.
//!
//! Messages are plain [`http::Request`] / [`http::Response`] values. The body type fixes the mode
//! for the lifetime of the message: [`Bytes`] for buffered (REST) messages and [`EntityStream`] for
//! streaming messages. Converting between the modes creates a new message and preserves method,
//! URI, version, status and headers exactly.

mod wire;

pub use wire::WIRE_ATTRIBUTE_HEADER_PREFIX;
pub use wire::WireAttributes;

use bytes::Bytes;
use http::{HeaderValue, Request, Response, StatusCode};

use crate::stream::{EntityStream, EntityStreams, StreamError};

pub type RestRequest = Request<Bytes>;
pub type RestResponse = Response<Bytes>;
pub type StreamRequest = Request<EntityStream>;
pub type StreamResponse = Response<EntityStream>;

/// Wraps the buffered entity as a single-chunk stream.
pub fn to_stream_request(request: RestRequest) -> StreamRequest {
    request.map(EntityStreams::once)
}

pub fn to_stream_response(response: RestResponse) -> StreamResponse {
    response.map(EntityStreams::once)
}

/// Buffers the stream to completion.
pub async fn to_rest_request(request: StreamRequest) -> Result<RestRequest, StreamError> {
    let (parts, body) = request.into_parts();
    let entity = EntityStreams::collect(body).await?;
    Ok(Request::from_parts(parts, entity))
}

pub async fn to_rest_response(response: StreamResponse) -> Result<RestResponse, StreamError> {
    let (parts, body) = response.into_parts();
    let entity = EntityStreams::collect(body).await?;
    Ok(Response::from_parts(parts, entity))
}

/// Builds a text response, used for error responses produced by the transport itself.
pub fn text_response(status: StatusCode, text: impl Into<String>) -> StreamResponse {
    let text = text.into();
    let mut response = Response::new(EntityStreams::once(Bytes::from(text)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{Method, Version};

    #[tokio::test]
    async fn rest_stream_round_trip_preserves_envelope() {
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/a/b?c=d")
            .version(Version::HTTP_11)
            .header("X-One", "1")
            .header("x-two", "2")
            .header("X-Two", "3")
            .body(Bytes::from_static(b"payload"))
            .unwrap();

        let restored = to_rest_request(to_stream_request(request)).await.unwrap();

        assert_eq!(restored.method(), Method::PUT);
        assert_eq!(restored.uri(), "/a/b?c=d");
        assert_eq!(restored.headers().get_all("x-two").iter().count(), 2);
        assert_eq!(restored.headers()["x-one"], "1");
        assert_eq!(&restored.body()[..], b"payload");
    }

    #[tokio::test]
    async fn text_response_carries_status() {
        let response = to_rest_response(text_response(StatusCode::NOT_FOUND, "missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(&response.body()[..], b"missing");
    }
}
