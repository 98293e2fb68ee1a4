//! Query tunneling.
//!
//! Long query strings do not survive every proxy, so the client may move the query of a request
//! into its body. The tunneled request is a `POST` carrying the original method in
//! `X-HTTP-Method-Override`:
//!
//! - without a body, the body is the query as `application/x-www-form-urlencoded`
//! - with a body, the body is `multipart/mixed`: the query part followed by the original body
//!
//! The server reverses the rewrite before dispatching and marks the call with
//! [`keys::IS_QUERY_TUNNELED`].

mod multipart;

use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use http::uri::PathAndQuery;
use http::{HeaderValue, Method, Uri, header};
use tracing::{debug, warn};

use crate::context::{RequestContext, keys};
use crate::error::TransportError;
use crate::filter::{FilterFlow, StreamFilter};
use crate::message::{RestRequest, StreamRequest, WireAttributes, to_rest_request, to_stream_request};
use multipart::Part;

pub const METHOD_OVERRIDE_HEADER: &str = "x-http-method-override";

const FORM_URL_ENCODED: &str = "application/x-www-form-urlencoded";

/// Whether `request` should be tunneled: its query is non-empty and at least `threshold` bytes
/// long, or tunneling is forced through [`keys::FORCE_QUERY_TUNNEL`].
pub fn should_tunnel(uri: &Uri, ctx: &RequestContext, threshold: usize) -> bool {
    match uri.query() {
        Some(query) if !query.is_empty() => query.len() >= threshold || ctx.flag(keys::FORCE_QUERY_TUNNEL),
        _ => false,
    }
}

/// Rewrites `request` as a tunneled `POST` when [`should_tunnel`] says so; returns it untouched
/// otherwise.
pub fn encode(request: RestRequest, ctx: &RequestContext, threshold: usize) -> Result<RestRequest, TransportError> {
    if !should_tunnel(request.uri(), ctx, threshold) {
        return Ok(request);
    }

    let (mut parts, body) = request.into_parts();
    let query = parts.uri.query().unwrap_or_default().to_string();
    parts.uri = without_query(&parts.uri)?;

    let body = if body.is_empty() {
        parts.headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(FORM_URL_ENCODED));
        Bytes::from(query)
    } else {
        let content_type = parts.headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_string);
        let sections = [
            Part { content_type: Some(FORM_URL_ENCODED.to_string()), body: Bytes::from(query) },
            Part { content_type, body },
        ];
        let boundary = multipart::boundary_for(&sections);
        let content_type = HeaderValue::from_str(&format!("multipart/mixed; boundary={boundary}"))
            .map_err(|_e| TransportError::invalid_request("multipart boundary is not a valid header value"))?;
        parts.headers.insert(header::CONTENT_TYPE, content_type);
        multipart::write(&boundary, &sections)
    };

    parts.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    let method = HeaderValue::from_str(parts.method.as_str())
        .map_err(|_e| TransportError::invalid_request("method is not a valid header value"))?;
    parts.headers.insert(METHOD_OVERRIDE_HEADER, method);
    debug!(method = %parts.method, uri = %parts.uri, "tunneling query through the request body");
    parts.method = Method::POST;

    Ok(RestRequest::from_parts(parts, body))
}

/// Restores a tunneled request; requests without `X-HTTP-Method-Override` pass through.
pub fn decode(request: RestRequest, ctx: &mut RequestContext) -> Result<RestRequest, TransportError> {
    let Some(method) = request.headers().get(METHOD_OVERRIDE_HEADER) else {
        return Ok(request);
    };
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_e| TransportError::invalid_request("invalid X-HTTP-Method-Override header"))?;
    let content_type: mime::Mime = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| TransportError::invalid_request("tunneled request without a valid Content-Type"))?;

    let (mut parts, body) = request.into_parts();
    parts.headers.remove(METHOD_OVERRIDE_HEADER);

    let essence = content_type.essence_str();
    let (query, body) = if essence == FORM_URL_ENCODED {
        parts.headers.remove(header::CONTENT_TYPE);
        parts.headers.remove(header::CONTENT_LENGTH);
        (Some(body), Bytes::new())
    } else if essence == "multipart/mixed" {
        parts.headers.remove(header::CONTENT_TYPE);
        parts.headers.remove(header::CONTENT_LENGTH);
        let boundary = content_type
            .get_param(mime::BOUNDARY)
            .ok_or_else(|| TransportError::invalid_request("multipart body without boundary"))?;

        let mut query = None;
        let mut entity: Option<Bytes> = None;
        for section in multipart::parse(boundary.as_str(), &body)? {
            let is_form = section
                .content_type
                .as_deref()
                .and_then(|ct| ct.parse::<mime::Mime>().ok())
                .is_some_and(|ct| ct.essence_str() == FORM_URL_ENCODED);
            if is_form && query.is_none() {
                query = Some(section.body);
            } else if entity.is_none() {
                if let Some(value) = section.content_type.as_deref().and_then(|ct| HeaderValue::from_str(ct).ok()) {
                    parts.headers.insert(header::CONTENT_TYPE, value);
                }
                parts.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(section.body.len()));
                entity = Some(section.body);
            } else {
                warn!(content_type = ?section.content_type, "unexpected body part in tunneled request");
            }
        }
        (query, entity.unwrap_or_default())
    } else {
        (None, body)
    };

    if let Some(query) = query.filter(|q| !q.is_empty()) {
        let query = std::str::from_utf8(&query)
            .map_err(|_e| TransportError::invalid_request("tunneled query is not valid utf-8"))?;
        parts.uri = with_query(&parts.uri, query)?;
    }
    parts.method = method;
    ctx.put_local_attr(keys::IS_QUERY_TUNNELED, true);

    Ok(RestRequest::from_parts(parts, body))
}

fn without_query(uri: &Uri) -> Result<Uri, TransportError> {
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::from_str(uri.path()).map_err(invalid_uri)?);
    Uri::from_parts(parts).map_err(invalid_uri)
}

/// Appends `query` to the query `uri` already has.
fn with_query(uri: &Uri, query: &str) -> Result<Uri, TransportError> {
    let path_and_query = match uri.query() {
        None | Some("") => format!("{}?{query}", uri.path()),
        Some(existing) => format!("{}?{existing}&{query}", uri.path()),
    };
    let mut parts = uri.clone().into_parts();
    parts.path_and_query = Some(PathAndQuery::from_str(&path_and_query).map_err(invalid_uri)?);
    Uri::from_parts(parts).map_err(invalid_uri)
}

fn invalid_uri<E: std::fmt::Display>(e: E) -> TransportError {
    TransportError::invalid_request(format!("invalid uri: {e}"))
}

/// Client filter tunneling long queries; only requests that are tunneled get buffered.
#[derive(Debug, Clone)]
pub struct QueryTunnelEncodeFilter {
    threshold: usize,
}

impl QueryTunnelEncodeFilter {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }
}

#[async_trait]
impl StreamFilter for QueryTunnelEncodeFilter {
    async fn on_request(
        &self,
        request: StreamRequest,
        ctx: &mut RequestContext,
        _wire: &mut WireAttributes,
    ) -> Result<FilterFlow, TransportError> {
        if !should_tunnel(request.uri(), ctx, self.threshold) {
            return Ok(FilterFlow::Next(request));
        }
        let request = to_rest_request(request).await.map_err(TransportError::from_stream)?;
        Ok(FilterFlow::Next(to_stream_request(encode(request, ctx, self.threshold)?)))
    }
}

/// Server filter restoring tunneled requests before they are dispatched.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryTunnelDecodeFilter;

#[async_trait]
impl StreamFilter for QueryTunnelDecodeFilter {
    async fn on_request(
        &self,
        request: StreamRequest,
        ctx: &mut RequestContext,
        _wire: &mut WireAttributes,
    ) -> Result<FilterFlow, TransportError> {
        if !request.headers().contains_key(METHOD_OVERRIDE_HEADER) {
            return Ok(FilterFlow::Next(request));
        }
        let request = to_rest_request(request).await.map_err(TransportError::from_stream)?;
        Ok(FilterFlow::Next(to_stream_request(decode(request, ctx)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn get(uri: &str) -> RestRequest {
        Request::builder().method(Method::GET).uri(uri).body(Bytes::new()).unwrap()
    }

    #[test]
    fn threshold_is_inclusive() {
        let ctx = RequestContext::new();

        let short = encode(get("http://localhost/q?a=1&b=2"), &ctx, 8).unwrap();
        assert_eq!(short.method(), Method::GET);
        assert_eq!(short.uri(), "http://localhost/q?a=1&b=2");

        let long = encode(get("http://localhost/q?a=1&b=22"), &ctx, 8).unwrap();
        assert_eq!(long.method(), Method::POST);
        assert_eq!(long.uri(), "http://localhost/q");
        assert_eq!(long.headers()[METHOD_OVERRIDE_HEADER], "GET");
        assert_eq!(long.headers()[header::CONTENT_TYPE], FORM_URL_ENCODED);
        assert_eq!(&long.body()[..], b"a=1&b=22");
    }

    #[test]
    fn force_flag_tunnels_short_queries() {
        let mut ctx = RequestContext::new();
        ctx.put_local_attr(keys::FORCE_QUERY_TUNNEL, true);

        let forced = encode(get("/q?a=1&b=2"), &ctx, 8).unwrap();
        assert_eq!(forced.method(), Method::POST);

        let no_query = encode(get("/q?"), &ctx, 8).unwrap();
        assert_eq!(no_query.method(), Method::GET);
    }

    #[test]
    fn form_round_trip() {
        let ctx = RequestContext::new();
        let tunneled = encode(get("/q?ids=1,2,3&name=long-value"), &ctx, 4).unwrap();

        let mut server_ctx = RequestContext::new();
        let restored = decode(tunneled, &mut server_ctx).unwrap();
        assert_eq!(restored.method(), Method::GET);
        assert_eq!(restored.uri(), "/q?ids=1,2,3&name=long-value");
        assert!(restored.body().is_empty());
        assert!(!restored.headers().contains_key(METHOD_OVERRIDE_HEADER));
        assert!(!restored.headers().contains_key(header::CONTENT_TYPE));
        assert!(server_ctx.flag(keys::IS_QUERY_TUNNELED));
    }

    #[test]
    fn multipart_round_trip_keeps_the_body() {
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/items?id=12345678")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Bytes::from_static(b"{\"name\":\"x\"}"))
            .unwrap();
        let tunneled = encode(request, &RequestContext::new(), 4).unwrap();
        assert_eq!(tunneled.method(), Method::POST);
        assert!(tunneled.headers()[header::CONTENT_TYPE].to_str().unwrap().starts_with("multipart/mixed; boundary="));

        let restored = decode(tunneled, &mut RequestContext::new()).unwrap();
        assert_eq!(restored.method(), Method::PUT);
        assert_eq!(restored.uri(), "/items?id=12345678");
        assert_eq!(restored.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(restored.headers()[header::CONTENT_LENGTH], "12");
        assert_eq!(&restored.body()[..], b"{\"name\":\"x\"}");
    }

    #[test]
    fn decode_appends_to_an_existing_query() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/q?trace=1")
            .header(METHOD_OVERRIDE_HEADER, "GET")
            .header(header::CONTENT_TYPE, FORM_URL_ENCODED)
            .body(Bytes::from_static(b"a=1"))
            .unwrap();
        let restored = decode(request, &mut RequestContext::new()).unwrap();
        assert_eq!(restored.uri(), "/q?trace=1&a=1");
    }

    #[test]
    fn untunneled_requests_pass_through_decode() {
        let mut ctx = RequestContext::new();
        let request = decode(get("/plain?x=1"), &mut ctx).unwrap();
        assert_eq!(request.uri(), "/plain?x=1");
        assert!(!ctx.flag(keys::IS_QUERY_TUNNELED));
    }
}
