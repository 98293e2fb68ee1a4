use async_trait::async_trait;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderValue, StatusCode};
use micro_transport::context::RequestContext;
use micro_transport::error::TransportError;
use micro_transport::filter::{FilterFlow, StreamFilter};
use micro_transport::message::{StreamRequest, StreamResponse, WireAttributes, text_response};
use micro_transport::stream::EntityStreams;
use tracing::{debug, trace, warn};

use crate::RESPONSE_COMPRESSION_THRESHOLD_HEADER;
use crate::partial::{PartialRead, read_partial};
use crate::{AcceptEncoding, CompressionConfig, CompressionError, EncodingType};

/// `String`: the `Accept-Encoding` header of the request being served.
const ACCEPT_ENCODING_KEY: &str = "compression.accept_encoding";
/// `usize`: the response threshold the client asked for.
const RESPONSE_THRESHOLD_KEY: &str = "compression.response_threshold";

/// Server side compression: inflates request bodies and compresses responses in the coding the
/// client prefers.
#[derive(Debug)]
pub struct ServerCompressionFilter {
    supported: Vec<EncodingType>,
    response_threshold: usize,
}

impl ServerCompressionFilter {
    pub fn new(config: &CompressionConfig) -> Self {
        Self { supported: EncodingType::CODECS.to_vec(), response_threshold: config.response_threshold }
    }

    /// Restricts the codings responses may be compressed with, in order of preference.
    pub fn with_supported(mut self, supported: Vec<EncodingType>) -> Self {
        self.supported = supported;
        self
    }

    /// The coding to answer with, `Ok(None)` when the client did not negotiate.
    fn negotiate(&self, ctx: &RequestContext) -> Result<Option<EncodingType>, CompressionError> {
        let Some(header) = ctx.get_local_attr::<String>(ACCEPT_ENCODING_KEY) else {
            return Ok(None);
        };
        let accepted = AcceptEncoding::parse(header)?;
        match AcceptEncoding::choose_best(&accepted, &self.supported) {
            Some(coding) => Ok(Some(coding)),
            None => Err(CompressionError::UnsupportedEncoding(header.clone())),
        }
    }

    async fn compress(
        &self,
        response: StreamResponse,
        coding: EncodingType,
        ctx: &RequestContext,
    ) -> Result<StreamResponse, TransportError> {
        let Some(compressor) = coding.compressor() else {
            return Ok(response);
        };
        if response.headers().contains_key(CONTENT_ENCODING) || response.body().exact_len() == Some(0) {
            return Ok(response);
        }

        let threshold = ctx.get_local_attr::<usize>(RESPONSE_THRESHOLD_KEY).copied().unwrap_or(self.response_threshold);
        let (mut parts, body) = response.into_parts();
        let body = match read_partial(body, threshold).await? {
            PartialRead::Complete(chunks) => {
                trace!(threshold, "response body below compression threshold");
                EntityStreams::from_chunks(chunks)
            }
            PartialRead::Exceeds(body) => {
                parts.headers.remove(CONTENT_LENGTH);
                parts.headers.insert(CONTENT_ENCODING, HeaderValue::from_static(coding.http_name()));
                compressor.deflate(body)
            }
        };
        Ok(StreamResponse::from_parts(parts, body))
    }
}

#[async_trait]
impl StreamFilter for ServerCompressionFilter {
    async fn on_request(
        &self,
        request: StreamRequest,
        ctx: &mut RequestContext,
        _wire: &mut WireAttributes,
    ) -> Result<FilterFlow, TransportError> {
        let (mut parts, body) = request.into_parts();

        if let Some(accept) = parts.headers.get(ACCEPT_ENCODING).and_then(|v| v.to_str().ok()) {
            ctx.put_local_attr(ACCEPT_ENCODING_KEY, accept.to_string());
        }
        if let Some(threshold) = parts.headers.get(RESPONSE_COMPRESSION_THRESHOLD_HEADER) {
            match threshold.to_str().ok().and_then(|v| v.trim().parse::<usize>().ok()) {
                Some(threshold) => ctx.put_local_attr(RESPONSE_THRESHOLD_KEY, threshold),
                None => warn!(?threshold, "ignoring invalid response compression threshold"),
            }
        }

        let Some(encoding) = parts.headers.get(CONTENT_ENCODING) else {
            return Ok(FilterFlow::Next(StreamRequest::from_parts(parts, body)));
        };
        let name = String::from_utf8_lossy(encoding.as_bytes()).into_owned();
        let coding = match name.parse::<EncodingType>() {
            Ok(EncodingType::Any) | Err(_) => {
                debug!(encoding = %name, "request in unsupported content encoding");
                let message = CompressionError::UnsupportedEncoding(name).to_string();
                return Err(TransportError::error_response(text_response(StatusCode::UNSUPPORTED_MEDIA_TYPE, message)));
            }
            Ok(coding) => coding,
        };

        parts.headers.remove(CONTENT_ENCODING);
        parts.headers.remove(CONTENT_LENGTH);
        let body = match coding.compressor() {
            Some(compressor) => compressor.inflate(body),
            None => body,
        };
        Ok(FilterFlow::Next(StreamRequest::from_parts(parts, body)))
    }

    async fn on_response(
        &self,
        response: StreamResponse,
        ctx: &mut RequestContext,
        _wire: &mut WireAttributes,
    ) -> Result<StreamResponse, TransportError> {
        match self.negotiate(ctx) {
            Ok(None) => Ok(response),
            Ok(Some(coding)) => self.compress(response, coding, ctx).await,
            Err(e) => {
                debug!(cause = %e, "no acceptable response encoding");
                let (mut parts, _body) = response.into_parts();
                parts.status = StatusCode::NOT_ACCEPTABLE;
                parts.headers.remove(CONTENT_LENGTH);
                Err(TransportError::error_response(StreamResponse::from_parts(parts, EntityStreams::empty())))
            }
        }
    }

    async fn on_error(
        &self,
        error: TransportError,
        ctx: &mut RequestContext,
        _wire: &mut WireAttributes,
    ) -> Result<StreamResponse, TransportError> {
        match error {
            TransportError::ErrorResponse(response) => match self.negotiate(ctx) {
                Ok(Some(coding)) => Err(TransportError::error_response(self.compress(*response, coding, ctx).await?)),
                _ => Err(TransportError::ErrorResponse(response)),
            },
            error => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{Request, Response};

    use super::*;

    fn filter(threshold: usize) -> ServerCompressionFilter {
        ServerCompressionFilter::new(&CompressionConfig { response_threshold: threshold, ..CompressionConfig::default() })
    }

    fn response(body: &'static str) -> StreamResponse {
        Response::builder()
            .header(CONTENT_LENGTH, body.len())
            .header("x-original", "kept")
            .body(EntityStreams::once(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    /// Runs the request hook for a request with `headers`, leaving the negotiation in `ctx`.
    async fn receive(filter: &ServerCompressionFilter, headers: &[(&'static str, &str)], ctx: &mut RequestContext) {
        let mut request = Request::get("/").body(EntityStreams::empty()).unwrap();
        for (name, value) in headers {
            request.headers_mut().insert(*name, HeaderValue::from_str(value).unwrap());
        }
        assert!(matches!(filter.on_request(request, ctx, &mut WireAttributes::new()).await.unwrap(), FilterFlow::Next(_)));
    }

    #[tokio::test]
    async fn inflates_request_bodies() {
        let compressed = EncodingType::Brotli.compressor().unwrap().deflate(EntityStreams::once(Bytes::from_static(b"payload")));
        let request = Request::post("/").header(CONTENT_ENCODING, "br").header(CONTENT_LENGTH, "11").body(compressed).unwrap();

        let flow = filter(0).on_request(request, &mut RequestContext::new(), &mut WireAttributes::new()).await.unwrap();
        let FilterFlow::Next(request) = flow else { panic!("request should be forwarded") };
        assert!(request.headers().get(CONTENT_ENCODING).is_none());
        assert!(request.headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(EntityStreams::collect(request.into_body()).await.unwrap(), "payload");
    }

    #[tokio::test]
    async fn unsupported_request_codings_are_rejected() {
        let request = Request::post("/").header(CONTENT_ENCODING, "snappy").body(EntityStreams::empty()).unwrap();

        let err = filter(0).on_request(request, &mut RequestContext::new(), &mut WireAttributes::new()).await.unwrap_err();
        assert_eq!(err.response_status(), Some(StatusCode::UNSUPPORTED_MEDIA_TYPE));
        let TransportError::ErrorResponse(response) = err else { unreachable!() };
        assert_eq!(EntityStreams::collect(response.into_body()).await.unwrap(), "Unsupported encoding referenced: snappy");
    }

    #[tokio::test]
    async fn compresses_responses_from_the_threshold_on() {
        let filter = filter(5);
        let mut ctx = RequestContext::new();
        receive(&filter, &[("accept-encoding", "gzip;q=0.5, deflate")], &mut ctx).await;

        let small = filter.on_response(response("1234"), &mut ctx, &mut WireAttributes::new()).await.unwrap();
        assert!(small.headers().get(CONTENT_ENCODING).is_none());
        assert_eq!(small.headers()[CONTENT_LENGTH], "4");

        let large = filter.on_response(response("12345"), &mut ctx, &mut WireAttributes::new()).await.unwrap();
        assert_eq!(large.headers()[CONTENT_ENCODING], "deflate");
        assert!(large.headers().get(CONTENT_LENGTH).is_none());
        let inflated = EncodingType::Deflate.compressor().unwrap().inflate(large.into_body());
        assert_eq!(EntityStreams::collect(inflated).await.unwrap(), "12345");
    }

    #[tokio::test]
    async fn clients_can_lower_the_threshold() {
        let filter = filter(1024);
        let mut ctx = RequestContext::new();
        receive(&filter, &[("accept-encoding", "zstd"), (RESPONSE_COMPRESSION_THRESHOLD_HEADER, "0")], &mut ctx).await;

        let response = filter.on_response(response("x"), &mut ctx, &mut WireAttributes::new()).await.unwrap();
        assert_eq!(response.headers()[CONTENT_ENCODING], "zstd");
    }

    #[tokio::test]
    async fn responses_pass_without_negotiation() {
        let filter = filter(0);
        let untouched = filter.on_response(response("abc"), &mut RequestContext::new(), &mut WireAttributes::new()).await.unwrap();
        assert!(untouched.headers().get(CONTENT_ENCODING).is_none());

        let mut ctx = RequestContext::new();
        receive(&filter, &[("accept-encoding", "identity")], &mut ctx).await;
        let identity = filter.on_response(response("abc"), &mut ctx, &mut WireAttributes::new()).await.unwrap();
        assert!(identity.headers().get(CONTENT_ENCODING).is_none());
        assert_eq!(EntityStreams::collect(identity.into_body()).await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn preferred_identity_beats_lower_ranked_codings() {
        let filter = filter(0);
        let mut ctx = RequestContext::new();
        receive(&filter, &[("accept-encoding", "identity, gzip;q=0.5")], &mut ctx).await;

        let response = filter.on_response(response("abc"), &mut ctx, &mut WireAttributes::new()).await.unwrap();
        assert!(response.headers().get(CONTENT_ENCODING).is_none());
        assert_eq!(EntityStreams::collect(response.into_body()).await.unwrap(), "abc");
    }

    #[tokio::test]
    async fn nothing_acceptable_is_406_with_the_original_headers() {
        let filter = filter(0).with_supported(vec![EncodingType::Gzip]);
        let mut ctx = RequestContext::new();
        receive(&filter, &[("accept-encoding", "br, identity;q=0")], &mut ctx).await;

        let err = filter.on_response(response("abc"), &mut ctx, &mut WireAttributes::new()).await.unwrap_err();
        assert_eq!(err.response_status(), Some(StatusCode::NOT_ACCEPTABLE));
        let TransportError::ErrorResponse(response) = err else { unreachable!() };
        assert_eq!(response.headers()["x-original"], "kept");
    }

    #[tokio::test]
    async fn compresses_error_responses() {
        let filter = filter(0);
        let mut ctx = RequestContext::new();
        receive(&filter, &[("accept-encoding", "gzip")], &mut ctx).await;

        let error = TransportError::error_response(text_response(StatusCode::BAD_REQUEST, "bad input"));
        let err = filter.on_error(error, &mut ctx, &mut WireAttributes::new()).await.unwrap_err();
        let TransportError::ErrorResponse(response) = err else { unreachable!() };
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[CONTENT_ENCODING], "gzip");
    }
}
