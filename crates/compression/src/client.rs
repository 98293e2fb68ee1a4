use async_trait::async_trait;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH};
use http::{HeaderMap, HeaderValue};
use micro_transport::context::{RequestContext, keys};
use micro_transport::error::TransportError;
use micro_transport::filter::{FilterFlow, StreamFilter};
use micro_transport::message::{StreamRequest, StreamResponse, WireAttributes};
use micro_transport::stream::EntityStreams;
use tracing::{debug, trace};

use crate::partial::{PartialRead, read_partial};
use crate::{AcceptEncoding, CompressionConfig, CompressionError, CompressionOption, EncodingType};

/// Request header through which a client tells the server from which size on to compress the
/// response.
pub const RESPONSE_COMPRESSION_THRESHOLD_HEADER: &str = "x-response-compression-threshold";

/// Client side compression: compresses request bodies, asks for compressed responses and inflates
/// them.
#[derive(Debug)]
pub struct ClientCompressionFilter {
    config: CompressionConfig,
    accept_encoding: Option<HeaderValue>,
}

impl ClientCompressionFilter {
    pub fn new(config: &CompressionConfig) -> Result<Self, CompressionError> {
        if config.request_encoding == EncodingType::Any {
            return Err(CompressionError::InvalidRequestEncoding(config.request_encoding));
        }
        let accept_encoding = match AcceptEncoding::header_value(&config.accepted_encodings) {
            header if header.is_empty() => None,
            header => Some(
                HeaderValue::from_str(&header).map_err(|_e| CompressionError::InvalidAcceptEncoding(header.clone()))?,
            ),
        };
        Ok(Self { config: config.clone(), accept_encoding })
    }

    fn add_response_compression_headers(&self, headers: &mut HeaderMap, ctx: &RequestContext) {
        let Some(accept_encoding) = &self.accept_encoding else {
            return;
        };
        let operation = ctx.get_local_attr::<String>(keys::OPERATION).map(String::as_str);
        if !self.config.compresses_operation(operation) {
            return;
        }

        let threshold = match ctx.get_local_attr::<CompressionOption>(keys::RESPONSE_COMPRESSION_OVERRIDE) {
            None => self.config.response_threshold,
            Some(CompressionOption::ForceOn) => 0,
            Some(CompressionOption::ForceOff) => return,
        };
        headers.insert(ACCEPT_ENCODING, accept_encoding.clone());
        headers.insert(RESPONSE_COMPRESSION_THRESHOLD_HEADER, HeaderValue::from(threshold));
    }
}

#[async_trait]
impl StreamFilter for ClientCompressionFilter {
    async fn on_request(
        &self,
        mut request: StreamRequest,
        ctx: &mut RequestContext,
        _wire: &mut WireAttributes,
    ) -> Result<FilterFlow, TransportError> {
        self.add_response_compression_headers(request.headers_mut(), ctx);

        let Some(compressor) = self.config.request_encoding.compressor() else {
            return Ok(FilterFlow::Next(request));
        };
        let threshold = match ctx.get_local_attr::<CompressionOption>(keys::REQUEST_COMPRESSION_OVERRIDE) {
            None => self.config.request_threshold,
            Some(CompressionOption::ForceOn) => 0,
            Some(CompressionOption::ForceOff) => return Ok(FilterFlow::Next(request)),
        };

        let (mut parts, body) = request.into_parts();
        let body = match read_partial(body, threshold).await? {
            PartialRead::Complete(chunks) => {
                trace!(threshold, "request body below compression threshold");
                EntityStreams::from_chunks(chunks)
            }
            PartialRead::Exceeds(body) => {
                parts.headers.remove(CONTENT_LENGTH);
                parts.headers.insert(CONTENT_ENCODING, HeaderValue::from_static(compressor.content_encoding().http_name()));
                compressor.deflate(body)
            }
        };
        Ok(FilterFlow::Next(StreamRequest::from_parts(parts, body)))
    }

    async fn on_response(
        &self,
        response: StreamResponse,
        ctx: &mut RequestContext,
        _wire: &mut WireAttributes,
    ) -> Result<StreamResponse, TransportError> {
        if ctx.flag(keys::RESPONSE_DECOMPRESSION_OFF) {
            return Ok(response);
        }
        match response_coding(&response) {
            Ok(coding) => Ok(inflate(response, coding)),
            Err(name) => Err(CompressionError::UnrecognizedResponseEncoding(name).into()),
        }
    }

    async fn on_error(
        &self,
        error: TransportError,
        ctx: &mut RequestContext,
        _wire: &mut WireAttributes,
    ) -> Result<StreamResponse, TransportError> {
        match error {
            TransportError::ErrorResponse(response) if !ctx.flag(keys::RESPONSE_DECOMPRESSION_OFF) => {
                // an error response in an unknown coding is handed on as is
                let response = match response_coding(&response) {
                    Ok(coding) => inflate(*response, coding),
                    Err(_) => *response,
                };
                Err(TransportError::error_response(response))
            }
            error => Err(error),
        }
    }
}

/// The coding named by the `Content-Encoding` of `response`, or the unrecognized name.
fn response_coding(response: &StreamResponse) -> Result<Option<EncodingType>, String> {
    let Some(encoding) = response.headers().get(CONTENT_ENCODING) else {
        return Ok(None);
    };
    let name = String::from_utf8_lossy(encoding.as_bytes()).into_owned();
    match name.parse::<EncodingType>() {
        Ok(EncodingType::Any) | Err(_) => {
            debug!(encoding = %name, "unrecognized response content encoding");
            Err(name)
        }
        Ok(coding) => Ok(Some(coding)),
    }
}

fn inflate(response: StreamResponse, coding: Option<EncodingType>) -> StreamResponse {
    let Some(coding) = coding else {
        return response;
    };
    let (mut parts, body) = response.into_parts();
    parts.headers.remove(CONTENT_ENCODING);
    parts.headers.remove(CONTENT_LENGTH);
    let body = match coding.compressor() {
        Some(compressor) => compressor.inflate(body),
        None => body,
    };
    StreamResponse::from_parts(parts, body)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{Request, Response, StatusCode};
    use micro_transport::message::text_response;
    use micro_transport::stream::EntityStream;

    use super::*;

    fn filter(config: CompressionConfig) -> ClientCompressionFilter {
        ClientCompressionFilter::new(&config).unwrap()
    }

    fn request(body: &'static [u8]) -> StreamRequest {
        Request::post("http://localhost/echo")
            .header(CONTENT_LENGTH, body.len())
            .body(EntityStreams::once(Bytes::from_static(body)))
            .unwrap()
    }

    async fn forwarded(filter: &ClientCompressionFilter, request: StreamRequest, ctx: &mut RequestContext) -> StreamRequest {
        match filter.on_request(request, ctx, &mut WireAttributes::new()).await.unwrap() {
            FilterFlow::Next(request) => request,
            FilterFlow::Respond(_) => panic!("the compression filter never answers requests"),
        }
    }

    fn gzip(body: &'static [u8]) -> EntityStream {
        EncodingType::Gzip.compressor().unwrap().deflate(EntityStreams::once(Bytes::from_static(body)))
    }

    #[test]
    fn any_is_not_a_request_encoding() {
        let config = CompressionConfig { request_encoding: EncodingType::Any, ..CompressionConfig::default() };
        assert!(matches!(ClientCompressionFilter::new(&config), Err(CompressionError::InvalidRequestEncoding(EncodingType::Any))));
    }

    #[tokio::test]
    async fn compresses_requests_from_the_threshold_on() {
        let filter = filter(CompressionConfig {
            request_threshold: 8,
            request_encoding: EncodingType::Gzip,
            ..CompressionConfig::default()
        });

        let below = forwarded(&filter, request(b"1234567"), &mut RequestContext::new()).await;
        assert!(below.headers().get(CONTENT_ENCODING).is_none());
        assert_eq!(below.headers()[CONTENT_LENGTH], "7");
        assert_eq!(EntityStreams::collect(below.into_body()).await.unwrap(), "1234567");

        let at = forwarded(&filter, request(b"12345678"), &mut RequestContext::new()).await;
        assert_eq!(at.headers()[CONTENT_ENCODING], "gzip");
        assert!(at.headers().get(CONTENT_LENGTH).is_none());
        let inflated = EncodingType::Gzip.compressor().unwrap().inflate(at.into_body());
        assert_eq!(EntityStreams::collect(inflated).await.unwrap(), "12345678");
    }

    #[tokio::test]
    async fn request_overrides() {
        let filter = filter(CompressionConfig {
            request_threshold: 4,
            request_encoding: EncodingType::Deflate,
            ..CompressionConfig::default()
        });

        let mut ctx = RequestContext::new();
        ctx.put_local_attr(keys::REQUEST_COMPRESSION_OVERRIDE, CompressionOption::ForceOn);
        let forced = forwarded(&filter, request(b"tiny"), &mut ctx).await;
        assert_eq!(forced.headers()[CONTENT_ENCODING], "deflate");

        let mut ctx = RequestContext::new();
        ctx.put_local_attr(keys::REQUEST_COMPRESSION_OVERRIDE, CompressionOption::ForceOff);
        let untouched = forwarded(&filter, request(b"well above the threshold"), &mut ctx).await;
        assert!(untouched.headers().get(CONTENT_ENCODING).is_none());
    }

    #[tokio::test]
    async fn asks_for_compressed_responses() {
        let config = CompressionConfig {
            response_threshold: 100,
            accepted_encodings: vec![EncodingType::Gzip, EncodingType::Deflate],
            response_compression_operations: vec!["get".to_string()],
            compress_without_operation_hint: false,
            ..CompressionConfig::default()
        };
        let filter = filter(config);
        let with_operation = |operation: &str| {
            let mut ctx = RequestContext::new();
            ctx.put_local_attr(keys::OPERATION, operation.to_string());
            ctx
        };

        let asked = forwarded(&filter, request(b""), &mut with_operation("get")).await;
        assert_eq!(asked.headers()[ACCEPT_ENCODING], "gzip;q=1.00,deflate;q=0.67");
        assert_eq!(asked.headers()[RESPONSE_COMPRESSION_THRESHOLD_HEADER], "100");

        for mut ctx in [with_operation("create"), RequestContext::new()] {
            let plain = forwarded(&filter, request(b""), &mut ctx).await;
            assert!(plain.headers().get(ACCEPT_ENCODING).is_none());
        }

        let mut forced_on = with_operation("get");
        forced_on.put_local_attr(keys::RESPONSE_COMPRESSION_OVERRIDE, CompressionOption::ForceOn);
        let forced = forwarded(&filter, request(b""), &mut forced_on).await;
        assert_eq!(forced.headers()[RESPONSE_COMPRESSION_THRESHOLD_HEADER], "0");

        let mut forced_off = with_operation("get");
        forced_off.put_local_attr(keys::RESPONSE_COMPRESSION_OVERRIDE, CompressionOption::ForceOff);
        let plain = forwarded(&filter, request(b""), &mut forced_off).await;
        assert!(plain.headers().get(ACCEPT_ENCODING).is_none());
        assert!(plain.headers().get(RESPONSE_COMPRESSION_THRESHOLD_HEADER).is_none());
    }

    #[tokio::test]
    async fn inflates_responses() {
        let filter = filter(CompressionConfig::default());
        let response = Response::builder().header(CONTENT_ENCODING, "gzip").header(CONTENT_LENGTH, "3").body(gzip(b"hello")).unwrap();

        let inflated = filter.on_response(response, &mut RequestContext::new(), &mut WireAttributes::new()).await.unwrap();
        assert!(inflated.headers().get(CONTENT_ENCODING).is_none());
        assert!(inflated.headers().get(CONTENT_LENGTH).is_none());
        assert_eq!(EntityStreams::collect(inflated.into_body()).await.unwrap(), "hello");

        let mut ctx = RequestContext::new();
        ctx.put_local_attr(keys::RESPONSE_DECOMPRESSION_OFF, true);
        let response = Response::builder().header(CONTENT_ENCODING, "gzip").body(gzip(b"hello")).unwrap();
        let raw = filter.on_response(response, &mut ctx, &mut WireAttributes::new()).await.unwrap();
        assert_eq!(raw.headers()[CONTENT_ENCODING], "gzip");
        assert_ne!(EntityStreams::collect(raw.into_body()).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn rejects_unknown_response_codings() {
        let filter = filter(CompressionConfig::default());
        let response = Response::builder().header(CONTENT_ENCODING, "snappy").body(EntityStreams::empty()).unwrap();

        let err = filter.on_response(response, &mut RequestContext::new(), &mut WireAttributes::new()).await.unwrap_err();
        assert_eq!(err.root_cause().to_string(), "Server returned unrecognized content encoding: snappy");
    }

    #[tokio::test]
    async fn inflates_error_responses() {
        let filter = filter(CompressionConfig::default());
        let mut response = text_response(StatusCode::INTERNAL_SERVER_ERROR, "");
        *response.body_mut() = gzip(b"boom");
        response.headers_mut().insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        let err = filter
            .on_error(TransportError::error_response(response), &mut RequestContext::new(), &mut WireAttributes::new())
            .await
            .unwrap_err();
        let response = match err {
            TransportError::ErrorResponse(response) => response,
            other => panic!("expected an error response, got {other}"),
        };
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(EntityStreams::collect(response.into_body()).await.unwrap(), "boom");
    }
}
