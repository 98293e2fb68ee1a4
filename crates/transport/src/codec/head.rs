//! Request and status line parsing and encoding, including the framing headers.

use bytes::{Buf, BufMut, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri, Version, header};
use httparse::Status;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, RequestHead, ResponseHead, SendError, method_has_body, response_has_body};

pub(crate) const MAX_HEADER_NUM: usize = 64;

/// Default limit for the size of a message head.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 8 * 1024;

const INIT_HEADER_SIZE: usize = 4 * 1024;

pub(crate) fn decode_request_head(
    src: &mut BytesMut,
    max_header_bytes: usize,
) -> Result<Option<(RequestHead, PayloadSize)>, ParseError> {
    let parsed = {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(src).map_err(map_httparse_error)? {
            Status::Complete(offset) => {
                ensure!(offset <= max_header_bytes, ParseError::too_large_header(offset, max_header_bytes));
                let method = Method::from_bytes(req.method.ok_or(ParseError::InvalidMethod)?.as_bytes())
                    .map_err(|_e| ParseError::InvalidMethod)?;
                let uri: Uri = req.path.ok_or(ParseError::InvalidUri)?.parse().map_err(|_e| ParseError::InvalidUri)?;
                let version = version_of(req.version)?;
                let headers = collect_headers(req.headers)?;
                Some((offset, method, uri, version, headers))
            }
            Status::Partial => None,
        }
    };

    let Some((offset, method, uri, version, headers)) = parsed else {
        ensure!(src.len() <= max_header_bytes, ParseError::too_large_header(src.len(), max_header_bytes));
        return Ok(None);
    };
    src.advance(offset);
    trace!(head_size = offset, %method, %uri, "parsed request head");

    let mut head = Request::new(());
    *head.method_mut() = method;
    *head.uri_mut() = uri;
    *head.version_mut() = version;
    *head.headers_mut() = headers;

    let payload_size = request_payload_size(&head)?;
    Ok(Some((head, payload_size)))
}

pub(crate) fn decode_response_head(
    src: &mut BytesMut,
    request_method: &Method,
    max_header_bytes: usize,
) -> Result<Option<(ResponseHead, PayloadSize)>, ParseError> {
    let parsed = {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADER_NUM];
        let mut resp = httparse::Response::new(&mut headers);
        match resp.parse(src).map_err(map_httparse_error)? {
            Status::Complete(offset) => {
                ensure!(offset <= max_header_bytes, ParseError::too_large_header(offset, max_header_bytes));
                let status = resp
                    .code
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .ok_or(ParseError::InvalidStatus(resp.code))?;
                let version = version_of(resp.version)?;
                let headers = collect_headers(resp.headers)?;
                Some((offset, status, version, headers))
            }
            Status::Partial => None,
        }
    };

    let Some((offset, status, version, headers)) = parsed else {
        ensure!(src.len() <= max_header_bytes, ParseError::too_large_header(src.len(), max_header_bytes));
        return Ok(None);
    };
    src.advance(offset);
    trace!(head_size = offset, %status, "parsed response head");

    let mut head = Response::new(());
    *head.status_mut() = status;
    *head.version_mut() = version;
    *head.headers_mut() = headers;

    let payload_size = response_payload_size(request_method, &head)?;
    Ok(Some((head, payload_size)))
}

fn map_httparse_error(e: httparse::Error) -> ParseError {
    match e {
        httparse::Error::TooManyHeaders => ParseError::too_many_headers(MAX_HEADER_NUM),
        httparse::Error::Version => ParseError::InvalidVersion(None),
        e => ParseError::invalid_header(e.to_string()),
    }
}

fn version_of(version: Option<u8>) -> Result<Version, ParseError> {
    match version {
        Some(0) => Ok(Version::HTTP_10),
        Some(1) => Ok(Version::HTTP_11),
        v => Err(ParseError::InvalidVersion(v)),
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap, ParseError> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for header in parsed {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(ParseError::invalid_header)?;
        let value = HeaderValue::from_bytes(header.value).map_err(ParseError::invalid_header)?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn request_payload_size(head: &RequestHead) -> Result<PayloadSize, ParseError> {
    match framing(head.headers())? {
        Some(size) => Ok(size),
        None => Ok(PayloadSize::Empty),
    }
}

fn response_payload_size(request_method: &Method, head: &ResponseHead) -> Result<PayloadSize, ParseError> {
    if !response_has_body(request_method, head.status()) {
        return Ok(PayloadSize::Empty);
    }
    Ok(framing(head.headers())?.unwrap_or(PayloadSize::UntilClose))
}

/// Framing declared by `Transfer-Encoding` / `Content-Length`, if any.
fn framing(headers: &HeaderMap) -> Result<Option<PayloadSize>, ParseError> {
    let te_header = headers.get(header::TRANSFER_ENCODING);
    let cl_header = headers.get(header::CONTENT_LENGTH);

    match (te_header, cl_header) {
        (None, None) => Ok(None),
        (Some(te_value), None) => {
            ensure!(is_chunked(Some(te_value)), ParseError::invalid_header("transfer-encoding without chunked"));
            Ok(Some(PayloadSize::Chunked))
        }
        (None, Some(cl_value)) => {
            let cl_str = cl_value.to_str().map_err(|_e| ParseError::invalid_content_length("value can't to_str"))?;
            let length = cl_str
                .trim()
                .parse::<u64>()
                .map_err(|_e| ParseError::invalid_content_length(format!("value {cl_str} is not u64")))?;
            Ok(Some(if length == 0 { PayloadSize::Empty } else { PayloadSize::Length(length) }))
        }
        (Some(_), Some(_)) => {
            Err(ParseError::invalid_content_length("transfer_encoding and content_length both present in headers"))
        }
    }
}

fn is_chunked(header_value: Option<&HeaderValue>) -> bool {
    const CHUNKED: &[u8] = b"chunked";
    header_value
        .and_then(|value| value.as_bytes().rsplit(|b| *b == b',').next())
        .is_some_and(|last| last.trim_ascii().eq_ignore_ascii_case(CHUNKED))
}

/// Rewrites the framing headers of `headers` to match `payload_size`.
fn set_framing(headers: &mut HeaderMap, payload_size: PayloadSize, bodyless_needs_length: bool) {
    match payload_size {
        PayloadSize::Length(n) => {
            headers.remove(header::TRANSFER_ENCODING);
            headers.insert(header::CONTENT_LENGTH, n.into());
        }
        PayloadSize::Chunked => {
            headers.remove(header::CONTENT_LENGTH);
            headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        }
        PayloadSize::Empty => {
            headers.remove(header::TRANSFER_ENCODING);
            if bodyless_needs_length {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
            } else {
                headers.remove(header::CONTENT_LENGTH);
            }
        }
        PayloadSize::UntilClose => {
            headers.remove(header::TRANSFER_ENCODING);
            headers.remove(header::CONTENT_LENGTH);
        }
    }
}

fn put_headers(headers: &HeaderMap, dst: &mut BytesMut) {
    for (header_name, header_value) in headers {
        dst.put_slice(header_name.as_ref());
        dst.put_slice(b": ");
        dst.put_slice(header_value.as_ref());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
}

pub(crate) fn encode_request_head(
    mut head: RequestHead,
    payload_size: PayloadSize,
    dst: &mut BytesMut,
) -> Result<(), SendError> {
    if head.version() != Version::HTTP_11 {
        return Err(SendError::UnsupportedVersion(head.version()));
    }
    let bodyless_needs_length = method_has_body(head.method());
    set_framing(head.headers_mut(), payload_size, bodyless_needs_length);

    dst.reserve(INIT_HEADER_SIZE);
    dst.put_slice(head.method().as_str().as_bytes());
    dst.put_u8(b' ');
    let target = if *head.method() == Method::OPTIONS && head.uri().path() == "*" {
        "*"
    } else {
        head.uri().path_and_query().map_or("/", |path_and_query| path_and_query.as_str())
    };
    dst.put_slice(target.as_bytes());
    dst.put_slice(b" HTTP/1.1\r\n");
    put_headers(head.headers(), dst);
    Ok(())
}

pub(crate) fn encode_response_head(
    mut head: ResponseHead,
    payload_size: PayloadSize,
    dst: &mut BytesMut,
) -> Result<(), SendError> {
    if head.version() != Version::HTTP_11 {
        return Err(SendError::UnsupportedVersion(head.version()));
    }
    let status = head.status();
    let bodyless_needs_length = !status.is_informational() && status != StatusCode::NO_CONTENT;
    set_framing(head.headers_mut(), payload_size, bodyless_needs_length);

    dst.reserve(INIT_HEADER_SIZE);
    dst.put_slice(b"HTTP/1.1 ");
    dst.put_slice(status.as_str().as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    dst.put_slice(b"\r\n");
    put_headers(head.headers(), dst);
    Ok(())
}
