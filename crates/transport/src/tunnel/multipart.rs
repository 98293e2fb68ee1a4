//! Minimal `multipart/mixed` bodies: one `Content-Type` header per part.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::TransportError;

const MAX_PART_HEADERS: usize = 16;

static BOUNDARY_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Part {
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// A boundary that occurs in none of `parts`.
pub(crate) fn boundary_for(parts: &[Part]) -> String {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.subsec_nanos()).unwrap_or_default();
    loop {
        let seq = BOUNDARY_SEQ.fetch_add(1, Ordering::Relaxed);
        let boundary = format!("----transport-tunnel-{:08x}{seq:08x}", nanos);
        if !parts.iter().any(|part| find(&part.body, boundary.as_bytes()).is_some()) {
            return boundary;
        }
    }
}

pub(crate) fn write(boundary: &str, parts: &[Part]) -> Bytes {
    let mut buf = BytesMut::new();
    for part in parts {
        buf.put_slice(b"--");
        buf.put_slice(boundary.as_bytes());
        buf.put_slice(b"\r\n");
        if let Some(content_type) = &part.content_type {
            buf.put_slice(b"Content-Type: ");
            buf.put_slice(content_type.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
        buf.put_slice(&part.body);
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"--");
    buf.put_slice(boundary.as_bytes());
    buf.put_slice(b"--\r\n");
    buf.freeze()
}

pub(crate) fn parse(boundary: &str, body: &Bytes) -> Result<Vec<Part>, TransportError> {
    let delimiter = format!("--{boundary}");
    let inner_delimiter = format!("\r\n--{boundary}");
    let malformed = || TransportError::invalid_request("malformed multipart body");

    let start = find(body, delimiter.as_bytes()).ok_or_else(malformed)?;
    let mut offset = start + delimiter.len();
    let mut parts = Vec::new();
    loop {
        let rest = &body[offset..];
        if rest.starts_with(b"--") {
            return Ok(parts);
        }
        // skip transport padding up to the end of the delimiter line
        let line_end = find(rest, b"\r\n").ok_or_else(malformed)?;
        offset += line_end + 2;

        let rest = &body[offset..];
        let end = find(rest, inner_delimiter.as_bytes()).ok_or_else(malformed)?;
        parts.push(parse_part(body.slice(offset..offset + end))?);
        offset += end + inner_delimiter.len();
    }
}

fn parse_part(part: Bytes) -> Result<Part, TransportError> {
    if part.starts_with(b"\r\n") {
        return Ok(Part { content_type: None, body: part.slice(2..) });
    }

    let header_end = find(&part, b"\r\n\r\n")
        .ok_or_else(|| TransportError::invalid_request("multipart part without header terminator"))?;
    let mut headers = [httparse::EMPTY_HEADER; MAX_PART_HEADERS];
    let content_type = match httparse::parse_headers(&part[..header_end + 4], &mut headers) {
        Ok(httparse::Status::Complete((_, headers))) => headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case("content-type"))
            .map(|header| String::from_utf8_lossy(header.value).trim().to_string()),
        Ok(httparse::Status::Partial) | Err(_) => {
            return Err(TransportError::invalid_request("malformed multipart part headers"));
        }
    };
    Ok(Part { content_type, body: part.slice(header_end + 4..) })
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_what_it_writes() {
        let parts = vec![
            Part { content_type: Some("application/x-www-form-urlencoded".into()), body: Bytes::from_static(b"a=1") },
            Part { content_type: Some("application/json".into()), body: Bytes::from_static(b"{\"x\":\r\n1}") },
        ];
        let boundary = boundary_for(&parts);
        let body = write(&boundary, &parts);

        assert_eq!(parse(&boundary, &body).unwrap(), parts);
    }

    #[test]
    fn parses_foreign_bodies() {
        let body = Bytes::from_static(
            b"preamble\r\n--xyz\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\nids=1,2,3\r\n--xyz\r\n\
              content-type: application/json\r\n\r\n{\"foo\":\"bar\"}\r\n--xyz--",
        );
        let parts = parse("xyz", &body).unwrap();

        assert_eq!(parts.len(), 2);
        assert_eq!(&parts[0].body[..], b"ids=1,2,3");
        assert_eq!(parts[1].content_type.as_deref(), Some("application/json"));
        assert_eq!(&parts[1].body[..], b"{\"foo\":\"bar\"}");
    }

    #[test]
    fn rejects_truncated_bodies() {
        let body = Bytes::from_static(b"--xyz\r\nContent-Type: text/plain\r\n\r\nunterminated");
        assert!(parse("xyz", &body).is_err());
    }
}
