//! HTTP/2 over clear text, reached through an HTTP/1.1 upgrade.
//!
//! The client opens the connection with an `OPTIONS *` request carrying `Upgrade: h2c`. A server
//! that agrees answers `101 Switching Protocols` and both sides continue with HTTP/2 on the same
//! socket; the client skips stream 1, which the upgrade request occupies. Any other answer means
//! the server only speaks HTTP/1.1.

use http::header::{CONNECTION, HOST, UPGRADE};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};

use crate::protocol::{RequestHead, ResponseHead};

pub const HTTP2_SETTINGS_HEADER: &str = "http2-settings";

/// Base64url encoded SETTINGS payload sent with the upgrade request: a single
/// `SETTINGS_ENABLE_PUSH = 0`.
pub const HTTP2_SETTINGS: &str = "AAIAAAAA";

/// First stream id the client uses once the upgrade succeeded.
pub(crate) const FIRST_STREAM_AFTER_UPGRADE: u32 = 3;

pub(crate) fn upgrade_request(authority: &str) -> RequestHead {
    let mut head = Request::new(());
    *head.method_mut() = Method::OPTIONS;
    *head.uri_mut() = Uri::from_static("*");
    *head.version_mut() = Version::HTTP_11;

    let headers = head.headers_mut();
    if let Ok(host) = HeaderValue::from_str(authority) {
        headers.insert(HOST, host);
    }
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade, HTTP2-Settings"));
    headers.insert(UPGRADE, HeaderValue::from_static("h2c"));
    headers.insert(HTTP2_SETTINGS_HEADER, HeaderValue::from_static(HTTP2_SETTINGS));
    head
}

/// Whether `head` asks to switch this connection to HTTP/2.
pub(crate) fn is_upgrade_request(head: &RequestHead) -> bool {
    has_token(head.headers(), UPGRADE.as_str(), "h2c")
        && has_token(head.headers(), CONNECTION.as_str(), "upgrade")
        && head.headers().contains_key(HTTP2_SETTINGS_HEADER)
}

pub(crate) fn is_upgrade_response(head: &ResponseHead) -> bool {
    head.status() == StatusCode::SWITCHING_PROTOCOLS && has_token(head.headers(), UPGRADE.as_str(), "h2c")
}

pub(crate) fn switching_protocols() -> ResponseHead {
    let mut head = Response::new(());
    *head.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    head.headers_mut().insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    head.headers_mut().insert(UPGRADE, HeaderValue::from_static("h2c"));
    head
}

/// The `OPTIONS *` request of a declined upgrade is answered by the server itself.
pub(crate) fn is_asterisk_options(head: &RequestHead) -> bool {
    *head.method() == Method::OPTIONS && head.uri() == "*"
}

fn has_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}
