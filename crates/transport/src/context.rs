//! Per-call attribute bag shared between filters and the transport.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

/// Well-known [`RequestContext`] keys.
///
/// These form the informal protocol between filters, the client/server transports and
/// application code.
pub mod keys {
    /// [`crate::disrupt::DisruptContext`]: fault to inject into this call, consumed once.
    pub const DISRUPT_CONTEXT: &str = "transport.disrupt.context";
    /// `String`: name of the operation being invoked, drives response compression decisions.
    pub const OPERATION: &str = "transport.operation";
    /// `bool`: tunnel the query through the body regardless of its length.
    pub const FORCE_QUERY_TUNNEL: &str = "transport.query_tunnel.force";
    /// `bool`: set on the server when the request arrived tunneled.
    pub const IS_QUERY_TUNNELED: &str = "transport.query_tunnel.is_tunneled";
    /// compression override for the request body (see the compression crate).
    pub const REQUEST_COMPRESSION_OVERRIDE: &str = "transport.compression.request_override";
    /// compression override for the response body (see the compression crate).
    pub const RESPONSE_COMPRESSION_OVERRIDE: &str = "transport.compression.response_override";
    /// `bool`: hand the compressed response body to the caller untouched.
    pub const RESPONSE_DECOMPRESSION_OFF: &str = "transport.compression.response_decompression_off";
    /// [`crate::negotiation::SslSessionValidatorRef`]: validates the TLS session of the connection.
    pub const SSL_SESSION_VALIDATOR: &str = "transport.tls.session_validator";
    /// [`super::TraceInfo`]: tracing identifiers propagated as wire attributes.
    pub const TRACE_INFO: &str = "transport.trace_info";
    /// `tokio::time::Instant`: when the call was issued.
    pub const REQUEST_START_TIME: &str = "transport.request_start_time";
    /// `std::net::SocketAddr`: remote address of the peer, set by the server.
    pub const REMOTE_ADDRESS: &str = "transport.remote_address";
    /// [`crate::negotiation::HttpProtocol`]: protocol the call travelled over.
    pub const HTTP_PROTOCOL: &str = "transport.http_protocol";
    /// `Vec<(String, String)>`: path parameters captured by the dispatcher route.
    pub const PATH_PARAMS: &str = "transport.path_params";
}

/// A per-call mutable attribute bag, keyed by string, holding values of any `Send + Sync` type.
///
/// A context is created per call, owned by that call and never shared between calls.
#[derive(Default)]
pub struct RequestContext {
    attrs: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn put_local_attr<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.attrs.insert(key.into(), Box::new(value));
    }

    /// Returns the value under `key` if it exists and has type `T`.
    pub fn get_local_attr<T: Any>(&self, key: &str) -> Option<&T> {
        self.attrs.get(key).and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_local_attr_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.attrs.get_mut(key).and_then(|value| value.downcast_mut::<T>())
    }

    /// Removes and returns the value under `key` if it has type `T`; a value of another type is
    /// left in place.
    pub fn remove_local_attr<T: Any>(&mut self, key: &str) -> Option<T> {
        let value = self.attrs.remove(key)?;
        match value.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(value) => {
                self.attrs.insert(key.to_string(), value);
                None
            }
        }
    }

    pub fn contains_local_attr(&self, key: &str) -> bool {
        self.attrs.contains_key(key)
    }

    /// Reads a boolean flag, treating a missing or mistyped value as `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.get_local_attr::<bool>(key).copied().unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.attrs.keys().collect();
        keys.sort();
        f.debug_struct("RequestContext").field("keys", &keys).finish()
    }
}

/// Tracing identifiers carried across hops as wire attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceInfo {
    pub trace_id: String,
    pub span_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_attributes() {
        let mut ctx = RequestContext::new();
        ctx.put_local_attr(keys::OPERATION, String::from("get"));
        ctx.put_local_attr(keys::FORCE_QUERY_TUNNEL, true);

        assert_eq!(ctx.get_local_attr::<String>(keys::OPERATION).map(String::as_str), Some("get"));
        assert_eq!(ctx.get_local_attr::<u32>(keys::OPERATION), None);
        assert!(ctx.flag(keys::FORCE_QUERY_TUNNEL));
        assert!(!ctx.flag(keys::IS_QUERY_TUNNELED));
    }

    #[test]
    fn remove_keeps_mistyped_values() {
        let mut ctx = RequestContext::new();
        ctx.put_local_attr("k", 42u32);

        assert_eq!(ctx.remove_local_attr::<String>("k"), None);
        assert!(ctx.contains_local_attr("k"));
        assert_eq!(ctx.remove_local_attr::<u32>("k"), Some(42));
        assert!(ctx.is_empty());
    }
}
