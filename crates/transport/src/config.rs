//! Client and server configuration.
//!
//! Both structs deserialize with `serde` from any self-describing format, every field being
//! optional. Durations are plain milliseconds. A client can also be configured from the flat
//! `http.*` string properties a client factory receives, see [`ClientConfig::from_properties`].

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::codec::DEFAULT_MAX_HEADER_BYTES;
use crate::negotiation::tls::{ClientTlsConfig, ServerTlsConfig};
use crate::negotiation::{HttpProtocol, ProtocolPolicy};
use crate::pool::{PoolConfig, PoolStrategy};

pub const HTTP_REQUEST_TIMEOUT: &str = "http.requestTimeout";
pub const HTTP_STREAMING_TIMEOUT: &str = "http.streamingTimeout";
pub const HTTP_POOL_SIZE: &str = "http.poolSize";
pub const HTTP_POOL_MIN_SIZE: &str = "http.poolMinSize";
pub const HTTP_POOL_WAITER_SIZE: &str = "http.poolWaiterSize";
pub const HTTP_POOL_STRATEGY: &str = "http.poolStrategy";
pub const HTTP_IDLE_TIMEOUT: &str = "http.idleTimeout";
pub const HTTP_MAX_HEADER_SIZE: &str = "http.maxHeaderSize";
pub const HTTP_QUERY_POST_THRESHOLD: &str = "http.queryPostThreshold";
pub const HTTP_PROTOCOL_VERSION: &str = "http.protocolVersion";
pub const HTTP_SHUTDOWN_TIMEOUT: &str = "http.shutdownTimeout";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for property {key}")]
    InvalidProperty { key: String, value: String },
}

impl ConfigError {
    fn invalid(key: &str, value: &str) -> Self {
        Self::InvalidProperty { key: key.to_string(), value: value.to_string() }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// bounds a call from issuance until its response body is drained
    pub request_timeout_ms: u64,
    /// maximum gap between two response body chunks, `0` disables it
    pub streaming_timeout_ms: u64,
    pub pool: PoolConfig,
    /// URIs at least this long are tunneled through POST
    pub query_tunnel_threshold: usize,
    pub protocol: ProtocolPolicy,
    pub max_header_bytes: usize,
    pub shutdown_grace_ms: u64,
    pub tls: Option<ClientTlsConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            streaming_timeout_ms: 0,
            pool: PoolConfig::default(),
            query_tunnel_threshold: 4096,
            protocol: ProtocolPolicy::default(),
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            shutdown_grace_ms: 30_000,
            tls: None,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn streaming_timeout(&self) -> Option<Duration> {
        (self.streaming_timeout_ms > 0).then(|| Duration::from_millis(self.streaming_timeout_ms))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Builds a configuration from flat `http.*` properties. Properties that are absent keep their
    /// default, unknown properties are ignored.
    ///
    /// `http.protocolVersion` takes `HTTP_1_1` or `HTTP_2`, `http.poolStrategy` takes `MRU` or
    /// `LRU`; every other property is a number.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (key, value) in properties {
            let value = value.trim();
            match key.as_str() {
                HTTP_REQUEST_TIMEOUT => config.request_timeout_ms = number(key, value)?,
                HTTP_STREAMING_TIMEOUT => config.streaming_timeout_ms = number(key, value)?,
                HTTP_POOL_SIZE => config.pool.max_size = number(key, value)?,
                HTTP_POOL_MIN_SIZE => config.pool.min_size = number(key, value)?,
                HTTP_POOL_WAITER_SIZE => config.pool.max_waiters = number(key, value)?,
                HTTP_IDLE_TIMEOUT => config.pool.idle_timeout_ms = number(key, value)?,
                HTTP_POOL_STRATEGY => {
                    config.pool.strategy = match value.to_ascii_uppercase().as_str() {
                        "MRU" => PoolStrategy::Mru,
                        "LRU" => PoolStrategy::Lru,
                        _ => return Err(ConfigError::invalid(key, value)),
                    };
                }
                HTTP_MAX_HEADER_SIZE => config.max_header_bytes = number(key, value)?,
                HTTP_QUERY_POST_THRESHOLD => config.query_tunnel_threshold = number(key, value)?,
                HTTP_PROTOCOL_VERSION => {
                    config.protocol = match value {
                        "HTTP_1_1" => ProtocolPolicy::http11(),
                        "HTTP_2" => ProtocolPolicy::http2(),
                        _ => return Err(ConfigError::invalid(key, value)),
                    };
                }
                HTTP_SHUTDOWN_TIMEOUT => config.shutdown_grace_ms = number(key, value)?,
                _ => debug!(key, "ignore unknown client property"),
            }
        }
        Ok(config)
    }
}

fn number<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_e| ConfigError::invalid(key, value))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: SocketAddr,
    /// protocols served, most preferred first; `h2` without TLS enables the clear text upgrade
    pub protocols: Vec<HttpProtocol>,
    /// maximum gap between two request body chunks, `0` disables it
    pub streaming_timeout_ms: u64,
    pub max_header_bytes: usize,
    pub tls: Option<ServerTlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            protocols: vec![HttpProtocol::Http2, HttpProtocol::Http11],
            streaming_timeout_ms: 0,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            tls: None,
        }
    }
}

impl ServerConfig {
    pub fn streaming_timeout(&self) -> Option<Duration> {
        (self.streaming_timeout_ms > 0).then(|| Duration::from_millis(self.streaming_timeout_ms))
    }

    pub(crate) fn allows_h2c(&self) -> bool {
        self.tls.is_none() && self.protocols.contains(&HttpProtocol::Http2)
    }
}
