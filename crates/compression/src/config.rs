use serde::{Deserialize, Serialize};

use crate::EncodingType;

/// Compression policy of a client or server.
///
/// Thresholds are in bytes: a body shorter than the threshold is sent as is, a body of at least
/// the threshold is compressed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub request_threshold: usize,
    pub response_threshold: usize,
    /// coding of outgoing request bodies, [`EncodingType::Identity`] disables request compression
    pub request_encoding: EncodingType,
    /// codings a client accepts for responses, most preferred first; empty disables response
    /// compression
    pub accepted_encodings: Vec<EncodingType>,
    /// operations whose responses a client asks to be compressed, `*` matches every operation
    pub response_compression_operations: Vec<String>,
    /// whether a call without an operation hint asks for response compression
    pub compress_without_operation_hint: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            request_threshold: 4096,
            response_threshold: 4096,
            request_encoding: EncodingType::Identity,
            accepted_encodings: vec![EncodingType::Gzip, EncodingType::Deflate],
            response_compression_operations: vec!["*".to_string()],
            compress_without_operation_hint: true,
        }
    }
}

impl CompressionConfig {
    /// Whether responses of `operation` should be compressed; `None` is a call without a hint.
    pub fn compresses_operation(&self, operation: Option<&str>) -> bool {
        match operation {
            None => self.compress_without_operation_hint,
            Some(operation) => self.response_compression_operations.iter().any(|op| op == "*" || op == operation),
        }
    }
}

/// A per-call override of the compression thresholds, stored in the request context under
/// `REQUEST_COMPRESSION_OVERRIDE` or `RESPONSE_COMPRESSION_OVERRIDE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionOption {
    /// compress whatever the size of the body
    ForceOn,
    /// never compress
    ForceOff,
}
