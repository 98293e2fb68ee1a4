use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CompressionError;
use crate::codec::{Codec, StreamingCompressor};

/// Content codings, named as in `Content-Encoding` and `Accept-Encoding` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "&'static str")]
pub enum EncodingType {
    Gzip,
    Deflate,
    Zstd,
    Brotli,
    Identity,
    /// the `*` wildcard of `Accept-Encoding`
    Any,
}

impl EncodingType {
    /// Every coding that has a codec, in the order servers prefer them when a client states no
    /// preference.
    pub const CODECS: [EncodingType; 4] = [Self::Zstd, Self::Brotli, Self::Gzip, Self::Deflate];

    pub fn http_name(self) -> &'static str {
        match self {
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
            Self::Zstd => "zstd",
            Self::Brotli => "br",
            Self::Identity => "identity",
            Self::Any => "*",
        }
    }

    /// The codec of this coding; `None` for `identity` and `*`.
    pub fn compressor(self) -> Option<Box<dyn StreamingCompressor>> {
        match self {
            Self::Identity | Self::Any => None,
            coding => Some(Box::new(Codec::new(coding))),
        }
    }
}

impl fmt::Display for EncodingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.http_name())
    }
}

impl FromStr for EncodingType {
    type Err = CompressionError;

    /// Case insensitive, surrounding whitespace ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        [Self::Gzip, Self::Deflate, Self::Zstd, Self::Brotli, Self::Identity, Self::Any]
            .into_iter()
            .find(|coding| coding.http_name().eq_ignore_ascii_case(name))
            .ok_or_else(|| CompressionError::UnsupportedEncoding(name.to_string()))
    }
}

impl TryFrom<String> for EncodingType {
    type Error = CompressionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EncodingType> for &'static str {
    fn from(coding: EncodingType) -> Self {
        coding.http_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back() {
        for coding in [EncodingType::Gzip, EncodingType::Brotli, EncodingType::Identity, EncodingType::Any] {
            assert_eq!(coding.http_name().parse::<EncodingType>().unwrap(), coding);
        }
        assert_eq!(" GZIP ".parse::<EncodingType>().unwrap(), EncodingType::Gzip);
        assert!(matches!("snappy".parse::<EncodingType>(), Err(CompressionError::UnsupportedEncoding(name)) if name == "snappy"));
    }

    #[test]
    fn only_real_codings_have_codecs() {
        assert!(EncodingType::Identity.compressor().is_none());
        assert!(EncodingType::Any.compressor().is_none());
        assert_eq!(EncodingType::Zstd.compressor().unwrap().content_encoding(), EncodingType::Zstd);
    }
}
