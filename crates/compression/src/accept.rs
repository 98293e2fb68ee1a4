//! `Accept-Encoding` parsing and negotiation.

use std::collections::HashSet;
use std::fmt::Write;

use tracing::trace;

use crate::{CompressionError, EncodingType};

/// One entry of an `Accept-Encoding` header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptEncoding {
    pub encoding: EncodingType,
    pub quality: f32,
}

impl AcceptEncoding {
    /// Parses `name;q=value` entries, most preferred first. Entries of equal quality keep their
    /// header order and codings without a codec here are skipped.
    pub fn parse(header: &str) -> Result<Vec<AcceptEncoding>, CompressionError> {
        let mut entries = Vec::new();
        for entry in header.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let mut params = entry.split(';').map(str::trim);
            let name = params.next().unwrap_or_default();
            let mut quality = 1.0_f32;
            for param in params {
                let Some(value) = param.strip_prefix("q=").or_else(|| param.strip_prefix("Q=")) else {
                    continue;
                };
                quality = value.trim().parse().map_err(|_e| CompressionError::InvalidAcceptEncoding(entry.to_string()))?;
                if !(0.0..=1.0).contains(&quality) {
                    return Err(CompressionError::InvalidAcceptEncoding(entry.to_string()));
                }
            }

            match name.parse::<EncodingType>() {
                Ok(encoding) => entries.push(AcceptEncoding { encoding, quality }),
                Err(_) => trace!(name, "skip unknown coding"),
            }
        }
        entries.sort_by(|a, b| b.quality.total_cmp(&a.quality));
        Ok(entries)
    }

    /// Picks the coding to answer with from `accepted` (as returned by [`AcceptEncoding::parse`]),
    /// among the codings of `supported`. `identity` needs no codec and is always supported, so a
    /// listed `identity` wins at its rank. `q=0` excludes a coding, `*;q=0` excludes every coding
    /// not listed. Unlisted, `identity` is chosen when nothing better is acceptable and it is not
    /// excluded; `None` means nothing acceptable is left.
    pub fn choose_best(accepted: &[AcceptEncoding], supported: &[EncodingType]) -> Option<EncodingType> {
        let excluded: HashSet<EncodingType> =
            accepted.iter().filter(|entry| entry.quality <= 0.0).map(|entry| entry.encoding).collect();
        let listed: HashSet<EncodingType> = accepted.iter().map(|entry| entry.encoding).collect();

        for entry in accepted.iter().filter(|entry| entry.quality > 0.0) {
            match entry.encoding {
                EncodingType::Any => {
                    if let Some(coding) = supported.iter().find(|coding| !listed.contains(coding)) {
                        return Some(*coding);
                    }
                }
                EncodingType::Identity => return Some(EncodingType::Identity),
                coding if supported.contains(&coding) => return Some(coding),
                _ => {}
            }
        }

        let identity_excluded = excluded.contains(&EncodingType::Identity)
            || (excluded.contains(&EncodingType::Any) && !listed.contains(&EncodingType::Identity));
        (!identity_excluded).then_some(EncodingType::Identity)
    }

    /// A client header listing `encodings` with strictly decreasing qualities, e.g.
    /// `gzip;q=1.00,deflate;q=0.67,identity;q=0.33`.
    pub fn header_value(encodings: &[EncodingType]) -> String {
        let delta = 1.0 / (encodings.len() as f32 + 1.0);
        let mut quality = 1.0_f32;
        let mut header = String::new();
        for (index, encoding) in encodings.iter().enumerate() {
            if index > 0 {
                header.push(',');
            }
            let _ = write!(header, "{};q={quality:.2}", encoding.http_name());
            quality -= delta;
        }
        header
    }
}
