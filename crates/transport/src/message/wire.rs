use std::collections::BTreeMap;

use http::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

/// Header prefix used to carry wire attributes over HTTP.
pub const WIRE_ATTRIBUTE_HEADER_PREFIX: &str = "x-wire-attr-";

/// Transport metadata travelling next to a message across one hop.
///
/// Names are case-insensitive; each name may carry several values in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireAttributes {
    entries: BTreeMap<String, Vec<String>>,
}

impl WireAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `name` to the single value `value`.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.entries.insert(name.to_ascii_lowercase(), vec![value.into()]);
    }

    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.entries.entry(name.to_ascii_lowercase()).or_default().push(value.into());
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(&name.to_ascii_lowercase()).and_then(|values| values.first()).map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries.get(&name.to_ascii_lowercase()).map_or(&[], Vec::as_slice)
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.entries.remove(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().flat_map(|(name, values)| values.iter().map(move |value| (name.as_str(), value.as_str())))
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Encodes the attributes as prefixed headers. Attributes that are not valid header
    /// names or values are skipped.
    pub fn write_headers(&self, headers: &mut HeaderMap) {
        for (name, value) in self.iter() {
            let header_name = format!("{WIRE_ATTRIBUTE_HEADER_PREFIX}{name}");
            match (HeaderName::from_bytes(header_name.as_bytes()), HeaderValue::from_str(value)) {
                (Ok(header_name), Ok(header_value)) => {
                    headers.append(header_name, header_value);
                }
                _ => warn!(attribute = name, "skip wire attribute that can't be encoded as a header"),
            }
        }
    }

    /// Extracts the prefixed headers into wire attributes, removing them from `headers`.
    pub fn take_from_headers(headers: &mut HeaderMap) -> Self {
        let names: Vec<HeaderName> =
            headers.keys().filter(|name| name.as_str().starts_with(WIRE_ATTRIBUTE_HEADER_PREFIX)).cloned().collect();

        let mut attributes = Self::new();
        for name in names {
            let attribute = &name.as_str()[WIRE_ATTRIBUTE_HEADER_PREFIX.len()..];
            for value in headers.get_all(&name) {
                match value.to_str() {
                    Ok(value) => attributes.append(attribute, value),
                    Err(_) => warn!(attribute, "skip wire attribute with non visible ascii value"),
                }
            }
            headers.remove(&name);
        }
        attributes
    }
}
