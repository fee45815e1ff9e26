//! Ordered header map with case-insensitive lookup

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// HTTP headers in wire order.
///
/// Names keep the casing they arrived with; lookups ignore case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the first value for a header
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Get every value for a header, in order
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Append a header without touching existing values
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replace a header in place, or append it if absent
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter().position(|(k, _)| k.eq_ignore_ascii_case(name)) {
            Some(first) => {
                self.entries[first].1 = value;
                let mut index = 0;
                self.entries.retain(|(k, _)| {
                    let keep = index <= first || !k.eq_ignore_ascii_case(name);
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name.to_string(), value)),
        }
    }

    /// Remove all values for a header
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parsed Content-Length, if present and valid
    pub fn content_length(&self) -> Option<usize> {
        self.get("content-length").and_then(|v| v.trim().parse().ok())
    }

    /// Whether the last transfer coding is chunked
    pub fn is_chunked(&self) -> bool {
        self.get_all("transfer-encoding")
            .flat_map(|v| v.split(','))
            .last()
            .map(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }

    /// Write headers in `Name: value\r\n` form
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }
}

impl Serialize for Headers {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Repeated names are joined the way HTTP allows folding them.
        let mut folded: Vec<(&str, String)> = Vec::with_capacity(self.entries.len());
        for (name, value) in &self.entries {
            match folded.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
                Some((_, existing)) => {
                    existing.push_str(", ");
                    existing.push_str(value);
                }
                None => folded.push((name.as_str(), value.clone())),
            }
        }

        let mut map = serializer.serialize_map(Some(folded.len()))?;
        for (name, value) in &folded {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Headers {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeadersVisitor;

        impl<'de> Visitor<'de> for HeadersVisitor {
            type Value = Headers;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of header names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Headers, A::Error> {
                let mut headers = Headers::new();
                while let Some((name, value)) = access.next_entry::<String, String>()? {
                    headers.append(name, value);
                }
                Ok(headers)
            }
        }

        deserializer.deserialize_map(HeadersVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "text/html");
        assert_eq!(headers.get("content-type"), Some("text/html"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/html"));
        assert!(!headers.contains("accept"));
    }

    #[test]
    fn test_set_keeps_position_and_collapses_duplicates() {
        let mut headers: Headers = vec![
            ("Host", "example.com"),
            ("Accept", "*/*"),
            ("X-Test", "a"),
            ("x-test", "b"),
        ]
        .into_iter()
        .collect();

        headers.set("Accept", "text/plain");
        headers.set("X-TEST", "1");

        let names: Vec<_> = headers.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        assert_eq!(names, vec!["Host=example.com", "Accept=text/plain", "X-Test=1"]);
    }

    #[test]
    fn test_chunked_detection() {
        let mut headers = Headers::new();
        headers.append("Transfer-Encoding", "gzip, chunked");
        assert!(headers.is_chunked());

        headers.set("transfer-encoding", "chunked, gzip");
        assert!(!headers.is_chunked());
    }

    #[test]
    fn test_serde_preserves_order() {
        let json = r#"{"Zeta":"1","Alpha":"2","Mid":"3"}"#;
        let headers: Headers = serde_json::from_str(json).unwrap();
        let names: Vec<_> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["Zeta", "Alpha", "Mid"]);
        assert_eq!(serde_json::to_string(&headers).unwrap(), json);
    }

    #[test]
    fn test_serialize_folds_repeated_names() {
        let mut headers = Headers::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("set-cookie", "b=2");
        assert_eq!(
            serde_json::to_string(&headers).unwrap(),
            r#"{"Set-Cookie":"a=1, b=2"}"#
        );
    }
}
