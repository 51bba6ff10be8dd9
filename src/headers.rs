//! Builders for the response header maps the server attaches to every write.
//!
//! These are thin value types: they never talk to the transport directly,
//! they just assemble an [`http::HeaderMap`] the way the rest of the crate
//! expects it (`Allow` as a comma-joined list, `Location`/`x-version` only
//! when non-empty, a content-type chosen from the status class).

use http::{HeaderMap, HeaderName, HeaderValue};

/// Generic header-map builder: emplaces a header only when the value is
/// non-empty, mirroring the original library's behavior of never emitting
/// headers for blank values.
#[derive(Debug, Default, Clone)]
pub struct Http2Headers {
    headers: HeaderMap,
}

impl Http2Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `name: value` unless `value` is empty.
    pub fn emplace(&mut self, name: &str, value: impl AsRef<str>) -> &mut Self {
        let value = value.as_ref();
        if !value.is_empty() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                self.headers.insert(name, value);
            }
        }
        self
    }

    /// Join `methods` with `", "` and set it as `Allow`.
    pub fn add_allowed_methods(&mut self, methods: &[String]) -> &mut Self {
        if !methods.is_empty() {
            self.emplace("allow", methods.join(", "));
        }
        self
    }

    pub fn into_header_map(self) -> HeaderMap {
        self.headers
    }
}

/// Assembles the response headers the server attaches to every outgoing
/// response: `x-version`, `location`, `content-type`/`content-length`, and
/// `Allow` for 405s.
#[derive(Debug, Default, Clone)]
pub struct ResponseHeader {
    version: String,
    location: String,
    allowed_methods: Vec<String>,
}

impl ResponseHeader {
    pub fn new(version: impl Into<String>, location: impl Into<String>, allowed_methods: Vec<String>) -> Self {
        ResponseHeader {
            version: version.into(),
            location: location.into(),
            allowed_methods,
        }
    }

    /// Build the header map for a response with the given body length and
    /// status code. Content-type is `application/json` for 2xx and
    /// `application/problem+json` otherwise; omitted when `content_length`
    /// is zero (matching the "no body, no content-type" original behavior).
    pub fn build(&self, content_length: usize, status: u16) -> HeaderMap {
        let mut h = Http2Headers::new();
        h.emplace("x-version", &self.version);
        h.emplace("location", &self.location);
        if content_length != 0 {
            let content_type = if (200..300).contains(&status) {
                "application/json"
            } else {
                "application/problem+json"
            };
            h.emplace("content-type", content_type);
        }
        h.emplace("content-length", content_length.to_string());
        h.add_allowed_methods(&self.allowed_methods);
        h.into_header_map()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emplace_skips_empty_values() {
        let mut h = Http2Headers::new();
        h.emplace("x-version", "");
        h.emplace("x-version", "v1");
        let map = h.into_header_map();
        assert_eq!(map.get("x-version").unwrap(), "v1");
    }

    #[test]
    fn allow_is_comma_space_joined() {
        let mut h = Http2Headers::new();
        h.add_allowed_methods(&["GET".into(), "POST".into()]);
        let map = h.into_header_map();
        assert_eq!(map.get("allow").unwrap(), "GET, POST");
    }

    #[test]
    fn content_type_follows_status_class() {
        let rh = ResponseHeader::new("v1", "", vec![]);
        let map = rh.build(5, 201);
        assert_eq!(map.get("content-type").unwrap(), "application/json");
        let map = rh.build(5, 400);
        assert_eq!(map.get("content-type").unwrap(), "application/problem+json");
        let map = rh.build(0, 204);
        assert!(map.get("content-type").is_none());
    }
}
