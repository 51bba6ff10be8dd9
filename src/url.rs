//! URL helpers: percent-encoding and path-prefix matching.
//!
//! Kept intentionally thin — full URI parsing is the `http`/`h2` crates'
//! job. This module only covers the bits the server needs to enforce its
//! `(api_name, api_version)` path prefix and to percent-encode values that
//! end up in headers such as `Location`.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Characters left unescaped, matching the common "encode everything except
/// unreserved URL characters" behavior used by `nghttp2::util::percent_encode`.
const ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Percent-encode a raw string for safe inclusion in a URL.
pub fn encode(raw: &str) -> String {
    utf8_percent_encode(raw, ENCODE_SET).to_string()
}

/// Percent-decode a URL-encoded string, lossily replacing invalid UTF-8.
pub fn decode(encoded: &str) -> String {
    percent_encoding::percent_decode_str(encoded)
        .decode_utf8_lossy()
        .into_owned()
}

fn normalize(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 2);
    if !path.starts_with('/') {
        out.push('/');
    }
    out.push_str(path);
    if !out.ends_with('/') {
        out.push('/');
    }
    out
}

/// Returns true when `path` starts with `prefix`, after normalizing both
/// sides to have a leading and trailing slash. Order-invariant with respect
/// to leading/trailing slashes on either argument.
pub fn match_prefix(path: &str, prefix: &str) -> bool {
    if path.is_empty() || prefix.is_empty() {
        return false;
    }
    normalize(path).starts_with(&normalize(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matches_regardless_of_slashes() {
        assert!(match_prefix("/app/v1/items", "/app/v1"));
        assert!(match_prefix("/app/v1/items", "app/v1"));
        assert!(match_prefix("/app/v1/items", "app/v1/"));
        assert!(match_prefix("app/v1/items/", "/app/v1/"));
    }

    #[test]
    fn prefix_rejects_non_prefix() {
        assert!(!match_prefix("/other/v1/items", "/app/v1"));
        assert!(!match_prefix("/app/v10/items", "/app/v1"));
    }

    #[test]
    fn encode_roundtrip() {
        let raw = "a b/c?d=é";
        let encoded = encode(raw);
        assert_eq!(decode(&encoded), raw);
    }
}
