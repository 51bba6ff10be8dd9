//! Black-box coverage for `url`: percent-encoding and the order-invariant
//! prefix match.

use h2flow::url;

#[test]
fn prefix_match_is_invariant_to_leading_and_trailing_slashes() {
    let path = "/app/v1/items";
    for prefix in ["/app/v1", "app/v1", "/app/v1/", "app/v1/"] {
        assert!(url::match_prefix(path, prefix), "prefix {prefix:?} should match {path:?}");
    }
    for path in ["app/v1/items", "/app/v1/items/", "app/v1/items/"] {
        assert!(url::match_prefix(path, "/app/v1"), "path {path:?} should match /app/v1");
    }
}

#[test]
fn prefix_match_rejects_a_different_segment() {
    assert!(!url::match_prefix("/other/v1/items", "/app/v1"));
    assert!(!url::match_prefix("/app/v2/items", "/app/v1"));
    // a longer version segment must not satisfy a shorter one by simple
    // string prefixing ("v10" starts with "v1" as text, but not as a path
    // segment).
    assert!(!url::match_prefix("/app/v10/items", "/app/v1"));
}

#[test]
fn prefix_match_rejects_empty_arguments() {
    assert!(!url::match_prefix("", "/app/v1"));
    assert!(!url::match_prefix("/app/v1/items", ""));
    assert!(!url::match_prefix("", ""));
}

#[test]
fn encode_decode_round_trips_reserved_and_unicode_characters() {
    let raw = "a path/with spaces & slashes?x=1&café=true";
    let encoded = url::encode(raw);
    assert_ne!(encoded, raw);
    assert!(!encoded.contains(' '), "spaces must be escaped");
    assert_eq!(url::decode(&encoded), raw);
}

#[test]
fn encode_leaves_unreserved_characters_untouched() {
    let raw = "abcXYZ012-._~";
    assert_eq!(url::encode(raw), raw);
}
