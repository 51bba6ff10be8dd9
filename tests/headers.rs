//! Black-box coverage for `headers`: the emplace-only-if-non-empty rule and
//! the status-class-driven `ResponseHeader::build`.

use h2flow::{Http2Headers, ResponseHeader};

#[test]
fn emplace_only_sets_non_empty_headers() {
    let mut headers = Http2Headers::new();
    headers.emplace("x-version", "");
    headers.emplace("location", "/app/v1/items/1");
    let map = headers.into_header_map();

    assert!(map.get("x-version").is_none());
    assert_eq!(map.get("location").unwrap(), "/app/v1/items/1");
}

#[test]
fn allow_header_is_comma_space_joined_and_absent_when_empty() {
    let mut headers = Http2Headers::new();
    headers.add_allowed_methods(&[]);
    assert!(headers.clone().into_header_map().get("allow").is_none());

    headers.add_allowed_methods(&["GET".to_string(), "HEAD".to_string(), "POST".to_string()]);
    let map = headers.into_header_map();
    assert_eq!(map.get("allow").unwrap(), "GET, HEAD, POST");
}

#[test]
fn response_header_omits_content_type_and_length_details_when_body_empty() {
    let rh = ResponseHeader::new("v2", "", vec![]);
    let map = rh.build(0, 204);

    assert!(map.get("content-type").is_none());
    assert_eq!(map.get("content-length").unwrap(), "0");
    assert_eq!(map.get("x-version").unwrap(), "v2");
}

#[test]
fn response_header_picks_content_type_by_status_class() {
    let rh = ResponseHeader::new("v1", "/app/v1/items/7", vec![]);

    let ok = rh.build(9, 201);
    assert_eq!(ok.get("content-type").unwrap(), "application/json");
    assert_eq!(ok.get("location").unwrap(), "/app/v1/items/7");
    assert_eq!(ok.get("content-length").unwrap(), "9");

    let err = rh.build(20, 404);
    assert_eq!(err.get("content-type").unwrap(), "application/problem+json");
}

#[test]
fn response_header_attaches_allow_for_method_not_allowed() {
    let rh = ResponseHeader::new("", "", vec!["GET".to_string(), "HEAD".to_string()]);
    let map = rh.build(0, 405);
    assert_eq!(map.get("allow").unwrap(), "GET, HEAD");
    assert!(map.get("x-version").is_none());
    assert!(map.get("location").is_none());
}
