use bytes::Bytes;
use citrine::core::http::HttpMsg;
use citrine::core::objstore::vary::{VaryBuild, build, matches};

fn req_with(headers: &[(&str, &str)]) -> HttpMsg {
    let mut req = HttpMsg::new_request(b"GET", b"/a", b"HTTP/1.1");
    for (n, v) in headers {
        req.set(n, Bytes::copy_from_slice(v.as_bytes()));
    }
    req
}

fn resp_varying_on(vary: &str) -> HttpMsg {
    let mut resp = HttpMsg::new_response(b"HTTP/1.1", 200, b"OK");
    resp.set("vary", Bytes::copy_from_slice(vary.as_bytes()));
    resp
}

#[test]
fn test_no_vary_header_builds_nothing() {
    let resp = HttpMsg::new_response(b"HTTP/1.1", 200, b"OK");
    let req = req_with(&[]);
    assert!(matches!(build(&resp, &req).unwrap(), VaryBuild::None));
}

#[test]
fn test_vary_star_is_never_matchable() {
    let resp = resp_varying_on("*");
    let req = req_with(&[]);
    assert!(matches!(build(&resp, &req).unwrap(), VaryBuild::Star));
}

#[test]
fn test_vary_description_matches_same_values() {
    let resp = resp_varying_on("Accept-Encoding, Accept-Language");
    let req = req_with(&[("accept-encoding", "gzip"), ("accept-language", "de")]);
    let VaryBuild::Desc(desc) = build(&resp, &req).unwrap() else {
        panic!("expected a vary description");
    };

    // Same values match, regardless of other headers.
    let same = req_with(&[
        ("accept-encoding", "gzip"),
        ("accept-language", "de"),
        ("x-other", "ignored"),
    ]);
    assert!(matches(&desc, &same));

    // A differing value does not.
    let other = req_with(&[("accept-encoding", "br"), ("accept-language", "de")]);
    assert!(!matches(&desc, &other));

    // An absent header matches only if it was absent at build time.
    let missing = req_with(&[("accept-language", "de")]);
    assert!(!matches(&desc, &missing));
}

#[test]
fn test_vary_on_absent_header_matches_absent() {
    let resp = resp_varying_on("X-Key");
    let req = req_with(&[]);
    let VaryBuild::Desc(desc) = build(&resp, &req).unwrap() else {
        panic!("expected a vary description");
    };
    assert!(matches(&desc, &req_with(&[])));
    assert!(!matches(&desc, &req_with(&[("x-key", "v")])));
}

#[test]
fn test_illegal_vary_field_name_is_rejected() {
    let resp = resp_varying_on("bad header name");
    let req = req_with(&[]);
    assert!(build(&resp, &req).is_err());
}
