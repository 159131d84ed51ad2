use bytes::{Bytes, BytesMut};
use citrine::core::http::{BodyFraming, HttpMsg, decode_headers, encode_headers};
use citrine::core::proto::http1::{
    ChunkStep, ChunkedDecoder, parse_req_head, parse_resp_head,
};
use citrine::core::storage::object::ObjAttrs;

#[test]
fn test_header_ops_are_case_insensitive() {
    let mut msg = HttpMsg::new_request(b"GET", b"/x", b"HTTP/1.1");
    msg.set("Content-Type", &b"text/html"[..]);
    assert_eq!(msg.get_str("content-type"), Some("text/html"));
    assert!(msg.has("CONTENT-TYPE"));

    msg.replace("content-type", &b"text/plain"[..]);
    assert_eq!(msg.get_str("Content-Type"), Some("text/plain"));
    assert_eq!(
        msg.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(b"content-type"))
            .count(),
        1
    );

    msg.unset("Content-Type");
    assert!(!msg.has("content-type"));
}

#[test]
fn test_body_framing_derivation() {
    let mut msg = HttpMsg::new_request(b"POST", b"/x", b"HTTP/1.1");
    assert_eq!(msg.body_framing(false), BodyFraming::None);

    msg.set("content-length", &b"42"[..]);
    assert_eq!(msg.body_framing(false), BodyFraming::Length(42));

    // Transfer-Encoding wins over Content-Length.
    msg.set("transfer-encoding", &b"chunked"[..]);
    assert_eq!(msg.body_framing(false), BodyFraming::Chunked);

    let mut resp = HttpMsg::new_response(b"HTTP/1.1", 200, b"OK");
    assert_eq!(resp.body_framing(true), BodyFraming::Eof);
    resp.status = 304;
    assert_eq!(resp.body_framing(true), BodyFraming::None);

    let mut bad = HttpMsg::new_response(b"HTTP/1.1", 200, b"OK");
    bad.set("content-length", &b"banana"[..]);
    assert_eq!(bad.body_framing(true), BodyFraming::Error);
}

#[test]
fn test_header_blob_round_trip_is_byte_identical() {
    let headers = vec![
        (Bytes::from_static(b"Content-Type"), Bytes::from_static(b"text/html")),
        (Bytes::from_static(b"X-Empty"), Bytes::new()),
        (Bytes::from_static(b"Set-Cookie"), Bytes::from_static(b"a=b; Path=/")),
    ];
    let blob = encode_headers(&headers);
    let decoded = decode_headers(&blob).unwrap();
    assert_eq!(decoded, headers);
    // Re-encoding yields the identical blob.
    assert_eq!(encode_headers(&decoded), blob);
}

#[test]
fn test_obj_attrs_round_trip() {
    let attrs = ObjAttrs {
        status: 200,
        reason: b"OK".to_vec(),
        proto: b"HTTP/1.1".to_vec(),
        headers: encode_headers(&[(
            Bytes::from_static(b"Content-Length"),
            Bytes::from_static(b"3"),
        )]),
        vary: Some(b"accept-encoding".to_vec()),
        flags: 3,
        len: 3,
        xid: 1007,
        esi: None,
        gzipped: false,
        etag: Some(b"\"abc\"".to_vec()),
        last_modified: None,
    };
    let blob = attrs.encode().unwrap();
    let decoded = ObjAttrs::decode(&blob).unwrap();
    assert_eq!(decoded, attrs);
}

#[test]
fn test_parse_req_head() {
    let head = b"GET /path?q=1 HTTP/1.1\r\nHost: h\r\nAccept: */*\r\n";
    let msg = parse_req_head(head, 64).unwrap();
    assert_eq!(msg.method.as_ref(), b"GET");
    assert_eq!(msg.url.as_ref(), b"/path?q=1");
    assert_eq!(msg.proto.as_ref(), b"HTTP/1.1");
    assert_eq!(msg.get_str("host"), Some("h"));
    assert_eq!(msg.headers.len(), 2);
}

#[test]
fn test_parse_req_head_rejects_garbage() {
    assert!(parse_req_head(b"GET /x", 64).is_err());
    assert!(parse_req_head(b"GET /x SPDY/3\r\n", 64).is_err());
    assert!(parse_req_head(b"GET /x HTTP/1.1\r\nBad Header Name: v\r\n", 64).is_err());
}

#[test]
fn test_parse_req_head_enforces_header_limit() {
    let head = b"GET / HTTP/1.1\r\na: 1\r\nb: 2\r\nc: 3\r\n";
    assert!(parse_req_head(head, 2).is_err());
}

#[test]
fn test_parse_resp_head() {
    let head = b"HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 0-1/10\r\n";
    let msg = parse_resp_head(head, 64).unwrap();
    assert_eq!(msg.status, 206);
    assert_eq!(msg.reason.as_ref(), b"Partial Content");
    assert_eq!(msg.get_str("content-range"), Some("bytes 0-1/10"));
}

#[test]
fn test_chunked_decoder() {
    let mut dec = ChunkedDecoder::new();
    let mut buf = BytesMut::from(&b"3\r\nabc\r\n4\r\ndefg\r\n0\r\n\r\n"[..]);
    assert_eq!(
        dec.step(&mut buf).unwrap(),
        ChunkStep::Data(Bytes::from_static(b"abc"))
    );
    assert_eq!(
        dec.step(&mut buf).unwrap(),
        ChunkStep::Data(Bytes::from_static(b"defg"))
    );
    assert_eq!(dec.step(&mut buf).unwrap(), ChunkStep::End);
    assert!(dec.finished());
}

#[test]
fn test_chunked_decoder_incremental() {
    let mut dec = ChunkedDecoder::new();
    let mut buf = BytesMut::from(&b"5\r\nhe"[..]);
    assert_eq!(
        dec.step(&mut buf).unwrap(),
        ChunkStep::Data(Bytes::from_static(b"he"))
    );
    assert_eq!(dec.step(&mut buf).unwrap(), ChunkStep::Incomplete);
    buf.extend_from_slice(b"llo\r\n0\r\n\r\n");
    assert_eq!(
        dec.step(&mut buf).unwrap(),
        ChunkStep::Data(Bytes::from_static(b"llo"))
    );
    assert_eq!(dec.step(&mut buf).unwrap(), ChunkStep::End);
}

#[test]
fn test_chunked_decoder_rejects_bad_size() {
    let mut dec = ChunkedDecoder::new();
    let mut buf = BytesMut::from(&b"zz\r\nabc"[..]);
    assert!(dec.step(&mut buf).is_err());
}
