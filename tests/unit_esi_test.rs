use citrine::core::fetch::esi::{EsiParser, EsiSeg, decode_segments, encode_segments};

fn parse_in_chunks(body: &[u8], chunk: usize) -> Vec<EsiSeg> {
    let mut parser = EsiParser::new();
    for piece in body.chunks(chunk) {
        parser.feed(piece);
    }
    parser.finish();
    parser.take_segments()
}

/// Reassembles the literal ranges for checking.
fn render(body: &[u8], segs: &[EsiSeg]) -> (Vec<u8>, Vec<String>) {
    let mut literal = Vec::new();
    let mut includes = Vec::new();
    for seg in segs {
        match seg {
            EsiSeg::Literal { off, len } => {
                literal.extend_from_slice(&body[*off as usize..(*off + *len) as usize]);
            }
            EsiSeg::Include { src } => includes.push(src.clone()),
        }
    }
    (literal, includes)
}

#[test]
fn test_plain_body_is_one_literal() {
    let body = b"no instructions here";
    let segs = parse_in_chunks(body, 64);
    assert_eq!(
        segs,
        vec![EsiSeg::Literal {
            off: 0,
            len: body.len() as u64
        }]
    );
}

#[test]
fn test_include_is_extracted_and_tag_skipped() {
    let body = b"<p>a</p><esi:include src=\"/frag\"/><p>b</p>";
    let segs = parse_in_chunks(body, 1024);
    let (literal, includes) = render(body, &segs);
    assert_eq!(literal, b"<p>a</p><p>b</p>");
    assert_eq!(includes, vec!["/frag".to_string()]);
}

#[test]
fn test_single_quoted_src_and_spacing() {
    let body = b"x<esi:include   src='/other' />y";
    let segs = parse_in_chunks(body, 1024);
    let (literal, includes) = render(body, &segs);
    assert_eq!(literal, b"xy");
    assert_eq!(includes, vec!["/other".to_string()]);
}

#[test]
fn test_tag_split_across_chunks() {
    let body = b"before<esi:include src=\"/frag\"/>after";
    for chunk in [1, 2, 3, 5, 7, 11] {
        let segs = parse_in_chunks(body, chunk);
        let (literal, includes) = render(body, &segs);
        assert_eq!(literal, b"beforeafter", "chunk size {chunk}");
        assert_eq!(includes, vec!["/frag".to_string()], "chunk size {chunk}");
    }
}

#[test]
fn test_multiple_includes_keep_order() {
    let body = b"1<esi:include src=\"/a\"/>2<esi:include src=\"/b\"/>3";
    let segs = parse_in_chunks(body, 4);
    let (literal, includes) = render(body, &segs);
    assert_eq!(literal, b"123");
    assert_eq!(includes, vec!["/a".to_string(), "/b".to_string()]);
}

#[test]
fn test_malformed_include_stays_literal() {
    let body = b"x<esi:include nothing=\"here\"/>y";
    let segs = parse_in_chunks(body, 1024);
    let (literal, includes) = render(body, &segs);
    assert_eq!(literal, body);
    assert!(includes.is_empty());
}

#[test]
fn test_segments_round_trip_through_attribute_blob() {
    let segs = vec![
        EsiSeg::Literal { off: 0, len: 10 },
        EsiSeg::Include {
            src: "/frag".to_string(),
        },
        EsiSeg::Literal { off: 40, len: 2 },
    ];
    let blob = encode_segments(&segs).unwrap();
    assert_eq!(decode_segments(&blob).unwrap(), segs);
}
