use bytes::Bytes;
use citrine::core::fetch::esi::EsiParser;
use citrine::core::fetch::filters::{
    CannedSource, ChunkedReader, EofReader, EsiScanFilter, FetchFilter, FilterChain, FilterPull,
    GunzipFilter, GzipFilter, LengthReader, TestGunzipFilter,
};
use flate2::Compression;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;

async fn drain(mut top: Box<dyn FetchFilter>) -> Result<Vec<u8>, citrine::core::CitrineError> {
    let mut out = Vec::new();
    loop {
        match top.pull().await? {
            FilterPull::Data(data) => out.extend_from_slice(&data),
            FilterPull::End => return Ok(out),
        }
    }
}

fn gzip_bytes(plain: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(plain).unwrap();
    enc.finish().unwrap()
}

#[tokio::test]
async fn test_length_reader_truncates_and_detects_short_body() {
    let src = CannedSource::new([Bytes::from_static(b"hello"), Bytes::from_static(b"world")]);
    let top = Box::new(LengthReader::new(Box::new(src), 7));
    assert_eq!(drain(top).await.unwrap(), b"hellowo");

    let short = CannedSource::new([Bytes::from_static(b"hi")]);
    let top: Box<dyn FetchFilter> = Box::new(LengthReader::new(Box::new(short), 10));
    let mut chain = FilterChain::new(top);
    // First pull yields data, the next one hits EOF early.
    let mut got_err = false;
    for _ in 0..3 {
        match chain.pull().await {
            Ok(FilterPull::Data(_)) => continue,
            Ok(FilterPull::End) => break,
            Err(_) => {
                got_err = true;
                break;
            }
        }
    }
    assert!(got_err);
    // The chain stays poisoned.
    assert!(chain.pull().await.is_err());
}

#[tokio::test]
async fn test_chunked_reader_reassembles_body() {
    let src = CannedSource::new([
        Bytes::from_static(b"3\r\nab"),
        Bytes::from_static(b"c\r\n2\r\nde\r\n0\r\n\r\n"),
    ]);
    let top = Box::new(ChunkedReader::new(Box::new(src)));
    assert_eq!(drain(top).await.unwrap(), b"abcde");
}

#[tokio::test]
async fn test_eof_reader_runs_to_close() {
    let src = CannedSource::new([Bytes::from_static(b"all "), Bytes::from_static(b"of it")]);
    let top = Box::new(EofReader::new(Box::new(src)));
    assert_eq!(drain(top).await.unwrap(), b"all of it");
}

#[tokio::test]
async fn test_gunzip_filter_decompresses() {
    let gz = gzip_bytes(b"the plain payload");
    let src = CannedSource::new([Bytes::from(gz)]);
    let top: Box<dyn FetchFilter> = Box::new(EofReader::new(Box::new(src)));
    let top = Box::new(GunzipFilter::new(top));
    assert_eq!(drain(top).await.unwrap(), b"the plain payload");
}

#[tokio::test]
async fn test_gzip_filter_round_trips() {
    let src = CannedSource::new([Bytes::from_static(b"compress me, please")]);
    let top: Box<dyn FetchFilter> = Box::new(EofReader::new(Box::new(src)));
    let top: Box<dyn FetchFilter> = Box::new(GzipFilter::new(top, 6));
    let top = Box::new(GunzipFilter::new(top));
    assert_eq!(drain(top).await.unwrap(), b"compress me, please");
}

#[tokio::test]
async fn test_test_gunzip_passes_valid_and_rejects_garbage() {
    let gz = gzip_bytes(b"checked");
    let src = CannedSource::new([Bytes::from(gz.clone())]);
    let top: Box<dyn FetchFilter> = Box::new(EofReader::new(Box::new(src)));
    let top = Box::new(TestGunzipFilter::new(top));
    // The compressed bytes pass through unchanged.
    assert_eq!(drain(top).await.unwrap(), gz);

    let src = CannedSource::new([Bytes::from_static(b"this is not gzip at all")]);
    let top: Box<dyn FetchFilter> = Box::new(EofReader::new(Box::new(src)));
    let top: Box<dyn FetchFilter> = Box::new(TestGunzipFilter::new(top));
    assert!(drain(top).await.is_err());
}

#[tokio::test]
async fn test_esi_scan_passes_through_and_records() {
    let body = b"<p>a</p><esi:include src=\"/frag\"/><p>b</p>";
    let src = CannedSource::new([Bytes::from_static(body)]);
    let parser = Arc::new(Mutex::new(EsiParser::new()));
    let top: Box<dyn FetchFilter> = Box::new(EofReader::new(Box::new(src)));
    let top = Box::new(EsiScanFilter::new(top, parser.clone()));
    assert_eq!(drain(top).await.unwrap(), body);
    assert!(parser.lock().has_includes());
}
