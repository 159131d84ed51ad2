use citrine::connection::session::{Session, StreamClose};

fn make_sess() -> Session {
    Session::new(
        7,
        "10.1.2.3:55555".parse().unwrap(),
        "127.0.0.1:6081".parse().unwrap(),
    )
}

#[test]
fn test_close_reason_identifiers_are_stable() {
    let table = [
        (StreamClose::RemClose, 1, "rem_close", false),
        (StreamClose::ReqClose, 2, "req_close", false),
        (StreamClose::RxBad, 4, "rx_bad", true),
        (StreamClose::RxBody, 5, "rx_body", true),
        (StreamClose::RxJunk, 6, "rx_junk", true),
        (StreamClose::RxOverflow, 7, "rx_overflow", true),
        (StreamClose::RxTimeout, 8, "rx_timeout", true),
        (StreamClose::RxCloseIdle, 9, "rx_close_idle", false),
        (StreamClose::TxPipe, 10, "tx_pipe", false),
        (StreamClose::TxError, 11, "tx_error", true),
        (StreamClose::TxEof, 12, "tx_eof", false),
        (StreamClose::RespClose, 13, "resp_close", false),
        (StreamClose::Overload, 14, "overload", true),
        (StreamClose::PipeOverflow, 15, "pipe_overflow", true),
        (StreamClose::RangeShort, 16, "range_short", true),
        (StreamClose::VclFailure, 18, "vcl_failure", true),
    ];
    for (reason, idx, name, is_err) in table {
        assert_eq!(reason.idx(), idx, "{name}");
        assert_eq!(reason.name(), name);
        assert_eq!(reason.is_err(), is_err, "{name}");
        assert!(!reason.description().is_empty());
    }
}

#[test]
fn test_first_close_reason_sticks() {
    let sess = make_sess();
    assert!(!sess.closing());
    sess.close(StreamClose::RemClose);
    sess.close(StreamClose::ReqClose);
    assert_eq!(sess.close_reason(), Some(StreamClose::RemClose));
}

#[test]
fn test_error_reason_upgrades_benign_one() {
    let sess = make_sess();
    sess.close(StreamClose::RemClose);
    sess.close(StreamClose::TxError);
    assert_eq!(sess.close_reason(), Some(StreamClose::TxError));
    // But never downgrades back.
    sess.close(StreamClose::ReqClose);
    assert_eq!(sess.close_reason(), Some(StreamClose::TxError));
}
