use citrine::core::req::deliver::{RangeOutcome, parse_range};

#[test]
fn test_simple_range() {
    assert_eq!(
        parse_range("bytes=100-199", 1000),
        RangeOutcome::Partial {
            start: 100,
            end: 199
        }
    );
}

#[test]
fn test_open_ended_range_runs_to_last_byte() {
    assert_eq!(
        parse_range("bytes=990-", 1000),
        RangeOutcome::Partial {
            start: 990,
            end: 999
        }
    );
}

#[test]
fn test_suffix_range_takes_last_bytes() {
    assert_eq!(
        parse_range("bytes=-10", 1000),
        RangeOutcome::Partial {
            start: 990,
            end: 999
        }
    );
    // A suffix longer than the object covers it all.
    assert_eq!(
        parse_range("bytes=-5000", 1000),
        RangeOutcome::Partial { start: 0, end: 999 }
    );
}

#[test]
fn test_end_clamps_to_length() {
    assert_eq!(
        parse_range("bytes=0-99999", 100),
        RangeOutcome::Partial { start: 0, end: 99 }
    );
}

#[test]
fn test_start_at_length_is_unsatisfiable() {
    assert_eq!(parse_range("bytes=1000-1001", 1000), RangeOutcome::Unsatisfiable);
    assert_eq!(parse_range("bytes=100-", 100), RangeOutcome::Unsatisfiable);
}

#[test]
fn test_inverted_range_is_unsatisfiable() {
    assert_eq!(parse_range("bytes=50-10", 1000), RangeOutcome::Unsatisfiable);
}

#[test]
fn test_unsupported_forms_are_ignored() {
    assert_eq!(parse_range("chapters=1-2", 1000), RangeOutcome::Ignore);
    assert_eq!(parse_range("bytes=1-2,5-9", 1000), RangeOutcome::Ignore);
    assert_eq!(parse_range("bytes=abc-def", 1000), RangeOutcome::Ignore);
    assert_eq!(parse_range("bytes=", 1000), RangeOutcome::Ignore);
}
