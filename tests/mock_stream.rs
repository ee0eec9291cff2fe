//! Exercises the `tests/support` mock duplex stream in isolation: the
//! `test_failure` error kind and paired in-order byte delivery (spec §7,
//! §8's "for every pair (reader, writer) ... bytes written on one side
//! equal bytes read on the other, in order").

mod support;

use coronet::error::ErrorKind;
use support::MockStream;

#[test]
fn paired_streams_deliver_bytes_in_order() {
    let (a, b) = MockStream::pair();
    a.write_all(b"hello").unwrap();
    let mut buf = [0u8; 16];
    let n = b.read_some(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello");
}

#[test]
fn injected_read_failure_surfaces_as_test_failure() {
    let (a, b) = MockStream::pair();
    a.write_all(b"x").unwrap();
    b.fail_next_read();
    let mut buf = [0u8; 4];
    let err = b.read_some(&mut buf).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TestFailure);
}

#[test]
fn injected_write_failure_surfaces_as_test_failure() {
    let (a, _b) = MockStream::pair();
    a.fail_next_write();
    let err = a.write_all(b"x").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TestFailure);
}
