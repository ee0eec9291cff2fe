//! A minimal mock duplex stream, standing in for the "mock streams for
//! tests" external collaborator spec.md §6 lists as out of scope for the
//! core crate itself. Two `MockStream` halves share an in-memory byte pipe
//! in each direction; `fail_next_read`/`fail_next_write` make the next call
//! return [`coronet::error::ErrorKind::TestFailure`] instead of touching the
//! buffer, the way a hand-written mock transport would simulate a failing
//! underlying connection without any real I/O.
//!
//! Not part of the library: this crate's `TcpStream`/`TlsStream` are
//! concrete types built directly on real sockets (spec.md's core has no
//! generic "async stream" trait to substitute a mock into), so this support
//! module only exercises the error taxonomy and buffering conventions
//! black-box, the way an external test harness would.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use coronet::error::Error;

struct Shared {
    buf: Mutex<VecDeque<u8>>,
    fail_next_read: std::sync::atomic::AtomicBool,
    fail_next_write: std::sync::atomic::AtomicBool,
}

/// One half of a paired mock duplex stream.
pub struct MockStream {
    read_from: Arc<Shared>,
    write_to: Arc<Shared>,
}

impl MockStream {
    /// Builds a connected pair: bytes written on one side are read on the
    /// other, in each direction independently (spec §8's "for every pair
    /// (reader, writer) of paired streams" property).
    pub fn pair() -> (MockStream, MockStream) {
        let a_to_b = Arc::new(Shared {
            buf: Mutex::new(VecDeque::new()),
            fail_next_read: std::sync::atomic::AtomicBool::new(false),
            fail_next_write: std::sync::atomic::AtomicBool::new(false),
        });
        let b_to_a = Arc::new(Shared {
            buf: Mutex::new(VecDeque::new()),
            fail_next_read: std::sync::atomic::AtomicBool::new(false),
            fail_next_write: std::sync::atomic::AtomicBool::new(false),
        });
        (
            MockStream {
                read_from: Arc::clone(&b_to_a),
                write_to: Arc::clone(&a_to_b),
            },
            MockStream {
                read_from: a_to_b,
                write_to: b_to_a,
            },
        )
    }

    pub fn write_all(&self, data: &[u8]) -> Result<(), Error> {
        if self
            .write_to
            .fail_next_write
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(Error::test_failure("mock write failure injected"));
        }
        self.write_to.buf.lock().unwrap().extend(data.iter().copied());
        Ok(())
    }

    /// Reads up to `buf.len()` bytes, returning the number actually read (0
    /// if nothing is buffered, never blocking).
    pub fn read_some(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if self
            .read_from
            .fail_next_read
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(Error::test_failure("mock read failure injected"));
        }
        let mut src = self.read_from.buf.lock().unwrap();
        let n = src.len().min(buf.len());
        for slot in &mut buf[..n] {
            *slot = src.pop_front().unwrap();
        }
        Ok(n)
    }

    pub fn fail_next_read(&self) {
        self.read_from
            .fail_next_read
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn fail_next_write(&self) {
        self.write_to
            .fail_next_write
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }
}
