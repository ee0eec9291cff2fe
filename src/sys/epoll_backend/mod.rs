//! Linux backend: `epoll` plus an `eventfd` waker.
//!
//! Grounded on `src/detail/epoll/scheduler.hpp` for the reactor shape and
//! on the teacher's own modern `src/sys/unix/selector/epoll.rs` and
//! `src/sys/unix/waker/eventfd.rs` for the actual syscalls (`epoll_create1`,
//! `epoll_ctl`, `epoll_wait`, `eventfd`).

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;
use std::task::Waker;
use std::time::Duration;

use crate::error::Error;
use crate::op::Register;
use crate::sys::Interest;

const WAKE_TOKEN: u64 = u64::MAX;

fn interest_to_epoll(interest: Interest) -> u32 {
    (libc::EPOLLONESHOT
        | match interest {
            Interest::Read => libc::EPOLLIN | libc::EPOLLRDHUP,
            Interest::Write => libc::EPOLLOUT,
        }) as u32
}

struct Waiter {
    waker: Waker,
}

pub struct Reactor {
    epoll: OwnedFd,
    wake_fd: OwnedFd,
    waiters: Mutex<HashMap<RawFd, Waiter>>,
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        let epoll_raw = epoll_errno(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll_raw) };

        let wake_raw = epoll_errno(unsafe {
            libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK)
        })?;
        let wake_fd = unsafe { OwnedFd::from_raw_fd(wake_raw) };

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        epoll_errno(unsafe {
            libc::epoll_ctl(epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, wake_fd.as_raw_fd(), &mut ev)
        })?;

        Ok(Reactor {
            epoll,
            wake_fd,
            waiters: Mutex::new(HashMap::new()),
        })
    }

    /// Blocks in `epoll_wait` for up to `timeout` (forever if `None`),
    /// waking the `Waker` registered for every fd that became ready.
    /// Returns the number of fds it woke.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let millis = timeout
            .map(|d| {
                d.checked_add(Duration::from_nanos(999_999))
                    .unwrap_or(d)
                    .as_millis()
                    .min(i32::MAX as u128) as i32
            })
            .unwrap_or(-1);

        let mut events: [libc::epoll_event; 256] = unsafe { std::mem::zeroed() };
        let n = epoll_errno(unsafe {
            libc::epoll_wait(self.epoll.as_raw_fd(), events.as_mut_ptr(), events.len() as i32, millis)
        })?;

        let mut woke = 0;
        for ev in &events[..n as usize] {
            if ev.u64 == WAKE_TOKEN {
                self.drain_wake_fd();
                continue;
            }
            let fd = ev.u64 as RawFd;
            if let Some(waiter) = self.waiters.lock().unwrap().remove(&fd) {
                waiter.waker.wake();
                woke += 1;
            }
        }
        Ok(woke)
    }

    pub fn interrupt(&self) {
        let value: u64 = 1;
        unsafe {
            libc::write(
                self.wake_fd.as_raw_fd(),
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }

    fn drain_wake_fd(&self) {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe {
                libc::read(
                    self.wake_fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n < 0 {
                break;
            }
        }
    }

    /// Creates a registration handle for `fd` that `op::Op` can arm/disarm
    /// against this reactor for the given `interest`.
    pub fn registration(self: &std::sync::Arc<Self>, fd: RawFd, interest: Interest) -> IoRegistration {
        IoRegistration {
            reactor: std::sync::Arc::clone(self),
            fd,
            interest,
            armed: false,
        }
    }
}

fn epoll_errno(ret: i32) -> io::Result<i32> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// A single fd's readiness registration, scoped to the lifetime of one
/// [`crate::op::Op`].
pub struct IoRegistration {
    reactor: std::sync::Arc<Reactor>,
    fd: RawFd,
    interest: Interest,
    armed: bool,
}

impl Register for IoRegistration {
    fn arm(&mut self, waker: Waker) -> Result<(), Error> {
        self.reactor
            .waiters
            .lock()
            .unwrap()
            .insert(self.fd, Waiter { waker });

        let mut ev = libc::epoll_event {
            events: interest_to_epoll(self.interest),
            u64: self.fd as u64,
        };
        let op = if self.armed {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        epoll_errno(unsafe { libc::epoll_ctl(self.reactor.epoll.as_raw_fd(), op, self.fd, &mut ev) })
            .map_err(Error::system)?;
        self.armed = true;
        Ok(())
    }

    fn disarm(&mut self) {
        if self.armed {
            self.reactor.waiters.lock().unwrap().remove(&self.fd);
            unsafe {
                libc::epoll_ctl(
                    self.reactor.epoll.as_raw_fd(),
                    libc::EPOLL_CTL_DEL,
                    self.fd,
                    std::ptr::null_mut(),
                );
            }
            self.armed = false;
        }
    }
}
