//! Generic POSIX backend: `select(2)` plus a self-pipe waker.
//!
//! Used on platforms that have a POSIX socket API but no `epoll` (macOS,
//! BSDs). Grounded on `src/detail/select/` in the original and, for the
//! self-pipe idiom, on the teacher's own unix waker implementations
//! (the modern backend prefers `eventfd`, which is Linux-only; `select`
//! itself is also unusable on Windows, hence the crate's third backend).
//! `select`'s O(highest fd) cost and `FD_SETSIZE` ceiling are accepted
//! deliberately here — this backend exists for portability, not for
//! matching epoll's scalability.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::io::FromRawFd;
use std::sync::{Arc, Mutex};
use std::task::Waker;
use std::time::Duration;

use crate::error::Error;
use crate::op::Register;
use crate::sys::Interest;

struct Waiter {
    waker: Waker,
    interest: Interest,
}

pub struct Reactor {
    wake_read: std::fs::File,
    wake_write: std::fs::File,
    waiters: Mutex<HashMap<RawFd, Waiter>>,
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        let mut fds = [0i32; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        }
        Ok(Reactor {
            wake_read: unsafe { std::fs::File::from_raw_fd(fds[0]) },
            wake_write: unsafe { std::fs::File::from_raw_fd(fds[1]) },
            waiters: Mutex::new(HashMap::new()),
        })
    }

    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let waiters = self.waiters.lock().unwrap();
        let wake_fd = self.wake_read.as_raw_fd();
        let mut max_fd = wake_fd;

        let mut read_set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut write_set: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            libc::FD_SET(wake_fd, &mut read_set);
        }
        for (&fd, waiter) in waiters.iter() {
            max_fd = max_fd.max(fd);
            unsafe {
                match waiter.interest {
                    Interest::Read => libc::FD_SET(fd, &mut read_set),
                    Interest::Write => libc::FD_SET(fd, &mut write_set),
                }
            }
        }
        drop(waiters);

        let mut tv = timeout.map(|d| libc::timeval {
            tv_sec: d.as_secs() as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        });

        let ret = unsafe {
            libc::select(
                max_fd + 1,
                &mut read_set,
                &mut write_set,
                std::ptr::null_mut(),
                tv.as_mut().map_or(std::ptr::null_mut(), |t| t as *mut _),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        if unsafe { libc::FD_ISSET(wake_fd, &read_set) } {
            self.drain_wake_pipe();
        }

        let mut woke = 0;
        let mut waiters = self.waiters.lock().unwrap();
        let ready: Vec<RawFd> = waiters
            .iter()
            .filter(|(&fd, waiter)| unsafe {
                match waiter.interest {
                    Interest::Read => libc::FD_ISSET(fd, &read_set),
                    Interest::Write => libc::FD_ISSET(fd, &write_set),
                }
            })
            .map(|(&fd, _)| fd)
            .collect();
        for fd in ready {
            if let Some(waiter) = waiters.remove(&fd) {
                waiter.waker.wake();
                woke += 1;
            }
        }
        Ok(woke)
    }

    pub fn interrupt(&self) {
        use std::io::Write;
        let _ = (&self.wake_write).write(&[1u8]);
    }

    fn drain_wake_pipe(&self) {
        use std::io::Read;
        let mut buf = [0u8; 64];
        loop {
            match (&self.wake_read).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    pub fn registration(self: &Arc<Self>, fd: RawFd, interest: Interest) -> IoRegistration {
        IoRegistration {
            reactor: Arc::clone(self),
            fd,
            interest,
            armed: false,
        }
    }
}

pub struct IoRegistration {
    reactor: Arc<Reactor>,
    fd: RawFd,
    interest: Interest,
    armed: bool,
}

impl Register for IoRegistration {
    fn arm(&mut self, waker: Waker) -> Result<(), Error> {
        self.reactor.waiters.lock().unwrap().insert(
            self.fd,
            Waiter {
                waker,
                interest: self.interest,
            },
        );
        self.armed = true;
        self.reactor.interrupt();
        Ok(())
    }

    fn disarm(&mut self) {
        if self.armed {
            self.reactor.waiters.lock().unwrap().remove(&self.fd);
            self.armed = false;
        }
    }
}
