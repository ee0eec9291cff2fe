//! Shared socket construction plus the raw send/recv calls spec §4.2 needs
//! (the `MSG_NOSIGNAL`/`SO_NOSIGPIPE` write path) for both [`super::TcpStream`]
//! and [`super::TcpListener`].
//!
//! Grounded on the teacher's own `net/tcp/socket.rs` for the
//! `socket2`-based construction, generalized from mio's readiness-polling
//! use of it to this crate's op/reactor state machine.

use std::io;

use socket2::{Domain, Protocol, Socket, Type};

use crate::endpoint::Endpoint;

/// Builds a non-blocking `SOCK_STREAM` socket in the address family implied
/// by `endpoint`, with `SO_NOSIGPIPE` set up front on platforms that lack
/// `MSG_NOSIGNAL` (spec §4.2's "write SIGPIPE suppression" by the other
/// available mechanism).
pub(crate) fn new_stream_socket(endpoint: &Endpoint) -> io::Result<Socket> {
    let domain = if endpoint.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    #[cfg(target_vendor = "apple")]
    socket.set_nosigpipe(true)?;
    Ok(socket)
}

#[cfg(unix)]
mod unix_io {
    use std::io;
    use std::os::fd::RawFd;

    /// `recv(2)` on the raw fd. Reads carry no signal-suppression concern
    /// of their own; this exists mainly so [`raw_send`] has a matching
    /// sibling in one place.
    pub(crate) fn raw_recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    /// `send(2)` with `MSG_NOSIGNAL` where the platform has it, so a write
    /// to a peer that has reset the connection surfaces as `EPIPE` through
    /// the ordinary error path rather than raising `SIGPIPE` against the
    /// process (spec §4.2).
    pub(crate) fn raw_send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe {
            libc::send(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                no_signal_flag(),
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    /// Vectored `recv(2)` via `readv`.
    pub(crate) fn raw_recv_vectored(
        fd: RawFd,
        bufs: &mut [std::io::IoSliceMut<'_>],
    ) -> io::Result<usize> {
        let n = unsafe {
            libc::readv(
                fd,
                bufs.as_ptr() as *const libc::iovec,
                bufs.len() as libc::c_int,
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    /// Vectored, signal-suppressed send via `sendmsg`.
    pub(crate) fn raw_send_vectored(fd: RawFd, bufs: &[std::io::IoSlice<'_>]) -> io::Result<usize> {
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = bufs.len() as _;
        let n = unsafe { libc::sendmsg(fd, &msg, no_signal_flag()) };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    #[cfg(target_os = "linux")]
    fn no_signal_flag() -> libc::c_int {
        libc::MSG_NOSIGNAL
    }

    /// Platforms without `MSG_NOSIGNAL` (BSD/macOS) rely on `SO_NOSIGPIPE`
    /// set at socket-creation time instead (see [`super::new_stream_socket`]).
    #[cfg(not(target_os = "linux"))]
    fn no_signal_flag() -> libc::c_int {
        0
    }
}

#[cfg(unix)]
pub(crate) use unix_io::{raw_recv, raw_recv_vectored, raw_send, raw_send_vectored};

/// `TCP_NODELAY` / `SO_KEEPALIVE` / `SO_SNDBUF` / `SO_RCVBUF` / `SO_LINGER`
/// get/set pairs shared verbatim by [`super::TcpStream`] and
/// [`super::TcpListener`] (spec §4.6's options list), thin wrappers over
/// `socket2::Socket` the way the teacher's own option methods are.
pub trait SocketOptions {
    fn socket(&self) -> &Socket;

    fn set_nodelay(&self, enable: bool) -> io::Result<()> {
        self.socket().set_nodelay(enable)
    }

    fn nodelay(&self) -> io::Result<bool> {
        self.socket().nodelay()
    }

    fn set_keepalive(&self, enable: bool) -> io::Result<()> {
        self.socket().set_keepalive(enable)
    }

    fn keepalive(&self) -> io::Result<bool> {
        self.socket().keepalive()
    }

    fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        self.socket().set_recv_buffer_size(size)
    }

    fn recv_buffer_size(&self) -> io::Result<usize> {
        self.socket().recv_buffer_size()
    }

    fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        self.socket().set_send_buffer_size(size)
    }

    fn send_buffer_size(&self) -> io::Result<usize> {
        self.socket().send_buffer_size()
    }

    fn set_linger(&self, duration: Option<std::time::Duration>) -> io::Result<()> {
        self.socket().set_linger(duration)
    }

    fn linger(&self) -> io::Result<Option<std::time::Duration>> {
        self.socket().linger()
    }
}
