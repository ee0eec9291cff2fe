//! Async TCP listening socket (spec component J / §4.7).
//!
//! Grounded on the teacher's `net/tcp_listener.rs` for the public surface
//! (`bind`/`accept`/`local_addr`) and on `op.rs`/`stream.rs` for how
//! `accept` itself is driven asynchronously instead of through mio's
//! `Source`/readiness model.

use std::sync::Mutex;

use log::debug;
#[cfg(windows)]
use socket2::Type;
use socket2::{SockAddr, Socket};

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::op::Slot;
use crate::scheduler::Scheduler;

use super::socket::{new_stream_socket, SocketOptions};
use super::stream::TcpStream;

pub struct TcpListener {
    socket: Socket,
    scheduler: Scheduler,
    local: Mutex<Option<Endpoint>>,
    accept_slot: Slot,
}

impl SocketOptions for TcpListener {
    fn socket(&self) -> &Socket {
        &self.socket
    }
}

impl TcpListener {
    /// Binds and begins listening, setting the address-reuse option before
    /// `bind` (spec §4.7).
    pub fn listen(scheduler: &Scheduler, endpoint: Endpoint, backlog: i32) -> Result<TcpListener, Error> {
        let socket = new_stream_socket(&endpoint).map_err(Error::system)?;
        socket.set_reuse_address(true).map_err(Error::system)?;
        #[cfg(unix)]
        socket.set_reuse_port(true).map_err(Error::system)?;

        let addr: SockAddr = endpoint.as_socket_addr().into();
        socket.bind(&addr).map_err(Error::system)?;
        socket.listen(backlog).map_err(Error::system)?;

        let listener = TcpListener {
            socket,
            scheduler: scheduler.clone(),
            local: Mutex::new(None),
            accept_slot: Slot::new(),
        };
        platform::associate(&listener)?;
        listener.cache_local();
        debug!("listening on {endpoint}");
        Ok(listener)
    }

    fn cache_local(&self) {
        if let Ok(addr) = self.socket.local_addr() {
            if let Some(addr) = addr.as_socket() {
                *self.local.lock().unwrap() = Some(Endpoint::from(addr));
            }
        }
    }

    pub fn local_endpoint(&self) -> Option<Endpoint> {
        *self.local.lock().unwrap()
    }

    /// Waits for a pending connection, creates a new stream implementation
    /// for it, transfers the native handle, sets non-blocking mode, and
    /// caches its endpoints (spec §4.7). The listening socket itself
    /// remains valid for subsequent accepts.
    pub async fn accept(&self) -> Result<(TcpStream, Endpoint), Error> {
        let accepted = platform::accept(self).await?;
        let stream = TcpStream::adopt(&self.scheduler, accepted)?;
        let remote = stream
            .remote_endpoint()
            .ok_or_else(|| Error::invalid_argument("accept: peer endpoint unavailable"))?;
        debug!("accepted connection from {remote}");
        Ok((stream, remote))
    }

    /// Cancels a pending `accept`, if any.
    pub fn close(&self) {
        self.accept_slot.cancel();
    }
}

/// Raw-handle interop (SPEC_FULL.md §2), matching the teacher's own
/// `net/tcp/listener.rs` impls.
#[cfg(unix)]
impl std::os::fd::AsRawFd for TcpListener {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        std::os::fd::AsRawFd::as_raw_fd(&self.socket)
    }
}

#[cfg(unix)]
impl std::os::fd::IntoRawFd for TcpListener {
    fn into_raw_fd(self) -> std::os::fd::RawFd {
        std::os::fd::IntoRawFd::into_raw_fd(self.socket)
    }
}

#[cfg(windows)]
impl std::os::windows::io::AsRawSocket for TcpListener {
    fn as_raw_socket(&self) -> std::os::windows::io::RawSocket {
        std::os::windows::io::AsRawSocket::as_raw_socket(&self.socket)
    }
}

#[cfg(windows)]
impl std::os::windows::io::IntoRawSocket for TcpListener {
    fn into_raw_socket(self) -> std::os::windows::io::RawSocket {
        std::os::windows::io::IntoRawSocket::into_raw_socket(self.socket)
    }
}

#[cfg(unix)]
mod platform {
    use std::os::fd::AsRawFd;

    use super::*;
    use crate::op::{Attempt, Op};
    use crate::sys::Interest;

    pub(super) fn associate(_listener: &TcpListener) -> Result<(), Error> {
        Ok(())
    }

    pub(super) async fn accept(listener: &TcpListener) -> Result<Socket, Error> {
        let fd = listener.socket.as_raw_fd();
        let reactor = listener.scheduler.reactor();
        let reg = reactor.registration(fd, Interest::Read);
        let op = Op::with_slot(
            || match listener.socket.accept() {
                Ok((socket, _addr)) => Attempt::Done(Ok(socket)),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Attempt::WouldBlock,
                Err(e) => Attempt::Done(Err(Error::system(e))),
            },
            reg,
            &listener.accept_slot,
        );
        let socket = op.await?;
        socket.set_nonblocking(true).map_err(Error::system)?;
        Ok(socket)
    }
}

#[cfg(windows)]
mod platform {
    use std::mem::ManuallyDrop;
    use std::net;
    use std::os::windows::io::{AsRawSocket, FromRawSocket};

    use miow::net::TcpListenerExt;

    use super::*;
    use crate::op::{Attempt, Op};

    fn borrow_listener(socket: &Socket) -> ManuallyDrop<net::TcpListener> {
        ManuallyDrop::new(unsafe { net::TcpListener::from_raw_socket(socket.as_raw_socket()) })
    }

    fn borrow_stream(socket: &Socket) -> ManuallyDrop<net::TcpStream> {
        ManuallyDrop::new(unsafe { net::TcpStream::from_raw_socket(socket.as_raw_socket()) })
    }

    pub(super) fn associate(listener: &TcpListener) -> Result<(), Error> {
        let reactor = listener.scheduler.reactor();
        reactor
            .port()
            .add_socket(0, &*borrow_listener(&listener.socket))
            .map_err(Error::system)
    }

    /// Per spec §4.7: "the cross-platform accept-completion path must, on
    /// Windows, call the post-accept context-update hook so the accepted
    /// socket behaves correctly" — `update_accept_context` below.
    pub(super) async fn accept(listener: &TcpListener) -> Result<Socket, Error> {
        let family = if listener
            .local_endpoint()
            .map(|e| e.is_ipv6())
            .unwrap_or(false)
        {
            socket2::Domain::IPV6
        } else {
            socket2::Domain::IPV4
        };
        let accept_socket = Socket::new(family, Type::STREAM, Some(socket2::Protocol::TCP))
            .map_err(Error::system)?;
        accept_socket.set_nonblocking(true).map_err(Error::system)?;

        let reactor = listener.scheduler.reactor();
        let mut reg = reactor.registration();
        let overlapped = reg.overlapped_ptr();
        let mut buf = [0u8; 1024];
        unsafe {
            borrow_listener(&listener.socket)
                .accept_overlapped(&borrow_stream(&accept_socket), &mut buf, overlapped)
                .map_err(Error::system)?;
        }
        let result_handle = reg.result_handle();
        let op = Op::with_slot(
            move || match result_handle.lock().unwrap().take() {
                Some(_) => Attempt::Done(Ok(())),
                None => Attempt::WouldBlock,
            },
            reg,
            &listener.accept_slot,
        );
        op.await?;

        borrow_stream(&accept_socket)
            .update_accept_context(&*borrow_listener(&listener.socket))
            .map_err(Error::system)?;
        Ok(accept_socket)
    }
}
