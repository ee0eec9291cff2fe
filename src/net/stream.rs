//! Async, non-blocking TCP stream socket (spec component I / §4.6).
//!
//! Grounded on the teacher's `net/tcp_stream.rs` for the public surface
//! shape (`connect`, `read`/`write`, `shutdown`, `*_endpoint`, option
//! get/set pairs) and on `src/detail/epoll/epoll_op.hpp` /
//! `src/detail/iocp/iocp_op.hpp` for how each operation actually drives the
//! reactor: generalized here from mio's readiness-only `Source`/`Registry`
//! model to [`crate::op::Op`]'s try-once-then-park state machine, since a
//! stream here needs genuine per-op futures rather than an external
//! `Poll::poll` loop the caller drives by hand.

use std::io;
use std::net::Shutdown;
use std::sync::Mutex;

use log::debug;
use socket2::Socket;

use crate::buffer::{IoView, IoViewMut, MAX_IOV};
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::op::{Op, Slot};
use crate::scheduler::Scheduler;

use super::socket::{new_stream_socket, SocketOptions};

/// A guard that charges one unit of the scheduler's outstanding-work count
/// for as long as an `Op` constructed against it may still be pending,
/// mirroring how [`crate::timer::Sleep`] and [`crate::resolver::Resolve`]
/// each bracket their own pending lifetime (see `block_on`'s doc comment:
/// every future this crate hands out must do this or `run_one` has no way
/// to know to keep blocking for it).
struct WorkGuard<'a>(&'a Scheduler);

impl<'a> WorkGuard<'a> {
    fn start(scheduler: &'a Scheduler) -> WorkGuard<'a> {
        scheduler.work_started();
        WorkGuard(scheduler)
    }
}

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        self.0.work_finished();
    }
}

/// An established (or connecting) TCP connection.
///
/// Per spec §5, only one concurrent read, one concurrent write, and one
/// concurrent connect are permitted on a given stream; nothing here
/// enforces that beyond the fixed one-slot-per-kind layout making a second
/// concurrent call simply overwrite the slot's in-flight state, which is
/// why the contract is "undefined" rather than an error for a caller that
/// violates it.
pub struct TcpStream {
    socket: Socket,
    scheduler: Scheduler,
    local: Mutex<Option<Endpoint>>,
    remote: Mutex<Option<Endpoint>>,
    read_slot: Slot,
    write_slot: Slot,
    connect_slot: Slot,
}

impl SocketOptions for TcpStream {
    fn socket(&self) -> &Socket {
        &self.socket
    }
}

impl TcpStream {
    fn from_socket(scheduler: &Scheduler, socket: Socket) -> TcpStream {
        TcpStream {
            socket,
            scheduler: scheduler.clone(),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            read_slot: Slot::new(),
            write_slot: Slot::new(),
            connect_slot: Slot::new(),
        }
    }

    /// Creates the native handle and associates it with the reactor (spec
    /// §4.6 `open()`), without connecting yet. Exposed for callers that
    /// want to set socket options (e.g. `set_nodelay`) before `connect`;
    /// most callers should just use [`TcpStream::connect`].
    pub fn open(scheduler: &Scheduler, v6: bool) -> Result<TcpStream, Error> {
        let family_probe = if v6 {
            Endpoint::unspecified(0, true)
        } else {
            Endpoint::unspecified(0, false)
        };
        let socket = new_stream_socket(&family_probe).map_err(Error::system)?;
        let stream = TcpStream::from_socket(scheduler, socket);
        platform::associate(&stream)?;
        Ok(stream)
    }

    /// Connects to `endpoint`, caching both endpoints on success (spec
    /// §4.6 "endpoint caching").
    pub async fn connect(scheduler: &Scheduler, endpoint: Endpoint) -> Result<TcpStream, Error> {
        debug!("connecting to {endpoint}");
        let socket = new_stream_socket(&endpoint).map_err(Error::system)?;
        let stream = TcpStream::from_socket(scheduler, socket);
        platform::associate(&stream)?;

        let _work = WorkGuard::start(&stream.scheduler);
        platform::connect(&stream, endpoint).await?;

        stream.cache_endpoints();
        debug!("connected to {endpoint}");
        Ok(stream)
    }

    fn cache_endpoints(&self) {
        if let Ok(addr) = self.socket.local_addr() {
            if let Some(addr) = addr.as_socket() {
                *self.local.lock().unwrap() = Some(Endpoint::from(addr));
            }
        }
        if let Ok(addr) = self.socket.peer_addr() {
            if let Some(addr) = addr.as_socket() {
                *self.remote.lock().unwrap() = Some(Endpoint::from(addr));
            }
        }
    }

    /// Used by [`super::TcpListener::accept`] to adopt a freshly accepted
    /// native handle and cache its endpoints, per spec §4.7.
    pub(crate) fn adopt(scheduler: &Scheduler, socket: Socket) -> Result<TcpStream, Error> {
        socket.set_nonblocking(true).map_err(Error::system)?;
        let stream = TcpStream::from_socket(scheduler, socket);
        platform::associate(&stream)?;
        stream.cache_endpoints();
        Ok(stream)
    }

    /// Per spec §4.2 "EOF discrimination": a zero-length read is only a
    /// legitimate success when the caller's own buffer was empty (handled
    /// above, before any op is even started); once we've started one with a
    /// genuinely non-empty buffer, zero bytes transferred means the peer
    /// closed cleanly.
    pub async fn read_some(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        let _work = WorkGuard::start(&self.scheduler);
        match platform::read(self, buf).await {
            Ok(0) => Err(Error::eof()),
            other => other,
        }
    }

    pub async fn write_some(&self, buf: &[u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }
        let _work = WorkGuard::start(&self.scheduler);
        platform::write(self, buf).await
    }

    /// Vectored read, capped at [`MAX_IOV`] buffers per spec §6.
    pub async fn read_some_vectored(&self, view: &mut IoViewMut<'_>) -> Result<usize, Error> {
        if view.is_empty() {
            return Ok(0);
        }
        let _work = WorkGuard::start(&self.scheduler);
        match platform::read_vectored(self, view.slices_mut()).await {
            Ok(0) => Err(Error::eof()),
            other => other,
        }
    }

    /// Vectored write, capped at [`MAX_IOV`] buffers per spec §6.
    pub async fn write_some_vectored(&self, view: &IoView<'_>) -> Result<usize, Error> {
        if view.is_empty() {
            return Ok(0);
        }
        let mut slices = {
            let empty: [std::io::IoSlice<'_>; MAX_IOV] = std::array::from_fn(|_| std::io::IoSlice::new(&[]));
            empty
        };
        let n = view.copy_to(&mut slices);
        let _work = WorkGuard::start(&self.scheduler);
        platform::write_vectored(self, &slices[..n]).await
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<(), Error> {
        self.socket.shutdown(how).map_err(Error::system)
    }

    pub fn local_endpoint(&self) -> Option<Endpoint> {
        *self.local.lock().unwrap()
    }

    pub fn remote_endpoint(&self) -> Option<Endpoint> {
        *self.remote.lock().unwrap()
    }

    /// Cancels every pending operation on this stream, per spec §4.6
    /// "closing while operations are pending is a supported operation;
    /// each pending op is resumed with cancelled". The actual handle close
    /// happens on `Drop` (closing `socket2::Socket` closes the fd/handle),
    /// matching the spec's note that the implementation record may outlive
    /// the public handle while an op is still draining through the
    /// scheduler queue — here that's simply the `Arc`-free `Slot`s keeping
    /// their `OpState` alive until the in-flight `Op::poll` observes
    /// `cancelled` and returns.
    pub fn close(&self) {
        debug!("closing stream; cancelling pending ops");
        self.read_slot.cancel();
        self.write_slot.cancel();
        self.connect_slot.cancel();
    }
}

/// Raw-handle interop (SPEC_FULL.md §2), matching the teacher's own
/// `net/tcp/stream.rs` impls: lets a caller hand this stream's underlying
/// socket to code outside this crate.
#[cfg(unix)]
impl std::os::fd::AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        std::os::fd::AsRawFd::as_raw_fd(&self.socket)
    }
}

#[cfg(unix)]
impl std::os::fd::IntoRawFd for TcpStream {
    fn into_raw_fd(self) -> std::os::fd::RawFd {
        std::os::fd::IntoRawFd::into_raw_fd(self.socket)
    }
}

#[cfg(windows)]
impl std::os::windows::io::AsRawSocket for TcpStream {
    fn as_raw_socket(&self) -> std::os::windows::io::RawSocket {
        std::os::windows::io::AsRawSocket::as_raw_socket(&self.socket)
    }
}

#[cfg(windows)]
impl std::os::windows::io::IntoRawSocket for TcpStream {
    fn into_raw_socket(self) -> std::os::windows::io::RawSocket {
        std::os::windows::io::IntoRawSocket::into_raw_socket(self.socket)
    }
}

#[cfg(unix)]
mod platform {
    use std::os::fd::AsRawFd;

    use super::*;
    use crate::op::Attempt;
    use crate::sys::Interest;

    pub(super) fn associate(_stream: &TcpStream) -> Result<(), Error> {
        // epoll/select registrations are per-call (spec §4.2's "try once,
        // register on would-block"), so there is nothing to do at open time
        // beyond what `new_stream_socket` already did (non-blocking mode).
        Ok(())
    }

    pub(super) async fn connect(stream: &TcpStream, endpoint: Endpoint) -> Result<(), Error> {
        let addr: socket2::SockAddr = endpoint.as_socket_addr().into();
        match stream.socket.connect(&addr) {
            Ok(()) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(Error::system(e)),
        }

        let fd = stream.socket.as_raw_fd();
        let reactor = stream.scheduler.reactor();
        let reg = reactor.registration(fd, Interest::Write);

        // `connect(2)` itself was already issued above exactly once; the
        // first poll only needs to wait for writability, then check
        // `SO_ERROR` for the real outcome.
        let mut issued = false;
        let op = Op::with_slot(
            || {
                if !issued {
                    issued = true;
                    return Attempt::WouldBlock;
                }
                match stream.socket.take_error() {
                    Ok(None) => Attempt::Done(Ok(())),
                    Ok(Some(e)) => Attempt::Done(Err(Error::system(e))),
                    Err(e) => Attempt::Done(Err(Error::system(e))),
                }
            },
            reg,
            &stream.connect_slot,
        );
        op.await
    }

    pub(super) async fn read(stream: &TcpStream, buf: &mut [u8]) -> Result<usize, Error> {
        let fd = stream.socket.as_raw_fd();
        let reactor = stream.scheduler.reactor();
        let reg = reactor.registration(fd, Interest::Read);
        let op = Op::with_slot(
            || match super::super::socket::raw_recv(fd, buf) {
                Ok(n) => Attempt::Done(Ok(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Attempt::WouldBlock,
                Err(e) => Attempt::Done(Err(Error::system(e))),
            },
            reg,
            &stream.read_slot,
        );
        op.await
    }

    pub(super) async fn write(stream: &TcpStream, buf: &[u8]) -> Result<usize, Error> {
        let fd = stream.socket.as_raw_fd();
        let reactor = stream.scheduler.reactor();
        let reg = reactor.registration(fd, Interest::Write);
        let op = Op::with_slot(
            || match super::super::socket::raw_send(fd, buf) {
                Ok(n) => Attempt::Done(Ok(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Attempt::WouldBlock,
                Err(e) => Attempt::Done(Err(Error::system(e))),
            },
            reg,
            &stream.write_slot,
        );
        op.await
    }

    pub(super) async fn read_vectored(
        stream: &TcpStream,
        bufs: &mut [std::io::IoSliceMut<'_>],
    ) -> Result<usize, Error> {
        let fd = stream.socket.as_raw_fd();
        let reactor = stream.scheduler.reactor();
        let reg = reactor.registration(fd, Interest::Read);
        let op = Op::with_slot(
            || match super::super::socket::raw_recv_vectored(fd, bufs) {
                Ok(n) => Attempt::Done(Ok(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Attempt::WouldBlock,
                Err(e) => Attempt::Done(Err(Error::system(e))),
            },
            reg,
            &stream.read_slot,
        );
        op.await
    }

    pub(super) async fn write_vectored(
        stream: &TcpStream,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Result<usize, Error> {
        let fd = stream.socket.as_raw_fd();
        let reactor = stream.scheduler.reactor();
        let reg = reactor.registration(fd, Interest::Write);
        let op = Op::with_slot(
            || match super::super::socket::raw_send_vectored(fd, bufs) {
                Ok(n) => Attempt::Done(Ok(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Attempt::WouldBlock,
                Err(e) => Attempt::Done(Err(Error::system(e))),
            },
            reg,
            &stream.write_slot,
        );
        op.await
    }
}

#[cfg(windows)]
mod platform {
    use std::mem::ManuallyDrop;
    use std::net;
    use std::os::windows::io::{AsRawSocket, FromRawSocket};

    use miow::net::TcpStreamExt;

    use super::*;
    use crate::op::Attempt;

    /// Borrows the socket as a `std::net::TcpStream` long enough to call one
    /// of `miow`'s overlapped extension methods, without taking ownership
    /// (the real owner stays `stream.socket`; dropping the temporary view
    /// must never close the handle out from under it).
    fn borrow(socket: &Socket) -> ManuallyDrop<net::TcpStream> {
        ManuallyDrop::new(unsafe { net::TcpStream::from_raw_socket(socket.as_raw_socket()) })
    }

    pub(super) fn associate(stream: &TcpStream) -> Result<(), Error> {
        let reactor = stream.scheduler.reactor();
        reactor
            .port()
            .add_socket(0, &*borrow(&stream.socket))
            .map_err(Error::system)
    }

    pub(super) async fn connect(stream: &TcpStream, endpoint: Endpoint) -> Result<(), Error> {
        // `ConnectEx` requires the socket be bound first.
        let bind_addr = Endpoint::unspecified(0, endpoint.is_ipv6()).as_socket_addr();
        stream
            .socket
            .bind(&bind_addr.into())
            .map_err(Error::system)?;

        let reactor = stream.scheduler.reactor();
        let mut reg = reactor.registration();
        let overlapped = reg.overlapped_ptr();
        let addr = endpoint.as_socket_addr();
        unsafe {
            borrow(&stream.socket)
                .connect_overlapped(&addr, overlapped)
                .map_err(Error::system)?;
        }
        let result_handle = reg.result_handle();
        let op = Op::with_slot(
            move || match result_handle.lock().unwrap().take() {
                Some(_) => Attempt::Done(Ok(())),
                None => Attempt::WouldBlock,
            },
            reg,
            &stream.connect_slot,
        );
        op.await?;
        borrow(&stream.socket)
            .update_connect_context()
            .map_err(Error::system)
    }

    pub(super) async fn read(stream: &TcpStream, buf: &mut [u8]) -> Result<usize, Error> {
        let reactor = stream.scheduler.reactor();
        let mut reg = reactor.registration();
        let overlapped = reg.overlapped_ptr();
        unsafe {
            borrow(&stream.socket)
                .read_overlapped(buf, overlapped)
                .map_err(Error::system)?;
        }
        let result_handle = reg.result_handle();
        let op = Op::with_slot(
            move || match result_handle.lock().unwrap().take() {
                Some(n) => Attempt::Done(Ok(n as usize)),
                None => Attempt::WouldBlock,
            },
            reg,
            &stream.read_slot,
        );
        op.await
    }

    pub(super) async fn write(stream: &TcpStream, buf: &[u8]) -> Result<usize, Error> {
        let reactor = stream.scheduler.reactor();
        let mut reg = reactor.registration();
        let overlapped = reg.overlapped_ptr();
        unsafe {
            borrow(&stream.socket)
                .write_overlapped(buf, overlapped)
                .map_err(Error::system)?;
        }
        let result_handle = reg.result_handle();
        let op = Op::with_slot(
            move || match result_handle.lock().unwrap().take() {
                Some(n) => Attempt::Done(Ok(n as usize)),
                None => Attempt::WouldBlock,
            },
            reg,
            &stream.write_slot,
        );
        op.await
    }

    /// `miow`'s overlapped extension traits take a single buffer; this
    /// crate's vectored calls fall back to one `WSASend`/`WSARecv` per
    /// buffer in sequence rather than a single scatter/gather syscall on
    /// Windows, and return after the first buffer completes (spec §4.6:
    /// "return as soon as any/some bytes arrive").
    pub(super) async fn read_vectored(
        stream: &TcpStream,
        bufs: &mut [std::io::IoSliceMut<'_>],
    ) -> Result<usize, Error> {
        match bufs.iter_mut().find(|b| !b.is_empty()) {
            Some(first) => read(stream, &mut first[..]).await,
            None => Ok(0),
        }
    }

    pub(super) async fn write_vectored(
        stream: &TcpStream,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Result<usize, Error> {
        match bufs.iter().find(|b| !b.is_empty()) {
            Some(first) => write(stream, &first[..]).await,
            None => Ok(0),
        }
    }
}
