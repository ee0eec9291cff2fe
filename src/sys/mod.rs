//! Platform backend dispatch (spec §5's three required backends).
//!
//! Each backend exposes the same small surface — a `Reactor` the scheduler
//! blocks inside, and an `IoRegistration` that `op::Register` operations are
//! armed against — so `scheduler.rs` and `op.rs` stay entirely
//! platform-neutral, the same separation `detail/epoll`, `detail/iocp`, and
//! `detail/posix` keep in the original. The reactor itself is core
//! infrastructure (the timer and resolver services need a scheduler to run
//! on regardless of whether TCP is in use), so these are not gated behind
//! the `net` feature; only the socket-specific registration helpers each
//! backend exposes are used exclusively by `net`.

/// A readiness interest: waiting for a fd/socket to become readable or
/// writable. Shared by the epoll and generic POSIX backends, whose
/// completion model is "wait, then the caller performs its own syscall" —
/// unlike the IOCP backend, where the syscall itself is submitted as part
/// of arming the registration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Interest {
    Read,
    Write,
}

#[cfg(target_os = "linux")]
pub mod epoll_backend;
#[cfg(target_os = "linux")]
pub use epoll_backend::{IoRegistration, Reactor};

#[cfg(windows)]
pub mod iocp_backend;
#[cfg(windows)]
pub use iocp_backend::{IoRegistration, Reactor};

#[cfg(all(unix, not(target_os = "linux")))]
pub mod posix_backend;
#[cfg(all(unix, not(target_os = "linux")))]
pub use posix_backend::{IoRegistration, Reactor};
