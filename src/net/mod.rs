//! TCP networking (spec components I/J): [`TcpStream`] and [`TcpListener`],
//! built on non-blocking [`socket2::Socket`]s and this crate's own
//! `op`/`scheduler` state machine rather than mio's readiness-polling
//! `Poll`/`Registry`. UDP and Unix domain sockets are out of scope (spec
//! non-goals) and have no module here at all.

mod listener;
mod socket;
mod stream;

pub use listener::TcpListener;
pub use socket::SocketOptions;
pub use stream::TcpStream;
