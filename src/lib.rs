//! A coroutine-native async TCP runtime: a single-reactor-thread scheduler
//! (epoll on Linux, an I/O completion port on Windows, `select` elsewhere),
//! timers, DNS resolution, process signal subscriptions, and TCP stream/
//! listener sockets, all driven through ordinary `std::future::Future`s.
//!
//! Grounded throughout on a C++ `io_context`-style coroutine runtime: the
//! [`context::ExecutionContext`]/[`scheduler::Scheduler`] pairing, the
//! work-accounting contract `run`/`run_one` stop on, and the per-operation
//! state machine in [`op`] all follow that original's shape directly,
//! reimplemented over Rust's `Future`/`Waker` rather than stackful
//! coroutines. [`block_on`] is the one genuinely new piece this port
//! needed: something has to drive a `Future` that the original never had
//! to, since a coroutine resumes itself but a `Future` only asks to be
//! polled again.
//!
//! ```no_run
//! use coronet::context::ExecutionContext;
//! use coronet::endpoint::Endpoint;
//! use coronet::net::TcpStream;
//!
//! let ctx = ExecutionContext::new().unwrap();
//! let endpoint = Endpoint::parse("127.0.0.1:0").unwrap();
//! ctx.block_on(async {
//!     let _ = TcpStream::connect(ctx.scheduler(), endpoint).await;
//! });
//! ```

pub mod block_on;
pub mod buffer;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod op;
pub mod resolver;
pub mod scheduler;
pub mod timer;
pub mod util;

#[cfg(feature = "net")]
pub mod net;

#[cfg(feature = "signal")]
pub mod signal;

#[cfg(feature = "tls")]
pub mod tls;

mod sys;

pub use block_on::block_on;
pub use context::ExecutionContext;
pub use endpoint::Endpoint;
pub use error::{Error, ErrorKind, Result};
