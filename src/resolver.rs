//! The DNS resolver service (spec component G).
//!
//! Grounded on `src/detail/epoll/resolver_service.hpp`: `getaddrinfo`
//! blocks, and no portable async variant exists across epoll/IOCP/select,
//! so each resolution is offloaded to its own detached `std::thread` that
//! runs the blocking call and posts the result back onto the scheduler.
//! The original tracks in-flight resolutions through the same
//! `work_started`/`work_finished` counter the scheduler already exposes
//! for keeping `run()` alive while async work is outstanding, rather than
//! a bespoke counter — this keeps that choice.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::task::Waker;

use log::debug;

use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::scheduler::Scheduler;

bitflags::bitflags! {
    /// Mirrors the flag bits `resolver_service.hpp`'s `epoll_resolve_op`
    /// threads through to `getaddrinfo`'s `ai_flags`.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ResolveFlags: u32 {
        /// Equivalent to `AI_PASSIVE`: the result is for a socket that will
        /// `bind`, not `connect`.
        const PASSIVE = 0b0001;
        /// Equivalent to `AI_NUMERICHOST`: reject anything that needs an
        /// actual DNS lookup and only accept numeric literals.
        const NUMERIC_HOST = 0b0010;
        /// Equivalent to `AI_V4MAPPED`: when resolving for an IPv6-only
        /// query, allow IPv4 results to come back as v4-mapped IPv6
        /// addresses.
        const V4_MAPPED = 0b0100;
        /// Equivalent to `AI_ALL`: combined with `V4_MAPPED`, return both
        /// native v6 results and v4-mapped ones instead of v6 taking
        /// priority.
        const ALL = 0b1000;
        /// Equivalent to `AI_NUMERICSERV`: `service` is already a numeric
        /// port and must not be looked up against `/etc/services`.
        const NUMERIC_SERVICE = 0b1_0000;
        /// Equivalent to `AI_ADDRCONFIG`: only return address families the
        /// local host itself has a configured, non-loopback interface for.
        const ADDRESS_CONFIGURED = 0b10_0000;
    }
}

struct Shared {
    results: Mutex<Option<Result<Vec<SocketAddr>, Error>>>,
    waker: Mutex<Option<Waker>>,
    cancelled: std::sync::atomic::AtomicBool,
}

/// A pending (or completed) resolution. Best-effort cancellable: per spec
/// §4.4, the underlying OS lookup itself may not be interruptible, so
/// [`Resolve::cancel`] only guarantees the waiting coroutine is resumed
/// with [`Error::cancelled`] promptly, not that the worker thread stops.
pub struct Resolve {
    shared: Arc<Shared>,
}

impl Resolve {
    /// Requests cancellation. The worker thread already in flight keeps
    /// running to completion in the background (its result is simply
    /// discarded), matching `getaddrinfo`'s own lack of a cancel primitive.
    pub fn cancel(&self) {
        self.shared
            .cancelled
            .store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(waker) = self.shared.waker.lock().unwrap().take() {
            waker.wake();
        }
    }
}

impl std::future::Future for Resolve {
    type Output = Result<Vec<SocketAddr>, Error>;

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        if self.shared.cancelled.load(std::sync::atomic::Ordering::SeqCst) {
            return std::task::Poll::Ready(Err(Error::cancelled()));
        }
        let mut results = self.shared.results.lock().unwrap();
        match results.take() {
            Some(result) => std::task::Poll::Ready(result),
            None => {
                *self.shared.waker.lock().unwrap() = Some(cx.waker().clone());
                std::task::Poll::Pending
            }
        }
    }
}

/// Resolves hostnames to a set of candidate [`SocketAddr`]s, offloading the
/// blocking `getaddrinfo`-equivalent call to a worker thread per request.
#[derive(Clone)]
pub struct ResolverService {
    scheduler: Scheduler,
}

impl ResolverService {
    pub fn new(scheduler: &Scheduler) -> ResolverService {
        ResolverService {
            scheduler: scheduler.clone(),
        }
    }

    /// Resolves `host:service` (e.g. `"example.com:443"`, or a numeric
    /// `"host:port"` if [`ResolveFlags::NUMERIC_HOST`] is set) into a list
    /// of candidate endpoints, in the order the platform resolver
    /// considers preferable.
    pub fn resolve(&self, host: &str, service: &str, flags: ResolveFlags) -> Resolve {
        let shared = Arc::new(Shared {
            results: Mutex::new(None),
            waker: Mutex::new(None),
            cancelled: std::sync::atomic::AtomicBool::new(false),
        });

        if flags.contains(ResolveFlags::NUMERIC_SERVICE) && service.parse::<u16>().is_err() {
            *shared.results.lock().unwrap() = Some(Err(Error::invalid_argument(
                "resolver: NUMERIC_SERVICE set but service is not a numeric port",
            )));
            return Resolve { shared };
        }

        if flags.contains(ResolveFlags::NUMERIC_HOST) {
            let result = Endpoint::parse(&format!("{host}:{service}"))
                .map(|ep| vec![ep.as_socket_addr()])
                .map_err(|_| Error::invalid_argument("resolver: NUMERIC_HOST set but host:service is not numeric"));
            *shared.results.lock().unwrap() = Some(result);
            return Resolve { shared };
        }

        let scheduler = self.scheduler.clone();
        scheduler.work_started();

        let host = host.to_owned();
        let query = format!("{host}:{service}");
        let worker_shared = Arc::clone(&shared);
        let worker_scheduler = scheduler.clone();

        debug!("resolving {query}");
        std::thread::spawn(move || {
            let result = blocking_resolve(&query, flags);
            let mut results = worker_shared.results.lock().unwrap();
            *results = Some(result);
            drop(results);

            let waker = worker_shared.waker.lock().unwrap().take();
            worker_scheduler.post(Box::new(move || {
                if let Some(waker) = waker {
                    waker.wake();
                }
            }));
            worker_scheduler.work_finished();
        });

        Resolve { shared }
    }
}

/// Performs the actual blocking lookup on the calling (worker) thread.
///
/// `std::net::ToSocketAddrs` is the portable stand-in for `getaddrinfo`
/// this crate uses rather than binding the C library directly; it shares
/// `getaddrinfo`'s blocking behavior and its `EAI_NONAME`-style "no such
/// host" failure mode, which is mapped to [`ErrorKind::InvalidArgument`]
/// below to distinguish a bad hostname from a transient system error.
fn blocking_resolve(query: &str, flags: ResolveFlags) -> Result<Vec<SocketAddr>, Error> {
    use std::net::ToSocketAddrs;

    let mut addrs: Vec<SocketAddr> = query
        .to_socket_addrs()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidInput => {
                Error::invalid_argument("resolver: no such host")
            }
            _ => Error::system(e),
        })?
        .collect();

    if addrs.is_empty() {
        return Err(Error::invalid_argument("resolver: no addresses returned"));
    }

    if flags.contains(ResolveFlags::V4_MAPPED) && !flags.contains(ResolveFlags::ALL) {
        // Prefer native v6 over v4-mapped v6 when both are present and
        // `ALL` was not requested, matching `getaddrinfo`'s default
        // ordering under `AI_V4MAPPED` without `AI_ALL`.
        addrs.sort_by_key(|a| matches!(a.ip(), IpAddr::V4(_)));
    }

    if flags.contains(ResolveFlags::ADDRESS_CONFIGURED) {
        let (v4_up, v6_up) = (has_configured_interface(false), has_configured_interface(true));
        addrs.retain(|a| if a.is_ipv4() { v4_up } else { v6_up });
        if addrs.is_empty() {
            return Err(Error::invalid_argument(
                "resolver: no addresses left after ADDRESS_CONFIGURED filtering",
            ));
        }
    }

    Ok(addrs)
}

/// A cheap, approximate `AI_ADDRCONFIG` check: binds a UDP socket in the
/// given family and tries to `connect` it to a non-routable address in the
/// same family purely to ask the kernel's routing table whether it would
/// know how to send such a packet at all, without sending anything.
fn has_configured_interface(v6: bool) -> bool {
    use std::net::UdpSocket;

    let (bind_addr, probe_addr) = if v6 {
        ("[::]:0", "2001:db8::1:53")
    } else {
        ("0.0.0.0:0", "192.0.2.1:53")
    };
    UdpSocket::bind(bind_addr)
        .and_then(|socket| socket.connect(probe_addr))
        .is_ok()
}
