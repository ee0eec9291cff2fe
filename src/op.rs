//! The per-operation state machine (spec component C).
//!
//! Grounded on `src/detail/epoll/op.hpp`'s `epoll_op`: every asynchronous
//! operation is a small state machine that can complete three different
//! ways — synchronously inline, from the reactor thread once the fd becomes
//! ready, or via cancellation — and the three must never race each other
//! into double-completing the same coroutine. The original encodes this
//! with a `registration_state` enum (`unregistered` / `registering` /
//! `registered`) stored in an atomic; this is a direct port of that to
//! `Future::poll`, where "resume the coroutine" becomes "return
//! `Poll::Ready`" or "wake the stored `Waker`".
//!
//! `Op` itself is generic over the "try once" closure so `read_some`,
//! `write_some`, `connect`, and `accept` all share one state machine instead
//! of four hand-duplicated ones, the way the C++ original duplicates
//! `epoll_op`/`epoll_connect_op` per operation kind.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll, Waker};

use log::trace;

use crate::error::Error;

/// Mirrors `op.hpp`'s `registration_state`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistrationState {
    /// No attempt to wait for readiness has been made yet.
    Unregistered = 0,
    /// A readiness registration is in flight; a reactor-thread completion
    /// racing in right now must win and complete the op rather than being
    /// dropped on the floor.
    Registering = 1,
    /// Registered and parked; only the reactor thread (or a cancel) may
    /// complete the op now.
    Registered = 2,
}

impl From<u8> for RegistrationState {
    fn from(v: u8) -> RegistrationState {
        match v {
            0 => RegistrationState::Unregistered,
            1 => RegistrationState::Registering,
            2 => RegistrationState::Registered,
            _ => unreachable!("invalid registration state"),
        }
    }
}

/// What a single attempt to perform the operation inline resulted in.
pub enum Attempt<T> {
    /// The operation finished; this is its result.
    Done(Result<T, Error>),
    /// The operation would block; the caller must register for readiness
    /// and try again once woken.
    WouldBlock,
}

/// The claim/cancel bookkeeping an [`Op`] needs, split out from `Op` itself
/// so it can be shared with the owning I/O object. Mirrors spec §3's
/// "shared-ownership handle to the owning I/O object" concern in reverse:
/// here it's the *op's* cancellation state that must outlive any single
/// `poll` call so `close()`/`cancel()` can reach in and fire it while the
/// `Op` future only exists transiently on the awaiting stack frame.
pub struct OpState {
    reg: AtomicU8,
    cancelled: std::sync::atomic::AtomicBool,
    waker: Mutex<Option<Waker>>,
}

impl OpState {
    fn new() -> Arc<OpState> {
        Arc::new(OpState {
            reg: AtomicU8::new(RegistrationState::Unregistered as u8),
            cancelled: std::sync::atomic::AtomicBool::new(false),
            waker: Mutex::new(None),
        })
    }

    /// Requests cancellation. If an op holding this state is currently
    /// parked waiting on the reactor, the next poll observes `cancelled`
    /// and completes with [`Error::cancelled`] instead of re-trying the
    /// operation. Mirrors `epoll_op::request_cancel()`; this is also what
    /// a stream's `close()` calls on every slot it holds (spec §4.2 paths
    /// 3/4).
    pub fn request_cancel(&self) {
        trace!("op: cancel requested");
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(waker) = self.waker.lock().unwrap().take() {
            waker.wake();
        }
    }
}

/// A single fixed op slot embedded in an I/O object (spec §3: "one read-op
/// slot, one write-op slot, one connect-op slot per stream"). Holds the
/// in-flight op's [`OpState`] only while an operation of this kind is
/// actually pending, so `close()` can cancel whatever's in flight without
/// needing to reach into the `Future` itself.
#[derive(Default)]
pub struct Slot(Mutex<Option<Arc<OpState>>>);

impl Slot {
    pub fn new() -> Slot {
        Slot(Mutex::new(None))
    }

    fn set(&self, state: &Arc<OpState>) {
        *self.0.lock().unwrap() = Some(Arc::clone(state));
    }

    fn clear(&self) {
        *self.0.lock().unwrap() = None;
    }

    /// Cancels whatever op currently occupies this slot, if any. A no-op
    /// when nothing of this kind is in flight.
    pub fn cancel(&self) {
        if let Some(state) = self.0.lock().unwrap().take() {
            state.request_cancel();
        }
    }
}

/// A pollable asynchronous operation built from repeatedly calling
/// `try_once` until it reports completion, parking on the reactor in
/// between attempts.
///
/// `R` is the reactor-side registration handle (an fd registration token on
/// epoll/select, an `OVERLAPPED` completion slot on IOCP) that `register`
/// arms and `Drop`/cancel tears down.
pub struct Op<'a, F, Reg, T>
where
    F: FnMut() -> Attempt<T>,
{
    try_once: F,
    register: Reg,
    state: Arc<OpState>,
    /// The owning object's slot for this op kind, published for the
    /// duration this `Op` is alive so an external `close()`/`cancel()` can
    /// reach [`OpState::request_cancel`] even while this `Op` only lives on
    /// the awaiting task's stack. Cleared on drop.
    slot: Option<&'a Slot>,
}

/// Implemented by the platform backend: given a `Waker` to call once the
/// underlying fd/handle becomes ready (or the operation otherwise
/// completes out of band), arm the registration. Returning `Err` aborts the
/// operation with that error instead of parking.
pub trait Register {
    fn arm(&mut self, waker: Waker) -> Result<(), Error>;

    /// Tears down a registration that was armed but whose op is being
    /// dropped/cancelled before completion. Mirrors `epoll_op::reset()`.
    fn disarm(&mut self) {}
}

impl<'a, F, Reg, T> Op<'a, F, Reg, T>
where
    F: FnMut() -> Attempt<T>,
    Reg: Register,
{
    /// Builds an op with no owning slot: nothing outside this `Future` can
    /// cancel it before it resolves. Used for operations spec §3 doesn't
    /// call out a fixed embedded slot for (e.g. a one-shot `connect` retry
    /// loop that races no concurrent `close`).
    pub fn new(try_once: F, register: Reg) -> Op<'a, F, Reg, T> {
        Op {
            try_once,
            register,
            state: OpState::new(),
            slot: None,
        }
    }

    /// Builds an op whose cancellation state is published into `slot` for
    /// the duration of this `Future`'s life, so the owning I/O object's
    /// `close()`/per-op `cancel()` can reach in and fire
    /// [`OpState::request_cancel`] while this `Op` is parked on some other
    /// task's stack (spec §4.2 paths 3/4, §4.6 "each pending op is resumed
    /// with cancelled").
    pub fn with_slot(try_once: F, register: Reg, slot: &'a Slot) -> Op<'a, F, Reg, T> {
        let state = OpState::new();
        slot.set(&state);
        Op {
            try_once,
            register,
            state,
            slot: Some(slot),
        }
    }
}

impl<'a, F, Reg, T> Future for Op<'a, F, Reg, T>
where
    F: FnMut() -> Attempt<T> + Unpin,
    Reg: Register + Unpin,
{
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);

        if this.state.cancelled.load(Ordering::SeqCst) {
            return Poll::Ready(Err(Error::cancelled()));
        }

        match (this.try_once)() {
            Attempt::Done(result) => Poll::Ready(result),
            Attempt::WouldBlock => {
                *this.state.waker.lock().unwrap() = Some(cx.waker().clone());

                // A backend like epoll's one-shot registration disarms
                // itself the moment it fires: being polled again while in
                // `Registered` means that single-shot event already
                // happened (we were woken) and try_once still returned
                // `WouldBlock` (a spurious wakeup, or we lost a race for
                // the readiness), so there is no live registration left to
                // wait on. Fold that back to `Unregistered` so the CAS
                // below re-arms instead of leaving the fd/handle parked
                // with nothing watching it.
                this.state
                    .reg
                    .compare_exchange(
                        RegistrationState::Registered as u8,
                        RegistrationState::Unregistered as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .ok();

                // Unregistered -> Registering: we are the first to attempt
                // to (re-)park this op. A reactor-thread completion that
                // raced in between the `try_once` call above and this
                // compare-exchange will observe `Registering` and still
                // complete us below via `arm`'s own readiness callback, so
                // no wakeup is lost.
                let prev = this
                    .state
                    .reg
                    .compare_exchange(
                        RegistrationState::Unregistered as u8,
                        RegistrationState::Registering as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .unwrap_or_else(|actual| actual);

                if RegistrationState::from(prev) == RegistrationState::Unregistered {
                    trace!("op: registering for readiness");
                    if let Err(err) = this.register.arm(cx.waker().clone()) {
                        this.state
                            .reg
                            .store(RegistrationState::Unregistered as u8, Ordering::SeqCst);
                        return Poll::Ready(Err(err));
                    }
                    this.state
                        .reg
                        .store(RegistrationState::Registered as u8, Ordering::SeqCst);
                }

                if this.state.cancelled.load(Ordering::SeqCst) {
                    return Poll::Ready(Err(Error::cancelled()));
                }

                Poll::Pending
            }
        }
    }
}

impl<'a, F, Reg, T> Drop for Op<'a, F, Reg, T>
where
    F: FnMut() -> Attempt<T>,
{
    fn drop(&mut self) {
        if let Some(slot) = self.slot {
            slot.clear();
        }
        if RegistrationState::from(self.state.reg.load(Ordering::SeqCst))
            != RegistrationState::Unregistered
        {
            self.register.disarm();
        }
    }
}

/// A no-op [`Register`] for operations that always complete synchronously
/// (e.g. a `connect` fast path on a non-blocking socket that happened to
/// finish immediately) and never need to park.
pub struct NeverRegister;

impl Register for NeverRegister {
    fn arm(&mut self, _waker: Waker) -> Result<(), Error> {
        Err(Error::system(std::io::Error::from(std::io::ErrorKind::WouldBlock)))
    }
}
