//! The signal service (spec component F): a [`SignalSet`] holds a dynamic
//! set of signal numbers and resolves its `wait` the next time any member
//! signal is delivered to the process.
//!
//! Grounded on `src/detail/posix/signals.hpp`'s `posix_signals`: process
//! signal delivery is inherently a single, process-wide resource no matter
//! how many [`crate::context::ExecutionContext`]s an application creates,
//! so the installed handler and the table of interested subscribers are
//! kept in one process-global, mutex-guarded registry rather than being
//! duplicated per context. `sigaction` is installed the moment the first
//! member for a given signal number appears across every live set and
//! restored to the default disposition the moment the last one goes away,
//! mirroring the original's install-on-first/restore-on-last bookkeeping.
//!
//! # Signal-safety caveat
//!
//! The installed handler itself only does the one thing it's safe to do
//! from a signal handler: bump an atomic. Everything else (waking futures)
//! happens later, off a poller thread or the scheduler. Carried over from
//! the original: this service is **not** signal-safe beyond that one
//! store — do not assume anything else about handler reentrancy.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll, Waker};

use log::debug;

use crate::error::Error;
use crate::scheduler::Scheduler;

/// The highest signal number this service will subscribe to, matching the
/// original's `max_signal_number = 64` (enough to cover every POSIX
/// real-time signal plus the standard ones).
pub const MAX_SIGNAL_NUMBER: i32 = 64;

bitflags::bitflags! {
    /// Mirrors the `sigaction` flag bits `signals.hpp` exposes per
    /// subscription, plus the semantic `DONT_CARE` opt-out described below.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SignalFlags: u32 {
        /// `SA_RESTART`: restart an interrupted syscall rather than failing
        /// it with `EINTR`.
        const RESTART = 0b00001;
        /// `SA_NOCLDSTOP`: don't generate `SIGCHLD` when a child stops.
        const NO_CHILD_STOP = 0b00010;
        /// `SA_NOCLDWAIT`: don't turn children into zombies on exit.
        const NO_CHILD_WAIT = 0b00100;
        /// `SA_NODEFER`: don't block this signal number while its own
        /// handler is running.
        const NO_DEFER = 0b01000;
        /// `SA_RESETHAND`: reset the disposition to default after the
        /// first delivery.
        const RESET_HANDLER = 0b10000;
        /// Not an OS flag: opts a subscription out of the "every
        /// subscriber to a signal number must request identical flags"
        /// check (see [`SignalSet::add`]), for callers that only care
        /// about being woken and have no opinion on the underlying
        /// `sigaction` disposition.
        const DONT_CARE = 0b100000;
    }
}

impl SignalFlags {
    /// Flags outside what this platform's backend can actually honor
    /// return not-supported at `add` time rather than being silently
    /// dropped.
    fn check_supported(self) -> Result<(), Error> {
        if !(self - backend::supported_flags()).is_empty() {
            return Err(Error::not_supported(
                "signal: flag not supported on this platform",
            ));
        }
        Ok(())
    }
}

struct SignalEntry {
    installed_flags: Option<SignalFlags>,
    members: Vec<Arc<Inner>>,
}

impl SignalEntry {
    const fn new() -> SignalEntry {
        SignalEntry {
            installed_flags: None,
            members: Vec::new(),
        }
    }
}

struct GlobalState {
    entries: Vec<SignalEntry>,
    scheduler: Option<Scheduler>,
}

static GLOBAL: OnceLock<Mutex<GlobalState>> = OnceLock::new();

fn global() -> &'static Mutex<GlobalState> {
    GLOBAL.get_or_init(|| {
        Mutex::new(GlobalState {
            entries: (0..=MAX_SIGNAL_NUMBER).map(|_| SignalEntry::new()).collect(),
            scheduler: None,
        })
    })
}

/// Shared state for one [`SignalSet`], kept in an `Arc` so the global
/// registry and every in-flight [`Wait`] can reference it without the
/// `SignalSet` itself needing to stay pinned anywhere.
struct Inner {
    scheduler: Scheduler,
    members: Mutex<Vec<i32>>,
    /// Count of deliveries not yet observed by a `wait()` poll. Spec's
    /// "undelivered-count" fallback: if nothing is awaiting `wait` when a
    /// member signal fires, this is what lets the next `wait()` call
    /// resolve immediately instead of blocking.
    pending: AtomicUsize,
    waker: Mutex<Option<Waker>>,
    cancelled: AtomicBool,
}

/// A dynamic set of signal numbers. `wait()` resumes the next time any
/// member is delivered to the process; `add`/`remove`/`clear` mutate
/// membership; `cancel` aborts whatever `wait()` call is currently
/// outstanding.
pub struct SignalSet {
    inner: Arc<Inner>,
}

impl SignalSet {
    fn new(scheduler: &Scheduler) -> SignalSet {
        SignalSet {
            inner: Arc::new(Inner {
                scheduler: scheduler.clone(),
                members: Mutex::new(Vec::new()),
                pending: AtomicUsize::new(0),
                waker: Mutex::new(None),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    /// Adds `signo` to this set, installing the process handler for it if
    /// no other member across any live set currently has one registered.
    ///
    /// Returns [`Error::not_supported`] if `flags` requests something this
    /// platform's backend can't honor, and [`Error::invalid_argument`] if
    /// another set is already subscribed to `signo` with different flags
    /// and neither side passed [`SignalFlags::DONT_CARE`].
    pub fn add(&self, signo: i32, flags: SignalFlags) -> Result<(), Error> {
        flags.check_supported()?;
        if !(0..=MAX_SIGNAL_NUMBER).contains(&signo) {
            return Err(Error::invalid_argument("signal: number out of range"));
        }

        let mut members = self.inner.members.lock().unwrap();
        if members.contains(&signo) {
            return Ok(());
        }
        register_member(signo, flags, &self.inner)?;
        members.push(signo);
        Ok(())
    }

    /// Removes `signo` from this set, if present. Uninstalls the process
    /// handler if this was the last member of that signal number across
    /// every live set.
    pub fn remove(&self, signo: i32) {
        let mut members = self.inner.members.lock().unwrap();
        if let Some(pos) = members.iter().position(|&s| s == signo) {
            members.remove(pos);
            drop(members);
            unregister_member(signo, &self.inner);
        }
    }

    /// Removes every member signal number from this set.
    pub fn clear(&self) {
        let members = std::mem::take(&mut *self.inner.members.lock().unwrap());
        for signo in members {
            unregister_member(signo, &self.inner);
        }
    }

    /// Returns a future that resolves once any member signal has been
    /// delivered since the last `wait`, or immediately if one fired while
    /// nothing was waiting.
    pub fn wait(&self) -> Wait {
        // Starting a fresh wait discards any earlier, already-consumed
        // cancellation so a stale `cancel()` can't fail a later call that
        // was never actually outstanding when it was requested.
        self.inner.cancelled.store(false, Ordering::SeqCst);
        Wait {
            inner: Arc::clone(&self.inner),
            guard: None,
        }
    }

    /// Aborts the currently outstanding `wait()`, if any, resuming it with
    /// [`Error::cancelled`].
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        if let Some(waker) = self.inner.waker.lock().unwrap().take() {
            waker.wake();
        }
    }
}

impl Drop for SignalSet {
    fn drop(&mut self) {
        self.clear();
    }
}

struct WorkGuard(Scheduler);

impl WorkGuard {
    fn start(scheduler: &Scheduler) -> WorkGuard {
        scheduler.work_started();
        WorkGuard(scheduler.clone())
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.0.work_finished();
    }
}

/// The future returned by [`SignalSet::wait`].
pub struct Wait {
    inner: Arc<Inner>,
    guard: Option<WorkGuard>,
}

impl Future for Wait {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.guard.is_none() {
            this.guard = Some(WorkGuard::start(&this.inner.scheduler));
        }

        if this.inner.cancelled.swap(false, Ordering::SeqCst) {
            this.guard = None;
            return Poll::Ready(Err(Error::cancelled()));
        }

        if this.inner.pending.swap(0, Ordering::SeqCst) > 0 {
            this.guard = None;
            return Poll::Ready(Ok(()));
        }

        *this.inner.waker.lock().unwrap() = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// The signal service: one per [`crate::context::ExecutionContext`], a thin
/// factory for [`SignalSet`]s, though the underlying OS-level registration
/// it drives is process-global.
#[derive(Clone)]
pub struct SignalService {
    scheduler: Scheduler,
}

impl SignalService {
    pub fn new(scheduler: &Scheduler) -> SignalService {
        global().lock().unwrap().scheduler = Some(scheduler.clone());
        static POLLER_STARTED: std::sync::Once = std::sync::Once::new();
        POLLER_STARTED.call_once(backend::spawn_poller);
        SignalService {
            scheduler: scheduler.clone(),
        }
    }

    /// Creates a new, empty [`SignalSet`] bound to this context's
    /// scheduler. Add member signal numbers with [`SignalSet::add`].
    pub fn new_set(&self) -> SignalSet {
        SignalSet::new(&self.scheduler)
    }
}

fn register_member(signo: i32, flags: SignalFlags, inner: &Arc<Inner>) -> Result<(), Error> {
    let mut state = global().lock().unwrap();
    let entry = &mut state.entries[signo as usize];
    match entry.installed_flags {
        Some(existing) => {
            let either_dont_care =
                flags.contains(SignalFlags::DONT_CARE) || existing.contains(SignalFlags::DONT_CARE);
            if !either_dont_care && existing != flags {
                return Err(Error::invalid_argument(
                    "signal: incompatible flags for a signal number already subscribed",
                ));
            }
        }
        None => {
            debug!("signal: installing handler for signo={signo}");
            install(signo, flags)?;
            entry.installed_flags = Some(flags);
        }
    }
    entry.members.push(Arc::clone(inner));
    Ok(())
}

fn unregister_member(signo: i32, inner: &Arc<Inner>) {
    let mut state = global().lock().unwrap();
    let entry = &mut state.entries[signo as usize];
    entry.members.retain(|m| !Arc::ptr_eq(m, inner));
    if entry.members.is_empty() && entry.installed_flags.is_some() {
        debug!("signal: uninstalling handler for signo={signo}, last subscriber gone");
        uninstall(signo);
        entry.installed_flags = None;
    }
}

/// Called from the OS-level handler (a real `sigaction` handler on Unix, a
/// `SetConsoleCtrlHandler` callback on Windows) once it's safe to do real
/// work — i.e. from a poller thread, not from handler context directly.
fn deliver(signo: i32) {
    let (scheduler, members) = {
        let state = global().lock().unwrap();
        (
            state.scheduler.clone(),
            state.entries[signo as usize].members.clone(),
        )
    };

    for inner in members {
        inner.pending.fetch_add(1, Ordering::SeqCst);
        if let Some(waker) = inner.waker.lock().unwrap().take() {
            if let Some(ref scheduler) = scheduler {
                scheduler.post(Box::new(move || waker.wake()));
            } else {
                waker.wake();
            }
        }
    }
}

#[cfg(unix)]
mod backend {
    use super::{deliver, SignalFlags};
    use crate::error::Error;
    use std::sync::atomic::{AtomicBool, Ordering};

    static PENDING: [AtomicBool; super::MAX_SIGNAL_NUMBER as usize + 1] =
        [const { AtomicBool::new(false) }; super::MAX_SIGNAL_NUMBER as usize + 1];

    extern "C" fn handler(signo: libc::c_int) {
        // Signal-safe: only ever touches a lock-free atomic.
        PENDING[signo as usize].store(true, Ordering::SeqCst);
    }

    /// `sigaction` honors every flag in [`SignalFlags`] on Unix.
    pub fn supported_flags() -> SignalFlags {
        SignalFlags::all()
    }

    pub fn install(signo: i32, flags: SignalFlags) -> Result<(), Error> {
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = handler as usize;
            libc::sigemptyset(&mut sa.sa_mask);

            let mut sa_flags = 0;
            if flags.contains(SignalFlags::RESTART) {
                sa_flags |= libc::SA_RESTART;
            }
            if flags.contains(SignalFlags::NO_CHILD_STOP) {
                sa_flags |= libc::SA_NOCLDSTOP;
            }
            if flags.contains(SignalFlags::NO_CHILD_WAIT) {
                sa_flags |= libc::SA_NOCLDWAIT;
            }
            if flags.contains(SignalFlags::NO_DEFER) {
                sa_flags |= libc::SA_NODEFER;
            }
            if flags.contains(SignalFlags::RESET_HANDLER) {
                sa_flags |= libc::SA_RESETHAND;
            }
            sa.sa_flags = sa_flags;

            if libc::sigaction(signo, &sa, std::ptr::null_mut()) != 0 {
                return Err(Error::system(std::io::Error::last_os_error()));
            }
        }
        Ok(())
    }

    pub fn uninstall(signo: i32) {
        use log::warn;
        unsafe {
            if libc::signal(signo, libc::SIG_DFL) == libc::SIG_ERR {
                warn!(
                    "signal: failed to restore default disposition for signo={}: {}",
                    signo,
                    std::io::Error::last_os_error()
                );
            }
        }
    }

    /// A background thread polling `PENDING` and calling back into
    /// [`deliver`]. There is no portable async-signal-safe way to hand a
    /// completion directly to the scheduler from inside the handler, so a
    /// lightweight poller bridges the gap — the same role the original's
    /// self-pipe-plus-`epoll` bridge plays, simplified since this crate's
    /// `select`/`posix` backend may not always have an fd-based wakeup
    /// path available for this purpose.
    pub fn spawn_poller() {
        std::thread::spawn(|| loop {
            for signo in 0..=super::MAX_SIGNAL_NUMBER {
                if PENDING[signo as usize].swap(false, Ordering::SeqCst) {
                    deliver(signo);
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        });
    }
}

#[cfg(windows)]
mod backend {
    use super::{deliver, SignalFlags};
    use crate::error::Error;
    use std::sync::Once;
    use winapi::um::consoleapi::SetConsoleCtrlHandler;

    static INSTALL_ONCE: Once = Once::new();

    unsafe extern "system" fn handler(ctrl_type: u32) -> i32 {
        deliver(ctrl_type as i32);
        1
    }

    /// `SetConsoleCtrlHandler` has no flags concept at all; only the
    /// semantic, non-OS `DONT_CARE` opt-out is honored here.
    pub fn supported_flags() -> SignalFlags {
        SignalFlags::DONT_CARE
    }

    pub fn install(_signo: i32, _flags: SignalFlags) -> Result<(), Error> {
        INSTALL_ONCE.call_once(|| unsafe {
            SetConsoleCtrlHandler(Some(handler), 1);
        });
        Ok(())
    }

    pub fn uninstall(_signo: i32) {
        // Windows has no per-event unregistration API; the shared handler
        // stays installed but simply finds no subscribers left for any
        // event once the last one unsubscribes.
    }

    /// No separate poller thread is needed: `SetConsoleCtrlHandler`
    /// invokes `handler` on its own dedicated OS thread already.
    pub fn spawn_poller() {}
}

use backend::{install, uninstall};

/// Known console-control / signal numbers usable with [`SignalSet::add`],
/// named the way `signals.hpp`'s cross-platform table does: a Unix signal
/// number where one exists, a Windows `CTRL_*_EVENT` constant otherwise.
pub mod kind {
    #[cfg(unix)]
    pub const INTERRUPT: i32 = libc::SIGINT;
    #[cfg(unix)]
    pub const TERMINATE: i32 = libc::SIGTERM;
    #[cfg(unix)]
    pub const HANGUP: i32 = libc::SIGHUP;

    #[cfg(windows)]
    pub const INTERRUPT: i32 = winapi::um::wincon::CTRL_C_EVENT as i32;
    #[cfg(windows)]
    pub const TERMINATE: i32 = winapi::um::wincon::CTRL_SHUTDOWN_EVENT as i32;
    #[cfg(windows)]
    pub const HANGUP: i32 = winapi::um::wincon::CTRL_CLOSE_EVENT as i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incompatible_flags_on_same_signal_are_rejected() {
        // Two sets racing to claim SIGUSR1-equivalent territory with
        // different, non-DONT_CARE flags must not both win.
        #[cfg(unix)]
        let signo = libc::SIGUSR1;
        #[cfg(not(unix))]
        let signo = kind::INTERRUPT;

        let scheduler = Scheduler::new().unwrap();
        let a = SignalSet::new(&scheduler);
        let b = SignalSet::new(&scheduler);

        a.add(signo, SignalFlags::RESTART).unwrap();
        let err = b.add(signo, SignalFlags::NO_DEFER).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);

        // DONT_CARE on either side bypasses the compatibility check.
        b.add(signo, SignalFlags::NO_DEFER | SignalFlags::DONT_CARE)
            .unwrap();
    }

    #[test]
    fn out_of_range_signal_number_is_rejected() {
        let scheduler = Scheduler::new().unwrap();
        let set = SignalSet::new(&scheduler);
        let err = set.add(MAX_SIGNAL_NUMBER + 1, SignalFlags::empty()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }
}
