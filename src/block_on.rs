//! Drives a single top-level [`Future`] to completion on the calling
//! thread, using [`Scheduler::run_one`] as the wait primitive.
//!
//! The original is a coroutine runtime: calling a blocking-looking
//! operation inside a coroutine suspends the coroutine and resumes it once
//! the scheduler completes the underlying asynchronous op. Rust's
//! `Future`/`Waker` model needs something to actually call `poll` again
//! after a wakeup, though, since waking a `Waker` by itself does nothing
//! but request a re-poll. `block_on` is that loop: every `Op`, `Sleep`, and
//! `Resolve`/`SignalSet` future in this crate stores whatever `Waker` was
//! passed to its last `poll`, which, threaded straight down through the
//! `.await`s an application writes, is this loop's own no-op waker. So
//! after a completion wakes it, re-polling the top-level future is enough
//! to observe the result directly; the waker itself doesn't need to do
//! anything except exist.

use std::future::Future;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::scheduler::Scheduler;

fn noop_raw_waker() -> RawWaker {
    fn clone(_: *const ()) -> RawWaker {
        noop_raw_waker()
    }
    fn no_op(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, no_op, no_op, no_op);
    RawWaker::new(std::ptr::null(), &VTABLE)
}

fn noop_waker() -> Waker {
    // Safety: the vtable's functions never dereference the data pointer.
    unsafe { Waker::from_raw(noop_raw_waker()) }
}

/// Polls `future` to completion, calling [`Scheduler::run_one`] between
/// polls whenever it returns [`Poll::Pending`]. Every future this crate
/// hands out only ever returns `Pending` after arming a reactor
/// registration, a timer, a resolver thread, or a signal subscription —
/// each of which bumps the scheduler's outstanding-work count for exactly
/// as long as it's pending — so `run_one` is guaranteed to make forward
/// progress rather than spin.
pub fn block_on<F: Future>(scheduler: &Scheduler, future: F) -> F::Output {
    let mut future = std::pin::pin!(future);
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    loop {
        if let Poll::Ready(value) = future.as_mut().poll(&mut cx) {
            return value;
        }
        if scheduler.run_one() == 0 {
            // The scheduler stopped (outstanding work hit zero, or `stop`
            // was called) while this future was still pending: nothing is
            // ever going to wake it again.
            panic!("block_on: scheduler stopped with the awaited future still pending");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn drives_a_timer_sleep_to_completion() {
        let scheduler = Scheduler::new().unwrap();
        let timer = crate::timer::TimerService::new(&scheduler);
        block_on(&scheduler, timer.sleep(Duration::from_millis(5)));
    }

    #[test]
    fn drives_an_already_ready_future_without_touching_the_scheduler() {
        let scheduler = Scheduler::new().unwrap();
        scheduler.stop();
        assert_eq!(block_on(&scheduler, async { 42 }), 42);
    }
}
