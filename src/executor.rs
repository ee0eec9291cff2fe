//! The executor seam: a boxed handler plus the `Waker` bridge that lets a
//! parked [`crate::op::Op`] get itself re-polled by posting back onto the
//! scheduler's queue.
//!
//! Grounded on `scheduler.hpp`'s `post`/`dispatch` pair: `post` always
//! queues for later, `dispatch` runs inline when already executing on a
//! scheduler thread and queues otherwise. Every handler is an owned
//! closure, same as the original's `std::function<void()>`-erased
//! completion handlers.

use std::sync::Arc;

/// A unit of work queued on a [`crate::scheduler::Scheduler`].
pub type Handler = Box<dyn FnOnce() + Send>;

/// Implemented by anything that can accept posted work: the scheduler
/// itself, and small per-service adapters that need to hand work back to
/// it without holding a direct `&Scheduler`.
pub trait Executor: Send + Sync {
    /// Queues `handler` to run later, never inline.
    fn post(&self, handler: Handler);

    /// Runs `handler` inline if already executing on one of this
    /// executor's own threads, otherwise behaves like `post`.
    fn dispatch(&self, handler: Handler) {
        self.post(handler);
    }
}

impl Executor for Arc<dyn Executor> {
    fn post(&self, handler: Handler) {
        (**self).post(handler)
    }

    fn dispatch(&self, handler: Handler) {
        (**self).dispatch(handler)
    }
}
