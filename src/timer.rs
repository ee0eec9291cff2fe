//! The timer service (spec component F).
//!
//! Grounded on `src/detail/timer_service.hpp`: a service keyed off
//! `Instant` (the original's `steady_clock`) that can create a timer,
//! reschedule it to an arbitrary new deadline, cancel it, and report its
//! nearest expiry to the scheduler so `calculate_timeout` never sleeps past
//! it. Repositioning an arbitrary live timer is the operation a plain
//! `std::collections::BinaryHeap` cannot do (no decrease-key, no arbitrary
//! removal), so this keeps its own binary heap with each entry tracking its
//! current index for O(log n) reposition/removal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::Waker;
use std::time::{Duration, Instant};

use log::trace;

use crate::scheduler::{Scheduler, TimeoutSource};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct TimerId(u64);

struct Entry {
    id: TimerId,
    deadline: Instant,
    waker: Option<Waker>,
}

struct Heap {
    entries: Vec<Entry>,
    /// Maps a `TimerId` to its current index in `entries`, so an arbitrary
    /// timer can be repositioned or removed without a linear scan.
    index_of: std::collections::HashMap<TimerId, usize>,
}

impl Heap {
    fn new() -> Heap {
        Heap {
            entries: Vec::new(),
            index_of: std::collections::HashMap::new(),
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.index_of.insert(self.entries[a].id, a);
        self.index_of.insert(self.entries[b].id, b);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.entries[parent].deadline <= self.entries[i].deadline {
                break;
            }
            self.swap(parent, i);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut smallest = i;
            if left < self.entries.len() && self.entries[left].deadline < self.entries[smallest].deadline {
                smallest = left;
            }
            if right < self.entries.len() && self.entries[right].deadline < self.entries[smallest].deadline {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }

    fn push(&mut self, entry: Entry) {
        let id = entry.id;
        self.entries.push(entry);
        let i = self.entries.len() - 1;
        self.index_of.insert(id, i);
        self.sift_up(i);
    }

    fn remove(&mut self, id: TimerId) -> Option<Entry> {
        let i = *self.index_of.get(&id)?;
        self.index_of.remove(&id);
        let last = self.entries.len() - 1;
        self.entries.swap(i, last);
        let removed = self.entries.pop().unwrap();
        if i < self.entries.len() {
            self.index_of.insert(self.entries[i].id, i);
            self.sift_down(i);
            self.sift_up(i);
        }
        Some(removed)
    }

    fn peek_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.deadline)
    }

    fn pop_expired(&mut self, now: Instant, out: &mut Vec<Entry>) {
        while let Some(top) = self.entries.first() {
            if top.deadline > now {
                break;
            }
            let id = top.id;
            if let Some(entry) = self.remove(id) {
                out.push(entry);
            }
        }
    }
}

/// A handle to a single scheduled timer. Dropping it cancels the timer if
/// it has not already fired.
pub struct Timer {
    id: TimerId,
    service: TimerService,
}

impl Timer {
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Reschedules this timer to a new deadline, whether pending, already
    /// fired, or cancelled.
    pub fn reset_at(&self, deadline: Instant) {
        self.service.reschedule(self.id, deadline);
    }

    pub fn reset_after(&self, delay: Duration) {
        self.reset_at(Instant::now() + delay);
    }

    pub fn cancel(&self) {
        self.service.cancel(self.id);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.service.cancel(self.id);
    }
}

/// A future that resolves once its timer's deadline passes or it is
/// cancelled (in which case it resolves immediately, never blocking
/// forever on a cancelled wait).
pub struct Sleep {
    timer: Arc<Timer>,
}

impl std::future::Future for Sleep {
    type Output = ();

    fn poll(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<()> {
        self.timer.service.poll_timer(self.timer.id, cx.waker())
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        // Balances the `work_started` taken out when this `Sleep` was
        // created (see `sleep_until`), regardless of whether it resolved,
        // was cancelled, or was simply dropped unpolled.
        self.timer.service.inner.scheduler.work_finished();
    }
}

struct Inner {
    heap: Mutex<Heap>,
    next_id: AtomicU64,
    scheduler: Scheduler,
}

/// The timer service: one per [`crate::context::ExecutionContext`].
#[derive(Clone)]
pub struct TimerService {
    inner: Arc<Inner>,
}

impl TimerService {
    pub fn new(scheduler: &Scheduler) -> TimerService {
        let service = TimerService {
            inner: Arc::new(Inner {
                heap: Mutex::new(Heap::new()),
                next_id: AtomicU64::new(1),
                scheduler: scheduler.clone(),
            }),
        };
        scheduler.register_timeout_source(Arc::new(service.clone()));
        service
    }

    /// Schedules a new timer for `deadline`, returning a handle whose
    /// [`Sleep`] future (see [`TimerService::sleep_until`]) completes once
    /// the deadline passes or the handle is dropped/cancelled.
    pub fn create(&self, deadline: Instant) -> Arc<Timer> {
        let id = TimerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.heap.lock().unwrap().push(Entry {
            id,
            deadline,
            waker: None,
        });
        trace!("timer {id:?}: created for {deadline:?}");
        Arc::new(Timer {
            id,
            service: self.clone(),
        })
    }

    pub fn sleep_until(&self, deadline: Instant) -> Sleep {
        // Pins `run`/`run_one` open until this wait resolves or is dropped;
        // see `Sleep`'s `Drop` for the matching `work_finished`.
        self.inner.scheduler.work_started();
        Sleep {
            timer: self.create(deadline),
        }
    }

    pub fn sleep(&self, delay: Duration) -> Sleep {
        self.sleep_until(Instant::now() + delay)
    }

    fn reschedule(&self, id: TimerId, deadline: Instant) {
        let mut heap = self.inner.heap.lock().unwrap();
        if let Some(mut entry) = heap.remove(id) {
            entry.deadline = deadline;
            let waker = entry.waker.take();
            heap.push(entry);
            drop(heap);
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }

    fn cancel(&self, id: TimerId) {
        let mut heap = self.inner.heap.lock().unwrap();
        if let Some(mut entry) = heap.remove(id) {
            trace!("timer {id:?}: cancelled");
            let waker = entry.waker.take();
            drop(heap);
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }

    fn poll_timer(&self, id: TimerId, waker: &Waker) -> std::task::Poll<()> {
        let mut heap = self.inner.heap.lock().unwrap();
        // Already fired (and removed by `process_expired`) or cancelled:
        // either way there's nothing left to wait for.
        match heap.index_of.get(&id) {
            Some(&i) => {
                heap.entries[i].waker = Some(waker.clone());
                std::task::Poll::Pending
            }
            None => std::task::Poll::Ready(()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.heap.lock().unwrap().entries.is_empty()
    }
}

impl TimeoutSource for TimerService {
    fn nearest_expiry(&self) -> Option<Duration> {
        let heap = self.inner.heap.lock().unwrap();
        heap.peek_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn process_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut heap = self.inner.heap.lock().unwrap();
            heap.pop_expired(now, &mut expired);
        }
        let mut woke = 0;
        for mut entry in expired {
            if let Some(waker) = entry.waker.take() {
                waker.wake();
                woke += 1;
            }
        }
        woke
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TimerService {
        let scheduler = Scheduler::new().unwrap();
        TimerService::new(&scheduler)
    }

    #[test]
    fn nearest_expiry_tracks_the_earliest_timer() {
        let svc = service();
        let far = svc.create(Instant::now() + Duration::from_secs(10));
        let near = svc.create(Instant::now() + Duration::from_millis(1));
        assert!(svc.nearest_expiry().unwrap() <= Duration::from_millis(1));
        near.cancel();
        assert!(svc.nearest_expiry().unwrap() > Duration::from_secs(1));
        far.cancel();
    }

    #[test]
    fn reschedule_moves_an_arbitrary_live_timer() {
        let svc = service();
        let t = svc.create(Instant::now() + Duration::from_secs(1));
        t.reset_after(Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        svc.process_expired();
        assert!(svc.is_empty());
    }
}
