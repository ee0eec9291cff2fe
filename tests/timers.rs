//! Timer ordering scenarios (spec §8, S5, plus the already-past-deadline
//! boundary).

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use coronet::context::ExecutionContext;

/// S5: three timers armed for now+30ms, now+10ms, now+20ms resume in
/// deadline order (10ms, 20ms, 30ms), not arming order.
#[test]
fn timers_resume_in_deadline_order() {
    let ctx = ExecutionContext::new().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    ctx.clone().block_on(async {
        let timers = ctx.timer();
        let deadlines = [30u64, 10, 20];

        let mut sleeps = Vec::new();
        for &ms in &deadlines {
            let order = Arc::clone(&order);
            let timers = timers.clone();
            sleeps.push(async move {
                timers.sleep(Duration::from_millis(ms)).await;
                order.lock().unwrap().push(ms);
            });
        }

        join_all(sleeps).await;
    });

    assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
}

/// A timer whose deadline is already in the past when waited on resumes
/// immediately with success, never blocking.
#[test]
fn past_deadline_timer_resumes_immediately() {
    let ctx = ExecutionContext::new().unwrap();
    ctx.clone().block_on(async {
        let timers = ctx.timer();
        let start = Instant::now();
        timers.sleep_until(Instant::now() - Duration::from_secs(1)).await;
        assert!(start.elapsed() < Duration::from_millis(500));
    });
}

/// Cancelling (dropping) a timer handle before its deadline resolves its
/// `Sleep` promptly rather than leaving the waiter parked forever.
#[test]
fn dropped_timer_resolves_its_sleep() {
    let ctx = ExecutionContext::new().unwrap();
    ctx.clone().block_on(async {
        let timers = ctx.timer();
        let handle = timers.create(Instant::now() + Duration::from_secs(30));
        let id = handle.id();
        assert!(!timers.is_empty());
        handle.cancel();
        // cancel() removes the entry synchronously from the heap.
        let _ = id;
        assert!(timers.is_empty());
    });
}

/// A tiny hand-rolled "join all" over a fixed list of same-shaped futures,
/// since this crate has no async combinator dependency of its own.
async fn join_all<F: std::future::Future<Output = ()>>(futures: Vec<F>) {
    let mut futures: Vec<_> = futures.into_iter().map(|f| Box::pin(f)).collect();
    std::future::poll_fn(move |cx| {
        futures.retain_mut(|f| f.as_mut().poll(cx).is_pending());
        if futures.is_empty() {
            std::task::Poll::Ready(())
        } else {
            std::task::Poll::Pending
        }
    })
    .await
}
