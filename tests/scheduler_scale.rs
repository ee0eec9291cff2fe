//! Scheduler post-rate and multi-thread scaling scenarios (spec §8, S1/S2).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use coronet::executor::Executor;
use coronet::scheduler::Scheduler;

const N: usize = 1_000_000;

/// S1: post `N` handlers from a single thread, `run()` drains exactly `N`.
#[test]
fn post_rate_single_thread() {
    let scheduler = Scheduler::new().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..N {
        let counter = Arc::clone(&counter);
        scheduler.post(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    }
    let ran = scheduler.run();
    assert_eq!(ran, N);
    assert_eq!(counter.load(Ordering::SeqCst), N);
}

/// S2: the same `N` handlers, drained by `K` threads all calling `run()`
/// concurrently. Every handler runs exactly once, and the threads' returned
/// counts sum to `N`.
#[test]
fn post_rate_multi_thread() {
    for &k in &[1usize, 2, 4, 8] {
        let scheduler = Scheduler::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..N {
            let counter = Arc::clone(&counter);
            scheduler.post(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let threads: Vec<_> = (0..k)
            .map(|_| {
                let scheduler = scheduler.clone();
                std::thread::spawn(move || scheduler.run())
            })
            .collect();

        let total: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(total, N, "k={k}");
        assert_eq!(counter.load(Ordering::SeqCst), N, "k={k}");
    }
}

/// `stop()` on an idle multi-thread context causes every `run()` to return
/// promptly, even with no outstanding work to drain.
#[test]
fn stop_wakes_every_idle_runner() {
    let scheduler = Scheduler::new().unwrap();
    // Pin outstanding work open so `run()` actually blocks instead of
    // returning immediately for "nothing to do".
    scheduler.work_started();

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let scheduler = scheduler.clone();
            std::thread::spawn(move || scheduler.run())
        })
        .collect();

    // Give every thread a chance to park before stopping.
    std::thread::sleep(std::time::Duration::from_millis(50));
    scheduler.stop();

    for t in threads {
        assert_eq!(t.join().unwrap(), 0);
    }
}
