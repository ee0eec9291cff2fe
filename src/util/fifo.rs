//! Mutex-guarded FIFO queue (spec component B, the non-intrusive half).
//!
//! The scheduler's handler queue is the one place spec §5 explicitly calls
//! for a single mutex rather than anything lock-free ("the scheduler's
//! handler queue ... is protected by a single mutex"), so this is a plain
//! `Mutex<VecDeque<T>>`, not the intrusive list above.

use std::collections::VecDeque;
use std::sync::Mutex;

pub struct Fifo<T> {
    queue: Mutex<VecDeque<T>>,
}

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Fifo::new()
    }
}

impl<T> Fifo<T> {
    pub fn new() -> Fifo<T> {
        Fifo {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, value: T) {
        self.queue.lock().unwrap().push_back(value);
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains every queued value, calling `f` on each. Used during shutdown
    /// to run the `destroy` path instead of the normal invoke path.
    pub fn drain(&self, mut f: impl FnMut(T)) {
        let mut drained = Vec::new();
        std::mem::swap(&mut drained, &mut *self.queue.lock().unwrap());
        for value in drained {
            f(value);
        }
    }
}
