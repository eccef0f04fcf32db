//! Counting-semaphore throttle for worker fan-out.
//!
//! Bounds how many chunker or reducer tasks run at once; `wait_all` is the
//! phase-end barrier.

use parking_lot::{Condvar, Mutex};

pub struct Throttle {
    max: usize,
    active: Mutex<usize>,
    cond: Condvar,
}

impl Throttle {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            active: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Block until a slot is free, then take it.
    pub fn acquire(&self) {
        let mut active = self.active.lock();
        while *active >= self.max {
            self.cond.wait(&mut active);
        }
        *active += 1;
    }

    /// Return a slot.
    pub fn release(&self) {
        let mut active = self.active.lock();
        *active -= 1;
        self.cond.notify_all();
    }

    /// Block until every slot has been returned.
    pub fn wait_all(&self) {
        let mut active = self.active.lock();
        while *active > 0 {
            self.cond.wait(&mut active);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_bounds_concurrency() {
        let throttle = Arc::new(Throttle::new(3));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let throttle = Arc::clone(&throttle);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(std::thread::spawn(move || {
                throttle.acquire();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
                throttle.release();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        throttle.wait_all();
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }
}
