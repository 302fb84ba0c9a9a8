use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

/// A reusable N-way rendezvous that spins by default and falls back to a
/// condition variable when asked to yield.
///
/// At audio rate the step kernel passes through two of these tens of
/// thousands of times per second; parking on a condvar at every rendezvous
/// would dominate the cost of a step. Spinning trades CPU for microsecond
/// wakeups. Setting the yield flag (from any thread, at any time) converts
/// the next rendezvous into a blocking one so the OS can schedule other work
/// while the engine is idle.
///
/// The step kernel alternates between two barriers so a fast thread that
/// finished phase k+1 cannot wrap around into a rendezvous another thread is
/// still leaving in phase k. `set_total` must only be called while no thread
/// is inside `wait`.
pub(crate) struct HybridBarrier {
    count: AtomicUsize,
    total: AtomicUsize,
    yield_requested: AtomicBool,
    mutex: Mutex<()>,
    cv: Condvar,
}

impl HybridBarrier {
    pub fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            total: AtomicUsize::new(1),
            yield_requested: AtomicBool::new(false),
            mutex: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
    }

    /// Makes the next rendezvous park its waiters on the condvar instead of
    /// spinning. Consumed (and cleared) by the rendezvous that observes it.
    pub fn request_yield(&self) {
        self.yield_requested.store(true, Ordering::SeqCst);
    }

    pub fn wait(&self) {
        let total = self.total.load(Ordering::SeqCst);
        if total <= 1 {
            return;
        }

        let id = self.count.fetch_add(1, Ordering::SeqCst) + 1;

        // The last thread to arrive ends the phase.
        if id == total {
            self.count.store(0, Ordering::SeqCst);
            if self.yield_requested.load(Ordering::SeqCst) {
                let _guard = self.mutex.lock().unwrap();
                self.cv.notify_all();
                self.yield_requested.store(false, Ordering::SeqCst);
            }
            return;
        }

        // Spin until the phase ends, unless asked to yield.
        while !self.yield_requested.load(Ordering::SeqCst) {
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            std::hint::spin_loop();
        }

        // Wait on the condvar. The predicate re-check covers both spurious
        // wakeups and a phase that ended between the spin loop and here.
        let mut guard = self.mutex.lock().unwrap();
        while self.count.load(Ordering::SeqCst) != 0 {
            guard = self.cv.wait(guard).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn single_party_wait_is_noop() {
        let barrier = HybridBarrier::new();
        barrier.wait();
        barrier.wait();
    }

    #[test]
    fn phases_stay_in_lockstep() {
        const THREADS: usize = 4;
        const PHASES: usize = 2000;

        let a = Arc::new(HybridBarrier::new());
        let b = Arc::new(HybridBarrier::new());
        a.set_total(THREADS);
        b.set_total(THREADS);
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..THREADS {
            let a = Arc::clone(&a);
            let b = Arc::clone(&b);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for phase in 0..PHASES {
                    a.wait();
                    // All of the previous phase's increments must be visible,
                    // and none of the next phase's can have started.
                    let seen = counter.load(Ordering::SeqCst);
                    assert!(seen >= phase * THREADS, "phase skew: behind");
                    assert!(seen < (phase + 1) * THREADS, "phase skew: ahead");
                    counter.fetch_add(1, Ordering::SeqCst);
                    b.wait();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), THREADS * PHASES);
    }

    #[test]
    fn yield_parks_and_releases_waiters() {
        const THREADS: usize = 4;

        let barrier = Arc::new(HybridBarrier::new());
        barrier.set_total(THREADS);
        barrier.request_yield();

        let mut handles = Vec::new();
        for _ in 0..THREADS - 1 {
            let barrier = Arc::clone(&barrier);
            handles.push(std::thread::spawn(move || barrier.wait()));
        }

        // Waiters should be parked on the condvar by now, not returning.
        std::thread::sleep(Duration::from_millis(50));
        for handle in &handles {
            assert!(!handle.is_finished());
        }

        // The last arrival releases everyone and consumes the yield flag.
        barrier.wait();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(!barrier.yield_requested.load(Ordering::SeqCst));
    }
}
