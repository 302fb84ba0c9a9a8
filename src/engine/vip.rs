use std::sync::{Condvar, Mutex};

/// A non-exclusive priority gate.
///
/// Any number of threads may hold a [`VipGuard`] at once; [`wait`](VipMutex::wait)
/// blocks while at least one guard is alive. This provides no mutual
/// exclusion on its own; the engine pairs it with the control mutex. The
/// engine loop calls `wait` at the top of every iteration, so a caller that
/// takes a guard before queueing on the control mutex is guaranteed the loop
/// parks outside its critical section rather than starting another batch
/// ahead of the caller.
pub(crate) struct VipMutex {
    count: Mutex<usize>,
    cv: Condvar,
}

impl VipMutex {
    pub fn new() -> Self {
        Self { count: Mutex::new(0), cv: Condvar::new() }
    }

    /// Registers the calling thread as a priority holder until the returned
    /// guard is dropped.
    pub fn lock(&self) -> VipGuard<'_> {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        VipGuard { vip: self }
    }

    /// Blocks until no priority holders remain.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.cv.wait(count).unwrap();
        }
    }
}

pub(crate) struct VipGuard<'a> {
    vip: &'a VipMutex,
}

impl Drop for VipGuard<'_> {
    fn drop(&mut self) {
        let mut count = self.vip.count.lock().unwrap();
        *count -= 1;
        drop(count);
        self.vip.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn wait_passes_when_no_holders() {
        let vip = VipMutex::new();
        vip.wait();
    }

    #[test]
    fn wait_blocks_until_guard_drops() {
        let vip = Arc::new(VipMutex::new());

        let vip2 = Arc::clone(&vip);
        let hold = Duration::from_millis(100);
        let holder = std::thread::spawn(move || {
            let _guard = vip2.lock();
            std::thread::sleep(hold);
        });

        // Give the holder time to take the guard before we wait on it.
        std::thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        vip.wait();
        assert!(start.elapsed() >= Duration::from_millis(50));

        holder.join().unwrap();
    }

    #[test]
    fn nested_holders_all_block_wait() {
        let vip = VipMutex::new();
        let a = vip.lock();
        let b = vip.lock();
        drop(a);

        // One holder remains; a bounded wait on a helper thread must time out.
        std::thread::scope(|s| {
            let done = s.spawn(|| vip.wait());
            std::thread::sleep(Duration::from_millis(30));
            assert!(!done.is_finished());
            drop(b);
            done.join().unwrap();
        });
    }
}
