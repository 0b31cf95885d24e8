// CPU fences
//
// Signaled by the queue thread once every workgroup of a submission has
// finished. Waiters block on a condition variable.

use parking_lot::{Condvar, Mutex};
use std::time::Instant;

#[derive(Debug)]
pub struct SoftFence {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl SoftFence {
    pub fn new(signaled: bool) -> Self {
        Self {
            signaled: Mutex::new(signaled),
            cond: Condvar::new(),
        }
    }

    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    pub(crate) fn signal(&self) {
        *self.signaled.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
    }

    /// Block until signaled or `deadline` passes. Returns the signaled state.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                return *signaled;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn wait_returns_after_signal_from_another_thread() {
        let fence = Arc::new(SoftFence::new(false));
        let signaler = fence.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaler.signal();
        });
        fence.wait();
        assert!(fence.is_signaled());
        handle.join().unwrap();
    }

    #[test]
    fn wait_until_times_out_when_never_signaled() {
        let fence = SoftFence::new(false);
        let deadline = Instant::now() + Duration::from_millis(5);
        assert!(!fence.wait_until(deadline));
        fence.signal();
        assert!(fence.wait_until(Instant::now()));
        fence.reset();
        assert!(!fence.is_signaled());
    }
}
