#[cfg(test)]
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Counting semaphore a parked worker sleeps on.
pub(crate) struct Semaphore {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new() -> Semaphore {
        Semaphore {
            permits: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.cv.notify_one();
    }

    pub fn wait(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cv.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Returns false if no permit arrived within `timeout`.
    #[cfg(test)]
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.cv.wait_for(&mut permits, timeout).timed_out() {
                if *permits == 0 {
                    return false;
                }
                break;
            }
        }
        *permits -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_before_wait_is_not_lost() {
        let sem = Semaphore::new();
        sem.signal();
        sem.wait();
        assert!(!sem.wait_for(Duration::from_millis(10)));
    }

    #[test]
    fn wakes_a_waiting_thread() {
        let sem = Arc::new(Semaphore::new());
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.wait_for(Duration::from_secs(5)))
        };
        sem.signal();
        assert!(waiter.join().unwrap());
    }
}
