//! A counting semaphore with a timed wait, built on a mutex + condition
//! variable rather than a platform semaphore primitive (`sem_t`). The
//! counter is a plain signed integer and is never permitted to go
//! negative.
//!
//! This type is used from both the controller thread and, via the signal
//! handler, from an arbitrarily interrupted mutator thread. It performs no
//! allocation after construction.

use std::time::{Duration, Instant};

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        use parking_lot::{Condvar, Mutex};
    } else {
        use std::sync::{Condvar, Mutex};
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Acquired,
    TimedOut,
}

pub struct Semaphore {
    count: Mutex<i64>,
    condvar: Condvar,
}

impl Semaphore {
    pub fn new(initial_count: i64) -> Self {
        Self {
            count: Mutex::new(initial_count),
            condvar: Condvar::new(),
        }
    }

    /// Increments the count and wakes one waiter. Never fails.
    pub fn signal(&self) {
        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "linux", target_os = "android"))] {
                let mut count = self.count.lock();
                *count += 1;
                self.condvar.notify_one();
            } else {
                let mut count = self.count.lock().expect("semaphore mutex poisoned");
                *count += 1;
                self.condvar.notify_one();
            }
        }
    }

    /// Blocks indefinitely until the count is positive, then decrements it.
    pub fn wait(&self) {
        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "linux", target_os = "android"))] {
                let mut count = self.count.lock();
                while *count <= 0 {
                    self.condvar.wait(&mut count);
                }
                *count -= 1;
            } else {
                let mut count = self.count.lock().expect("semaphore mutex poisoned");
                while *count <= 0 {
                    count = self.condvar.wait(count).expect("semaphore mutex poisoned");
                }
                *count -= 1;
            }
        }
    }

    /// Blocks until the count is positive or `deadline` passes. On success,
    /// decrements the count and returns `Acquired`. Returns `TimedOut`
    /// precisely when the deadline passes first; the count is left
    /// untouched in that case.
    pub fn wait_until(&self, deadline: Instant) -> WaitResult {
        cfg_if::cfg_if! {
            if #[cfg(any(target_os = "linux", target_os = "android"))] {
                let mut count = self.count.lock();
                loop {
                    if *count > 0 {
                        *count -= 1;
                        return WaitResult::Acquired;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitResult::TimedOut;
                    }
                    let timed_out = self.condvar.wait_for(&mut count, deadline - now);
                    if timed_out.timed_out() && *count <= 0 {
                        return WaitResult::TimedOut;
                    }
                }
            } else {
                let mut count = self.count.lock().expect("semaphore mutex poisoned");
                loop {
                    if *count > 0 {
                        *count -= 1;
                        return WaitResult::Acquired;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitResult::TimedOut;
                    }
                    let (guard, timeout_result) = self
                        .condvar
                        .wait_timeout(count, deadline - now)
                        .expect("semaphore mutex poisoned");
                    count = guard;
                    if timeout_result.timed_out() && *count <= 0 {
                        return WaitResult::TimedOut;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_then_wait_does_not_block() {
        let sem = Semaphore::new(0);
        sem.signal();
        sem.wait();
    }

    #[test]
    fn wait_until_times_out_with_no_signal() {
        let sem = Semaphore::new(0);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(sem.wait_until(deadline), WaitResult::TimedOut);
    }

    #[test]
    fn wait_until_acquires_when_signalled_in_time() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = Arc::clone(&sem);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            sem2.signal();
        });
        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(sem.wait_until(deadline), WaitResult::Acquired);
    }

    #[test]
    fn counter_never_goes_negative_under_contention() {
        let sem = Arc::new(Semaphore::new(0));
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let sem = Arc::clone(&sem);
                thread::spawn(move || {
                    for _ in 0..100 {
                        sem.signal();
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        for _ in 0..400 {
            sem.wait();
        }
        // One more wait should time out rather than go negative.
        let deadline = Instant::now() + Duration::from_millis(10);
        assert_eq!(sem.wait_until(deadline), WaitResult::TimedOut);
    }
}
