use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Admission flag guaranteeing at most one deploy run at a time.
///
/// Acquisition is a single compare-and-swap; release happens when the
/// returned [`DeployGuard`] is dropped, which covers every exit path of the
/// run task including panics.
#[derive(Debug, Default)]
pub struct DeployLock {
    running: AtomicBool,
    released: Notify,
}

impl DeployLock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the lock if it is idle. Returns `None` when a run already holds it.
    pub fn try_acquire(self: &Arc<Self>) -> Option<DeployGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| DeployGuard {
                lock: Arc::clone(self),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Resolve once no guard is outstanding.
    pub async fn wait_idle(&self) {
        loop {
            // Register before checking so a release in between is not missed.
            let notified = self.released.notified();
            if !self.is_running() {
                return;
            }
            notified.await;
        }
    }
}

/// Proof of holding the [`DeployLock`].
#[derive(Debug)]
pub struct DeployGuard {
    lock: Arc<DeployLock>,
}

impl Drop for DeployGuard {
    fn drop(&mut self) {
        self.lock.running.store(false, Ordering::Release);
        self.lock.released.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn second_acquire_fails_until_release() {
        let lock = DeployLock::new();
        let guard = lock.try_acquire().expect("idle lock");
        assert!(lock.is_running());
        assert!(lock.try_acquire().is_none());
        drop(guard);
        assert!(!lock.is_running());
        assert!(lock.try_acquire().is_some());
    }

    #[test]
    fn racing_threads_admit_exactly_one() {
        let lock = DeployLock::new();
        let winners = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(std::sync::Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let winners = Arc::clone(&winners);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    if let Some(guard) = lock.try_acquire() {
                        winners.fetch_add(1, Ordering::SeqCst);
                        // Hold until every thread has tried.
                        std::thread::sleep(Duration::from_millis(50));
                        drop(guard);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(!lock.is_running());
    }

    #[test]
    fn guard_released_on_panic() {
        let lock = DeployLock::new();
        let held = lock.try_acquire().unwrap();
        let result = std::thread::spawn(move || {
            let _guard = held;
            panic!("deploy task blew up");
        })
        .join();
        assert!(result.is_err());
        assert!(!lock.is_running());
    }

    #[tokio::test]
    async fn wait_idle_resolves_after_release() {
        let lock = DeployLock::new();
        lock.wait_idle().await;

        let guard = lock.try_acquire().unwrap();
        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
    }
}
