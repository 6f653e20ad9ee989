use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Granularity at which sleeping and waiting loops re-check for cancellation.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A shared flag used to abort in-flight work.
///
/// Clones observe the same flag. Long-running loops (process waits, retry
/// backoff) poll it every [`POLL_INTERVAL`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless cancelled first.
    ///
    /// Returns `true` if the full duration elapsed, `false` if the token was
    /// cancelled while sleeping.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Cancels this token once `timeout` elapses, unless the returned guard is
    /// dropped first.
    pub fn arm_deadline(&self, timeout: Duration) -> DeadlineGuard {
        let disarmed = Arc::new(AtomicBool::new(false));
        let token = self.clone();
        let watch = Arc::clone(&disarmed);
        thread::spawn(move || {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                if watch.load(Ordering::SeqCst) || token.is_cancelled() {
                    return;
                }
                thread::sleep(POLL_INTERVAL);
            }
            if !watch.load(Ordering::SeqCst) {
                tracing::warn!(?timeout, "Overall reproduction deadline reached, cancelling");
                token.cancel();
            }
        });
        DeadlineGuard { disarmed }
    }
}

/// Disarms the watchdog started by [`CancelToken::arm_deadline`] when dropped.
#[derive(Debug)]
pub struct DeadlineGuard {
    disarmed: Arc<AtomicBool>,
}

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.disarmed.store(true, Ordering::SeqCst);
    }
}
