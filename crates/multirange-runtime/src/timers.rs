//! Liveness timers
//!
//! One epoch-token timer per liveness deadline. Arming bumps the epoch and
//! sleeps on the tokio timer wheel; a fire observes the epoch again before
//! acting, so canceling or re-arming a timer that is already firing is
//! race-free (the stale fire sees a newer epoch and does nothing).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Re-armable one-shot timer with epoch-token cancellation
pub struct LivenessTimer {
    epoch: Arc<AtomicU64>,
}

impl LivenessTimer {
    pub fn new() -> Self {
        Self {
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Arm the timer, superseding any previous arming. `on_expiry` runs only
    /// if no later arm/cancel happened before the deadline.
    pub fn arm<F>(&self, duration: Duration, on_expiry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let token = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let epoch = Arc::clone(&self.epoch);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if epoch.load(Ordering::SeqCst) == token {
                on_expiry();
            }
        });
    }

    /// Cancel any pending expiry
    pub fn cancel(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }
}

impl Default for LivenessTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_duration() {
        let timer = LivenessTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let flag = Arc::clone(&fired);
        timer.arm(Duration::from_millis(100), move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let timer = LivenessTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let flag = Arc::clone(&fired);
        timer.arm(Duration::from_millis(100), move || {
            flag.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_supersedes_previous_deadline() {
        let timer = LivenessTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let flag = Arc::clone(&fired);
            timer.arm(Duration::from_millis(100), move || {
                flag.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Only the last arming may fire
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
