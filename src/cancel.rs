//! Cooperative cancellation for long-running maintenance work.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Cancellation token polled between pipeline steps and while waiting on
/// subprocesses.
///
/// Clones share the underlying flag, so cancelling any clone cancels them
/// all. A deadline applies only to the token it was derived on (and clones
/// of that token), which is how per-repository timeouts are layered on top
/// of the process-wide shutdown flag.
#[derive(Clone, Debug)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: None,
        }
    }

    /// Wraps an externally owned flag, e.g. one registered with signal-hook.
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        CancelToken {
            flag,
            deadline: None,
        }
    }

    /// Derives a token that additionally expires after `timeout`.
    ///
    /// The shutdown flag stays shared; the earlier of an existing deadline
    /// and the new one wins.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let new_deadline = Instant::now().checked_add(timeout);
        let deadline = match (self.deadline, new_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        CancelToken {
            flag: Arc::clone(&self.flag),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::Relaxed) {
            return true;
        }
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    /// Sleeps for up to `duration`, returning early once cancelled.
    pub fn sleep(&self, duration: Duration) {
        const SLICE: Duration = Duration::from_millis(250);

        let wake_at = Instant::now() + duration;
        while !self.is_cancelled() {
            let now = Instant::now();
            if now >= wake_at {
                return;
            }
            std::thread::sleep(SLICE.min(wake_at - now));
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
