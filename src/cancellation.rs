//! Shutdown signalling shared by the capture thread, the metadata thread and
//! the control loop. Shutdown is one-way: once requested it is never cleared.

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Granularity of interruptible waits.
pub const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Process-wide shutdown flag. Cheap to clone; all clones observe the same request.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Request shutdown. Idempotent.
    pub fn request(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("shutdown_requested");
        }
        self.token.cancel();
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Sleep for `duration` in `WAIT_SLICE` steps. Returns early with `true`
    /// if shutdown is requested or `interrupt` returns true.
    pub fn wait_for(&self, duration: Duration, interrupt: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_requested() || interrupt() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(WAIT_SLICE.min(deadline - now));
        }
    }

    /// Underlying token, for async consumers (signal handler).
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn wait_runs_to_deadline_without_interrupt() {
        let signal = ShutdownSignal::new();
        let start = Instant::now();
        assert!(!signal.wait_for(Duration::from_millis(30), || false));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_returns_early_on_shutdown_from_another_thread() {
        let signal = ShutdownSignal::new();
        let remote = signal.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.request();
        });
        let start = Instant::now();
        assert!(signal.wait_for(Duration::from_secs(5), || false));
        assert!(start.elapsed() < Duration::from_secs(1));
        t.join().unwrap();
    }

    #[test]
    fn wait_returns_early_on_interrupt_predicate() {
        let signal = ShutdownSignal::new();
        let flag = Arc::new(AtomicBool::new(true));
        let f = Arc::clone(&flag);
        assert!(signal.wait_for(Duration::from_secs(5), move || f.load(Ordering::SeqCst)));
        assert!(!signal.is_requested());
    }

    #[test]
    fn request_is_idempotent() {
        let signal = ShutdownSignal::new();
        signal.request();
        signal.request();
        assert!(signal.is_requested());
    }
}
