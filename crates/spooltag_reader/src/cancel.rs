use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Stop flag for the poll loop, checked once per iteration.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Sleep up to `duration`, waking early once cancelled.
    pub fn sleep(&self, duration: std::time::Duration) {
        const STEP: std::time::Duration = std::time::Duration::from_millis(50);
        let deadline = std::time::Instant::now() + duration;
        while !self.is_cancelled() {
            let now = std::time::Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(STEP.min(deadline - now));
        }
    }

    /// Flag shared with signal handlers.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert!(!other.is_cancelled());
        token.cancel();
        assert!(other.is_cancelled());
        assert!(token.flag().load(Ordering::SeqCst));
    }

    #[test]
    fn test_sleep_returns_early_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        let start = Instant::now();
        token.sleep(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
