use core::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter of simulated CPU ticks. The scheduler's tick driver is
/// the only writer; everything else reads.
pub struct Clock {
    total: AtomicU64,
    idle: AtomicU64,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            idle: AtomicU64::new(0),
        }
    }

    /// One busy tick.
    pub fn tick(&self) {
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    /// One tick spent with no runnable work.
    pub fn tick_idle(&self) {
        self.total.fetch_add(1, Ordering::SeqCst);
        self.idle.fetch_add(1, Ordering::SeqCst);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn idle(&self) -> u64 {
        self.idle.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> u64 {
        // idle never exceeds total; both only grow
        self.total().saturating_sub(self.idle())
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
