use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Last observed activity of the child, shared with its log readers
#[derive(Debug)]
pub struct Heartbeat {
    origin: Instant,
    /// Milliseconds since `origin`
    last: AtomicU64,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    pub fn beat(&self) {
        self.last.store(self.now_ms(), Ordering::Relaxed);
    }

    /// Time since the last beat
    pub fn age(&self) -> Duration {
        let last = self.last.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Stale(Duration),
}

/// A child is stale only once silent for strictly longer than `threshold`.
pub fn assess(age: Duration, threshold: Duration) -> Liveness {
    if age > threshold {
        Liveness::Stale(age)
    } else {
        Liveness::Alive
    }
}
