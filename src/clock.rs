use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Monotonic millisecond time source.
///
/// The value wraps after ~49 days; every consumer works with
/// `wrapping_sub` differences, never with absolute comparisons.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u32;
}

/// Milliseconds elapsed since the clock was created.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u32 {
        // Truncation is the wrap-around.
        self.origin.elapsed().as_millis() as u32
    }
}

/// Clock that only moves when told to. Used to replay pulse trains.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    pub fn new(start_ms: u32) -> Self {
        Self {
            now: AtomicU32::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: u32) {
        self.now.store(now_ms, Ordering::Relaxed);
    }

    /// Moves the clock forward and returns the new time.
    pub fn advance(&self, delta_ms: u32) -> u32 {
        self.now
            .fetch_add(delta_ms, Ordering::Relaxed)
            .wrapping_add(delta_ms)
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.now.load(Ordering::Relaxed)
    }
}
