//! Presentation-time authority shared by the audio and video paths.
//!
//! Both streams are stamped from a single lazily-captured epoch, so the
//! container sees one monotonic timeline even though the compositor and the
//! audio device are clocked independently. Video timestamps produced by the
//! encoder are discarded and replaced with this clock's value at drain time,
//! which approximates (rather than guarantees) A/V synchronization.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

/// Source of raw microsecond readings.
pub trait Clock: Send + Sync {
    /// Monotonically non-decreasing microseconds from an arbitrary origin
    fn now_us(&self) -> u64;
}

/// Process monotonic clock
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Hand-driven clock for deterministic tests and replays
#[derive(Debug, Default)]
pub struct ManualClock {
    now_us: AtomicU64,
}

impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now_us: AtomicU64::new(start_us),
        }
    }

    pub fn advance_us(&self, delta_us: u64) {
        self.now_us.fetch_add(delta_us, Ordering::SeqCst);
    }

    pub fn set_us(&self, now_us: u64) {
        self.now_us.fetch_max(now_us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.load(Ordering::SeqCst)
    }
}

/// The session's single presentation-time authority.
///
/// The first call to [`now_us`](Self::now_us) captures the epoch and returns 0;
/// later calls return `(clock - epoch) / time_lapse`.
pub struct PresentationClock {
    clock: Arc<dyn Clock>,
    epoch_us: OnceLock<u64>,
    time_lapse: u64,
}

impl PresentationClock {
    pub fn new(clock: Arc<dyn Clock>, time_lapse: u32) -> Self {
        Self {
            clock,
            epoch_us: OnceLock::new(),
            time_lapse: u64::from(time_lapse.max(1)),
        }
    }

    /// Real-time authority backed by the monotonic clock
    pub fn monotonic(time_lapse: u32) -> Self {
        Self::new(Arc::new(MonotonicClock::new()), time_lapse)
    }

    pub fn now_us(&self) -> u64 {
        let now = self.clock.now_us();
        let epoch = *self.epoch_us.get_or_init(|| now);
        now.saturating_sub(epoch) / self.time_lapse
    }

    /// Raw clock reading of the epoch, once established
    pub fn epoch_us(&self) -> Option<u64> {
        self.epoch_us.get().copied()
    }

    pub fn time_lapse(&self) -> u32 {
        self.time_lapse as u32
    }
}

impl std::fmt::Debug for PresentationClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresentationClock")
            .field("epoch_us", &self.epoch_us.get())
            .field("time_lapse", &self.time_lapse)
            .finish()
    }
}
