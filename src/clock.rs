//! Monotonic clock and deadline arithmetic for the run loop.

use std::time::{Duration, Instant};

use rand::Rng;

/// A point in time the scheduler compares scopes against. Stored as
/// seconds since an arbitrary, clock-specific epoch so it can be ordered
/// and hashed without reference to `Instant` (which isn't `Hash`/`Ord` in
/// a way that composes with `f64`-style deadline arithmetic).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Deadline(f64);

impl Deadline {
    /// A deadline that never expires.
    pub const INFINITE: Deadline = Deadline(f64::INFINITY);

    /// A deadline already in the past — used to implement "brief" yields
    /// as "indefinite with deadline -∞" (§4.2).
    pub const PAST: Deadline = Deadline(f64::NEG_INFINITY);

    pub fn seconds(value: f64) -> Self {
        Deadline(value)
    }

    pub fn as_seconds(&self) -> f64 {
        self.0
    }

    pub fn is_finite(&self) -> bool {
        self.0.is_finite()
    }

    pub fn has_expired(&self, now: f64) -> bool {
        self.0 <= now
    }

    /// Whether this deadline should occupy a slot in the runner's deadline
    /// index: anything short of `INFINITE`, including `PAST` — a scope
    /// deadline of `-∞` is deliberately indexed too, so the ordinary
    /// expiry walk is what retires it (§4.2's "brief yields are indefinite
    /// with deadline -∞").
    pub(crate) fn registers_in_deadline_index(&self) -> bool {
        *self != Deadline::INFINITE
    }
}

impl Eq for Deadline {}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A monotonic time source exposing the two operations the run loop needs:
/// "what time is it" and "how long until this deadline". Implementations
/// other than [`MonotonicClock`] are useful in tests that need to jump the
/// clock forward without a real sleep (scenarios S3–S5).
pub trait Clock: Send {
    fn current_time(&self) -> f64;

    /// Seconds to sleep to reach `deadline`, clamped to be non-negative.
    /// The default implementation is correct for any clock whose
    /// `current_time` is comparable to deadlines it produced; reactors
    /// further clamp this to `[0, 24h]` per the run loop's timeout rule.
    fn deadline_to_sleep_time(&self, deadline: Deadline) -> f64 {
        (deadline.as_seconds() - self.current_time()).max(0.0)
    }
}

/// The default clock: real monotonic time, offset by a large random value
/// chosen once at construction so user code cannot accidentally depend on
/// deadlines being comparable to wall-clock or process-start time.
pub struct MonotonicClock {
    start: Instant,
    offset: f64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        let offset = rand::thread_rng().gen_range(10_000.0..1_000_000.0);
        MonotonicClock {
            start: Instant::now(),
            offset,
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn current_time(&self) -> f64 {
        self.start.elapsed().as_secs_f64() + self.offset
    }
}

/// A clock whose `current_time` is set explicitly by the test driving it.
/// Used by the deadline-expiry scenarios (S3–S5), which need to advance
/// time instantaneously rather than actually sleeping.
pub struct MockClock {
    now: std::sync::atomic::AtomicU64, // bits of an f64, via to_bits/from_bits
}

impl MockClock {
    pub fn new() -> Self {
        MockClock {
            now: std::sync::atomic::AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let cur = f64::from_bits(self.now.load(std::sync::atomic::Ordering::SeqCst));
        let next = cur + by.as_secs_f64();
        self.now
            .store(next.to_bits(), std::sync::atomic::Ordering::SeqCst);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn current_time(&self) -> f64 {
        f64::from_bits(self.now.load(std::sync::atomic::Ordering::SeqCst))
    }
}
