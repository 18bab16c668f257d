//! Cycle clocks and the timeout drain of partially filled batches
//!
//! Workers read a cycle counter once per loop iteration. When at least one
//! drain interval has passed since the last drain, every non-empty batch is
//! flushed so low-rate traffic isn't held back waiting for a full batch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info};

const US_PER_S: u64 = 1_000_000;

/// Source of a monotonically increasing cycle count
pub trait CycleClock: Send + Sync {
    /// Current counter value
    fn now(&self) -> u64;

    /// Counter increments per second
    fn hz(&self) -> u64;
}

/// Drain interval in cycles
///
/// Cycles per microsecond are rounded up before scaling, so the interval is
/// never shorter than `us` microseconds. Saturates instead of wrapping.
#[inline]
pub const fn drain_cycles(hz: u64, us: u64) -> u64 {
    hz.div_ceil(US_PER_S).saturating_mul(us)
}

/// Decides when the timeout drain runs
#[derive(Debug, Clone, Copy)]
pub struct DrainTimer {
    interval: u64,
    last: u64,
}

impl DrainTimer {
    /// Timer that first fires `interval` cycles after `now`
    pub fn new(interval: u64, now: u64) -> Self {
        Self {
            interval,
            last: now,
        }
    }

    /// Returns true if a drain is due at `now`, and restarts the interval
    ///
    /// Restarts even when the caller has nothing to flush.
    #[inline]
    pub fn poll(&mut self, now: u64) -> bool {
        if now.saturating_sub(self.last) < self.interval {
            return false;
        }
        self.last = now;
        true
    }

    /// Counter value of the last drain
    pub fn last(&self) -> u64 {
        self.last
    }
}

/// x86-64 time-stamp counter
///
/// The frequency is measured once against the monotonic clock.
#[derive(Debug, Clone, Copy)]
pub struct TscClock {
    hz: u64,
}

impl TscClock {
    /// Calibrate over `window`
    ///
    /// Returns `None` without an invariant TSC (or off x86-64).
    pub fn calibrate(window: Duration) -> Option<Self> {
        if !has_invariant_tsc() {
            debug!("No invariant TSC");
            return None;
        }

        let start = Instant::now();
        let tsc_start = read_tsc();
        std::thread::sleep(window);
        let tsc_end = read_tsc();
        let elapsed_ns = start.elapsed().as_nanos() as u64;

        if elapsed_ns == 0 || tsc_end <= tsc_start {
            return None;
        }
        let hz = ((tsc_end - tsc_start) as u128 * 1_000_000_000 / elapsed_ns as u128) as u64;

        info!(hz, "Calibrated TSC");
        Some(Self { hz })
    }
}

impl CycleClock for TscClock {
    #[inline]
    fn now(&self) -> u64 {
        read_tsc()
    }

    fn hz(&self) -> u64 {
        self.hz
    }
}

#[cfg(target_arch = "x86_64")]
#[allow(unused_unsafe)]
fn has_invariant_tsc() -> bool {
    use std::arch::x86_64::__cpuid;

    // CPUID leaf 0x80000007, EDX bit 8
    let max_ext = unsafe { __cpuid(0x8000_0000) }.eax;
    if max_ext < 0x8000_0007 {
        return false;
    }
    unsafe { __cpuid(0x8000_0007) }.edx & (1 << 8) != 0
}

#[cfg(not(target_arch = "x86_64"))]
fn has_invariant_tsc() -> bool {
    false
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
#[allow(unused_unsafe)]
fn read_tsc() -> u64 {
    unsafe { std::arch::x86_64::_rdtsc() }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
fn read_tsc() -> u64 {
    0
}

/// Nanoseconds since creation (1 GHz)
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    base: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleClock for MonotonicClock {
    #[inline]
    fn now(&self) -> u64 {
        self.base.elapsed().as_nanos() as u64
    }

    fn hz(&self) -> u64 {
        1_000_000_000
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
    hz: u64,
}

impl ManualClock {
    pub fn new(hz: u64) -> Self {
        Self {
            now: AtomicU64::new(0),
            hz,
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::Relaxed);
    }

    pub fn advance(&self, cycles: u64) {
        self.now.fetch_add(cycles, Ordering::Relaxed);
    }
}

impl CycleClock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    fn hz(&self) -> u64 {
        self.hz
    }
}
