//! Worker statistics
//!
//! Lock-free counters, written only by the owning worker and read by the
//! control plane for reports.

use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-worker counters (cache-line aligned)
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    /// Frames released because the port accepted only part of a batch
    pub tx_dropped: AtomicU64,
    /// Replicas produced (original excluded)
    pub replicas: AtomicU64,
    /// Frames dropped because the header pool was exhausted
    pub alloc_failures: AtomicU64,
    /// Frames too short for an Ethernet header
    pub runt: AtomicU64,
    /// Frames addressed to a port without a batch
    pub no_port: AtomicU64,
    /// Frames dropped because a replica didn't fit into its header buffer
    pub headroom_errors: AtomicU64,
    pub full_flushes: AtomicU64,
    pub timeout_flushes: AtomicU64,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn record_rx(&self, packets: u64, bytes: u64) {
        self.rx_packets.fetch_add(packets, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_tx(&self, packets: u64, bytes: u64) {
        self.tx_packets.fetch_add(packets, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_tx_dropped(&self, packets: u64) {
        self.tx_dropped.fetch_add(packets, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_replicas(&self, count: u64) {
        self.replicas.fetch_add(count, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_alloc_failure(&self) {
        self.alloc_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_runt(&self) {
        self.runt.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_no_port(&self) {
        self.no_port.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_headroom_error(&self) {
        self.headroom_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_full_flush(&self) {
        self.full_flushes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_timeout_flushes(&self, batches: u64) {
        self.timeout_flushes.fetch_add(batches, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
            replicas: self.replicas.load(Ordering::Relaxed),
            alloc_failures: self.alloc_failures.load(Ordering::Relaxed),
            runt: self.runt.load(Ordering::Relaxed),
            no_port: self.no_port.load(Ordering::Relaxed),
            headroom_errors: self.headroom_errors.load(Ordering::Relaxed),
            full_flushes: self.full_flushes.load(Ordering::Relaxed),
            timeout_flushes: self.timeout_flushes.load(Ordering::Relaxed),
        }
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_dropped: u64,
    pub replicas: u64,
    pub alloc_failures: u64,
    pub runt: u64,
    pub no_port: u64,
    pub headroom_errors: u64,
    pub full_flushes: u64,
    pub timeout_flushes: u64,
}

impl WorkerStatsSnapshot {
    /// Frames dropped for any reason
    pub fn dropped(&self) -> u64 {
        self.tx_dropped + self.alloc_failures + self.runt + self.no_port + self.headroom_errors
    }

    pub fn packet_rate_mpps(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs == 0.0 {
            return 0.0;
        }
        self.tx_packets as f64 / (elapsed_secs * 1_000_000.0)
    }

    /// Counter increase since `earlier`
    pub fn delta(&self, earlier: &Self) -> Self {
        Self {
            rx_packets: self.rx_packets.saturating_sub(earlier.rx_packets),
            rx_bytes: self.rx_bytes.saturating_sub(earlier.rx_bytes),
            tx_packets: self.tx_packets.saturating_sub(earlier.tx_packets),
            tx_bytes: self.tx_bytes.saturating_sub(earlier.tx_bytes),
            tx_dropped: self.tx_dropped.saturating_sub(earlier.tx_dropped),
            replicas: self.replicas.saturating_sub(earlier.replicas),
            alloc_failures: self.alloc_failures.saturating_sub(earlier.alloc_failures),
            runt: self.runt.saturating_sub(earlier.runt),
            no_port: self.no_port.saturating_sub(earlier.no_port),
            headroom_errors: self.headroom_errors.saturating_sub(earlier.headroom_errors),
            full_flushes: self.full_flushes.saturating_sub(earlier.full_flushes),
            timeout_flushes: self.timeout_flushes.saturating_sub(earlier.timeout_flushes),
        }
    }
}

impl AddAssign for WorkerStatsSnapshot {
    fn add_assign(&mut self, other: Self) {
        self.rx_packets += other.rx_packets;
        self.rx_bytes += other.rx_bytes;
        self.tx_packets += other.tx_packets;
        self.tx_bytes += other.tx_bytes;
        self.tx_dropped += other.tx_dropped;
        self.replicas += other.replicas;
        self.alloc_failures += other.alloc_failures;
        self.runt += other.runt;
        self.no_port += other.no_port;
        self.headroom_errors += other.headroom_errors;
        self.full_flushes += other.full_flushes;
        self.timeout_flushes += other.timeout_flushes;
    }
}

impl Add for WorkerStatsSnapshot {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

impl Sum for WorkerStatsSnapshot {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}
