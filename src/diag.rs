// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Diagnostic counters and rate-limited logging shared by the lock
// implementations and the scheduler loops.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Log a contended-lock report at the rate the original scheduler used:
/// every occurrence up to 20, then every 200th up to 10,000, then every
/// 5,000th. `count` is the 1-based contention count for this lock.
pub(crate) fn report_contention(name: &str, count: u64, spins: u64) {
    let freq = if count > 10_000 {
        5_000
    } else if count > 20 {
        200
    } else {
        1
    };
    if count % freq == 0 {
        log::warn!(
            "contended lock {name}: contention_count={count} spins_this_wait={spins}"
        );
    }
}

/// Number of spin-duration histogram buckets, log2-scaled. Mirrors the
/// sixteen-bucket spin-time histogram the original scheduler exposes for
/// operator tuning of `spintime`.
pub const NUM_SPIN_INTERVALS: usize = 16;

/// Per-lock-site spin-time histogram and summary counters, readable by an
/// operator without perturbing the lock's fast path.
#[derive(Debug)]
pub struct SpinStat {
    buckets: [AtomicU64; NUM_SPIN_INTERVALS],
    contentions: AtomicU64,
    configured_spintime_ns: AtomicU32,
}

impl SpinStat {
    pub const fn new() -> Self {
        // AtomicU64::new is const but array-init needs repeat; build manually.
        const Z: AtomicU64 = AtomicU64::new(0);
        Self {
            buckets: [Z; NUM_SPIN_INTERVALS],
            contentions: AtomicU64::new(0),
            configured_spintime_ns: AtomicU32::new(0),
        }
    }

    /// Record one contended acquisition that spun for `spins` adaptive-yield
    /// iterations before succeeding. Bucketed by `log2(spins + 1)`.
    pub fn record(&self, spins: u64) {
        let bucket = (64 - (spins + 1).leading_zeros() as usize - 1).min(NUM_SPIN_INTERVALS - 1);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.contentions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn contentions(&self) -> u64 {
        self.contentions.load(Ordering::Relaxed)
    }

    pub fn histogram(&self) -> [u64; NUM_SPIN_INTERVALS] {
        let mut out = [0u64; NUM_SPIN_INTERVALS];
        for (i, b) in self.buckets.iter().enumerate() {
            out[i] = b.load(Ordering::Relaxed);
        }
        out
    }

    pub fn set_configured_spintime_ns(&self, ns: u32) {
        self.configured_spintime_ns.store(ns, Ordering::Relaxed);
    }

    pub fn configured_spintime_ns(&self) -> u32 {
        self.configured_spintime_ns.load(Ordering::Relaxed)
    }
}

impl Default for SpinStat {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-block-thread execution counters, snapshot-read by an operator or a
/// monitoring callback. Only the owning thread writes to it.
#[derive(Debug, Default)]
pub struct ThreadStat {
    pub signals_executed_round: u64,
    pub signals_executed_total: u64,
    pub busy_loops: u64,
    pub sleeps: u64,
    pub spins: u64,
    pub last_round_max_signals_per_jb: u32,
}

impl ThreadStat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_round(&mut self) {
        self.signals_executed_round = 0;
        self.busy_loops += 1;
    }

    pub fn record_executed(&mut self, n: u64) {
        self.signals_executed_round += n;
        self.signals_executed_total += n;
    }
}

/// Tracks whether a polled level value has changed since the last time a
/// caller read it, mirroring the out-parameter pair returned by
/// `mt_getSendBufferLevel`/`mt_getEstimatedJobBufferLevel` in the original
/// implementation (§10.4). Additive instrumentation only; never consulted
/// by scheduling decisions.
#[derive(Debug)]
pub struct LevelGauge {
    last: AtomicU32,
}

impl LevelGauge {
    pub const fn new() -> Self {
        Self { last: AtomicU32::new(u32::MAX) }
    }

    /// Record `current` as the latest reading and report whether it
    /// differs from the previous reading.
    pub fn read(&self, current: u32) -> (u32, bool) {
        let prev = self.last.swap(current, Ordering::Relaxed);
        (current, prev != current)
    }
}

impl Default for LevelGauge {
    fn default() -> Self {
        Self::new()
    }
}
