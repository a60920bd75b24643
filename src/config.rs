// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-wide scheduler configuration. Read-only after `Config::validate`
// succeeds; threads hand out immutable references rather than re-reading
// shared mutable state on every round.

use crate::error::SchedulerError;

pub const MAX_THREADS: usize = 256;
pub const MAX_JOB_BUFFERS_PER_THREAD: usize = 32;
pub const MAX_SEND_THREADS: usize = 8;
pub const MAX_SCHED_RESPONSIVENESS: u8 = 10;

/// Per-thread tuning, set once at startup and not changed while the thread
/// runs.
#[derive(Debug, Clone, Copy)]
pub struct ThreadConfig {
    /// Run this thread at realtime scheduling priority (§10.7).
    pub realtime: bool,
    /// Spin time, in nanoseconds, before falling back to a sleep-wait.
    pub spintime_ns: u32,
    /// Exempt this thread from assisting the send-thread pool.
    pub nosend: bool,
    /// 0 (max throughput, largest batches) .. 10 (max responsiveness,
    /// smallest batches). Drives `max_signals_before_send`/
    /// `max_signals_before_send_flush` below.
    pub sched_responsiveness: u8,
}

impl ThreadConfig {
    pub fn new(sched_responsiveness: u8) -> Self {
        Self {
            realtime: false,
            spintime_ns: 0,
            nosend: false,
            sched_responsiveness: sched_responsiveness.min(MAX_SCHED_RESPONSIVENESS),
        }
    }

    /// Signal count that triggers a send-buffer flush for this thread's
    /// traffic, interpolated linearly across the responsiveness range
    /// (0 → 1000 signals per flush, 10 → 70).
    pub fn max_signals_before_send(&self) -> u32 {
        let r = self.sched_responsiveness as u32;
        1000 - (1000 - 70) * r / 10
    }

    /// Signal count that triggers flushing the current send buffer early,
    /// even if `max_signals_before_send` has not been reached (0 → 340,
    /// 10 → 10).
    pub fn max_signals_before_send_flush(&self) -> u32 {
        let r = self.sched_responsiveness as u32;
        340 - (340 - 10) * r / 10
    }
}

/// Process-wide scheduler configuration, validated once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub num_threads: usize,
    pub num_receiver_threads: usize,
    pub num_tc_threads: usize,
    pub num_send_threads: usize,
    /// μs before a partially-filled send buffer is flushed regardless of
    /// size.
    pub max_send_delay_us: u32,
    /// μs, rounded up to the next multiple of 5 by `validate`.
    pub wakeup_latency_us: u32,
    /// ns fed to the spin-lock backoff calibration.
    pub spin_time_per_call_ns: u32,
    pub threads: Vec<ThreadConfig>,
}

impl Config {
    /// `num_job_buffers_per_thread`: one JBB per other thread that can
    /// address this thread, capped at `MAX_JOB_BUFFERS_PER_THREAD`.
    pub fn num_job_buffers_per_thread(&self) -> usize {
        self.num_threads.saturating_sub(1).min(MAX_JOB_BUFFERS_PER_THREAD)
    }

    /// True iff more than one producer thread can publish into a shared
    /// job buffer instance, in which case publication must serialize on
    /// the job buffer's spin lock.
    pub fn use_write_lock_mutex(&self) -> bool {
        self.num_threads > self.num_job_buffers_per_thread() + 1
    }

    pub fn validate(self) -> Result<Self, SchedulerError> {
        if self.num_threads == 0 || self.num_threads > MAX_THREADS {
            return Err(SchedulerError::InvalidConfig(format!(
                "num_threads {} out of range 1..={MAX_THREADS}",
                self.num_threads
            )));
        }
        if self.num_send_threads > MAX_SEND_THREADS {
            return Err(SchedulerError::InvalidConfig(format!(
                "num_send_threads {} exceeds {MAX_SEND_THREADS}",
                self.num_send_threads
            )));
        }
        if self.threads.len() != self.num_threads {
            return Err(SchedulerError::InvalidConfig(format!(
                "threads.len() {} does not match num_threads {}",
                self.threads.len(),
                self.num_threads
            )));
        }
        for (i, t) in self.threads.iter().enumerate() {
            if t.sched_responsiveness > MAX_SCHED_RESPONSIVENESS {
                return Err(SchedulerError::InvalidConfig(format!(
                    "thread {i}: sched_responsiveness {} exceeds {MAX_SCHED_RESPONSIVENESS}",
                    t.sched_responsiveness
                )));
            }
        }
        let wakeup_latency_us = self.wakeup_latency_us.div_ceil(5) * 5;
        Ok(Self {
            wakeup_latency_us,
            ..self
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(n: usize) -> Config {
        Config {
            num_threads: n,
            num_receiver_threads: 1,
            num_tc_threads: 1,
            num_send_threads: 2,
            max_send_delay_us: 200,
            wakeup_latency_us: 23,
            spin_time_per_call_ns: 500,
            threads: (0..n).map(|_| ThreadConfig::new(5)).collect(),
        }
    }

    #[test]
    fn validate_rounds_wakeup_latency_up_to_multiple_of_five() {
        let cfg = base_config(4).validate().unwrap();
        assert_eq!(cfg.wakeup_latency_us, 25);
    }

    #[test]
    fn validate_rejects_too_many_send_threads() {
        let mut cfg = base_config(4);
        cfg.num_send_threads = 9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_thread_count_mismatch() {
        let mut cfg = base_config(4);
        cfg.threads.pop();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn responsiveness_extremes_bound_flush_thresholds() {
        let low = ThreadConfig::new(0);
        let high = ThreadConfig::new(10);
        assert_eq!(low.max_signals_before_send(), 1000);
        assert_eq!(high.max_signals_before_send(), 70);
        assert_eq!(low.max_signals_before_send_flush(), 340);
        assert_eq!(high.max_signals_before_send_flush(), 10);
    }
}
