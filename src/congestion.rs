// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Congestion controller: decides how many extra signals a block thread
// may still drain from an already-FULL incoming job buffer, so that even
// when a thread's own outgoing quota has dropped to zero it keeps making
// progress on queues other threads are blocked behind. Without this, two
// threads each full towards the other could deadlock forever.

use crate::job_buffer::{JobBuffer, CONGESTED};

/// One thread's congestion bookkeeping: extra per-incoming-JBB quotas
/// plus the bitmask of destination threads this thread is currently
/// congested towards (consulted by [`JobBuffer`]'s producers via
/// `set_congested_jb_quotas`, which lives in the scheduler main loop).
pub struct CongestionState {
    extra_signals: Vec<u32>,
    congested_threads_mask: Vec<bool>,
}

impl CongestionState {
    pub fn new(num_threads: usize) -> Self {
        Self {
            extra_signals: vec![0; num_threads],
            congested_threads_mask: vec![false; num_threads],
        }
    }

    pub fn mark_congested(&mut self, dest_thread: usize) {
        self.congested_threads_mask[dest_thread] = true;
    }

    pub fn clear_congested(&mut self, dest_thread: usize) {
        self.congested_threads_mask[dest_thread] = false;
    }

    pub fn is_any_congested(&self) -> bool {
        self.congested_threads_mask.iter().any(|&b| b)
    }

    pub fn is_congested(&self, dest_thread: usize) -> bool {
        self.congested_threads_mask.get(dest_thread).copied().unwrap_or(false)
    }

    pub fn extra_signals(&self, jbb: usize) -> u32 {
        self.extra_signals[jbb]
    }

    /// `prepare_congested_execution`: distribute `total_extra_signals`
    /// across every `incoming` job buffer that is itself FULL
    /// (`free_pages() <= CONGESTED`), proportional to how starved each one
    /// is (`congestion = CONGESTED - free + 1`). Job buffers that are not
    /// congested get zero.
    ///
    /// Degenerate case: if there is no budget to distribute at all
    /// (`total_extra_signals == 0`) and this thread's own regular quota has
    /// also collapsed to zero (`max_signals_per_jb == 0`), proportional
    /// division would hand out all-zero quotas and the thread would make no
    /// progress on anything. Instead every currently non-empty incoming
    /// queue gets a quota of 1, so the thread always drains something.
    pub fn prepare_congested_execution(
        &mut self,
        incoming: &[(usize, &JobBuffer)],
        total_extra_signals: u32,
        max_signals_per_jb: u32,
    ) {
        self.extra_signals.iter_mut().for_each(|e| *e = 0);

        let weights: Vec<(usize, u32)> = incoming
            .iter()
            .filter_map(|&(jbb, jb)| {
                let free = jb.free_pages();
                if free <= CONGESTED {
                    Some((jbb, (CONGESTED - free + 1) as u32))
                } else {
                    None
                }
            })
            .collect();

        let total_weight: u32 = weights.iter().map(|&(_, w)| w).sum();
        if total_weight == 0 {
            return;
        }
        if total_extra_signals == 0 && max_signals_per_jb == 0 {
            for &(jbb, jb) in incoming {
                if !jb.is_empty() {
                    self.extra_signals[jbb] = 1;
                }
            }
            return;
        }
        for (jbb, w) in weights {
            self.extra_signals[jbb] = (total_extra_signals as u64 * w as u64 / total_weight as u64) as u32;
        }
    }

    /// `has_full_in_queues`: true iff some known-congested incoming JBB
    /// still has an extra quota left — the thread must keep draining it
    /// rather than yield, to avoid a circular wait.
    pub fn has_full_in_queues(&self) -> bool {
        self.extra_signals.iter().any(|&e| e > 0)
    }

    /// `get_congested_job_queue`: pick a thread (preferring `!= self`)
    /// whose outgoing job buffer to `self` is FULL, to use as a
    /// congestion-waiter target. `outgoing` maps thread index to whether
    /// this thread's queue into it is full.
    pub fn get_congested_job_queue(self_thread: usize, outgoing_full: &[bool]) -> Option<usize> {
        outgoing_full
            .iter()
            .enumerate()
            .filter(|&(_, &full)| full)
            .map(|(i, _)| i)
            .find(|&i| i != self_thread)
            .or_else(|| outgoing_full.iter().position(|&full| full))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{PagePool, ThreadLocalPageCache};
    use crate::signal::{Priority, Signal, SignalHeader};

    fn make_full_jb() -> JobBuffer {
        let pool = PagePool::new(1, None);
        let mut cache = ThreadLocalPageCache::new(0);
        let jb = JobBuffer::new(Priority::B, false, 0);
        let big = Signal::with_data(SignalHeader::new(1, 2, 1, 0), &[0u32; 25]);
        loop {
            if jb.insert(&big, &pool, &mut cache) == crate::job_buffer::InsertOutcome::Full {
                break;
            }
        }
        jb
    }

    #[test]
    fn extra_signals_are_zero_when_nothing_congested() {
        let jb = JobBuffer::new(Priority::B, false, 0);
        let mut cs = CongestionState::new(4);
        cs.prepare_congested_execution(&[(0, &jb)], 100, 75);
        assert_eq!(cs.extra_signals(0), 0);
        assert!(!cs.has_full_in_queues());
    }

    #[test]
    fn congested_queue_gets_proportional_extra_quota() {
        let full = make_full_jb();
        let half_full = JobBuffer::new(Priority::B, false, 0);
        let mut cs = CongestionState::new(4);
        cs.prepare_congested_execution(&[(0, &full), (1, &half_full)], 100, 75);
        assert!(cs.extra_signals(0) > 0);
        assert_eq!(cs.extra_signals(1), 0);
        assert!(cs.has_full_in_queues());
    }

    #[test]
    fn zero_budget_and_zero_own_quota_still_guarantees_one_per_populated_queue() {
        let full = make_full_jb();
        let mut cs = CongestionState::new(4);
        cs.prepare_congested_execution(&[(0, &full)], 0, 0);
        assert_eq!(cs.extra_signals(0), 1);
        assert!(cs.has_full_in_queues());
    }

    #[test]
    fn congested_queue_target_prefers_other_threads() {
        let mask = vec![true, true, false];
        assert_eq!(CongestionState::get_congested_job_queue(0, &mask), Some(1));
        let self_only = vec![true];
        assert_eq!(CongestionState::get_congested_job_queue(0, &self_only), Some(0));
    }
}
