// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-block-thread delayed-signal queue: a FIFO "zero" queue for signals
// that should fire on the very next scan, and two alarm-sorted queues
// (short: < 100ms out, long: >= 100ms out) split so the common
// short-delay case doesn't pay to scan far-future entries. Alarms are a
// 15-bit millisecond counter that wraps at `TICK_WRAP`; `handle_time_wrap`
// keeps every queued alarm consistent with the wrapped clock.

use crate::signal::Signal;

/// Alarms live in `0..=TICK_WRAP`. On wrap, every alarm (and the clock
/// itself) is reduced by `TICK_WRAP`.
pub const TICK_WRAP: u32 = 32_767;

pub const ZQ_SIZE: usize = 256;
pub const SQ_SIZE: usize = 512;
pub const LQ_SIZE: usize = 512;

/// Delay value requesting the zero queue: "as soon as possible", no alarm
/// ordering relative to other zero-queue entries beyond arrival order.
pub const BOUNDED_DELAY: u32 = u32::MAX;

/// A scan step never advances the clock by more than this in one call,
/// so a long pause between calls can't flood the consumer with a single
/// giant batch of expired alarms.
const MAX_STEP_MS: u32 = 20;
/// A gap this large between calls is logged as an oversleep and the
/// clock is allowed to fall behind rather than try to catch up.
const OVERSLEEP_MS: u32 = 1_500;
/// After an oversleep, ticks are reset to `now - CATCHUP_SLACK_MS` rather
/// than `now`, so the scan still processes the most recent second of
/// alarms instead of silently dropping them.
const CATCHUP_SLACK_MS: u32 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeQueueError {
    Full,
}

struct ShortEntry {
    alarm: u32,
    dest_thread: usize,
    signal: Signal,
}

/// Delayed-signal queue owned by a single block thread. Not `Sync`: only
/// the owning thread enqueues (via `senddelay`) and scans it.
///
/// `ticks` is the 15-bit alarm-space clock that wraps at `TICK_WRAP`;
/// `wall_ref_ms` is the last `now_ms` the caller reported, kept in the
/// caller's own (non-wrapping) millisecond domain so a gap between two
/// `scan_time_queues` calls can be measured without the wraparound
/// arithmetic leaking into the caller's clock source.
pub struct TimeQueue {
    zero: std::collections::VecDeque<(usize, Signal)>,
    short: Vec<ShortEntry>,
    long: Vec<ShortEntry>,
    ticks: u32,
    wall_ref_ms: u32,
}

impl TimeQueue {
    pub fn new(now_ms: u32) -> Self {
        Self {
            zero: std::collections::VecDeque::new(),
            short: Vec::new(),
            long: Vec::new(),
            ticks: now_ms % (TICK_WRAP + 1),
            wall_ref_ms: now_ms,
        }
    }

    pub fn ticks(&self) -> u32 {
        self.ticks
    }

    /// `senddelay(thr, sig, delay)`: queue `signal` for delivery to
    /// `dest_thread` after `delay_ms`, or immediately on the next scan if
    /// `delay_ms == BOUNDED_DELAY`.
    pub fn senddelay(
        &mut self,
        dest_thread: usize,
        signal: Signal,
        delay_ms: u32,
    ) -> Result<(), TimeQueueError> {
        if delay_ms == BOUNDED_DELAY {
            if self.zero.len() >= ZQ_SIZE {
                return Err(TimeQueueError::Full);
            }
            self.zero.push_back((dest_thread, signal));
            return Ok(());
        }
        // Not reduced modulo `TICK_WRAP` here: a long-queue delay can
        // legitimately place the alarm well beyond the current wrap
        // period. `handle_time_wrap` keeps every stored alarm consistent
        // with `ticks` by reducing both uniformly as the clock catches up.
        let alarm = self.ticks + delay_ms;
        let entry = ShortEntry { alarm, dest_thread, signal };
        let (queue, limit) = if delay_ms < 100 {
            (&mut self.short, SQ_SIZE)
        } else {
            (&mut self.long, LQ_SIZE)
        };
        if queue.len() >= limit {
            return Err(TimeQueueError::Full);
        }
        let pos = queue.partition_point(|e| e.alarm <= alarm);
        queue.insert(pos, entry);
        Ok(())
    }

    /// Reduce the clock and every queued alarm by `TICK_WRAP`. Called
    /// whenever `ticks` would otherwise exceed `TICK_WRAP`.
    fn handle_time_wrap(&mut self) {
        self.ticks = self.ticks.saturating_sub(TICK_WRAP);
        for e in self.short.iter_mut().chain(self.long.iter_mut()) {
            e.alarm = e.alarm.saturating_sub(TICK_WRAP);
        }
    }

    /// Drain every zero-queue entry and every short/long entry whose
    /// alarm has reached `end`, delivering each as a priority-A signal via
    /// `deliver`. Zero queue is always drained in full; short/long are
    /// drained from the front since both are kept sorted ascending.
    fn scan_queue(&mut self, end: u32, deliver: &mut impl FnMut(usize, Signal)) {
        while let Some((dest, sig)) = self.zero.pop_front() {
            deliver(dest, sig);
        }
        for queue in [&mut self.short, &mut self.long] {
            let cut = queue.partition_point(|e| e.alarm <= end);
            for e in queue.drain(..cut) {
                deliver(e.dest_thread, e.signal);
            }
        }
    }

    /// Drain only the zero queue, touching neither `ticks` nor
    /// `wall_ref_ms`. Used by the mid-round zero-queue rescan (every 100
    /// signals executed, per SPEC_FULL.md §4.10), which must not re-enter
    /// the wall-clock-driven `scan_time_queues`: `ticks` is the wrapped
    /// alarm-space clock, not a wall-clock millisecond, and feeding it back
    /// in as `now_ms` would spuriously trip the backwards-clock branch
    /// every time the two clocks have diverged (every wrap, or after an
    /// oversleep).
    pub fn scan_zero_queue(&mut self, deliver: &mut impl FnMut(usize, Signal)) {
        while let Some((dest, sig)) = self.zero.pop_front() {
            deliver(dest, sig);
        }
    }

    /// Advance the queue's clock to `now_ms`, stepping by at most
    /// `MAX_STEP_MS` per internal step and delivering every alarm that
    /// expires along the way via `deliver`. Handles clock wraparound,
    /// backwards-moving clocks, and oversleep (a gap wide enough that the
    /// scheduler was not scheduled for a long time) by logging and
    /// accepting a lag rather than trying to catch up immediately.
    pub fn scan_time_queues(&mut self, now_ms: u32, deliver: &mut impl FnMut(usize, Signal)) {
        if now_ms < self.wall_ref_ms {
            log::warn!(
                "scheduler clock moved backwards: ticks={} now={now_ms}",
                self.wall_ref_ms
            );
            self.wall_ref_ms = now_ms;
            self.ticks = now_ms % (TICK_WRAP + 1);
            self.scan_queue(self.ticks, deliver);
            return;
        }
        let mut diff = now_ms - self.wall_ref_ms;
        if diff > OVERSLEEP_MS {
            log::warn!("oversleep: {diff}ms since last scan");
            self.wall_ref_ms = now_ms.saturating_sub(CATCHUP_SLACK_MS);
            // `ticks` must move with `wall_ref_ms` here, not just the wall
            // reference: leaving `ticks` behind would desync the two
            // clocks by the skipped gap permanently (every later call
            // would see `ticks` trailing `wall_ref_ms` by that amount,
            // which looks identical to a backwards clock jump to anyone
            // comparing them, e.g. a naive zero-queue rescan).
            self.ticks = self.wall_ref_ms % (TICK_WRAP + 1);
            diff = now_ms - self.wall_ref_ms;
        }
        if diff == 0 {
            // Zero queue is scanned unconditionally even if the clock has
            // not moved at all since the previous call.
            self.scan_queue(self.ticks, deliver);
            return;
        }
        while diff > 0 {
            let step = diff.min(MAX_STEP_MS);
            self.ticks += step;
            self.wall_ref_ms += step;
            if self.ticks > TICK_WRAP {
                self.handle_time_wrap();
            }
            self.scan_queue(self.ticks, deliver);
            diff -= step;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.zero.is_empty() && self.short.is_empty() && self.long.is_empty()
    }

    pub fn len(&self) -> usize {
        self.zero.len() + self.short.len() + self.long.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalHeader;

    fn sig(id: u32) -> Signal {
        Signal::new(SignalHeader::new(1, 2, 9, id))
    }

    #[test]
    fn zero_queue_is_fifo_and_fires_every_scan() {
        let mut tq = TimeQueue::new(0);
        tq.senddelay(1, sig(1), BOUNDED_DELAY).unwrap();
        tq.senddelay(1, sig(2), BOUNDED_DELAY).unwrap();
        let mut delivered = Vec::new();
        tq.scan_time_queues(0, &mut |_d, s| delivered.push(s.header.signal_id));
        assert_eq!(delivered, vec![1, 2]);
    }

    #[test]
    fn short_queue_delivers_in_alarm_order_regardless_of_insertion_order() {
        let mut tq = TimeQueue::new(0);
        tq.senddelay(1, sig(30), 30).unwrap();
        tq.senddelay(1, sig(10), 10).unwrap();
        tq.senddelay(1, sig(20), 20).unwrap();
        let mut delivered = Vec::new();
        tq.scan_time_queues(40, &mut |_d, s| delivered.push(s.header.signal_id));
        assert_eq!(delivered, vec![10, 20, 30]);
    }

    #[test]
    fn entries_with_alarm_beyond_scan_horizon_stay_queued() {
        let mut tq = TimeQueue::new(0);
        tq.senddelay(1, sig(100), 100).unwrap();
        let mut delivered = Vec::new();
        tq.scan_time_queues(10, &mut |_d, s| delivered.push(s.header.signal_id));
        assert!(delivered.is_empty());
        assert_eq!(tq.len(), 1);
    }

    #[test]
    fn full_short_queue_rejects_further_inserts() {
        let mut tq = TimeQueue::new(0);
        for i in 0..SQ_SIZE as u32 {
            tq.senddelay(1, sig(i), 50).unwrap();
        }
        assert_eq!(tq.senddelay(1, sig(9999), 50), Err(TimeQueueError::Full));
    }

    #[test]
    fn clock_moving_backwards_is_accepted_without_panicking() {
        let mut tq = TimeQueue::new(1000);
        let mut delivered = Vec::new();
        tq.scan_time_queues(500, &mut |_d, s| delivered.push(s.header.signal_id));
        assert_eq!(tq.ticks(), 500);
    }

    #[test]
    fn oversleep_resets_ticks_instead_of_catching_up_fully() {
        let mut tq = TimeQueue::new(0);
        tq.senddelay(1, sig(1), 10).unwrap();
        let mut delivered = Vec::new();
        tq.scan_time_queues(OVERSLEEP_MS + 100, &mut |_d, s| delivered.push(s.header.signal_id));
        assert_eq!(delivered, vec![1]);
        assert_eq!(tq.ticks(), OVERSLEEP_MS + 100);
    }

    #[test]
    fn wraparound_keeps_relative_alarm_ordering() {
        let mut tq = TimeQueue::new(TICK_WRAP - 5);
        tq.senddelay(1, sig(1), 10).unwrap(); // alarm wraps past TICK_WRAP
        let mut delivered = Vec::new();
        tq.scan_time_queues(TICK_WRAP + 20, &mut |_d, s| delivered.push(s.header.signal_id));
        assert_eq!(delivered, vec![1]);
    }
}
