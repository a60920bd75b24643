// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Local signal stage: a per-producer-thread page holding, for every
// possible destination thread, an intrusive singly-linked list of pending
// signals threaded through a one-word "next" field. Batches small bursts
// of outgoing traffic before copying them into the destination's job
// buffer, trading a little latency for many fewer job-buffer-lock
// acquisitions.

use crate::job_buffer::{InsertOutcome, JobBuffer};
use crate::page::{Page, PagePool, ThreadLocalPageCache};
use crate::signal::{Signal, SignalHeader, SIGNAL_HEADER_WORDS, SIGNAL_RNIL};

/// Destination-local queue count that triggers an immediate single-destination flush.
pub const MAX_SIGNALS_BEFORE_FLUSH_OTHER: u32 = 20;
/// Same trigger, but tighter for destinations that are receive threads
/// (kept low to bound receive-path latency).
pub const MAX_SIGNALS_BEFORE_FLUSH_RECEIVER: u32 = 2;
/// Total local-buffer occupancy (in words) that triggers a flush of every
/// destination with pending signals.
pub const MAX_LOCAL_BUFFER_USAGE: usize = 8_140;
/// Cumulative pending-signal count on a destination job buffer (summed
/// across all producers) that forces an immediate wakeup instead of a
/// deferred one.
pub const MAX_SIGNALS_BEFORE_WAKEUP: u32 = 128;

const NEXT_WORD: usize = 1;

#[derive(Clone, Copy)]
struct DestCursor {
    first: u32,
    last: u32,
    count: u32,
}

impl DestCursor {
    const EMPTY: Self = Self {
        first: SIGNAL_RNIL,
        last: SIGNAL_RNIL,
        count: 0,
    };
}

/// What to do with a destination after an insert, decided by
/// [`LocalStage::insert_local_signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    None,
    FlushDestination(usize),
    FlushAll,
}

pub struct LocalStage {
    local_buffer: Page,
    next_buffer: Page,
    len: usize,
    dests: Vec<DestCursor>,
    /// Destinations that still need waking before this producer thread
    /// yields (deferred wakeup path).
    wake_pending: Vec<bool>,
}

impl LocalStage {
    pub fn new(num_threads: usize) -> Self {
        Self {
            local_buffer: Page::default_zeroed(),
            next_buffer: Page::default_zeroed(),
            len: 0,
            dests: vec![DestCursor::EMPTY; num_threads],
            wake_pending: vec![false; num_threads],
        }
    }

    fn footprint(signal: &Signal) -> usize {
        let raw = NEXT_WORD + signal.footprint_words();
        raw + (raw & 1)
    }

    /// Append `signal` to destination `dest`'s list. Returns the flush
    /// decision the caller must act on.
    pub fn insert_local_signal(&mut self, dest: usize, signal: &Signal, is_receiver: bool) -> FlushDecision {
        let at = self.len;
        let words = Self::footprint(signal);
        self.write_record(at, signal);
        let cursor = &mut self.dests[dest];
        if cursor.last != SIGNAL_RNIL {
            self.local_buffer.as_words_mut()[cursor.last as usize] = at as u32;
        } else {
            cursor.first = at as u32;
        }
        cursor.last = at as u32;
        cursor.count += 1;
        self.len += words;

        let threshold = if is_receiver {
            MAX_SIGNALS_BEFORE_FLUSH_RECEIVER
        } else {
            MAX_SIGNALS_BEFORE_FLUSH_OTHER
        };
        if self.dests[dest].count >= threshold {
            FlushDecision::FlushDestination(dest)
        } else if self.len > MAX_LOCAL_BUFFER_USAGE {
            FlushDecision::FlushAll
        } else {
            FlushDecision::None
        }
    }

    fn write_record(&mut self, at: usize, signal: &Signal) {
        let words = self.local_buffer.as_words_mut();
        words[at] = SIGNAL_RNIL;
        let h = &signal.header;
        let base = at + NEXT_WORD;
        words[base] = h.sender_block_ref;
        words[base + 1] = (h.receiver_block_no as u32) << 16 | h.gsn as u32;
        words[base + 2] = h.length as u32;
        words[base + 3] = h.section_count as u32;
        words[base + 4] = h.trace as u32;
        words[base + 5] = h.signal_id;
        words[base + 6] = 0;
        let data_start = base + SIGNAL_HEADER_WORDS;
        words[data_start..data_start + h.length as usize].copy_from_slice(signal.data_words());
        let sec_start = data_start + h.length as usize;
        words[sec_start..sec_start + h.section_count as usize]
            .copy_from_slice(signal.sections_used());
    }

    fn read_record(&self, at: usize) -> (Signal, u32) {
        let words = self.local_buffer.as_words();
        let next = words[at];
        let base = at + NEXT_WORD;
        let sender_block_ref = words[base];
        let packed = words[base + 1];
        let receiver_block_no = (packed >> 16) as u16;
        let gsn = (packed & 0xFFFF) as u16;
        let length = words[base + 2] as u16;
        let section_count = words[base + 3] as u8;
        let trace = words[base + 4] != 0;
        let signal_id = words[base + 5];
        let header = SignalHeader {
            sender_block_ref,
            receiver_block_no,
            gsn,
            length,
            section_count,
            trace,
            signal_id,
        };
        let mut signal = Signal::new(header);
        let data_start = base + SIGNAL_HEADER_WORDS;
        signal.data[..length as usize].copy_from_slice(&words[data_start..data_start + length as usize]);
        let sec_start = data_start + length as usize;
        signal.sections[..section_count as usize]
            .copy_from_slice(&words[sec_start..sec_start + section_count as usize]);
        (signal, next)
    }

    /// Copy every signal queued for `dest` into `jb`, in order, then clear
    /// the destination's cursor. Returns the number of signals flushed and
    /// the cumulative pending-signal count on `jb` after this flush, so
    /// the caller can decide between an immediate wakeup
    /// (≥ [`MAX_SIGNALS_BEFORE_WAKEUP`]) and a deferred one.
    pub fn flush_destination(
        &mut self,
        dest: usize,
        jb: &JobBuffer,
        pool: &PagePool,
        cache: &mut ThreadLocalPageCache,
    ) -> (u32, u32) {
        let mut flushed = 0u32;
        let mut cursor = self.dests[dest].first;
        while cursor != SIGNAL_RNIL {
            let (signal, next) = self.read_record(cursor as usize);
            // Back-pressure at this layer is handled by the congestion
            // controller upstream; a Full result here just stops this
            // flush early, leaving the remainder queued for next time.
            if jb.insert(&signal, pool, cache) == InsertOutcome::Full {
                break;
            }
            flushed += 1;
            cursor = next;
        }
        jb.flush();
        if flushed > 0 {
            // Drop the flushed prefix; any remainder (from a Full result)
            // stays linked starting at `cursor`.
            self.dests[dest].first = cursor;
            if cursor == SIGNAL_RNIL {
                self.dests[dest].last = SIGNAL_RNIL;
                self.dests[dest].count = 0;
            } else {
                self.dests[dest].count -= flushed;
            }
        }
        let pending = jb.add_pending_signals(flushed) + flushed;
        if pending >= MAX_SIGNALS_BEFORE_WAKEUP {
            jb.take_pending_signals();
            (flushed, pending)
        } else {
            self.wake_pending[dest] = true;
            (flushed, 0)
        }
    }

    /// Flush every destination with pending signals.
    pub fn flush_all<'a>(
        &mut self,
        job_buffers: impl Iterator<Item = (usize, &'a JobBuffer)>,
        pool: &PagePool,
        cache: &mut ThreadLocalPageCache,
    ) -> Vec<(usize, u32)> {
        let mut woken = Vec::new();
        for (dest, jb) in job_buffers {
            if self.dests[dest].count == 0 {
                continue;
            }
            let (_flushed, pending) = self.flush_destination(dest, jb, pool, cache);
            if pending > 0 {
                woken.push((dest, pending));
            }
        }
        self.pack_if_fragmented();
        woken
    }

    pub fn is_clear(&self) -> bool {
        self.dests.iter().all(|c| c.count == 0)
    }

    pub fn local_buffer_len(&self) -> usize {
        self.len
    }

    /// Drain destinations marked for a deferred wakeup (set when a flush
    /// did not reach [`MAX_SIGNALS_BEFORE_WAKEUP`]).
    pub fn take_wake_pending(&mut self) -> Vec<usize> {
        let mut out = Vec::new();
        for (i, w) in self.wake_pending.iter_mut().enumerate() {
            if *w {
                *w = false;
                out.push(i);
            }
        }
        out
    }

    /// Rewrite all still-pending signals into `next_buffer`, then swap it
    /// in as the new `local_buffer`. Used when repeated partial flushes
    /// have fragmented the buffer enough that a future insert might not
    /// find contiguous room, even though total occupancy is low.
    fn pack_if_fragmented(&mut self) {
        if self.is_clear() {
            self.len = 0;
            return;
        }
        let mut new_len = 0usize;
        let mut new_cursors = vec![DestCursor::EMPTY; self.dests.len()];
        for dest in 0..self.dests.len() {
            let mut cursor = self.dests[dest].first;
            while cursor != SIGNAL_RNIL {
                let (signal, next) = self.read_record(cursor as usize);
                let at = new_len;
                let words = Self::footprint(&signal);
                Self::write_record_into(&mut self.next_buffer, at, &signal);
                let c = &mut new_cursors[dest];
                if c.last != SIGNAL_RNIL {
                    self.next_buffer.as_words_mut()[c.last as usize] = at as u32;
                } else {
                    c.first = at as u32;
                }
                c.last = at as u32;
                c.count += 1;
                new_len += words;
                cursor = next;
            }
        }
        std::mem::swap(&mut self.local_buffer, &mut self.next_buffer);
        self.dests = new_cursors;
        self.len = new_len;
    }

    fn write_record_into(buf: &mut Page, at: usize, signal: &Signal) {
        let words = buf.as_words_mut();
        words[at] = SIGNAL_RNIL;
        let h = &signal.header;
        let base = at + NEXT_WORD;
        words[base] = h.sender_block_ref;
        words[base + 1] = (h.receiver_block_no as u32) << 16 | h.gsn as u32;
        words[base + 2] = h.length as u32;
        words[base + 3] = h.section_count as u32;
        words[base + 4] = h.trace as u32;
        words[base + 5] = h.signal_id;
        words[base + 6] = 0;
        let data_start = base + SIGNAL_HEADER_WORDS;
        words[data_start..data_start + h.length as usize].copy_from_slice(signal.data_words());
        let sec_start = data_start + h.length as usize;
        words[sec_start..sec_start + h.section_count as usize]
            .copy_from_slice(signal.sections_used());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Priority;

    fn mk_signal(id: u32) -> Signal {
        Signal::with_data(SignalHeader::new(1, 2, 42, id), &[id, id + 1])
    }

    #[test]
    fn fifo_order_preserved_through_flush() {
        let pool = PagePool::new(1, None);
        let mut cache = ThreadLocalPageCache::new(0);
        let mut stage = LocalStage::new(4);
        let jb = JobBuffer::new(Priority::B, false, 0);

        for i in 1..=10u32 {
            stage.insert_local_signal(1, &mk_signal(i), false);
        }
        stage.flush_destination(1, &jb, &pool, &mut cache);
        assert!(stage.is_clear());

        let mut consumer = crate::job_buffer::JobBufferConsumer::new();
        let mut cons_cache = ThreadLocalPageCache::new(0);
        let mut seen = Vec::new();
        consumer.run(&jb, &pool, &mut cons_cache, 100, |s| seen.push(s.header.signal_id), || {});
        assert_eq!(seen, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn flush_other_threshold_triggers_at_twenty() {
        let mut stage = LocalStage::new(4);
        let mut last = FlushDecision::None;
        for i in 1..=20u32 {
            last = stage.insert_local_signal(0, &mk_signal(i), false);
        }
        assert_eq!(last, FlushDecision::FlushDestination(0));
    }

    #[test]
    fn receiver_threshold_is_tighter() {
        let mut stage = LocalStage::new(4);
        stage.insert_local_signal(0, &mk_signal(1), true);
        let d = stage.insert_local_signal(0, &mk_signal(2), true);
        assert_eq!(d, FlushDecision::FlushDestination(0));
    }

    #[test]
    fn clear_stage_flush_all_is_noop() {
        let pool = PagePool::new(1, None);
        let mut cache = ThreadLocalPageCache::new(0);
        let mut stage = LocalStage::new(4);
        let jb = JobBuffer::new(Priority::B, false, 0);
        let woken = stage.flush_all(std::iter::once((0usize, &jb)), &pool, &mut cache);
        assert!(woken.is_empty());
        assert_eq!(stage.local_buffer_len(), 0);
    }
}
