// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The job buffer: a single-consumer, possibly-multi-producer ring of pages
// (JBB for priority-B signals, JBA for priority-A). The ring itself is the
// lock-free single-producer-single-consumer ring ported from the shared
// memory ring buffer used elsewhere in this codebase (acquire/release on
// the index pair, no lock on the read side); multi-producer configurations
// serialize publication with a spin lock, matching the original's
// `use_write_lock_mutex` switch.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::diag::LevelGauge;
use crate::page::{Page, PagePool};
use crate::signal::{Priority, Signal, SIGNAL_HEADER_WORDS};
use crate::spin_lock::SpinLock;

/// Fixed ring capacity, in pages, per job buffer.
pub const RING_SIZE: usize = 32;
/// Page header words: `{length, priority-A flag}`, at the start of every
/// job-buffer page.
const PAGE_HEADER_WORDS: usize = 2;
/// Data words available per job-buffer page (`PAGE_SIZE/4` minus the small
/// page header of length + priority-A flag).
pub const JOB_BUFFER_WORDS: usize = 8_190;

/// Free pages never consumed during normal operation.
pub const SAFETY: usize = 2;
/// Additional free pages consumed only to break wait-cycles.
pub const RESERVED: usize = 4;
/// Free-page threshold that triggers quota reduction in the congestion
/// controller.
pub const CONGESTED: usize = RESERVED + 4;

struct RingSlot {
    page: UnsafeCell<MaybeUninit<Page>>,
}

// Safety: a slot is written by at most one producer (serialized by
// `write_lock` when shared) and read by exactly one consumer; the
// write_idx/read_idx protocol below ensures no two parties touch a slot
// at the same time.
unsafe impl Sync for RingSlot {}

/// Lock-free ring of page handles. Capacity is always [`RING_SIZE`], a
/// power of two.
struct PageRing {
    slots: Box<[RingSlot]>,
    write_idx: AtomicUsize,
    read_idx: AtomicUsize,
}

impl PageRing {
    fn new() -> Self {
        let slots = (0..RING_SIZE)
            .map(|_| RingSlot {
                page: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            write_idx: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(0),
        }
    }

    fn mask(i: usize) -> usize {
        i & (RING_SIZE - 1)
    }

    /// Publish `page` into the next slot. Caller must already hold the
    /// job buffer's write lock when multiple producers share this ring.
    /// Returns the page back on failure (ring full).
    fn push(&self, page: Page) -> Result<(), Page> {
        let w = self.write_idx.load(Ordering::Relaxed);
        let r = self.read_idx.load(Ordering::Acquire);
        if w.wrapping_sub(r) >= RING_SIZE {
            return Err(page);
        }
        let slot = &self.slots[Self::mask(w)];
        unsafe {
            (*slot.page.get()).write(page);
        }
        // Release: consumer must see the written page before it sees the
        // advanced write_idx.
        self.write_idx.store(w.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Take the next page, if any. Single-consumer only.
    fn pop(&self) -> Option<Page> {
        let r = self.read_idx.load(Ordering::Relaxed);
        let w = self.write_idx.load(Ordering::Acquire);
        if r == w {
            return None;
        }
        let slot = &self.slots[Self::mask(r)];
        let page = unsafe { (*slot.page.get()).assume_init_read() };
        self.read_idx.store(r.wrapping_add(1), Ordering::Release);
        Some(page)
    }

    fn len(&self) -> usize {
        let w = self.write_idx.load(Ordering::Acquire);
        let r = self.read_idx.load(Ordering::Acquire);
        w.wrapping_sub(r)
    }

    fn free(&self) -> usize {
        RING_SIZE - self.len()
    }
}

impl Drop for PageRing {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

struct CurrentWriteBuffer {
    page: Option<Page>,
    len: usize,
}

/// A job buffer queue: JBB (priority-B, one of several per destination
/// thread) or JBA (priority-A, exactly one per thread). Producer side is
/// `insert`; consumer side is [`JobBufferConsumer`].
pub struct JobBuffer {
    ring: PageRing,
    current: Mutex<CurrentWriteBuffer>,
    /// Serializes the page-publish step when `shared` (multiple producer
    /// threads funnel into this same queue instance).
    write_lock: SpinLock,
    shared: bool,
    pending_signals: AtomicU32,
    priority: Priority,
    shard: usize,
    level_gauge: LevelGauge,
}

/// Outcome of a single `insert` call, used by the local signal stage and
/// scheduler primitives to decide whether to wake the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Ok,
    /// The queue is FULL (free pages ≤ RESERVED); caller must not retry
    /// without first consulting the congestion controller.
    Full,
}

impl JobBuffer {
    pub fn new(priority: Priority, shared: bool, shard: usize) -> Self {
        Self {
            ring: PageRing::new(),
            current: Mutex::new(CurrentWriteBuffer { page: None, len: 0 }),
            write_lock: SpinLock::new("jobbuffer_write_lock"),
            shared,
            pending_signals: AtomicU32::new(0),
            priority,
            shard,
            level_gauge: LevelGauge::new(),
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Free pages currently available in the ring (does not count the
    /// in-progress `current` page).
    pub fn free_pages(&self) -> usize {
        self.ring.free()
    }

    pub fn is_full(&self) -> bool {
        self.free_pages() <= RESERVED
    }

    pub fn is_congested(&self) -> bool {
        self.free_pages() <= CONGESTED
    }

    pub fn is_empty(&self) -> bool {
        self.ring.len() == 0
    }

    /// `get_estimated_job_buffer_level` (§10.4, `mt_getEstimatedJobBufferLevel`):
    /// pages currently occupied in the ring, plus whether that count
    /// changed since the last call. "Estimated" because a concurrent
    /// producer may publish or the consumer may drain between the read and
    /// the caller acting on it.
    pub fn get_estimated_job_buffer_level(&self) -> (usize, bool) {
        let used = RING_SIZE - self.free_pages();
        let (level, changed) = self.level_gauge.read(used as u32);
        (level as usize, changed)
    }

    pub fn pending_signals(&self) -> u32 {
        self.pending_signals.load(Ordering::Relaxed)
    }

    pub fn take_pending_signals(&self) -> u32 {
        self.pending_signals.swap(0, Ordering::Relaxed)
    }

    pub fn add_pending_signals(&self, n: u32) -> u32 {
        self.pending_signals.fetch_add(n, Ordering::Relaxed)
    }

    /// Copy `signal` into the producer-private write buffer, allocating a
    /// fresh page from `pool` (via `cache`) and publishing the current one
    /// when it would not fit. Returns [`InsertOutcome::Full`] if the ring
    /// has no room for the new page and no page could be allocated.
    pub fn insert(
        &self,
        signal: &Signal,
        pool: &PagePool,
        cache: &mut crate::page::ThreadLocalPageCache,
    ) -> InsertOutcome {
        if self.shared {
            self.write_lock.lock();
            let r = self.insert_locked(signal, pool, cache);
            self.write_lock.unlock();
            r
        } else {
            self.insert_locked(signal, pool, cache)
        }
    }

    fn insert_locked(
        &self,
        signal: &Signal,
        pool: &PagePool,
        cache: &mut crate::page::ThreadLocalPageCache,
    ) -> InsertOutcome {
        let words_needed = signal.footprint_words();
        let mut cur = self.current.lock().unwrap();
        if cur.page.is_none() {
            match cache.seize(pool).or_else(|| pool.seize(self.shard)) {
                Some(p) => {
                    cur.page = Some(p);
                    cur.len = 0;
                }
                None => return InsertOutcome::Full,
            }
        }
        if cur.len + words_needed > JOB_BUFFER_WORDS {
            if self.is_full() {
                return InsertOutcome::Full;
            }
            self.publish_current(&mut cur);
            match cache.seize(pool).or_else(|| pool.seize(self.shard)) {
                Some(p) => {
                    cur.page = Some(p);
                    cur.len = 0;
                }
                None => return InsertOutcome::Full,
            }
        }
        self.write_signal(cur.page.as_mut().unwrap(), cur.len, signal);
        cur.len += words_needed;
        InsertOutcome::Ok
    }

    fn write_signal(&self, page: &mut Page, at: usize, signal: &Signal) {
        let words = page.as_words_mut();
        let at = at + PAGE_HEADER_WORDS;
        let h = &signal.header;
        words[at] = h.sender_block_ref;
        words[at + 1] = (h.receiver_block_no as u32) << 16 | h.gsn as u32;
        words[at + 2] = h.length as u32;
        words[at + 3] = h.section_count as u32;
        words[at + 4] = h.trace as u32;
        words[at + 5] = h.signal_id;
        words[at + 6] = 0; // reserved header word, keeps SIGNAL_HEADER_WORDS == 7
        let data_start = at + SIGNAL_HEADER_WORDS;
        words[data_start..data_start + h.length as usize]
            .copy_from_slice(signal.data_words());
        let sec_start = data_start + h.length as usize;
        words[sec_start..sec_start + h.section_count as usize]
            .copy_from_slice(signal.sections_used());
    }

    fn publish_current(&self, cur: &mut CurrentWriteBuffer) {
        if let Some(mut page) = cur.page.take() {
            // A write barrier would precede the length store in the
            // original; here the Release on `ring.push`'s write_idx store
            // already orders the page's contents before the index becomes
            // visible, so no separate fence is required.
            let words = page.as_words_mut();
            words[0] = cur.len as u32;
            words[1] = (self.priority == Priority::A) as u32;
            let _ = self.ring.push(page);
        }
        cur.len = 0;
    }

    /// Force-publish whatever is in the current write buffer, even if
    /// empty-ish, so the consumer can make progress. Used at end-of-round
    /// flush points.
    pub fn flush(&self) {
        let mut cur = self.current.lock().unwrap();
        if cur.page.is_some() && cur.len > 0 {
            self.publish_current(&mut cur);
        }
    }
}

/// Per-consumer-thread read cursor into a [`JobBuffer`]. Not `Sync`: only
/// the owning block thread may use it, matching the single-consumer
/// contract.
pub struct JobBufferConsumer {
    page: Option<Page>,
    pos: usize,
    end: usize,
}

impl JobBufferConsumer {
    pub fn new() -> Self {
        Self {
            page: None,
            pos: 0,
            end: 0,
        }
    }

    /// Execute up to `max` signals from `jb`, calling `f(signal)` for each.
    /// Returns the number executed. Crossing into a new page releases the
    /// old one to `cache` and returns `released_page = true` via the
    /// out-parameter effect captured by the caller through `on_page_free`.
    pub fn run<F, G>(
        &mut self,
        jb: &JobBuffer,
        pool: &PagePool,
        cache: &mut crate::page::ThreadLocalPageCache,
        max: usize,
        mut f: F,
        mut on_page_free: G,
    ) -> usize
    where
        F: FnMut(&Signal),
        G: FnMut(),
    {
        let mut executed = 0;
        while executed < max {
            if self.page.is_none() || self.pos >= self.end {
                if let Some(old) = self.page.take() {
                    cache.release(pool, old);
                    on_page_free();
                }
                match jb.ring.pop() {
                    Some(p) => {
                        self.end = Self::page_len_words(&p);
                        self.pos = PAGE_HEADER_WORDS;
                        self.page = Some(p);
                    }
                    None => break,
                }
            }
            let page = self.page.as_ref().unwrap();
            let (signal, words) = Self::read_signal(page, self.pos);
            f(&signal);
            self.pos += words;
            executed += 1;
        }
        executed
    }

    fn page_len_words(page: &Page) -> usize {
        // Page header word 0 holds the data-area length in words, written
        // by `JobBuffer::publish_current`.
        let words = page.as_words();
        PAGE_HEADER_WORDS + words[0] as usize
    }

    fn read_signal(page: &Page, at: usize) -> (Signal, usize) {
        // `at` is an absolute word index into the page, already past the
        // page header (see `run`, which seeds `pos` at `PAGE_HEADER_WORDS`).
        let words = page.as_words();
        let sender_block_ref = words[at];
        let packed = words[at + 1];
        let receiver_block_no = (packed >> 16) as u16;
        let gsn = (packed & 0xFFFF) as u16;
        let length = words[at + 2] as u16;
        let section_count = words[at + 3] as u8;
        let trace = words[at + 4] != 0;
        let signal_id = words[at + 5];
        let header = crate::signal::SignalHeader {
            sender_block_ref,
            receiver_block_no,
            gsn,
            length,
            section_count,
            trace,
            signal_id,
        };
        let mut signal = Signal::new(header);
        let data_start = at + SIGNAL_HEADER_WORDS;
        signal.data[..length as usize].copy_from_slice(&words[data_start..data_start + length as usize]);
        let sec_start = data_start + length as usize;
        signal.sections[..section_count as usize]
            .copy_from_slice(&words[sec_start..sec_start + section_count as usize]);
        let raw = SIGNAL_HEADER_WORDS + length as usize + section_count as usize;
        (signal, raw + (raw & 1))
    }
}

impl Default for JobBufferConsumer {
    fn default() -> Self {
        Self::new()
    }
}
