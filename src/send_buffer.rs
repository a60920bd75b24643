// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-transporter send buffer. Each producer thread writes into its own
// page-backed staging ring (no lock on the writer's hot path);
// `link_thread_send_buffers` drains every thread's ring into the
// transporter's shared `buffered` list under `buffer_lock`, and the
// transporter's own send path splices `buffered` onto `sending` under
// `send_lock` before handing iovecs to the network layer. The two locks
// are taken in `send_lock`-then-`buffer_lock` order whenever both are
// needed, so a send in progress is never blocked behind a writer that is
// merely publishing a filled page.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::diag::LevelGauge;
use crate::page::{Page, PagePool, PAGE_SIZE};
use crate::spin_lock::SpinLock;

/// Packet-size optimisation threshold (§4.9): below this many buffered
/// bytes, a configured `max_send_delay` defers the send instead of
/// writing a near-empty packet.
pub const MAX_SEND_BUFFER_SIZE_TO_DELAY: usize = 20 * 1024;

struct SendPage {
    page: Page,
    /// Bytes written so far (the high-water mark within `page`).
    bytes: usize,
    /// Bytes already consumed from the front, once this page has moved
    /// into the `sending` list.
    start: usize,
}

impl SendPage {
    fn remaining(&self) -> usize {
        self.bytes - self.start
    }
}

/// Per-(thread, transporter) write side. Owned exclusively by the block
/// thread that writes to it; never touched by another thread, so its
/// hot path (`get_write_ptr`/`update_write_ptr`) needs no lock.
pub struct SendBufferWriter {
    shard: usize,
    current: Option<SendPage>,
    /// Pages handed off to the transporter's `buffered` list but not yet
    /// collected by `link_thread_send_buffers`.
    ready: Mutex<VecDeque<SendPage>>,
}

impl SendBufferWriter {
    pub fn new(shard: usize) -> Self {
        Self {
            shard,
            current: None,
            ready: Mutex::new(VecDeque::new()),
        }
    }

    /// Return a byte range of length `len` to write into, allocating or
    /// rolling over the current page as needed. `None` means no page
    /// could be allocated (`SendStatus::BufferFull` at the caller).
    pub fn get_write_ptr(&mut self, pool: &PagePool, len: usize) -> Option<(usize, usize)> {
        assert!(len <= PAGE_SIZE, "send chunk larger than a page");
        if let Some(cur) = &self.current {
            if cur.bytes + len <= PAGE_SIZE {
                let at = cur.bytes;
                return Some((at, len));
            }
            self.flush_current();
        }
        let page = pool.seize(self.shard)?;
        self.current = Some(SendPage { page, bytes: 0, start: 0 });
        Some((0, len))
    }

    /// Byte slice backing a previous `get_write_ptr` call, for the caller
    /// to write into directly.
    pub fn write_slice(&mut self, at: usize, len: usize) -> &mut [u8] {
        &mut self.current.as_mut().unwrap().page.as_bytes_mut()[at..at + len]
    }

    /// Record that the caller finished writing `len` bytes at the offset
    /// returned by the matching `get_write_ptr`.
    pub fn update_write_ptr(&mut self, len: usize) {
        self.current.as_mut().unwrap().bytes += len;
    }

    /// Publish the current page into this writer's ready queue for
    /// `link_thread_send_buffers` to collect. A no-op if there is no
    /// current page or it is empty.
    fn flush_current(&mut self) {
        if let Some(p) = self.current.take() {
            if p.bytes > 0 {
                self.ready.lock().unwrap().push_back(p);
            }
        }
    }

    pub fn flush(&mut self) {
        self.flush_current();
    }
}

/// A transporter's send buffer: the two-stage `buffered`/`sending` list
/// plus the force-send flag protocol.
pub struct SendBuffer {
    buffer_lock: SpinLock,
    send_lock: SpinLock,
    enabled: AtomicBool,
    force_send: AtomicBool,
    buffered: Mutex<VecDeque<SendPage>>,
    sending: Mutex<VecDeque<SendPage>>,
    buffered_size: AtomicUsize,
    sending_size: AtomicUsize,
    level_gauge: LevelGauge,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self {
            buffer_lock: SpinLock::new("send_buffer_lock"),
            send_lock: SpinLock::new("send_lock"),
            enabled: AtomicBool::new(true),
            force_send: AtomicBool::new(false),
            buffered: Mutex::new(VecDeque::new()),
            sending: Mutex::new(VecDeque::new()),
            buffered_size: AtomicUsize::new(0),
            sending_size: AtomicUsize::new(0),
            level_gauge: LevelGauge::new(),
        }
    }

    pub fn buffered_size(&self) -> usize {
        self.buffered_size.load(Ordering::Relaxed)
    }

    pub fn sending_size(&self) -> usize {
        self.sending_size.load(Ordering::Relaxed)
    }

    /// `get_send_buffer_level` (§10.4, `mt_getSendBufferLevel`): total bytes
    /// queued for this transporter (buffered plus in-flight), plus whether
    /// that total changed since the last call.
    pub fn get_send_buffer_level(&self) -> (usize, bool) {
        let total = self.buffered_size() + self.sending_size();
        let (level, changed) = self.level_gauge.read(total as u32);
        (level as usize, changed)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Collect every ready page from each of this transporter's writer
    /// threads into `buffered`. Called under `buffer_lock`.
    pub fn link_thread_send_buffers(&self, writers: &[&SendBufferWriter]) {
        self.buffer_lock.lock();
        let mut buffered = self.buffered.lock().unwrap();
        for w in writers {
            let mut ready = w.ready.lock().unwrap();
            while let Some(p) = ready.pop_front() {
                self.buffered_size.fetch_add(p.remaining(), Ordering::Relaxed);
                buffered.push_back(p);
            }
        }
        drop(buffered);
        self.buffer_lock.unlock();
    }

    /// Fill `iov` (as `(pointer-stable byte slice)` handles represented
    /// here by owned `Vec<u8>` copies, since the real transporter callback
    /// would borrow directly from the page) with up to `max` chunks ready
    /// to send. Links and splices first. Returns the chunks.
    pub fn get_bytes_to_send_iovec(&self, writers: &[&SendBufferWriter], max: usize) -> Vec<Vec<u8>> {
        self.send_lock.lock();
        self.link_thread_send_buffers(writers);

        {
            let mut buffered = self.buffered.lock().unwrap();
            let mut sending = self.sending.lock().unwrap();
            while let Some(p) = buffered.pop_front() {
                sending.push_back(p);
            }
            self.sending_size
                .store(self.sending_size.load(Ordering::Relaxed) + self.buffered_size.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        }

        let mut out = Vec::new();
        {
            let sending = self.sending.lock().unwrap();
            for p in sending.iter().take(max) {
                out.push(p.page.as_bytes()[p.start..p.bytes].to_vec());
            }
        }
        let total: usize = out.iter().map(|v| v.len()).sum();
        if out.len() >= max && total < PAGE_SIZE / 4 {
            drop(out);
            self.pack_sb_pages();
            let sending = self.sending.lock().unwrap();
            let mut out = Vec::new();
            for p in sending.iter().take(max) {
                out.push(p.page.as_bytes()[p.start..p.bytes].to_vec());
            }
            self.send_lock.unlock();
            return out;
        }

        self.send_lock.unlock();
        out
    }

    /// Merge adjacent pages in `sending` whose combined content fits one
    /// page, reducing iovec pressure. Called under `send_lock`.
    fn pack_sb_pages(&self) {
        let mut sending = self.sending.lock().unwrap();
        let mut merged: VecDeque<SendPage> = VecDeque::new();
        while let Some(next) = sending.pop_front() {
            if let Some(prev) = merged.back_mut() {
                let prev_remaining = prev.remaining();
                let next_remaining = next.remaining();
                if prev_remaining + next_remaining <= PAGE_SIZE {
                    let (dst, src_off) = (prev.bytes, next.start);
                    let src = next.page.as_bytes()[src_off..next.bytes].to_vec();
                    prev.page.as_bytes_mut()[dst..dst + src.len()].copy_from_slice(&src);
                    prev.bytes += src.len();
                    continue;
                }
            }
            // Not merged into `prev`: keep `start` as-is. It may already
            // be non-zero from a prior `bytes_sent` partial-consume;
            // resetting it to 0 here would re-expose bytes already on the
            // wire and duplicate them on the next iovec fill.
            merged.push_back(next);
        }
        *sending = merged;
    }

    /// Report that `n` bytes from the front of `sending` were written to
    /// the wire. Advances page starts, releases fully consumed pages back
    /// to `pool`, and returns the bytes still queued.
    pub fn bytes_sent(&self, pool: &PagePool, shard: usize, mut n: usize) -> usize {
        let mut sending = self.sending.lock().unwrap();
        while n > 0 {
            let Some(front) = sending.front_mut() else { break };
            let remaining = front.remaining();
            if n < remaining {
                front.start += n;
                n = 0;
            } else {
                n -= remaining;
                let done = sending.pop_front().unwrap();
                pool.release(shard, done.page);
            }
        }
        drop(sending);
        let left = self.recompute_sending_size();
        self.sending_size.store(left, Ordering::Relaxed);
        left
    }

    fn recompute_sending_size(&self) -> usize {
        self.sending.lock().unwrap().iter().map(|p| p.remaining()).sum()
    }

    /// Discard all currently buffered and sending pages and mark the
    /// transporter disabled; called under `send_lock`.
    pub fn disable_send_buffer(&self, pool: &PagePool, shard: usize) {
        self.send_lock.lock();
        self.enabled.store(false, Ordering::Relaxed);
        let mut buffered = self.buffered.lock().unwrap();
        while let Some(p) = buffered.pop_front() {
            pool.release(shard, p.page);
        }
        let mut sending = self.sending.lock().unwrap();
        while let Some(p) = sending.pop_front() {
            pool.release(shard, p.page);
        }
        self.buffered_size.store(0, Ordering::Relaxed);
        self.sending_size.store(0, Ordering::Relaxed);
        self.send_lock.unlock();
    }

    /// Re-enable the transporter. A writer unaware of the disable may have
    /// kept writing and linked fresh pages into `buffered` in the
    /// meantime (`link_thread_send_buffers` does not consult `enabled`);
    /// those are stale backlog for a connection that no longer exists on
    /// the other end and are discarded here rather than transmitted, the
    /// same way `disable_send_buffer` discards what was already queued.
    pub fn enable_send_buffer(&self, pool: &PagePool, shard: usize) {
        self.send_lock.lock();
        let mut buffered = self.buffered.lock().unwrap();
        while let Some(p) = buffered.pop_front() {
            pool.release(shard, p.page);
        }
        let mut sending = self.sending.lock().unwrap();
        while let Some(p) = sending.pop_front() {
            pool.release(shard, p.page);
        }
        self.buffered_size.store(0, Ordering::Relaxed);
        self.sending_size.store(0, Ordering::Relaxed);
        self.enabled.store(true, Ordering::Relaxed);
        self.send_lock.unlock();
    }

    /// A writer that could not acquire `send_lock` to send immediately
    /// sets this flag instead; the lock holder checks it after releasing
    /// the lock.
    pub fn request_force_send(&self) -> bool {
        if self.send_lock.trylock() {
            self.send_lock.unlock();
            false
        } else {
            self.force_send.store(true, Ordering::Relaxed);
            true
        }
    }

    /// Called by the current `send_lock` holder immediately after
    /// `unlock`. The fence orders the force-send flag read after the
    /// unlock's store, matching the original's `mb()` between `unlock`
    /// and reading `m_force_send`.
    pub fn take_force_send(&self) -> bool {
        std::sync::atomic::fence(Ordering::SeqCst);
        self.force_send.swap(false, Ordering::Relaxed)
    }

    /// Test-only access to `send_lock`, so integration tests under
    /// `tests/` can reproduce the force-send handoff race (§8 scenario 4)
    /// by holding the lock on one thread while another calls
    /// `request_force_send`.
    pub fn lock_send_for_test(&self) {
        self.send_lock.lock();
    }

    pub fn unlock_send_for_test(&self) {
        self.send_lock.unlock();
    }
}

impl Default for SendBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_send_round_trips_bytes() {
        let pool = PagePool::new(1, None);
        let mut writer = SendBufferWriter::new(0);
        let (at, len) = writer.get_write_ptr(&pool, 4).unwrap();
        writer.write_slice(at, len).copy_from_slice(b"abcd");
        writer.update_write_ptr(len);
        writer.flush();

        let sb = SendBuffer::new();
        let chunks = sb.get_bytes_to_send_iovec(&[&writer], 8);
        assert_eq!(chunks, vec![b"abcd".to_vec()]);
        assert_eq!(sb.sending_size(), 4);
    }

    #[test]
    fn bytes_sent_releases_fully_consumed_pages() {
        let pool = PagePool::new(1, None);
        let mut writer = SendBufferWriter::new(0);
        let (at, len) = writer.get_write_ptr(&pool, 4).unwrap();
        writer.write_slice(at, len).copy_from_slice(b"abcd");
        writer.update_write_ptr(len);
        writer.flush();

        let sb = SendBuffer::new();
        let _ = sb.get_bytes_to_send_iovec(&[&writer], 8);
        let left = sb.bytes_sent(&pool, 0, 4);
        assert_eq!(left, 0);
        assert_eq!(pool.free_count(0), 1);
    }

    #[test]
    fn partial_bytes_sent_keeps_page_queued() {
        let pool = PagePool::new(1, None);
        let mut writer = SendBufferWriter::new(0);
        let (at, len) = writer.get_write_ptr(&pool, 10).unwrap();
        writer.write_slice(at, len).copy_from_slice(b"0123456789");
        writer.update_write_ptr(len);
        writer.flush();

        let sb = SendBuffer::new();
        let _ = sb.get_bytes_to_send_iovec(&[&writer], 8);
        let left = sb.bytes_sent(&pool, 0, 4);
        assert_eq!(left, 6);
        assert_eq!(pool.free_count(0), 0);
    }

    #[test]
    fn force_send_flag_is_observed_after_unlock() {
        let sb = SendBuffer::new();
        sb.send_lock.lock();
        assert!(sb.request_force_send());
        sb.send_lock.unlock();
        assert!(sb.take_force_send());
        assert!(!sb.take_force_send());
    }

    #[test]
    fn disable_discards_queued_pages_and_enable_clears_flag() {
        let pool = PagePool::new(1, None);
        let mut writer = SendBufferWriter::new(0);
        let (at, len) = writer.get_write_ptr(&pool, 4).unwrap();
        writer.write_slice(at, len).copy_from_slice(b"abcd");
        writer.update_write_ptr(len);
        writer.flush();

        let sb = SendBuffer::new();
        sb.link_thread_send_buffers(&[&writer]);
        assert_eq!(sb.buffered_size(), 4);
        sb.disable_send_buffer(&pool, 0);
        assert!(!sb.is_enabled());
        assert_eq!(sb.buffered_size(), 0);
        sb.enable_send_buffer(&pool, 0);
        assert!(sb.is_enabled());
    }

    #[test]
    fn send_buffer_level_reports_changes_as_bytes_queue_and_drain() {
        let pool = PagePool::new(1, None);
        let mut writer = SendBufferWriter::new(0);
        let sb = SendBuffer::new();

        let (level, changed) = sb.get_send_buffer_level();
        assert_eq!(level, 0);
        assert!(changed);
        let (level, changed) = sb.get_send_buffer_level();
        assert_eq!(level, 0);
        assert!(!changed);

        let (at, len) = writer.get_write_ptr(&pool, 4).unwrap();
        writer.write_slice(at, len).copy_from_slice(b"abcd");
        writer.update_write_ptr(len);
        writer.flush();
        let _ = sb.get_bytes_to_send_iovec(&[&writer], 8);
        let (level, changed) = sb.get_send_buffer_level();
        assert_eq!(level, 4);
        assert!(changed);

        sb.bytes_sent(&pool, 0, 4);
        let (level, changed) = sb.get_send_buffer_level();
        assert_eq!(level, 0);
        assert!(changed);
    }
}
