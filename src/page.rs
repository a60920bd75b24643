// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The page pool: a sharded, spin-locked free list of fixed-size pages,
// ported from the index-linked free-list idiom used for large-message
// chunk storage — here over a heap-backed pool instead of shared memory,
// and holding whole pages rather than fixed-size chunks.

use std::collections::VecDeque;

use crate::spin_lock::SpinLock;

/// Fixed page size. Every page pool, job buffer, send buffer and time
/// queue slot array is built out of pages this size.
pub const PAGE_SIZE: usize = 32_768;
/// Byte alignment every page satisfies; signal headers within a page stay
/// 8-byte aligned as a result.
pub const PAGE_ALIGN: usize = 8;

/// Maximum page-pool shards (keyed by send-thread id).
pub const MAX_SHARDS: usize = 8;

/// Shards below this many free pages are not offered to a peer's cascade
/// fallback — see [`PagePool::seize_list_for_send_buffer`]. Tuning
/// constant, not a correctness guarantee.
const RG_REQUIRED_PAGES: usize = 96;

#[repr(align(8))]
struct PageStorage([u8; PAGE_SIZE]);

/// A single fixed-size page. Move-only: ownership is tracked by whichever
/// structure currently holds the `Page` value (pool shard, thread-local
/// cache, job-buffer slot, send buffer, time-queue slot array). There is
/// never more than one owner.
pub struct Page {
    storage: Box<PageStorage>,
}

impl Page {
    fn new() -> Self {
        Self {
            storage: Box::new(PageStorage([0u8; PAGE_SIZE])),
        }
    }

    /// A zeroed page not drawn from any [`PagePool`]. Used for buffers that
    /// are owned outright by a single thread for its lifetime (the local
    /// signal stage's swap buffers) rather than cycled through a pool.
    pub(crate) fn default_zeroed() -> Self {
        Self::new()
    }

    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.storage.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.storage.0
    }

    /// View the page as a slice of `u32` words (job-buffer/time-queue
    /// layout). `PAGE_SIZE` is a multiple of 4, so this never truncates.
    pub fn as_words(&self) -> &[u32] {
        debug_assert_eq!(PAGE_SIZE % 4, 0);
        unsafe { std::slice::from_raw_parts(self.storage.0.as_ptr() as *const u32, PAGE_SIZE / 4) }
    }

    pub fn as_words_mut(&mut self) -> &mut [u32] {
        unsafe {
            std::slice::from_raw_parts_mut(self.storage.0.as_mut_ptr() as *mut u32, PAGE_SIZE / 4)
        }
    }
}

struct Shard {
    lock: SpinLock,
    free: VecDeque<Page>,
}

impl Shard {
    fn new(name: &'static str) -> Self {
        Self {
            lock: SpinLock::new(name),
            free: VecDeque::new(),
        }
    }
}

/// Thread-safe free-list of pages, sharded into up to [`MAX_SHARDS`]
/// instances keyed by send-thread id. Job-buffer allocation always uses
/// shard 0 (or the calling thread's own shard when threads don't share a
/// send-thread instance); send-buffer allocation may cascade into a peer
/// shard before falling through to fresh allocation.
pub struct PagePool {
    shards: Vec<Shard>,
    /// Total pages ever created by this pool (own allocation stands in for
    /// the external memory manager). `None` means unbounded.
    budget: Option<usize>,
    allocated: std::sync::atomic::AtomicUsize,
}

impl PagePool {
    pub fn new(num_shards: usize, budget: Option<usize>) -> Self {
        let num_shards = num_shards.clamp(1, MAX_SHARDS);
        let shards = (0..num_shards).map(|_| Shard::new("page_pool_shard")).collect();
        Self {
            shards,
            budget,
            allocated: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    fn fresh_page(&self) -> Option<Page> {
        use std::sync::atomic::Ordering;
        if let Some(budget) = self.budget {
            let mut cur = self.allocated.load(Ordering::Relaxed);
            loop {
                if cur >= budget {
                    return None;
                }
                match self.allocated.compare_exchange_weak(
                    cur,
                    cur + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => cur = actual,
                }
            }
        } else {
            self.allocated.fetch_add(1, Ordering::Relaxed);
        }
        Some(Page::new())
    }

    /// Seize a single page from `shard`. Falls through to fresh allocation
    /// (standing in for the external memory manager) on a shard miss;
    /// returns `None` only once the pool's budget is exhausted. This is
    /// the job-buffer allocation path: no peer-shard cascade.
    pub fn seize(&self, shard: usize) -> Option<Page> {
        let shard = &self.shards[shard % self.shards.len()];
        shard.lock.lock();
        let page = shard.free.pop_front();
        shard.lock.unlock();
        match page {
            Some(p) => Some(p),
            None => self.fresh_page(),
        }
    }

    /// Seize `n` pages for send-buffer pre-allocation. Tries `shard`
    /// first; if it cannot supply `n`, tries the least-empty peer shard
    /// (read without that shard's lock — an intentionally racy estimate,
    /// acceptable because a stale read only costs an extra fallback, never
    /// a correctness violation); only then falls through to fresh
    /// allocation for the remainder.
    pub fn seize_list_for_send_buffer(&self, shard: usize, n: usize) -> Vec<Page> {
        let mut out = Vec::with_capacity(n);
        self.drain_shard_into(shard, n, &mut out);
        if out.len() < n && self.shards.len() > 1 {
            if let Some(peer) = self.least_empty_peer(shard) {
                if self.shards[peer].free.len() >= RG_REQUIRED_PAGES || out.is_empty() {
                    self.drain_shard_into(peer, n - out.len(), &mut out);
                }
            }
        }
        while out.len() < n {
            match self.fresh_page() {
                Some(p) => out.push(p),
                None => break,
            }
        }
        out
    }

    fn drain_shard_into(&self, shard: usize, n: usize, out: &mut Vec<Page>) {
        let shard = &self.shards[shard % self.shards.len()];
        shard.lock.lock();
        for _ in 0..n {
            match shard.free.pop_front() {
                Some(p) => out.push(p),
                None => break,
            }
        }
        shard.lock.unlock();
    }

    /// Cheap, lock-free estimate of which peer shard has the most free
    /// pages. Racy by design (§9 open question).
    fn least_empty_peer(&self, shard: usize) -> Option<usize> {
        (0..self.shards.len())
            .filter(|&i| i != shard)
            .max_by_key(|&i| self.shards[i].free.len())
    }

    pub fn release(&self, shard: usize, page: Page) {
        let shard = &self.shards[shard % self.shards.len()];
        shard.lock.lock();
        shard.free.push_back(page);
        shard.lock.unlock();
    }

    pub fn release_list(&self, shard: usize, pages: Vec<Page>) {
        let shard = &self.shards[shard % self.shards.len()];
        shard.lock.lock();
        for p in pages {
            shard.free.push_back(p);
        }
        shard.lock.unlock();
    }

    pub fn free_count(&self, shard: usize) -> usize {
        let shard = &self.shards[shard % self.shards.len()];
        shard.lock.lock();
        let n = shard.free.len();
        shard.lock.unlock();
        n
    }

    pub fn total_allocated(&self) -> usize {
        self.allocated.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Small per-thread FIFO that absorbs most seize/release traffic without
/// touching the shared pool. Producers drain this first; it refills from
/// and drains to the owning [`PagePool`] shard in batches, to avoid
/// oscillating across the shared-pool lock on every single page.
pub struct ThreadLocalPageCache {
    queue: VecDeque<Page>,
    max_free: usize,
    shard: usize,
}

impl ThreadLocalPageCache {
    pub const DEFAULT_MAX_FREE: usize = 32;

    pub fn new(shard: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            max_free: Self::DEFAULT_MAX_FREE,
            shard,
        }
    }

    fn refill_batch(&self) -> usize {
        (self.max_free / 6).max(1)
    }

    fn drain_target(&self) -> usize {
        self.max_free * 2 / 3
    }

    /// Seize one page, refilling from `pool` in a batch if the local
    /// cache is empty.
    pub fn seize(&mut self, pool: &PagePool) -> Option<Page> {
        if self.queue.is_empty() {
            let batch = self.refill_batch();
            for _ in 0..batch {
                match pool.seize(self.shard) {
                    Some(p) => self.queue.push_back(p),
                    None => break,
                }
            }
        }
        self.queue.pop_front()
    }

    /// Release one page locally; drain to the shared pool if the cache has
    /// grown past `max_free`.
    pub fn release(&mut self, pool: &PagePool, page: Page) {
        self.queue.push_back(page);
        if self.queue.len() > self.max_free {
            let target = self.drain_target();
            let mut drained = Vec::new();
            while self.queue.len() > target {
                if let Some(p) = self.queue.pop_front() {
                    drained.push(p);
                }
            }
            pool.release_list(self.shard, drained);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seize_and_release_round_trip() {
        let pool = PagePool::new(1, None);
        let p = pool.seize(0).unwrap();
        assert_eq!(pool.free_count(0), 0);
        pool.release(0, p);
        assert_eq!(pool.free_count(0), 1);
    }

    #[test]
    fn budget_exhaustion_returns_none() {
        let pool = PagePool::new(1, Some(2));
        assert!(pool.seize(0).is_some());
        assert!(pool.seize(0).is_some());
        assert!(pool.seize(0).is_none());
    }

    #[test]
    fn thread_local_cache_refills_in_batches() {
        let pool = PagePool::new(1, None);
        // Pre-seed the shared pool so refill doesn't fall through to fresh
        // allocation (which would also succeed, but we want to observe the
        // shared pool draining).
        let seeded: Vec<Page> = (0..10).map(|_| pool.seize(0).unwrap()).collect();
        pool.release_list(0, seeded);
        assert_eq!(pool.free_count(0), 10);

        let mut cache = ThreadLocalPageCache::new(0);
        assert!(cache.seize(&pool).is_some());
        // One refill batch (max_free/6 = 5) should have been pulled in,
        // one of which was just handed out.
        assert_eq!(cache.len(), 4);
        assert_eq!(pool.free_count(0), 5);
    }

    #[test]
    fn thread_local_cache_drains_when_over_max() {
        let pool = PagePool::new(1, None);
        let mut cache = ThreadLocalPageCache::new(0);
        cache.max_free = 8;
        for _ in 0..9 {
            cache.release(&pool, Page::new());
        }
        // drain_target = 8*2/3 = 5
        assert_eq!(cache.len(), 5);
        assert_eq!(pool.free_count(0), 4);
    }

    #[test]
    fn send_buffer_seize_list_cascades_to_peer_shard() {
        let pool = PagePool::new(2, None);
        let seeded: Vec<Page> = (0..200).map(|_| Page::new()).collect();
        pool.release_list(1, seeded);
        let got = pool.seize_list_for_send_buffer(0, 10);
        assert_eq!(got.len(), 10);
        assert!(pool.free_count(1) < 200);
    }
}
