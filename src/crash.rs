// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Crash shutdown coordinator: any thread that decides the process can no
// longer run safely calls `Scheduler::exec_stop_for_crash`, which
// broadcasts a prio-A STOP_FOR_CRASH to every thread's JBA so each gets a
// chance to reach a quiescent point, then dumps queue state and returns.
// Only the first caller drives the sequence; later callers block until
// its dump is done (§5, §7).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::page::ThreadLocalPageCache;
use crate::signal::{Signal, SignalHeader};
use crate::wait::WaitObject;

/// Reserved block number no ordinary block may register under. A thread
/// recognizes a signal addressed here as STOP_FOR_CRASH and acknowledges
/// it instead of dispatching to the registered block table.
pub const STOP_FOR_CRASH_BLOCK_NO: u16 = u16::MAX;

/// How long `exec_stop_for_crash` waits for every thread to acknowledge
/// before producing the dump regardless.
const ACK_TIMEOUT: Duration = Duration::from_secs(2);

pub struct CrashCoordinator {
    crash_started: AtomicBool,
    dump_mutex: Mutex<()>,
    acked: AtomicUsize,
    ack_waiter: WaitObject,
    /// Scratch page cache used only to stage the STOP_FOR_CRASH broadcast
    /// itself; the crash path is rare enough not to warrant a dedicated
    /// shard.
    scratch_cache: Mutex<ThreadLocalPageCache>,
}

impl CrashCoordinator {
    pub fn new() -> Self {
        Self {
            crash_started: AtomicBool::new(false),
            dump_mutex: Mutex::new(()),
            acked: AtomicUsize::new(0),
            ack_waiter: WaitObject::new(),
            scratch_cache: Mutex::new(ThreadLocalPageCache::new(0)),
        }
    }

    pub fn is_crashing(&self) -> bool {
        self.crash_started.load(Ordering::SeqCst)
    }

    /// True iff this call is the one that must drive the crash sequence.
    /// `false` means another thread already claimed it; the caller should
    /// call `wait_for_dump` and return.
    pub fn try_start(&self) -> bool {
        !self.crash_started.swap(true, Ordering::SeqCst)
    }

    /// Block until the thread that won `try_start` has finished producing
    /// the dump.
    pub fn wait_for_dump(&self) {
        drop(self.dump_mutex.lock().unwrap());
    }

    pub fn lock_dump(&self) -> MutexGuard<'_, ()> {
        self.dump_mutex.lock().unwrap()
    }

    pub fn lock_scratch_cache(&self) -> MutexGuard<'_, ThreadLocalPageCache> {
        self.scratch_cache.lock().unwrap()
    }

    /// Called from a thread's dispatch loop once it sees a STOP_FOR_CRASH
    /// signal addressed to it.
    pub fn acknowledge(&self) {
        self.acked.fetch_add(1, Ordering::SeqCst);
        self.ack_waiter.wakeup_all();
    }

    pub fn acked_count(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    /// Block up to `ACK_TIMEOUT` for `total` threads to acknowledge.
    /// Returns the final acknowledged count, which may be short of
    /// `total` if the timeout elapsed first.
    pub fn wait_for_acks(&self, total: usize) -> usize {
        let deadline = Instant::now() + ACK_TIMEOUT;
        loop {
            let acked = self.acked_count();
            if acked >= total {
                return acked;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return acked;
            }
            self.ack_waiter.yield_while(remaining, || self.acked_count() < total);
        }
    }

    pub fn stop_for_crash_signal() -> Signal {
        Signal::new(SignalHeader::new(0, STOP_FOR_CRASH_BLOCK_NO, 0, 0))
    }
}

impl Default for CrashCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_first_try_start_wins() {
        let c = CrashCoordinator::new();
        assert!(c.try_start());
        assert!(!c.try_start());
        assert!(c.is_crashing());
    }

    #[test]
    fn wait_for_acks_returns_once_every_thread_acked() {
        let c = CrashCoordinator::new();
        c.acknowledge();
        c.acknowledge();
        assert_eq!(c.wait_for_acks(2), 2);
    }

    #[test]
    fn stop_for_crash_signal_targets_the_reserved_block_number() {
        let sig = CrashCoordinator::stop_for_crash_signal();
        assert_eq!(sig.header.receiver_block_no, STOP_FOR_CRASH_BLOCK_NO);
    }
}
