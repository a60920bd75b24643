// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Sleep/wake primitive used by block threads, send threads, and the
// congestion controller. Portable variant: mutex + condvar with an
// explicit sleeper count in place of a futex word. The recheck-after-sleep
// pattern (re-evaluate the predicate under the same lock that gates the
// wait) is load-bearing: without it, a wakeup delivered between "decided
// to sleep" and "actually slept" would be lost.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

struct Inner {
    sleepers: u32,
}

/// A wait object. A single instance may be shared by more than one sleeper
/// (the congestion waiter case, where several producer threads block on
/// the same congested consumer); `wakeup` wakes one, `wakeup_all` wakes
/// every current sleeper.
pub struct WaitObject {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl WaitObject {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { sleepers: 0 }),
            cond: Condvar::new(),
        }
    }

    /// Atomically mark this thread as sleeping, re-check `pred` (the
    /// "would still sleep" predicate) and only then wait, up to
    /// `max_wait`. `pred` may be called any number of times while
    /// sleeping (spurious wakes are allowed; callers must tolerate
    /// redundant re-checks). Returns once `pred` is false or the timeout
    /// elapses.
    pub fn yield_while<F>(&self, max_wait: Duration, mut pred: F)
    where
        F: FnMut() -> bool,
    {
        let mut guard = self.inner.lock().unwrap();
        guard.sleepers += 1;
        if pred() {
            let (g, _timeout) = self
                .cond
                .wait_timeout_while(guard, max_wait, |_| pred())
                .unwrap();
            guard = g;
        }
        guard.sleepers -= 1;
    }

    /// Wake exactly one sleeper, if any. No-op on a wait object with no
    /// current sleepers (successive calls are idempotent).
    pub fn wakeup(&self) {
        let guard = self.inner.lock().unwrap();
        if guard.sleepers > 0 {
            drop(guard);
            self.cond.notify_one();
        }
    }

    /// Wake every current sleeper.
    pub fn wakeup_all(&self) {
        let guard = self.inner.lock().unwrap();
        if guard.sleepers > 0 {
            drop(guard);
            self.cond.notify_all();
        }
    }

    pub fn sleeper_count(&self) -> u32 {
        self.inner.lock().unwrap().sleepers
    }
}

impl Default for WaitObject {
    fn default() -> Self {
        Self::new()
    }
}
