// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Send-thread pool: up to MAX_SEND_THREADS dedicated threads (plus any
// block thread that calls `assist_send_thread`) drain transporters whose
// send buffers have data. Each transporter is owned by exactly one send-
// thread instance at a time, so `send_lock` for that transporter is never
// contended by two send threads simultaneously — only by a writer
// block-thread doing a force-send.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::wait::WaitObject;

pub const MAX_SEND_THREADS: usize = 8;

/// Overload back-off delay before a transporter flagged `send_overload`
/// is reconsidered.
const OVERLOAD_DELAY: Duration = Duration::from_micros(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrpState {
    Idle,
    Pending,
    Active,
    ActiveWithPending,
}

struct TrpEntry {
    id: u32,
    is_neighbour: bool,
    data_available: u32,
    listed: bool,
    send_overload: bool,
    delay_until: Option<Instant>,
}

impl TrpEntry {
    fn state(&self) -> TrpState {
        match (self.data_available, self.listed) {
            (0, false) => TrpState::Idle,
            (n, true) if n > 0 => TrpState::Pending,
            (1, false) => TrpState::Active,
            (n, false) if n > 1 => TrpState::ActiveWithPending,
            _ => TrpState::Idle,
        }
    }
}

struct Inner {
    neighbours: VecDeque<u32>,
    general: VecDeque<u32>,
    trps: std::collections::HashMap<u32, TrpEntry>,
    awake: bool,
    /// Alternates which list `get_trp` prefers, so neighbours don't starve
    /// the general list under sustained neighbour traffic.
    prefer_neighbour: bool,
}

/// One send-thread's state: its pending-transporter lists and wait
/// object. Neighbour-config and overload-status edits touch every
/// instance's mutex in a pool (§10.5), so callers go through
/// [`SendThreadPool`] rather than a single instance directly for those.
pub struct SendThreadInstance {
    inner: Mutex<Inner>,
    wait_obj: WaitObject,
}

impl SendThreadInstance {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                neighbours: VecDeque::new(),
                general: VecDeque::new(),
                trps: std::collections::HashMap::new(),
                awake: false,
                prefer_neighbour: true,
            }),
            wait_obj: WaitObject::new(),
        }
    }

    fn entry_mut<'a>(inner: &'a mut Inner, trp: u32) -> &'a mut TrpEntry {
        inner.trps.entry(trp).or_insert_with(|| TrpEntry {
            id: trp,
            is_neighbour: false,
            data_available: 0,
            listed: false,
            send_overload: false,
            delay_until: None,
        })
    }

    /// `alert_send_thread(insert_trp)`: mark `trp` as having data ready to
    /// send. Wakes this instance iff it was asleep.
    pub fn alert_send_thread(&self, trp: u32) {
        let mut inner = self.inner.lock().unwrap();
        let is_neighbour = Self::entry_mut(&mut inner, trp).is_neighbour;
        let entry = Self::entry_mut(&mut inner, trp);
        entry.data_available += 1;
        if !entry.listed {
            entry.listed = true;
            if is_neighbour {
                inner.neighbours.push_back(trp);
            } else {
                inner.general.push_back(trp);
            }
        }
        let was_asleep = !inner.awake;
        drop(inner);
        if was_asleep {
            self.wait_obj.wakeup();
        }
    }

    /// `get_trp`: pick the next transporter ready to send, alternating
    /// preference between the neighbour and general lists. Entries whose
    /// delay has not expired are skipped (remaining in the list) but the
    /// smallest remaining delay across skipped candidates is tracked and
    /// returned so the caller knows how long it's safe to sleep.
    pub fn get_trp(&self, now: Instant) -> (Option<u32>, Option<Duration>) {
        let mut inner = self.inner.lock().unwrap();
        let prefer_neighbour = inner.prefer_neighbour;
        inner.prefer_neighbour = !prefer_neighbour;

        let order: [bool; 2] = if prefer_neighbour { [true, false] } else { [false, true] };
        let mut min_delay: Option<Duration> = None;
        let mut fallback: Option<u32> = None;

        for use_neighbours in order {
            let len = if use_neighbours { inner.neighbours.len() } else { inner.general.len() };
            for _ in 0..len {
                let trp = if use_neighbours {
                    inner.neighbours.pop_front().unwrap()
                } else {
                    inner.general.pop_front().unwrap()
                };
                let remaining = {
                    let entry = inner.trps.get(&trp).unwrap();
                    entry.delay_until.map(|d| d.saturating_duration_since(now))
                };
                match remaining {
                    Some(d) if !d.is_zero() => {
                        min_delay = Some(min_delay.map_or(d, |m| m.min(d)));
                        if fallback.is_none() {
                            fallback = Some(trp);
                        }
                        if use_neighbours {
                            inner.neighbours.push_back(trp);
                        } else {
                            inner.general.push_back(trp);
                        }
                    }
                    _ => {
                        self.mark_active(&mut inner, trp);
                        return (Some(trp), None);
                    }
                }
            }
        }
        if let Some(trp) = fallback {
            // Every ready candidate was delayed; hand back the one with
            // the smallest remaining delay, still removed from its list.
            Self::remove_from_lists(&mut inner, trp);
            self.mark_active(&mut inner, trp);
            return (Some(trp), None);
        }
        (None, min_delay)
    }

    fn remove_from_lists(inner: &mut Inner, trp: u32) {
        inner.neighbours.retain(|&t| t != trp);
        inner.general.retain(|&t| t != trp);
    }

    fn mark_active(&self, inner: &mut Inner, trp: u32) {
        let entry = inner.trps.get_mut(&trp).unwrap();
        entry.listed = false;
        entry.delay_until = None;
    }

    /// Register `trp` as needing a further delay before its next
    /// `get_trp` candidacy (overload back-off or packet-size deferral).
    pub fn set_delay(&self, trp: u32, delay: Duration, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        Self::entry_mut(&mut inner, trp).delay_until = Some(now + delay);
    }

    /// `check_done_trp`: called after a send attempt. `more` signals the
    /// transporter still has data or the send did not fully drain it.
    pub fn check_done_trp(&self, trp: u32, more: bool) {
        let mut inner = self.inner.lock().unwrap();
        let entry = Self::entry_mut(&mut inner, trp);
        let still_pending = entry.data_available > 1 || more;
        entry.data_available = if still_pending { 1 } else { 0 };
        if still_pending {
            entry.listed = true;
            let is_neighbour = entry.is_neighbour;
            if is_neighbour {
                inner.neighbours.push_back(trp);
            } else {
                inner.general.push_back(trp);
            }
        }
    }

    pub fn state_of(&self, trp: u32) -> TrpState {
        let inner = self.inner.lock().unwrap();
        inner.trps.get(&trp).map(|e| e.state()).unwrap_or(TrpState::Idle)
    }

    pub fn set_awake(&self, awake: bool) {
        self.inner.lock().unwrap().awake = awake;
    }

    pub fn is_awake(&self) -> bool {
        self.inner.lock().unwrap().awake
    }

    pub fn pending_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.neighbours.len() + inner.general.len()
    }

    /// `assist_send_thread`: a block thread with no JBB work pulls up to
    /// `max` ready transporters and runs `send_fn` on each, without
    /// needing its own dedicated send thread.
    pub fn assist_send_thread(&self, max: usize, now: Instant, mut send_fn: impl FnMut(u32)) {
        for _ in 0..max {
            match self.get_trp(now) {
                (Some(trp), _) => {
                    send_fn(trp);
                    self.check_done_trp(trp, false);
                }
                (None, _) => break,
            }
        }
    }

    fn set_neighbour(&self, trp: u32, is_neighbour: bool) {
        let mut inner = self.inner.lock().unwrap();
        Self::entry_mut(&mut inner, trp).is_neighbour = is_neighbour;
    }

    fn set_overload(&self, trp: u32, overload: bool, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let entry = Self::entry_mut(&mut inner, trp);
        entry.send_overload = overload;
        if overload {
            entry.delay_until = Some(now + OVERLOAD_DELAY);
        }
    }
}

impl Default for SendThreadInstance {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns every send-thread instance, so neighbour-table and overload-flag
/// edits can be bracketed across all of them atomically (§10.5).
pub struct SendThreadPool {
    instances: Vec<SendThreadInstance>,
}

impl SendThreadPool {
    pub fn new(num_send_threads: usize) -> Self {
        let n = num_send_threads.clamp(1, MAX_SEND_THREADS);
        Self {
            instances: (0..n).map(|_| SendThreadInstance::new()).collect(),
        }
    }

    pub fn instance(&self, i: usize) -> &SendThreadInstance {
        &self.instances[i % self.instances.len()]
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// `start_change_neighbour_node` / `set_neighbour_node` /
    /// `end_change_neighbour_node` collapsed into one call: every
    /// instance's mutex is held for the whole edit, giving an atomic view
    /// of the neighbour table across all send threads.
    pub fn set_neighbour_node(&self, trp: u32, is_neighbour: bool) {
        let mut guards: Vec<_> = self.instances.iter().map(|i| i.inner.lock().unwrap()).collect();
        for inner in guards.iter_mut() {
            SendThreadInstance::entry_mut(inner, trp).is_neighbour = is_neighbour;
        }
    }

    pub fn set_overload_status(&self, trp: u32, overload: bool, now: Instant) {
        for inst in &self.instances {
            inst.set_overload(trp, overload, now);
        }
    }
}
