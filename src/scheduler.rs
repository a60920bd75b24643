// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The block-thread orchestrator: owns the shared job-buffer matrix and
// send-thread pool, and runs each thread's main loop over its own
// exclusively-owned [`BlockThreadContext`]. This is where the pieces built
// in the other modules (job_buffer, local_stage, time_queue, congestion,
// send_thread, page) are composed into the per-iteration flow described by
// the block-thread and receive-thread main loops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::Config;
use crate::congestion::CongestionState;
use crate::crash::{CrashCoordinator, STOP_FOR_CRASH_BLOCK_NO};
use crate::dispatch::{Block, SendStatus, Transporter, TransporterId};
use crate::error::{FatalError, Result, SchedulerError};
use crate::job_buffer::{InsertOutcome, JobBuffer, JobBufferConsumer, CONGESTED, RESERVED};
use crate::local_stage::{FlushDecision, LocalStage};
use crate::page::{PagePool, ThreadLocalPageCache};
use crate::rt_prio;
use crate::send_thread::SendThreadPool;
use crate::signal::{Priority, Signal};
use crate::time_queue::TimeQueue;
use crate::wait::WaitObject;

/// Per-round cap on signals drained from a single JBB before the
/// congestion pool's `extra_signals` kicks in.
pub const MAX_SIGNALS_PER_JB: u32 = 75;
/// Pages a block thread tries to keep preallocated in its thread-local send
/// pool ahead of a round, so a burst of outgoing traffic doesn't stall on
/// allocation mid-round.
pub const THR_SEND_BUFFER_PRE_ALLOC: usize = 32;
/// Re-scan the zero time queue after this many signals executed within one
/// `run_job_buffers` round, so prio-A work queued by a just-executed signal
/// doesn't wait a whole round to fire.
const ZERO_QUEUE_RESCAN_INTERVAL: u64 = 100;
/// Consecutive empty sleep-loops on a congestion waiter before giving up and
/// forcing progress with whatever `extra_signals` allows.
const MAX_CONSECUTIVE_CONGESTION_SLEEPS: u32 = 10;
/// Cap on a single congestion-waiter yield.
const CONGESTION_WAIT: Duration = Duration::from_millis(1);
/// Downgrade a realtime thread's priority after this much continuous busy
/// time, so the OS still gets a chance to time-share the core.
const REALTIME_BREAK_AFTER: Duration = Duration::from_millis(50);

/// Maps a producer thread to the JBB index it writes into on `dest`'s side.
/// Producer indices are compacted (self excluded) and wrapped into
/// `num_job_buffers_per_thread` slots when there are more producer threads
/// than dedicated JBBs, matching `Config::num_job_buffers_per_thread`.
pub fn jbb_index_for(dest: usize, producer: usize, num_jbb: usize) -> usize {
    let compact = if producer < dest { producer } else { producer - 1 };
    compact % num_jbb.max(1)
}

/// The shared, cross-thread-visible half of one block thread's queues: the
/// JBA (exactly one) and its JBBs (one per other producer thread, or shared
/// per `jbb_index_for` once there are more threads than slots). Producers
/// reach these through [`Scheduler::thread`]; only the owning thread's
/// [`BlockThreadContext`] consumes them.
pub struct ThreadJobBuffers {
    pub jba: JobBuffer,
    pub jbbs: Vec<JobBuffer>,
    /// Woken by the consumer whenever it crosses into a new JBB page, and
    /// by the congestion controller's producer side when a full queue
    /// finally has room; producers stuck in `handle_full_job_buffers`
    /// sleep here.
    pub congestion_waiter: WaitObject,
    /// Woken when new work lands on the JBA/JBBs and the consumer might be
    /// asleep.
    pub work_waiter: WaitObject,
    /// True iff this thread is a receive thread, used by producers to pick
    /// the tighter `MAX_SIGNALS_BEFORE_FLUSH_RECEIVER` local-stage flush
    /// threshold (§4.6) for traffic addressed to it.
    pub is_receiver: bool,
}

impl ThreadJobBuffers {
    fn new(thread_idx: usize, num_jbb: usize, shared: bool, is_receiver: bool) -> Self {
        Self {
            jba: JobBuffer::new(Priority::A, shared, thread_idx),
            jbbs: (0..num_jbb).map(|_| JobBuffer::new(Priority::B, shared, thread_idx)).collect(),
            congestion_waiter: WaitObject::new(),
            work_waiter: WaitObject::new(),
            is_receiver,
        }
    }

    pub fn jbb(&self, producer: usize, dest: usize) -> &JobBuffer {
        &self.jbbs[jbb_index_for(dest, producer, self.jbbs.len())]
    }
}

/// Top-level scheduler: the pieces every block thread shares. Threads hold
/// an `Arc<Scheduler>` and index into `threads` with their own id for
/// everything but their exclusive [`BlockThreadContext`].
pub struct Scheduler {
    pub config: Config,
    pub pool: PagePool,
    pub send_threads: SendThreadPool,
    threads: Vec<ThreadJobBuffers>,
    shutdown: AtomicBool,
    crash: CrashCoordinator,
    /// The embedding application's network layer, set once via
    /// `set_transporter` before any thread's `run_loop` starts. `None`
    /// means no remote peer is configured; `sendremote` then reports a
    /// configuration error rather than silently dropping the signal.
    transporter: OnceLock<Arc<dyn Transporter>>,
    /// Live-tunable mirrors of `config.wakeup_latency_us`/
    /// `config.spin_time_per_call_ns`, so an operator can retune either
    /// knob while the scheduler runs (§10.4), the way the original exposes
    /// `get_wakeup_latency`/`set_wakeup_latency` and
    /// `get_configured_spintime`/`set_spintime`. `config` itself stays the
    /// validated startup snapshot.
    wakeup_latency_us: AtomicU32,
    spintime_ns: AtomicU32,
}

impl Scheduler {
    pub fn new(config: Config) -> Result<Arc<Self>> {
        let config = config.validate()?;
        let num_jbb = config.num_job_buffers_per_thread();
        let shared = config.use_write_lock_mutex();
        let first_receiver = config.num_threads.saturating_sub(config.num_receiver_threads);
        let threads = (0..config.num_threads)
            .map(|t| ThreadJobBuffers::new(t, num_jbb, shared, t >= first_receiver))
            .collect();
        let pool = PagePool::new(config.num_send_threads.max(1), None);
        let send_threads = SendThreadPool::new(config.num_send_threads.max(1));
        let wakeup_latency_us = AtomicU32::new(config.wakeup_latency_us);
        let spintime_ns = AtomicU32::new(config.spin_time_per_call_ns);
        Ok(Arc::new(Self {
            config,
            pool,
            send_threads,
            threads,
            shutdown: AtomicBool::new(false),
            crash: CrashCoordinator::new(),
            transporter: OnceLock::new(),
            wakeup_latency_us,
            spintime_ns,
        }))
    }

    /// Current wakeup-latency cap (§10.4, `get_wakeup_latency`), in
    /// microseconds. Starts at `config.wakeup_latency_us` and may be
    /// retuned live with `set_wakeup_latency`.
    pub fn get_wakeup_latency(&self) -> u32 {
        self.wakeup_latency_us.load(Ordering::Relaxed)
    }

    /// Retune the wakeup-latency cap an already-running scheduler's block
    /// threads sleep against (§10.4, `set_wakeup_latency`). Takes effect on
    /// each thread's next sleep.
    pub fn set_wakeup_latency(&self, us: u32) {
        self.wakeup_latency_us.store(us, Ordering::Relaxed);
    }

    /// Current spin-lock backoff calibration (§10.4,
    /// `get_configured_spintime`), in nanoseconds.
    pub fn get_configured_spintime(&self) -> u32 {
        self.spintime_ns.load(Ordering::Relaxed)
    }

    /// Retune the spin-lock backoff calibration live (§10.4,
    /// `set_spintime`).
    pub fn set_spintime(&self, ns: u32) {
        self.spintime_ns.store(ns, Ordering::Relaxed);
    }

    pub fn num_threads(&self) -> usize {
        self.threads.len()
    }

    /// Install the network layer used by `sendremote` and the send-thread
    /// pool. A no-op if a transporter is already installed (first writer
    /// wins), matching the one-time startup-configuration contract every
    /// other per-thread setter in this module follows.
    pub fn set_transporter(&self, transporter: Arc<dyn Transporter>) {
        let _ = self.transporter.set(transporter);
    }

    pub fn transporter(&self) -> Option<&Arc<dyn Transporter>> {
        self.transporter.get()
    }

    fn thread(&self, idx: usize) -> Result<&ThreadJobBuffers> {
        self.threads.get(idx).ok_or(SchedulerError::InvalidIndex {
            what: "thread",
            index: idx,
            limit: self.threads.len(),
        })
    }

    /// Expose a thread's shared job-buffer matrix to integration tests
    /// under `tests/`, which only see this crate's public API and need to
    /// drive a destination's JBB directly to reproduce back-pressure and
    /// congestion scenarios without going through a second thread's main
    /// loop.
    pub fn thread_for_test(&self, idx: usize) -> &ThreadJobBuffers {
        self.thread(idx).expect("thread index out of range in test")
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for t in &self.threads {
            t.work_waiter.wakeup_all();
            t.congestion_waiter.wakeup_all();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn is_crashing(&self) -> bool {
        self.crash.is_crashing()
    }

    /// Record that this thread observed a STOP_FOR_CRASH signal. Called
    /// only from a block thread's dispatch loop.
    fn acknowledge_crash(&self) {
        self.crash.acknowledge();
    }

    /// `exec_stop_for_crash`: coordinate a crash shutdown across every
    /// thread (§5, §7). The first caller broadcasts a prio-A
    /// STOP_FOR_CRASH to every thread's JBA, waits up to 2s for each to
    /// acknowledge, dumps queue occupancy, and returns `true`. Concurrent
    /// callers after the first block until that dump completes and return
    /// `false`.
    pub fn exec_stop_for_crash(&self, reason: &str) -> bool {
        if !self.crash.try_start() {
            self.crash.wait_for_dump();
            return false;
        }
        let _dump_guard = self.crash.lock_dump();
        log::error!("exec_stop_for_crash: {reason}");

        {
            let mut cache = self.crash.lock_scratch_cache();
            let signal = CrashCoordinator::stop_for_crash_signal();
            for t in &self.threads {
                match t.jba.insert(&signal, &self.pool, &mut cache) {
                    InsertOutcome::Ok => {
                        t.jba.flush();
                        t.work_waiter.wakeup_all();
                    }
                    InsertOutcome::Full => {
                        log::error!("exec_stop_for_crash: a thread's JBA is full, it may not see STOP_FOR_CRASH");
                    }
                }
            }
        }

        let acked = self.crash.wait_for_acks(self.threads.len());
        if acked < self.threads.len() {
            log::error!(
                "exec_stop_for_crash: only {acked}/{} threads acknowledged, dumping anyway",
                self.threads.len()
            );
        }

        for (i, t) in self.threads.iter().enumerate() {
            let jbb_free: Vec<usize> = t.jbbs.iter().map(|jb| jb.free_pages()).collect();
            log::error!("exec_stop_for_crash: thread {i} jba_free={} jbb_free={jbb_free:?}", t.jba.free_pages());
        }
        true
    }
}

/// The exclusively-owned half of a block thread's state: everything only
/// the thread running its own main loop ever touches. Not `Send`-shared by
/// construction (held by value inside the thread closure that owns it).
pub struct BlockThreadContext {
    thread_idx: usize,
    is_receiver: bool,
    is_main: bool,
    scheduler: Arc<Scheduler>,
    local_stage: LocalStage,
    time_queue: TimeQueue,
    congestion: CongestionState,
    cache: ThreadLocalPageCache,
    jba_consumer: JobBufferConsumer,
    jbb_consumers: Vec<JobBufferConsumer>,
    blocks: HashMap<u16, Box<dyn Block>>,
    next_jbb_no: usize,
    max_signals_per_jb: u32,
    signal_id_seq: AtomicU32,
    signals_since_zq_rescan: u64,
    stat: crate::diag::ThreadStat,
    realtime: bool,
}

impl BlockThreadContext {
    pub fn new(scheduler: Arc<Scheduler>, thread_idx: usize, is_receiver: bool, is_main: bool, now_ms: u32) -> Result<Self> {
        let num_threads = scheduler.num_threads();
        if thread_idx >= num_threads {
            return Err(SchedulerError::InvalidIndex {
                what: "thread",
                index: thread_idx,
                limit: num_threads,
            });
        }
        let shard = thread_idx % scheduler.pool.num_shards();
        let num_jbb = scheduler.thread(thread_idx)?.jbbs.len();
        let realtime = scheduler.config.threads.get(thread_idx).map(|t| t.realtime).unwrap_or(false);
        Ok(Self {
            thread_idx,
            is_receiver,
            is_main,
            realtime,
            scheduler,
            local_stage: LocalStage::new(num_threads),
            time_queue: TimeQueue::new(now_ms),
            congestion: CongestionState::new(num_threads),
            cache: ThreadLocalPageCache::new(shard),
            jba_consumer: JobBufferConsumer::new(),
            jbb_consumers: (0..num_jbb).map(|_| JobBufferConsumer::new()).collect(),
            blocks: HashMap::new(),
            next_jbb_no: 0,
            max_signals_per_jb: MAX_SIGNALS_PER_JB,
            signal_id_seq: AtomicU32::new(1),
            signals_since_zq_rescan: 0,
            stat: crate::diag::ThreadStat::new(),
        })
    }

    pub fn register_block(&mut self, block_no: u16, block: Box<dyn Block>) {
        self.blocks.insert(block_no, block);
    }

    pub fn stat(&self) -> &crate::diag::ThreadStat {
        &self.stat
    }

    /// Test-only accessors exposing otherwise-private congestion and
    /// cache state to integration tests under `tests/`, which reproduce
    /// the back-pressure stall-and-recover scenario (§8 scenario 3) by
    /// driving a producer's quota bookkeeping directly rather than
    /// through a full `run_once` round.
    pub fn cache_for_test(&mut self) -> &mut ThreadLocalPageCache {
        &mut self.cache
    }

    pub fn set_congested_jb_quotas_for_test(&mut self) {
        self.set_congested_jb_quotas();
    }

    pub fn max_signals_per_jb_for_test(&self) -> u32 {
        self.max_signals_per_jb
    }

    pub fn is_congested_with_for_test(&self, dest_thread: usize) -> bool {
        self.congestion.is_congested(dest_thread)
    }

    pub fn recheck_congested_job_buffers_for_test(&mut self) {
        self.recheck_congested_job_buffers();
    }

    /// Run one job-buffer round directly, without the time-queue scan and
    /// send-assist steps `run_once` wraps it in — needed by integration
    /// tests under `tests/` that want to observe a single round's drain
    /// count in isolation.
    pub fn run_job_buffers_for_test(&mut self) -> Result<u64> {
        self.run_job_buffers()
    }

    fn next_signal_id(&self) -> u32 {
        self.signal_id_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// `sendlocal`: queue `signal` for a priority-B destination. Local
    /// destinations stage through the local signal stage; the decision
    /// returned by `insert_local_signal` is acted on immediately (matching
    /// the original's fold of the flush logic into the insert call site).
    pub fn sendlocal(&mut self, dest_thread: usize, mut signal: Signal) -> Result<()> {
        if signal.header.signal_id == 0 {
            signal.header.signal_id = self.next_signal_id();
        }
        let num_threads = self.scheduler.num_threads();
        if dest_thread >= num_threads {
            return Err(SchedulerError::InvalidIndex {
                what: "dest_thread",
                index: dest_thread,
                limit: num_threads,
            });
        }
        let is_receiver_dest = self.scheduler.thread(dest_thread)?.is_receiver;
        let decision = self.local_stage.insert_local_signal(dest_thread, &signal, is_receiver_dest);
        match decision {
            FlushDecision::None => {}
            FlushDecision::FlushDestination(d) => self.flush_destination(d)?,
            FlushDecision::FlushAll => self.flush_all_local_signals()?,
        }
        Ok(())
    }

    /// `sendprioa`: bypass the local stage entirely; JBA is always flushed
    /// and the consumer always woken, since prio-A must be visible to the
    /// destination before the caller's next yield point.
    pub fn sendprioa(&mut self, dest_thread: usize, mut signal: Signal) -> Result<()> {
        if signal.header.signal_id == 0 {
            signal.header.signal_id = self.next_signal_id();
        }
        let dest = self.scheduler.thread(dest_thread)?;
        match dest.jba.insert(&signal, &self.scheduler.pool, &mut self.cache) {
            InsertOutcome::Ok => {
                dest.jba.flush();
                dest.work_waiter.wakeup();
                Ok(())
            }
            InsertOutcome::Full => Err(SchedulerError::InvalidConfig(format!(
                "JBA for thread {dest_thread} is full; see §7 out_of_job_buffer"
            ))),
        }
    }

    /// `senddelay`: queue a signal on this thread's own time queue, to be
    /// delivered as a priority-A signal to `dest_thread` once its alarm
    /// expires. The time queue is not shared, so no destination-side
    /// validation happens until the alarm actually fires via `sendprioa`.
    pub fn senddelay(&mut self, dest_thread: usize, signal: Signal, delay_ms: u32) -> Result<()> {
        self.time_queue
            .senddelay(dest_thread, signal, delay_ms)
            .map_err(|_| SchedulerError::InvalidConfig("time queue full".to_string()))
    }

    /// `sendremote`: serialize `signal` and hand it to the configured
    /// [`Transporter`] for `trp`. Accepting into the transporter's own
    /// send buffer is synchronous; actual wire delivery happens later,
    /// asynchronously, through the send-thread pool's `assist_send_thread`/
    /// dedicated send threads. A missing transporter is a configuration
    /// error rather than a silent drop, since a caller that reaches this
    /// path expects remote delivery to eventually happen.
    pub fn sendremote(&mut self, trp: TransporterId, mut signal: Signal) -> Result<()> {
        if signal.header.signal_id == 0 {
            signal.header.signal_id = self.next_signal_id();
        }
        let transporter = self.scheduler.transporter().ok_or_else(|| {
            SchedulerError::InvalidConfig("sendremote: no transporter configured".to_string())
        })?;
        let bytes = signal.to_wire_bytes();
        match transporter.prepare_send(trp, &bytes) {
            SendStatus::Ok => {
                self.scheduler.send_threads.instance(trp.0 as usize).alert_send_thread(trp.0);
                Ok(())
            }
            SendStatus::BufferFull => Err(SchedulerError::InvalidConfig(format!(
                "sendremote: transporter {trp:?} buffer full"
            ))),
            SendStatus::NodeDisconnected => Err(SchedulerError::InvalidConfig(format!(
                "sendremote: transporter {trp:?} not connected"
            ))),
        }
    }

    /// Pull up to a handful of ready transporters off this thread's
    /// send-thread-pool slot and drive their sends directly, so a thread
    /// with no JBB work to do helps the dedicated send threads drain
    /// outgoing traffic instead of sitting idle (`assist_send_thread`,
    /// §10.5). A no-op when no transporter is configured.
    fn assist_send_thread(&self) {
        let Some(transporter) = self.scheduler.transporter() else { return };
        let instance = self.scheduler.send_threads.instance(self.thread_idx);
        let now = std::time::Instant::now();
        instance.assist_send_thread(4, now, |trp| {
            let _ = transporter.perform_send(TransporterId(trp), true);
        });
    }

    fn flush_destination(&mut self, dest: usize) -> Result<()> {
        let target = self.scheduler.thread(dest)?;
        let jb = target.jbb(self.thread_idx, dest);
        let (_flushed, pending) = self
            .local_stage
            .flush_destination(dest, jb, &self.scheduler.pool, &mut self.cache);
        if pending > 0 {
            target.work_waiter.wakeup();
        }
        Ok(())
    }

    /// Flush every destination the local stage has pending work for, and
    /// wake every consumer whose cumulative pending count just crossed
    /// `MAX_SIGNALS_BEFORE_WAKEUP`, plus any recorded from an earlier
    /// deferred-wakeup flush.
    pub fn flush_all_local_signals(&mut self) -> Result<()> {
        let num_threads = self.scheduler.num_threads();
        let woken = {
            let scheduler = &self.scheduler;
            let thread_idx = self.thread_idx;
            let job_buffers = (0..num_threads)
                .filter(|&d| d != thread_idx)
                .filter_map(|d| scheduler.threads.get(d).map(|t| (d, t.jbb(thread_idx, d))));
            self.local_stage.flush_all(job_buffers, &self.scheduler.pool, &mut self.cache)
        };
        for (dest, _pending) in woken {
            self.scheduler.thread(dest)?.work_waiter.wakeup();
        }
        for dest in self.local_stage.take_wake_pending() {
            self.scheduler.thread(dest)?.work_waiter.wakeup();
        }
        Ok(())
    }

    /// `set_congested_jb_quotas`: examine this thread's outgoing JBBs
    /// (the ones it produces into on every *other* thread) and collapse
    /// `max_signals_per_jb` when any of them is running low, marking the
    /// destination congested so the congestion controller keeps draining
    /// its known-full in-queues.
    fn set_congested_jb_quotas(&mut self) {
        self.max_signals_per_jb = MAX_SIGNALS_PER_JB;
        let num_threads = self.scheduler.num_threads();
        for dest in 0..num_threads {
            if dest == self.thread_idx {
                continue;
            }
            let Ok(target) = self.scheduler.thread(dest) else { continue };
            let jb = target.jbb(self.thread_idx, dest);
            let free = jb.free_pages();
            if free <= RESERVED {
                self.max_signals_per_jb = 0;
                self.congestion.mark_congested(dest);
            } else if free <= CONGESTED {
                let perjb_free = (MAX_SIGNALS_PER_JB * (free - RESERVED) as u32 / CONGESTED as u32).max(1);
                self.max_signals_per_jb = self.max_signals_per_jb.min(perjb_free);
                self.congestion.mark_congested(dest);
            } else {
                self.congestion.clear_congested(dest);
            }
        }
    }

    /// Restore quotas after a wait; called once the congestion waiter
    /// wakes, to re-derive `max_signals_per_jb` from current queue depths
    /// rather than trusting the stale value computed before sleeping.
    fn recheck_congested_job_buffers(&mut self) {
        self.set_congested_jb_quotas();
    }

    /// `handle_scheduling_decisions`: called after draining one JBB during
    /// `run_job_buffers`. Flushes accumulated local-signal traffic when the
    /// local buffer has grown large, so downstream consumers aren't starved
    /// for the whole round.
    fn handle_scheduling_decisions(&mut self) -> Result<()> {
        if self.local_stage.local_buffer_len() > crate::local_stage::MAX_LOCAL_BUFFER_USAGE / 2 {
            self.flush_all_local_signals()?;
        }
        Ok(())
    }

    /// Drain JBA to exhaustion, dispatching each signal. A prio-A signal
    /// that itself issues a further prio-A signal to this same thread is
    /// consumed before returning, by re-checking the JBA after every batch.
    fn drain_jba(&mut self) -> Result<u64> {
        let mut total = 0u64;
        let thread_idx = self.thread_idx;
        loop {
            let me = self.scheduler.thread(thread_idx)?;
            if me.jba.is_empty() {
                break;
            }
            let mut executed_this_pass = 0usize;
            let blocks = &mut self.blocks;
            let crash = &self.scheduler;
            self.jba_consumer.run(
                &me.jba,
                &self.scheduler.pool,
                &mut self.cache,
                MAX_SIGNALS_PER_JB as usize,
                |signal| {
                    if signal.header.receiver_block_no == STOP_FOR_CRASH_BLOCK_NO {
                        crash.acknowledge_crash();
                    } else if let Some(block) = blocks.get_mut(&signal.header.receiver_block_no) {
                        block.execute(signal.header.gsn, signal);
                    }
                    executed_this_pass += 1;
                },
                || {},
            );
            total += executed_this_pass as u64;
            if executed_this_pass == 0 {
                break;
            }
        }
        Ok(total)
    }

    /// `run_job_buffers`: one round. Drains JBA first (and after every JBB,
    /// so a prio-A signal produced mid-round is seen promptly), then each
    /// non-empty JBB in turn starting at `next_jbb_no`, up to
    /// `max_signals_per_jb + extra_signals[jbb]` signals. Returns the total
    /// signals executed this round.
    fn run_job_buffers(&mut self) -> Result<u64> {
        self.set_congested_jb_quotas();
        let thread_idx = self.thread_idx;
        if self.congestion.is_any_congested() {
            let me = self.scheduler.thread(thread_idx)?;
            let incoming: Vec<(usize, &JobBuffer)> = me.jbbs.iter().enumerate().collect();
            self.congestion
                .prepare_congested_execution(&incoming, MAX_SIGNALS_PER_JB, self.max_signals_per_jb);
        }

        let mut total = self.drain_jba()?;
        let num_jbb = self.jbb_consumers.len();
        if num_jbb == 0 {
            return Ok(total);
        }

        for offset in 0..num_jbb {
            let jbb_no = (self.next_jbb_no + offset) % num_jbb;
            let extra = self.congestion.extra_signals(jbb_no);
            let budget = self.max_signals_per_jb + extra;
            if budget == 0 {
                continue;
            }
            let me = self.scheduler.thread(thread_idx)?;
            if me.jbbs[jbb_no].is_empty() {
                continue;
            }
            let jb = &me.jbbs[jbb_no];
            let waiter = &me.congestion_waiter;
            let blocks = &mut self.blocks;
            let crash = &self.scheduler;
            let mut crossed_page = false;
            let consumer = &mut self.jbb_consumers[jbb_no];
            let executed = consumer.run(
                jb,
                &self.scheduler.pool,
                &mut self.cache,
                budget as usize,
                |signal| {
                    if signal.header.receiver_block_no == STOP_FOR_CRASH_BLOCK_NO {
                        crash.acknowledge_crash();
                    } else if let Some(block) = blocks.get_mut(&signal.header.receiver_block_no) {
                        block.execute(signal.header.gsn, signal);
                    }
                },
                || crossed_page = true,
            );
            if crossed_page {
                waiter.wakeup_all();
            }
            total += executed as u64;
            self.signals_since_zq_rescan += executed as u64;
            if self.signals_since_zq_rescan >= ZERO_QUEUE_RESCAN_INTERVAL {
                self.rescan_zero_queue()?;
                self.signals_since_zq_rescan = 0;
            }
            self.handle_scheduling_decisions()?;
            if total > 0 {
                self.drain_jba()?;
            }
        }
        self.next_jbb_no = (self.next_jbb_no + 1) % num_jbb;
        Ok(total)
    }

    /// Mid-round zero-queue-only rescan (every `ZERO_QUEUE_RESCAN_INTERVAL`
    /// signals, per SPEC_FULL.md §4.10). Must not re-enter
    /// `scan_time_queues`: that method interprets its argument as a
    /// wall-clock millisecond and measures it against `wall_ref_ms`, but
    /// `TimeQueue::ticks` is the wrapped alarm-space clock — the two
    /// diverge on every wrap and after an oversleep, which would trip the
    /// backwards-clock branch on every rescan.
    fn rescan_zero_queue(&mut self) -> Result<()> {
        let mut fired = Vec::new();
        self.time_queue.scan_zero_queue(&mut |dest, sig| fired.push((dest, sig)));
        for (dest, sig) in fired {
            self.sendprioa(dest, sig)?;
        }
        Ok(())
    }

    /// `handle_full_job_buffers`: called once `max_signals_per_jb` has
    /// collapsed to zero. Picks a congested destination to wait on (one
    /// whose outgoing JBB from this thread is FULL), sleeps on its
    /// `congestion_waiter` up to 1 ms, and after
    /// `MAX_CONSECUTIVE_CONGESTION_SLEEPS` empty wakeups forces progress
    /// using whatever `extra_signals` the congestion controller already
    /// granted rather than waiting forever.
    fn handle_full_job_buffers(&mut self) -> Result<()> {
        let outgoing_full: Vec<bool> = {
            let num_threads = self.scheduler.num_threads();
            let mut v = vec![false; num_threads];
            for dest in 0..num_threads {
                if dest == self.thread_idx {
                    continue;
                }
                if let Ok(target) = self.scheduler.thread(dest) {
                    v[dest] = target.jbb(self.thread_idx, dest).is_full();
                }
            }
            v
        };
        let Some(target) = CongestionState::get_congested_job_queue(self.thread_idx, &outgoing_full) else {
            return Ok(());
        };
        let mut consecutive_sleeps = 0u32;
        loop {
            if self.congestion.has_full_in_queues() {
                return Ok(());
            }
            let Ok(dest) = self.scheduler.thread(target) else { return Ok(()) };
            let still_full = dest.jbb(self.thread_idx, target).is_full();
            if !still_full {
                self.recheck_congested_job_buffers();
                return Ok(());
            }
            dest.congestion_waiter.yield_while(CONGESTION_WAIT, || {
                self.scheduler
                    .thread(target)
                    .map(|t| t.jbb(self.thread_idx, target).is_full())
                    .unwrap_or(false)
            });
            consecutive_sleeps += 1;
            if consecutive_sleeps >= MAX_CONSECUTIVE_CONGESTION_SLEEPS {
                log::warn!(
                    "thread {}: congestion waiter on thread {target} did not clear after {consecutive_sleeps} sleeps, forcing continue",
                    self.thread_idx
                );
                self.recheck_congested_job_buffers();
                return Ok(());
            }
        }
    }

    /// Drive `now_ms`'s worth of the time queue, run one job-buffer round,
    /// and decide whether to flush/sleep/fight congestion. Returns the
    /// number of signals executed this iteration, for the caller's
    /// main-loop bookkeeping (busy-loop vs sleep decisions, RT priority
    /// toggling).
    pub fn run_once(&mut self, now_ms: u32) -> Result<u64> {
        self.stat.begin_round();
        if self.cache.is_empty() {
            for _ in 0..THR_SEND_BUFFER_PRE_ALLOC {
                if self.cache.seize(&self.scheduler.pool).is_none() {
                    break;
                }
            }
        }

        let mut fired = Vec::new();
        self.time_queue.scan_time_queues(now_ms, &mut |dest, sig| fired.push((dest, sig)));
        for (dest, sig) in fired {
            self.sendprioa(dest, sig)?;
        }

        let executed = self.run_job_buffers()?;
        self.stat.record_executed(executed);

        if executed > 0 && self.local_stage.local_buffer_len() > 0 {
            self.flush_all_local_signals()?;
        } else if self.time_queue.is_empty() {
            self.stat.sleeps += 1;
        }

        if self.max_signals_per_jb == 0 {
            self.handle_full_job_buffers()?;
        }

        if executed == 0 {
            self.assist_send_thread();
        }

        Ok(executed)
    }

    /// `yield_for_work`: the sleep point reached once a round executed
    /// nothing and no timers are lagging. Predicate re-checks both JBA and
    /// every JBB on wake (spurious wakes tolerated).
    pub fn yield_for_work(&self, max_wait: Duration) -> Result<()> {
        let me = self.scheduler.thread(self.thread_idx)?;
        me.work_waiter.yield_while(max_wait, || {
            let jba_empty = me.jba.is_empty();
            let jbbs_empty = me.jbbs.iter().all(|jb| jb.is_empty());
            jba_empty && jbbs_empty && self.local_stage.is_clear()
        });
        Ok(())
    }

    /// Re-scan the connection table (and pick up new/dropped peers) this
    /// often, in main-loop iterations, on a receive thread (§4.11).
    pub const UPDATE_CONNECTIONS_INTERVAL: u64 = 16;

    /// Run the block-thread (or receive-thread, when `is_receiver`) main
    /// loop until `shutdown` is requested. `now_ms_fn` stands in for the
    /// embedding application's monotonic clock source; `poll_receive_fn` and
    /// `update_connections_fn` are only called when `is_receiver`, matching
    /// §4.11 — the latter every [`Self::UPDATE_CONNECTIONS_INTERVAL`]
    /// iterations, so a newly connected or dropped peer is noticed promptly
    /// without rescanning the connection table on every single iteration.
    pub fn run_loop(
        &mut self,
        mut now_ms_fn: impl FnMut() -> u32,
        mut poll_receive_fn: impl FnMut(u32),
        mut update_connections_fn: impl FnMut(),
    ) -> Result<()> {
        let mut last_rt_break = std::time::Instant::now();
        let mut iteration: u64 = 0;
        while !self.scheduler.is_shutting_down() && !self.scheduler.is_crashing() {
            let now_ms = now_ms_fn();
            let executed = self.run_once(now_ms)?;

            if self.is_receiver {
                iteration += 1;
                if iteration % Self::UPDATE_CONNECTIONS_INTERVAL == 0 {
                    update_connections_fn();
                }
                let delay_ms = if executed > 0 { 0 } else if self.is_main { 1 } else { 10 };
                poll_receive_fn(delay_ms);
            }

            if executed == 0 && self.time_queue.is_empty() && self.local_stage.is_clear() {
                self.yield_for_work(Duration::from_micros(self.scheduler.get_wakeup_latency() as u64))?;
            }

            if self.realtime && last_rt_break.elapsed() >= REALTIME_BREAK_AFTER {
                let _ = rt_prio::enter_normal_priority();
                let _ = rt_prio::enter_realtime_priority();
                last_rt_break = std::time::Instant::now();
            }
        }
        Ok(())
    }
}

/// Fatal helper mirroring §7's `out_of_job_buffer`/`job_buffer_full`
/// policy: call when a JBA insert fails even after exhausting every
/// fallback, since that indicates a resource-sizing bug rather than a
/// transient condition a caller could retry past.
pub fn fatal_out_of_job_buffer(thread_idx: usize) -> ! {
    crate::error::abort(&FatalError::new(format!(
        "thread {thread_idx}: job buffer exhausted (out_of_job_buffer)"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThreadConfig;
    use crate::signal::SignalHeader;

    fn cfg(n: usize) -> Config {
        Config {
            num_threads: n,
            num_receiver_threads: 0,
            num_tc_threads: 0,
            num_send_threads: 1,
            max_send_delay_us: 200,
            wakeup_latency_us: 25,
            spin_time_per_call_ns: 500,
            threads: (0..n).map(|_| ThreadConfig::new(5)).collect(),
        }
    }

    struct RecordingBlock {
        seen: Arc<std::sync::Mutex<Vec<u32>>>,
    }

    impl Block for RecordingBlock {
        fn execute(&mut self, _gsn: u16, signal: &Signal) {
            self.seen.lock().unwrap().push(signal.header.signal_id);
        }
    }

    #[test]
    fn jbb_index_compacts_self_out_of_the_producer_space() {
        assert_eq!(jbb_index_for(2, 0, 3), 0);
        assert_eq!(jbb_index_for(2, 1, 3), 1);
        assert_eq!(jbb_index_for(2, 3, 3), 2);
    }

    #[test]
    fn sendlocal_then_flush_executes_on_destination() {
        let scheduler = Scheduler::new(cfg(2)).unwrap();
        let mut t0 = BlockThreadContext::new(scheduler.clone(), 0, false, false, 0).unwrap();
        let mut t1 = BlockThreadContext::new(scheduler.clone(), 1, false, false, 0).unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        t1.register_block(42, Box::new(RecordingBlock { seen: seen.clone() }));

        let header = SignalHeader::new(1, 42, 7, 0);
        let sig = Signal::with_data(header, &[1, 2, 3]);
        t0.sendlocal(1, sig).unwrap();
        t0.flush_all_local_signals().unwrap();

        let executed = t1.run_job_buffers().unwrap();
        assert_eq!(executed, 1);
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn sendprioa_bypasses_local_stage_and_is_visible_immediately() {
        let scheduler = Scheduler::new(cfg(2)).unwrap();
        let mut t0 = BlockThreadContext::new(scheduler.clone(), 0, false, false, 0).unwrap();
        let mut t1 = BlockThreadContext::new(scheduler.clone(), 1, false, false, 0).unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        t1.register_block(9, Box::new(RecordingBlock { seen: seen.clone() }));

        let header = SignalHeader::new(1, 9, 1, 0);
        t0.sendprioa(1, Signal::new(header)).unwrap();

        let executed = t1.run_job_buffers().unwrap();
        assert_eq!(executed, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn senddelay_fires_through_sendprioa_after_scan() {
        let scheduler = Scheduler::new(cfg(2)).unwrap();
        let mut t0 = BlockThreadContext::new(scheduler.clone(), 0, false, false, 0).unwrap();
        let mut t1 = BlockThreadContext::new(scheduler.clone(), 1, false, false, 0).unwrap();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        t1.register_block(5, Box::new(RecordingBlock { seen: seen.clone() }));

        let header = SignalHeader::new(1, 5, 1, 0);
        t0.senddelay(1, Signal::new(header), crate::time_queue::BOUNDED_DELAY).unwrap();
        t0.run_once(0).unwrap();

        let executed = t1.run_job_buffers().unwrap();
        assert_eq!(executed, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn congested_destination_collapses_quota_to_zero_and_marks_congested() {
        let scheduler = Scheduler::new(cfg(2)).unwrap();
        let mut t0 = BlockThreadContext::new(scheduler.clone(), 0, false, false, 0).unwrap();

        let big = Signal::with_data(SignalHeader::new(1, 1, 1, 0), &[0u32; 25]);
        loop {
            let jb = &scheduler.thread(1).unwrap().jbb(0, 1);
            if jb.insert(&big, &scheduler.pool, &mut t0.cache) == InsertOutcome::Full {
                break;
            }
        }
        t0.set_congested_jb_quotas();
        assert_eq!(t0.max_signals_per_jb, 0);
        assert!(t0.congestion.is_any_congested());
    }

    #[test]
    fn unregistered_block_number_is_silently_dropped_not_panicking() {
        let scheduler = Scheduler::new(cfg(2)).unwrap();
        let mut t0 = BlockThreadContext::new(scheduler.clone(), 0, false, false, 0).unwrap();
        let mut t1 = BlockThreadContext::new(scheduler.clone(), 1, false, false, 0).unwrap();

        let header = SignalHeader::new(1, 999, 1, 0);
        t0.sendprioa(1, Signal::new(header)).unwrap();
        let executed = t1.run_job_buffers().unwrap();
        assert_eq!(executed, 1);
    }

    #[test]
    fn out_of_range_thread_is_a_recoverable_error_not_a_panic() {
        let scheduler = Scheduler::new(cfg(2)).unwrap();
        let mut t0 = BlockThreadContext::new(scheduler.clone(), 0, false, false, 0).unwrap();
        let header = SignalHeader::new(1, 1, 1, 0);
        let err = t0.sendlocal(7, Signal::new(header)).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidIndex { .. }));
    }

    struct FakeTransporter {
        accepted: Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
    }

    impl crate::dispatch::Transporter for FakeTransporter {
        fn prepare_send(&self, _trp: crate::dispatch::TransporterId, bytes: &[u8]) -> crate::dispatch::SendStatus {
            self.accepted.lock().unwrap().push(bytes.to_vec());
            crate::dispatch::SendStatus::Ok
        }
        fn perform_send(&self, _trp: crate::dispatch::TransporterId, _non_blocking: bool) -> std::io::Result<()> {
            Ok(())
        }
        fn get_bytes_to_send_iovec(&self, _trp: crate::dispatch::TransporterId, _iov: &mut [&[u8]], _max: usize) -> usize {
            0
        }
        fn bytes_sent(&self, _trp: crate::dispatch::TransporterId, _n: usize) -> usize {
            0
        }
        fn enable_send_buffer(&self, _trp: crate::dispatch::TransporterId) {}
        fn disable_send_buffer(&self, _trp: crate::dispatch::TransporterId) {}
        fn poll_receive(&self, _delay_ms: u32) -> usize {
            0
        }
        fn perform_receive(&self, _recv_thread_idx: usize) -> bool {
            false
        }
    }

    #[test]
    fn sendremote_without_a_transporter_is_a_recoverable_error() {
        let scheduler = Scheduler::new(cfg(1)).unwrap();
        let mut t0 = BlockThreadContext::new(scheduler.clone(), 0, false, false, 0).unwrap();
        let header = SignalHeader::new(1, 2, 3, 0);
        let err = t0.sendremote(crate::dispatch::TransporterId(0), Signal::new(header)).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig(_)));
    }

    #[test]
    fn sendremote_hands_wire_bytes_to_the_configured_transporter() {
        let scheduler = Scheduler::new(cfg(1)).unwrap();
        let accepted = Arc::new(std::sync::Mutex::new(Vec::new()));
        scheduler.set_transporter(Arc::new(FakeTransporter { accepted: accepted.clone() }));
        let mut t0 = BlockThreadContext::new(scheduler.clone(), 0, false, false, 0).unwrap();

        let header = SignalHeader::new(1, 2, 3, 0);
        let sig = Signal::with_data(header, &[9, 8, 7]);
        t0.sendremote(crate::dispatch::TransporterId(5), sig).unwrap();

        let got = accepted.lock().unwrap();
        assert_eq!(got.len(), 1);
        let back = Signal::from_wire_bytes(&got[0]).unwrap();
        assert_eq!(back.data_words(), &[9, 8, 7]);
    }

    #[test]
    fn wakeup_latency_and_spintime_are_live_tunable() {
        let scheduler = Scheduler::new(cfg(1)).unwrap();
        assert_eq!(scheduler.get_wakeup_latency(), scheduler.config.wakeup_latency_us);
        assert_eq!(scheduler.get_configured_spintime(), scheduler.config.spin_time_per_call_ns);

        scheduler.set_wakeup_latency(1234);
        assert_eq!(scheduler.get_wakeup_latency(), 1234);
        scheduler.set_spintime(5678);
        assert_eq!(scheduler.get_configured_spintime(), 5678);
    }
}
