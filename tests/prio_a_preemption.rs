// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

use std::sync::{Arc, Mutex};

use signalcore::config::{Config, ThreadConfig};
use signalcore::dispatch::Block;
use signalcore::scheduler::{BlockThreadContext, Scheduler, MAX_SIGNALS_PER_JB};
use signalcore::signal::{Signal, SignalHeader};

const PRIO_B_BLOCK: u16 = 1;
const PRIO_A_BLOCK: u16 = 2;

struct Recorder {
    order: Arc<Mutex<Vec<u16>>>,
}

impl Block for Recorder {
    fn execute(&mut self, _gsn: u16, signal: &Signal) {
        self.order.lock().unwrap().push(signal.header.receiver_block_no);
    }
}

fn cfg(n: usize) -> Config {
    Config {
        num_threads: n,
        num_receiver_threads: 0,
        num_tc_threads: 0,
        num_send_threads: 1,
        max_send_delay_us: 200,
        wakeup_latency_us: 200,
        spin_time_per_call_ns: 500,
        threads: (0..n).map(|_| ThreadConfig::new(5)).collect(),
    }
}

/// While C's incoming JBB is packed with prio-B traffic, P issues
/// `sendprioa`. Even though the JBB alone holds far more than
/// `MAX_SIGNALS_PER_JB` signals, C's round drains its JBA to exhaustion
/// before touching any JBB, so the prio-A signal is always observed
/// first, well inside the "within at most MAX_SIGNALS_PER_JB JBB signals"
/// bound the scenario requires.
#[test]
fn prio_a_signal_is_executed_ahead_of_a_backlogged_jbb() {
    let scheduler = Scheduler::new(cfg(2)).unwrap();
    let mut p = BlockThreadContext::new(scheduler.clone(), 0, false, false, 0).unwrap();
    let mut c = BlockThreadContext::new(scheduler.clone(), 1, false, false, 0).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    c.register_block(PRIO_B_BLOCK, Box::new(Recorder { order: order.clone() }));
    c.register_block(PRIO_A_BLOCK, Box::new(Recorder { order: order.clone() }));

    // Pack C's JBB with more prio-B traffic than a single round's quota.
    let backlog = MAX_SIGNALS_PER_JB as usize * 2;
    for i in 0..backlog {
        let header = SignalHeader::new(1, PRIO_B_BLOCK, 1, i as u32 + 1);
        p.sendlocal(1, Signal::new(header)).unwrap();
    }
    p.flush_all_local_signals().unwrap();

    // Then a prio-A signal lands on top of the backlog.
    let prio_a = SignalHeader::new(1, PRIO_A_BLOCK, 2, 0);
    p.sendprioa(1, Signal::new(prio_a)).unwrap();

    let executed = c.run_job_buffers_for_test().unwrap();
    assert!(executed > 0);

    let order = order.lock().unwrap();
    assert_eq!(
        order.first(),
        Some(&PRIO_A_BLOCK),
        "a prio-A signal must be executed ahead of any backlogged prio-B signal"
    );
    // And it fired well within the JBB's own per-round signal budget.
    let prio_a_pos = order.iter().position(|&b| b == PRIO_A_BLOCK).unwrap();
    assert!(prio_a_pos < MAX_SIGNALS_PER_JB as usize);
}
