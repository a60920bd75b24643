// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use signalcore::config::{Config, ThreadConfig};
use signalcore::dispatch::Block;
use signalcore::scheduler::{BlockThreadContext, Scheduler};
use signalcore::signal::{Signal, SignalHeader};

const DEST_BLOCK: u16 = 1;

struct Collector {
    seen: Arc<Mutex<Vec<u32>>>,
}

impl Block for Collector {
    fn execute(&mut self, _gsn: u16, signal: &Signal) {
        self.seen.lock().unwrap().push(signal.header.signal_id);
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

/// A producer thread sends 1,000 prio-B signals to a consumer thread; the
/// consumer must observe signal ids 1..=1000 in exactly that order.
#[test]
fn single_producer_single_consumer_preserves_fifo_order() {
    let scheduler = Scheduler::new(cfg(2)).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut consumer = BlockThreadContext::new(scheduler.clone(), 1, false, false, 0).unwrap();
    consumer.register_block(DEST_BLOCK, Box::new(Collector { seen: seen.clone() }));

    let seen_for_loop = seen.clone();
    let consumer_handle = thread::spawn(move || {
        let mut now = 0u32;
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while seen_for_loop.lock().unwrap().len() < 1000 && std::time::Instant::now() < deadline {
            consumer.run_once(now).unwrap();
            now = now.wrapping_add(1);
            thread::sleep(Duration::from_micros(50));
        }
    });

    let mut producer = BlockThreadContext::new(scheduler.clone(), 0, false, false, 0).unwrap();
    for i in 1..=1000u32 {
        let header = SignalHeader::new(1, DEST_BLOCK, 7, i);
        producer.sendlocal(1, Signal::new(header)).unwrap();
    }
    producer.flush_all_local_signals().unwrap();

    consumer_handle.join().unwrap();

    let got = seen.lock().unwrap();
    assert_eq!(got.len(), 1000);
    assert_eq!(*got, (1..=1000u32).collect::<Vec<_>>());
}
