// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use signalcore::page::PagePool;
use signalcore::send_buffer::{SendBuffer, SendBufferWriter};

/// Thread A holds `send_lock` (mid-send). Thread B has fresh bytes queued
/// in its writer and cannot get the lock itself, so it calls
/// `request_force_send`, which fails the `trylock` and sets the flag
/// instead. A, on its next `unlock`, reads the flag through the same full
/// memory barrier the lock's release uses and drains B's bytes before
/// reporting done.
#[test]
fn force_send_flag_set_while_locked_is_observed_and_drains_the_waiting_writer() {
    let pool = PagePool::new(1, None);
    let sb = SendBuffer::new();
    let mut writer = SendBufferWriter::new(0);

    // B's bytes, queued ahead of the handoff.
    let (at, len) = writer.get_write_ptr(&pool, 4).unwrap();
    writer.write_slice(at, len).copy_from_slice(b"data");
    writer.update_write_ptr(len);
    writer.flush();

    let (a_holds_lock_tx, a_holds_lock_rx) = mpsc::channel::<()>();
    let (b_set_flag_tx, b_set_flag_rx) = mpsc::channel::<()>();

    thread::scope(|scope| {
        let sb = &sb;
        scope.spawn(move || {
            sb.lock_send_for_test();
            a_holds_lock_tx.send(()).unwrap();
            // Hold the lock long enough for B to observe it and set the flag.
            b_set_flag_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            sb.unlock_send_for_test();
            assert!(sb.take_force_send(), "A must observe B's force-send request after unlock");
        });

        a_holds_lock_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(
            sb.request_force_send(),
            "request_force_send must fail trylock and set the flag while A holds send_lock"
        );
        b_set_flag_tx.send(()).unwrap();
    });

    // A's next send drains what B queued.
    let chunks = sb.get_bytes_to_send_iovec(&[&writer], 8);
    assert_eq!(chunks, vec![b"data".to_vec()]);
    let left = sb.bytes_sent(&pool, 0, 4);
    assert_eq!(left, 0);
}
