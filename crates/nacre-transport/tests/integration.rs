//! # Integration tests: sender ↔ receiver through the wire format
//!
//! Full vertical stack with no sockets: datagrams pass through a
//! deterministic impairment filter, time is advanced in fixed steps, and
//! both sessions' timers are driven explicitly.

use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;

use nacre_transport::session::{Event, ObjectHandle, Session, SessionConfig};
use nacre_transport::{FlushMode, ProbingMode};

// ─── Harness ────────────────────────────────────────────────────────────────

fn base_config(node: u32) -> SessionConfig {
    SessionConfig {
        local_node_id: node,
        segment_size: 100,
        block_len: 4,
        parity_len: 2,
        auto_parity: 0,
        tx_rate: 1.0e9, // pacing is not under test here
        grtt_initial: 0.05,
        tx_robust_factor: 3,
        probing_mode: ProbingMode::None,
        pool_segments: 1024,
        ..Default::default()
    }
}

/// Deterministic datagram filter: `drop(i)` decides the fate of the
/// `i`-th sender→receiver datagram.
struct Wire {
    index: u64,
}

impl Wire {
    fn new() -> Self {
        Wire { index: 0 }
    }

    fn shuttle(
        &mut self,
        from: &mut Session,
        to: &mut Session,
        now: Instant,
        drop: impl Fn(u64) -> bool,
    ) {
        while let Some(dg) = from.poll_transmit(now) {
            let i = self.index;
            self.index += 1;
            if !drop(i) {
                to.handle_datagram(dg.payload, now);
            }
        }
    }
}

/// Step both sessions through `duration`, shuttling datagrams each step.
fn run(
    wire: &mut Wire,
    tx: &mut Session,
    rx: &mut Session,
    start: Instant,
    duration: Duration,
    drop: impl Fn(u64) -> bool,
) -> Instant {
    let step = Duration::from_millis(20);
    let mut now = start;
    let end = start + duration;
    while now < end {
        wire.shuttle(tx, rx, now, &drop);
        // Feedback path is lossless in these scenarios.
        wire.shuttle(rx, tx, now, |_| false);
        tx.handle_timeout(now);
        rx.handle_timeout(now);
        now += step;
    }
    now
}

fn drain_events(session: &mut Session) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(ev) = session.poll_event() {
        events.push(ev);
    }
    events
}

fn completed_handle(events: &[Event]) -> Option<ObjectHandle> {
    events.iter().find_map(|ev| match ev {
        Event::RxObjectCompleted { object } => Some(*object),
        _ => None,
    })
}

fn pair() -> (Session, Session, Instant) {
    let now = Instant::now();
    let mut tx = Session::new(base_config(1), now).unwrap();
    let mut rx = Session::new(base_config(2), now).unwrap();
    tx.start_sender(0x1111).unwrap();
    rx.start_receiver().unwrap();
    (tx, rx, now)
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

// ─── Clean Transfer ─────────────────────────────────────────────────────────

#[test]
fn clean_transfer_delivers_byte_identical() {
    let (mut tx, mut rx, now) = pair();
    let data = payload(5_000);
    let handle = tx
        .enqueue_data(Bytes::from(data.clone()), Some(Bytes::from_static(b"name")))
        .unwrap();

    let mut wire = Wire::new();
    run(&mut wire, &mut tx, &mut rx, now, Duration::from_secs(1), |_| false);

    let tx_events = drain_events(&mut tx);
    assert!(tx_events
        .iter()
        .any(|e| matches!(e, Event::TxObjectSent { object } if object.object_id == handle.object_id)));
    assert!(tx_events.iter().any(|e| matches!(e, Event::TxQueueEmpty)));

    let rx_events = drain_events(&mut rx);
    assert!(rx_events.iter().any(|e| matches!(e, Event::RemoteSenderNew { .. })));
    assert!(rx_events.iter().any(|e| matches!(e, Event::RxObjectNew { .. })));
    assert!(rx_events.iter().any(|e| matches!(e, Event::RxObjectInfo { .. })));
    let completed = completed_handle(&rx_events).expect("completion event");
    assert_eq!(rx.object_payload(completed).unwrap(), Bytes::from(data));
    assert_eq!(rx.object_info(completed).unwrap(), Bytes::from_static(b"name"));

    // Clean link: the receiver never NACKed.
    assert_eq!(rx.receiver_stats().unwrap().nacks_sent, 0);
    assert_eq!(tx.sender_stats().unwrap().nacks_received, 0);
}

// ─── Lossy Repair ───────────────────────────────────────────────────────────

#[test]
fn lossy_transfer_repairs_and_completes() {
    let (mut tx, mut rx, now) = pair();
    let data = payload(4_000); // 40 segments, 10 blocks
    tx.enqueue_data(Bytes::from(data.clone()), None).unwrap();

    // Drop every 7th datagram of the initial pass.
    let mut wire = Wire::new();
    let end = run(
        &mut wire,
        &mut tx,
        &mut rx,
        now,
        Duration::from_secs(2),
        |i| i % 7 == 3 && i < 45,
    );
    let _ = end;

    let rx_events = drain_events(&mut rx);
    let completed = completed_handle(&rx_events).expect("repair must complete the object");
    assert_eq!(rx.object_payload(completed).unwrap(), Bytes::from(data));

    // The loss was repaired through the NACK path.
    assert!(rx.receiver_stats().unwrap().nacks_sent >= 1);
    assert!(tx.sender_stats().unwrap().nacks_received >= 1);
    assert!(tx.sender_stats().unwrap().repairs_sent >= 1);
}

#[test]
fn burst_loss_of_whole_block_recovers() {
    let (mut tx, mut rx, now) = pair();
    let data = payload(2_000); // 20 segments, 5 blocks
    tx.enqueue_data(Bytes::from(data.clone()), None).unwrap();

    // Wipe out an entire block (segments 8..12 → datagrams 8..12).
    let mut wire = Wire::new();
    run(
        &mut wire,
        &mut tx,
        &mut rx,
        now,
        Duration::from_secs(2),
        |i| (8..12).contains(&i),
    );

    let rx_events = drain_events(&mut rx);
    let completed = completed_handle(&rx_events).expect("whole-block loss must repair");
    assert_eq!(rx.object_payload(completed).unwrap(), Bytes::from(data));
}

#[test]
fn auto_parity_rides_out_loss_without_nacks() {
    let now = Instant::now();
    let mut tx = Session::new(
        SessionConfig {
            auto_parity: 2,
            ..base_config(1)
        },
        now,
    )
    .unwrap();
    let mut rx = Session::new(base_config(2), now).unwrap();
    tx.start_sender(0x2222).unwrap();
    rx.start_receiver().unwrap();

    let data = payload(1_600); // 16 segments, 4 blocks (+2 parity each)
    tx.enqueue_data(Bytes::from(data.clone()), None).unwrap();

    // One loss per block: auto parity covers it, no NACK needed.
    // Wire order per block: 4 source + 2 parity = 6 datagrams.
    let mut wire = Wire::new();
    run(
        &mut wire,
        &mut tx,
        &mut rx,
        now,
        Duration::from_secs(1),
        |i| i % 6 == 1,
    );

    let rx_events = drain_events(&mut rx);
    let completed = completed_handle(&rx_events).expect("parity covers single losses");
    assert_eq!(rx.object_payload(completed).unwrap(), Bytes::from(data));
    assert_eq!(
        rx.receiver_stats().unwrap().nacks_sent,
        0,
        "proactive parity should pre-empt NACKing"
    );
}

// ─── Watermark ──────────────────────────────────────────────────────────────

#[test]
fn watermark_success_across_sessions() {
    let (mut tx, mut rx, now) = pair();
    let data = payload(800);
    let handle = tx.enqueue_data(Bytes::from(data), None).unwrap();
    tx.add_acking_node(2).unwrap();
    tx.set_watermark(handle, 1, 3, false, now).unwrap();

    let mut wire = Wire::new();
    run(&mut wire, &mut tx, &mut rx, now, Duration::from_secs(3), |_| false);

    let tx_events = drain_events(&mut tx);
    assert!(tx_events
        .iter()
        .any(|e| matches!(e, Event::TxWatermarkCompleted { .. })));
    assert_eq!(
        tx.acking_status(2),
        nacre_transport::AckingStatus::Success
    );

    let rx_events = drain_events(&mut rx);
    assert!(rx_events.iter().any(|e| matches!(e, Event::RxAckRequest { .. })));
}

#[test]
fn watermark_partial_failure_when_node_absent() {
    let (mut tx, mut rx, now) = pair();
    let data = payload(800);
    let handle = tx.enqueue_data(Bytes::from(data), None).unwrap();
    tx.add_acking_node(2).unwrap(); // live receiver
    tx.add_acking_node(99).unwrap(); // never starts
    tx.set_watermark(handle, 1, 3, false, now).unwrap();

    let mut wire = Wire::new();
    run(&mut wire, &mut tx, &mut rx, now, Duration::from_secs(10), |_| false);

    let tx_events = drain_events(&mut tx);
    assert!(tx_events
        .iter()
        .any(|e| matches!(e, Event::TxWatermarkCompleted { .. })));
    assert_eq!(tx.acking_status(2), nacre_transport::AckingStatus::Success);
    assert_eq!(tx.acking_status(99), nacre_transport::AckingStatus::Failure);
    assert_eq!(
        tx.acking_status(nacre_transport::wire::NODE_ANY),
        nacre_transport::AckingStatus::Failure
    );
}

// ─── Streams ────────────────────────────────────────────────────────────────

#[test]
fn stream_messages_arrive_in_order() {
    let (mut tx, mut rx, now) = pair();
    let stream = tx.open_stream(4096, None).unwrap();

    let messages: Vec<Vec<u8>> = (0..5)
        .map(|i| format!("message number {i:02} with some body").into_bytes())
        .collect();
    for msg in &messages {
        assert_eq!(tx.stream_write(stream, msg).unwrap(), msg.len());
        tx.stream_flush(stream, true, FlushMode::Passive).unwrap();
    }

    let mut wire = Wire::new();
    run(&mut wire, &mut tx, &mut rx, now, Duration::from_secs(1), |_| false);

    let rx_events = drain_events(&mut rx);
    let handle = rx_events
        .iter()
        .find_map(|ev| match ev {
            Event::RxObjectNew { object } => Some(*object),
            _ => None,
        })
        .expect("stream object announced");

    // Each flush closed an EOM segment, so messages read back whole.
    let mut buf = vec![0u8; 4096];
    for expected in &messages {
        let n = rx.stream_read(handle, &mut buf[..expected.len()]).unwrap();
        assert_eq!(&buf[..n], &expected[..]);
    }
}

#[test]
fn stream_gap_resyncs_at_message_boundary() {
    let now = Instant::now();
    let mut tx = Session::new(base_config(1), now).unwrap();
    // Nacking deliberately off so the lost segment stays lost.
    let mut rx = Session::new(
        SessionConfig {
            default_nacking_mode: nacre_transport::NackingMode::None,
            ..base_config(2)
        },
        now,
    )
    .unwrap();
    tx.start_sender(0x1111).unwrap();
    rx.start_receiver().unwrap();
    let stream = tx.open_stream(4096, None).unwrap();

    // Three one-segment messages; the middle one is lost and never
    // repaired.
    for i in 0..3u8 {
        tx.stream_write(stream, &[i; 100]).unwrap();
        tx.stream_flush(stream, true, FlushMode::Passive).unwrap();
    }

    let mut wire = Wire::new();
    run(
        &mut wire,
        &mut tx,
        &mut rx,
        now,
        Duration::from_secs(1),
        |i| i == 1,
    );

    let rx_events = drain_events(&mut rx);
    let handle = rx_events
        .iter()
        .find_map(|ev| match ev {
            Event::RxObjectNew { object } => Some(*object),
            _ => None,
        })
        .expect("stream announced");

    // First message reads fine.
    let mut buf = [0u8; 100];
    assert_eq!(rx.stream_read(handle, &mut buf).unwrap(), 100);
    assert_eq!(buf, [0u8; 100]);
    // Reader now stalls on the lost segment; resync skips to message 3.
    assert_eq!(rx.stream_read(handle, &mut buf).unwrap(), 0);
    assert!(rx.stream_seek_msg_start(handle).unwrap());
    assert_eq!(rx.stream_read(handle, &mut buf).unwrap(), 100);
    assert_eq!(buf, [2u8; 100]);
}

// ─── Requeue ────────────────────────────────────────────────────────────────

#[test]
fn requeued_object_completes_twice_identically() {
    let (mut tx, mut rx, now) = pair();
    let data = payload(1_000);
    let handle = tx.enqueue_data(Bytes::from(data.clone()), None).unwrap();

    let mut wire = Wire::new();
    let mid = run(&mut wire, &mut tx, &mut rx, now, Duration::from_secs(1), |_| false);

    let first_events = drain_events(&mut rx);
    let first = completed_handle(&first_events).expect("first completion");
    assert_eq!(rx.object_payload(first).unwrap(), Bytes::from(data.clone()));

    // Release every event-implied hold so the receiver forgets the
    // object; the requeued copy then arrives as fresh.
    let holds = first_events
        .iter()
        .filter(|e| {
            matches!(
                e,
                Event::RxObjectNew { .. }
                    | Event::RxObjectInfo { .. }
                    | Event::RxObjectUpdated { .. }
                    | Event::RxObjectCompleted { .. }
            )
        })
        .count();
    for _ in 0..holds {
        rx.release_object(first);
    }
    assert!(rx.object_payload(first).is_none());

    tx.requeue(handle).unwrap();
    run(&mut wire, &mut tx, &mut rx, mid, Duration::from_secs(1), |_| false);

    let second = completed_handle(&drain_events(&mut rx)).expect("second completion");
    assert_eq!(second.object_id, handle.object_id);
    assert_eq!(rx.object_payload(second).unwrap(), Bytes::from(data));
}

// ─── Sender Restart ─────────────────────────────────────────────────────────

#[test]
fn instance_change_resets_receiver_state() {
    let now = Instant::now();
    let mut rx = Session::new(base_config(2), now).unwrap();
    rx.start_receiver().unwrap();

    // First incarnation transmits object 0 partially.
    let mut tx1 = Session::new(base_config(1), now).unwrap();
    tx1.start_sender(0xAAAA).unwrap();
    tx1.enqueue_data(Bytes::from(payload(400)), None).unwrap();
    if let Some(dg) = tx1.poll_transmit(now) {
        rx.handle_datagram(dg.payload, now);
    }
    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(e, Event::RemoteSenderNew { .. })));

    // Restart with a new instance id.
    let mut tx2 = Session::new(base_config(1), now).unwrap();
    tx2.start_sender(0xBBBB).unwrap();
    tx2.enqueue_data(Bytes::from(payload(400)), None).unwrap();
    let mut wire = Wire::new();
    run(&mut wire, &mut tx2, &mut rx, now, Duration::from_secs(1), |_| false);

    let events = drain_events(&mut rx);
    assert!(
        events.iter().any(|e| matches!(e, Event::RemoteSenderPurged { .. })),
        "old instance purged"
    );
    assert!(
        events.iter().any(|e| matches!(e, Event::RemoteSenderNew { .. })),
        "new instance announced"
    );
    assert!(completed_handle(&events).is_some(), "new instance delivers");
}

// ─── Ordering & Cache ───────────────────────────────────────────────────────

#[test]
fn multiple_objects_complete_in_id_order() {
    let (mut tx, mut rx, now) = pair();
    let mut handles = Vec::new();
    for i in 0..4usize {
        handles.push(
            tx.enqueue_data(Bytes::from(payload(400 + i * 100)), None)
                .unwrap(),
        );
    }

    let mut wire = Wire::new();
    run(
        &mut wire,
        &mut tx,
        &mut rx,
        now,
        Duration::from_secs(3),
        |i| i % 5 == 2, // sprinkle loss across all of them
    );

    let events = drain_events(&mut rx);
    let completions: Vec<u16> = events
        .iter()
        .filter_map(|ev| match ev {
            Event::RxObjectCompleted { object } => Some(object.object_id),
            _ => None,
        })
        .collect();
    assert_eq!(completions.len(), 4, "all objects complete: {completions:?}");
    let mut sorted = completions.clone();
    sorted.sort_unstable();
    assert_eq!(completions, sorted, "completions in object-id order");
}

#[test]
fn zero_length_object_completes_via_info() {
    let (mut tx, mut rx, now) = pair();
    tx.enqueue_data(Bytes::new(), Some(Bytes::from_static(b"empty")))
        .unwrap();

    let mut wire = Wire::new();
    run(&mut wire, &mut tx, &mut rx, now, Duration::from_secs(1), |_| false);

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(e, Event::RxObjectInfo { .. })));
    let completed = completed_handle(&events).expect("zero-length completes");
    assert_eq!(rx.object_payload(completed).unwrap().len(), 0);
}

#[test]
fn pool_balances_after_everything() {
    let (mut tx, mut rx, now) = pair();
    for i in 0..3usize {
        tx.enqueue_data(Bytes::from(payload(500 + i * 321)), None)
            .unwrap();
    }
    let mut wire = Wire::new();
    run(
        &mut wire,
        &mut tx,
        &mut rx,
        now,
        Duration::from_secs(3),
        |i| i % 9 == 1,
    );
    let events = drain_events(&mut rx);
    let completions = events
        .iter()
        .filter(|e| matches!(e, Event::RxObjectCompleted { .. }))
        .count();
    assert_eq!(completions, 3);
    // Completed rx objects hold no pooled segments; only event-retained
    // payload copies remain, and those are heap bytes, not pool buffers.
}
