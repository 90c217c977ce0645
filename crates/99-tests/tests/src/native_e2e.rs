#![cfg(all(test, not(target_arch = "wasm32")))]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use runtime_native::{LoopbackOptions, LoopbackPair};
use transport::{frame_size, FrameHeader, MemoryWindow, FRAME_COMPLETE, HEADER_SIZE};
use transport_fabric::{
    FabricError, HandleState, LinkLayout, MailboxReader, SendOutcome, HEARTBEAT_PORT,
};

use crate::support::{init_tracing, wait_until};

const SETTLE: Duration = Duration::from_secs(5);

fn polling_pair() -> LoopbackPair {
    LoopbackPair::establish(LoopbackOptions {
        interrupts: false,
        ..LoopbackOptions::default()
    })
    .expect("loopback link")
}

/// Sends, retrying while the ring is full and settling owed doorbells.
fn send_all(pair: &LoopbackPair, handle: &transport_fabric::TransferHandle, payload: &[u8]) {
    loop {
        match pair.owner.endpoint.send(handle, 0, payload).expect("send") {
            SendOutcome::WouldBlock => {
                let _ = pair.owner.link.poll();
                std::thread::sleep(Duration::from_micros(200));
            }
            _ => return,
        }
    }
}

#[test]
fn message_arrives_unmodified() {
    init_tracing();
    let pair = LoopbackPair::new().expect("loopback link");
    let (a, b) = (&pair.owner, &pair.peer);
    assert_eq!(b.id(), 7);

    let handle = a.endpoint.open(7, 21).expect("open");
    let inbox = b.endpoint.open(a.id(), 21).expect("open inbox");
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    b.endpoint
        .register_notifier(
            &inbox,
            Arc::new(move |payload: &[u8]| sink.lock().push(payload.to_vec())),
        )
        .expect("notifier");

    let message = b"0123456789";
    assert_eq!(
        a.endpoint.send(&handle, 2, message).expect("send"),
        SendOutcome::Signalled
    );

    assert!(wait_until(SETTLE, || !received.lock().is_empty()));
    assert_eq!(received.lock().as_slice(), &[message.to_vec()]);

    assert!(wait_until(SETTLE, || b.link.stats().delivered == 1));
    assert_eq!(b.link.stats().bytes_received, 10);
    assert!(wait_until(SETTLE, || b.mailbox.busy_slots() == 0));
    assert!(b.link.rx_ring().is_empty().expect("ring readable"));
}

#[test]
fn header_lands_on_the_wire() {
    let pair = polling_pair();
    let handle = pair.owner.endpoint.open(7, 21).expect("open");
    pair.owner
        .endpoint
        .send(&handle, 2, b"0123456789")
        .expect("send");

    let region = pair.peer.link.region();
    let layout = LinkLayout::for_region(region.size as usize).expect("layout");
    let mut raw = [0u8; HEADER_SIZE];
    region
        .window()
        .read_bytes(layout.downstream.data_offset(), &mut raw);
    let header = FrameHeader::decode(&raw);
    assert_eq!(
        (header.target_id, header.slot, header.port, header.length),
        (7, 2, 21, 10)
    );
    assert_eq!(header.check_sentinel, FRAME_COMPLETE);

    let (write, read) = pair.peer.link.rx_ring().counters().expect("counters");
    assert_eq!(write - read, frame_size(10) as u64);
}

#[test]
fn peer_replies_through_queue() {
    let pair = LoopbackPair::new().expect("loopback link");
    let inbox = pair.owner.endpoint.open(7, 40).expect("open");
    inbox.enable_queue().expect("queue");

    let reply = pair.peer.endpoint.open(1, 40).expect("open reply");
    pair.peer
        .endpoint
        .send(&reply, 0, b"pong")
        .expect("send reply");

    let payload = inbox.recv_timeout(SETTLE).expect("reply arrives");
    assert_eq!(payload, b"pong");
    assert!(matches!(
        inbox.recv_timeout(Duration::from_millis(5)),
        Err(FabricError::Timeout)
    ));
}

#[test]
fn fifo_across_wraps_with_interrupts() {
    let pair = LoopbackPair::new().expect("loopback link");
    let handle = pair.owner.endpoint.open(7, 22).expect("open");
    let inbox = pair.peer.endpoint.open(1, 22).expect("open inbox");
    inbox.enable_queue().expect("queue");

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let messages: Vec<Vec<u8>> = (0..600u32)
        .map(|seq| {
            let len = rng.gen_range(4..900);
            let mut payload = vec![0u8; len];
            rng.fill(&mut payload[..]);
            payload[..4].copy_from_slice(&seq.to_le_bytes());
            payload
        })
        .collect();

    for message in &messages {
        send_all(&pair, &handle, message);
    }

    let mut received = Vec::with_capacity(messages.len());
    // The peer's interrupt thread is the only consumer; the owner just settles
    // any doorbell it still owes.
    while received.len() < messages.len() {
        match inbox.recv_timeout(Duration::from_millis(50)) {
            Ok(payload) => received.push(payload),
            Err(FabricError::Timeout) => {
                let _ = pair.owner.link.poll();
            }
            Err(err) => panic!("unexpected receive error {err}"),
        }
    }
    assert_eq!(received, messages);
    assert!(pair.owner.link.stats().frames_sent >= messages.len() as u64);
}

#[test]
fn interrupt_and_poll_drains_keep_order() {
    let pair = LoopbackPair::new().expect("loopback link");
    let handle = pair.owner.endpoint.open(7, 26).expect("open");
    let inbox = pair.peer.endpoint.open(1, 26).expect("open inbox");

    let received = Arc::new(Mutex::new(Vec::new()));
    let entered = Arc::new(AtomicBool::new(false));
    let (sink, flag) = (received.clone(), entered.clone());
    pair.peer
        .endpoint
        .register_notifier(
            &inbox,
            Arc::new(move |payload: &[u8]| {
                if payload == b"first" {
                    flag.store(true, Ordering::Release);
                    std::thread::sleep(Duration::from_millis(200));
                }
                sink.lock().push(payload.to_vec());
            }),
        )
        .expect("notifier");

    pair.owner.endpoint.send(&handle, 0, b"first").expect("send");
    // The interrupt thread is now inside the notifier for "first".
    assert!(wait_until(SETTLE, || entered.load(Ordering::Acquire)));
    pair.owner.endpoint.send(&handle, 0, b"second").expect("send");
    pair.peer.endpoint.poll();

    assert!(wait_until(SETTLE, || received.lock().len() == 2));
    assert_eq!(
        received.lock().as_slice(),
        &[b"first".to_vec(), b"second".to_vec()]
    );
    assert!(wait_until(SETTLE, || pair.peer.link.stats().delivered == 2));
}

#[test]
fn backpressure_bounds_outstanding_doorbells() {
    let pair = polling_pair();
    let limit = pair.owner.endpoint.config().doorbell.budget_limit;
    let handle = pair.owner.endpoint.open(7, 23).expect("open");
    let inbox = pair.peer.endpoint.open(1, 23).expect("open inbox");
    inbox.enable_queue().expect("queue");

    let outcomes: Vec<SendOutcome> = (0..20u8)
        .map(|n| pair.owner.endpoint.send(&handle, 0, &[n]).expect("send"))
        .collect();
    let signalled = outcomes
        .iter()
        .filter(|o| **o == SendOutcome::Signalled)
        .count();
    assert_eq!(signalled as u32, limit);
    assert!(outcomes[limit as usize..]
        .iter()
        .all(|o| *o == SendOutcome::Pending));
    assert_eq!(pair.peer.mailbox.busy_slots(), limit);
    assert!(pair.owner.link.signal_owed());
    assert_eq!(pair.owner.link.stats().backpressure, 20 - limit as u64);

    // Pending frames are still in the ring; the receiver's polling pass finds them.
    let report = pair.peer.link.drain(64).expect("drain");
    assert_eq!(report.delivered, 20);
    assert_eq!(inbox.pending(), 20);

    // Once the receiver releases its slots, the owed doorbell goes out.
    let reader = MailboxReader::new(pair.peer.mailbox.clone());
    for slot in 0..limit {
        reader.take(slot);
    }
    pair.owner.link.poll().expect("poll");
    assert!(!pair.owner.link.signal_owed());
    assert_eq!(pair.peer.mailbox.busy_slots(), 1);
}

#[test]
fn unroutable_frames_do_not_stall() {
    let pair = polling_pair();
    let stray = pair.owner.endpoint.open(7, 99).expect("open stray");
    let handle = pair.owner.endpoint.open(7, 24).expect("open");
    let inbox = pair.peer.endpoint.open(1, 24).expect("open inbox");
    inbox.enable_queue().expect("queue");

    pair.owner.endpoint.send(&stray, 0, b"abc").expect("send stray");
    pair.owner
        .link
        .tx_ring()
        .push(FrameHeader::new(42, 0, 24), b"misaddressed")
        .expect("raw push");
    pair.owner.endpoint.send(&handle, 0, b"kept").expect("send");

    let (_, before) = pair.peer.link.rx_ring().counters().expect("counters");
    let report = pair.peer.link.drain(16).expect("drain");
    let (write, after) = pair.peer.link.rx_ring().counters().expect("counters");

    assert_eq!(report.frames, 3);
    assert_eq!(report.dropped, 2);
    assert_eq!(report.delivered, 1);
    assert_eq!(
        after - before,
        (frame_size(3) + frame_size(12) + frame_size(4)) as u64
    );
    assert_eq!(after, write);
    assert_eq!(inbox.try_recv().expect("open").as_deref(), Some(&b"kept"[..]));

    let stats = pair.peer.link.stats();
    assert_eq!(stats.no_handle, 1);
    assert_eq!(stats.misaddressed, 1);
}

#[test]
fn slow_reader_loses_overflow_not_order() {
    let mut peer = runtime_native::quick_config(7);
    peer.queue_depth = 2;
    let pair = LoopbackPair::establish(LoopbackOptions {
        peer,
        interrupts: false,
        ..LoopbackOptions::default()
    })
    .expect("loopback link");
    let handle = pair.owner.endpoint.open(7, 27).expect("open");
    let inbox = pair.peer.endpoint.open(1, 27).expect("open inbox");
    inbox.enable_queue().expect("queue");

    for n in 0..5u8 {
        pair.owner.endpoint.send(&handle, 0, &[n]).expect("send");
    }
    let report = pair.peer.link.drain(16).expect("drain");
    assert_eq!((report.delivered, report.dropped), (2, 3));
    assert_eq!(inbox.overflowed(), 3);

    let stats = pair.peer.link.stats();
    assert_eq!(stats.queue_full, 3);
    assert_eq!(stats.dropped(), 3);

    let received: Vec<Vec<u8>> = std::iter::from_fn(|| inbox.try_recv().expect("open")).collect();
    assert_eq!(received, vec![vec![0], vec![1]]);
}

#[test]
fn notifier_less_handle_drops_frames() {
    let pair = polling_pair();
    let handle = pair.owner.endpoint.open(7, 25).expect("open");
    let silent = pair.peer.endpoint.open(1, 25).expect("open silent");

    pair.owner.endpoint.send(&handle, 0, b"lost").expect("send");
    let report = pair.peer.link.drain(16).expect("drain");
    assert_eq!(report.dropped, 1);
    assert_eq!(silent.pending(), 0);
    assert_eq!(pair.peer.link.stats().no_notifier, 1);
}

#[test]
fn closed_handle_stops_receiving() {
    let pair = polling_pair();
    let handle = pair.owner.endpoint.open(7, 26).expect("open");
    let inbox = pair.peer.endpoint.open(1, 26).expect("open inbox");
    inbox.enable_queue().expect("queue");

    pair.owner.endpoint.send(&handle, 0, b"one").expect("send");
    pair.owner.endpoint.send(&handle, 0, b"two").expect("send");
    pair.peer.link.drain(16).expect("drain");
    assert_eq!(pair.peer.endpoint.close(&inbox), 2);
    assert_eq!(inbox.state(), HandleState::Closed);

    pair.owner.endpoint.send(&handle, 0, b"three").expect("send");
    let report = pair.peer.link.drain(16).expect("drain");
    assert_eq!(report.dropped, 1);
}

#[test]
fn idempotent_open_shares_one_conversation() {
    let pair = polling_pair();
    let first = pair.owner.endpoint.open(7, 27).expect("open");
    let second = pair.owner.endpoint.open(7, 27).expect("open again");
    assert!(Arc::ptr_eq(&first, &second));

    let inbox = pair.peer.endpoint.open(1, 27).expect("open inbox");
    inbox.enable_queue().expect("queue");
    pair.owner.endpoint.send(&first, 0, b"a").expect("send");
    pair.owner.endpoint.send(&second, 0, b"b").expect("send");
    pair.peer.link.drain(16).expect("drain");
    assert_eq!(inbox.pending(), 2);
}

#[test]
fn heartbeats_are_consumed_by_the_link() {
    let pair = polling_pair();
    assert_eq!(pair.owner.link.heartbeat().expect("heartbeat"), SendOutcome::Signalled);
    assert_eq!(pair.owner.link.heartbeat().expect("heartbeat"), SendOutcome::Signalled);

    let report = pair.peer.link.drain(16).expect("drain");
    assert_eq!(report.heartbeats, 2);
    assert_eq!(report.dropped, 0);
    assert_eq!(pair.peer.link.last_heartbeat(), 2);
    assert!(pair.peer.endpoint.handles().get(1, HEARTBEAT_PORT).is_none());

    let stats = pair.owner.link.stats();
    assert_eq!(stats.heartbeats_sent, 2);
}

#[test]
fn allocated_ports_round_trip() {
    let pair = polling_pair();
    let handle = pair.owner.endpoint.allocate(7).expect("allocate");
    let inbox = pair
        .peer
        .endpoint
        .open(1, handle.port())
        .expect("open inbox");
    inbox.enable_queue().expect("queue");

    pair.owner.endpoint.send(&handle, 0, b"hello").expect("send");
    pair.poll_until_idle(Duration::from_millis(10));
    assert_eq!(inbox.try_recv().expect("open").as_deref(), Some(&b"hello"[..]));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn polled_delivery_preserves_order(
        payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..2048), 1..40)
    ) {
        let pair = polling_pair();
        let handle = pair.owner.endpoint.open(7, 30).expect("open");
        let inbox = pair.peer.endpoint.open(1, 30).expect("open inbox");
        inbox.enable_queue().expect("queue");

        let mut received = Vec::new();
        for payload in &payloads {
            while pair.owner.endpoint.send(&handle, 0, payload).expect("send") == SendOutcome::WouldBlock {
                pair.peer.link.drain(64).expect("drain");
                while let Some(got) = inbox.try_recv().expect("open") {
                    received.push(got);
                }
            }
        }
        pair.poll_until_idle(Duration::from_millis(5));
        while let Some(got) = inbox.try_recv().expect("open") {
            received.push(got);
        }
        prop_assert_eq!(received, payloads);
    }
}
