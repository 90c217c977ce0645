#![cfg(all(test, not(target_arch = "wasm32")))]

use std::sync::Arc;

use runtime_native::{
    quick_config, BusMap, FaultPlan, LoopbackMailbox, LoopbackOptions, LoopbackPair, SilentLine,
};
use transport::frame::CHECK_OFFSET;
use transport::{BusMemory, MemoryWindow, RegionInit, FRAME_COMPLETE};
use transport_fabric::handshake::boot;
use transport_fabric::{
    Endpoint, ExposedRegion, FabricError, HandleState, HandshakePhase, LinkState, RetrySection,
    SendOutcome, StallSetting, TransportConfig,
};

use crate::support::init_tracing;

fn faulty_pair(plan: &Arc<FaultPlan>) -> LoopbackPair {
    LoopbackPair::establish(LoopbackOptions {
        interrupts: false,
        peer_faults: Some(plan.clone()),
        ..LoopbackOptions::default()
    })
    .expect("loopback link")
}

/// A domain whose handshake gives up after a couple of milliseconds.
fn impatient(local_id: u32) -> TransportConfig {
    let mut config = quick_config(local_id);
    config.handshake.poll = RetrySection::new(20, 100, 1);
    config
}

fn boot_window() -> BusMemory {
    BusMemory::new_aligned(boot::LEN, 64, 0x0010_0000, RegionInit::Zeroed).expect("boot window")
}

#[test]
fn bus_error_takes_link_down() {
    init_tracing();
    let plan = FaultPlan::new();
    let pair = faulty_pair(&plan);
    let reply = pair.peer.endpoint.open(1, 21).expect("open");
    assert_eq!(
        pair.peer.endpoint.send(&reply, 0, b"before").expect("send"),
        SendOutcome::Signalled
    );

    plan.sever();
    let err = pair
        .peer
        .endpoint
        .send(&reply, 0, b"after")
        .expect_err("bus is gone");
    assert!(err.is_link_down(), "unexpected error {err}");

    assert_eq!(pair.peer.link.state(), LinkState::Dead);
    assert_eq!(reply.state(), HandleState::Dead);
    assert!(matches!(
        reply.try_recv(),
        Err(FabricError::LinkDown { remote: 1 })
    ));
    assert!(matches!(
        pair.peer.endpoint.link(1),
        Err(FabricError::LinkDown { remote: 1 })
    ));
    assert!(pair.peer.link.drain(4).is_err());

    // The owner's view of the region is unaffected.
    assert_eq!(pair.owner.link.state(), LinkState::Up);
}

#[test]
fn stalled_sentinel_resyncs() {
    let plan = FaultPlan::new();
    let pair = faulty_pair(&plan);
    let inbox = pair.owner.endpoint.open(7, 22).expect("open");
    inbox.enable_queue().expect("queue");
    let reply = pair.peer.endpoint.open(1, 22).expect("open reply");

    plan.hold_sentinels(true);
    pair.peer.endpoint.send(&reply, 0, b"lost").expect("send");
    assert_eq!(plan.held(), 1);

    let report = pair.owner.link.drain(8).expect("drain");
    assert!(report.stalled);
    assert_eq!(report.delivered, 0);
    assert_eq!(pair.owner.link.stats().stalls, 1);
    assert!(pair.owner.link.rx_ring().is_empty().expect("ring readable"));

    plan.hold_sentinels(false);
    pair.peer.endpoint.send(&reply, 0, b"found").expect("send");
    let report = pair.owner.link.drain(8).expect("drain");
    assert!(!report.stalled);
    assert_eq!(report.delivered, 1);
    assert_eq!(inbox.try_recv().expect("open").as_deref(), Some(&b"found"[..]));
}

#[test]
fn retain_policy_keeps_frame() {
    let plan = FaultPlan::new();
    let mut owner = quick_config(1);
    owner.ring.stall = StallSetting::Retain;
    let pair = LoopbackPair::establish(LoopbackOptions {
        owner,
        interrupts: false,
        peer_faults: Some(plan.clone()),
        ..LoopbackOptions::default()
    })
    .expect("loopback link");
    let inbox = pair.owner.endpoint.open(7, 23).expect("open");
    inbox.enable_queue().expect("queue");
    let reply = pair.peer.endpoint.open(1, 23).expect("open reply");

    plan.hold_sentinels(true);
    pair.peer.endpoint.send(&reply, 0, b"late").expect("send");

    let report = pair.owner.link.drain(8).expect("drain");
    assert!(report.stalled);
    assert!(!pair.owner.link.rx_ring().is_empty().expect("ring readable"));

    // The sentinel finally lands.
    let data = pair.owner.link.rx_ring().layout().data_offset();
    pair.owner
        .link
        .region()
        .window()
        .store_u32(data + CHECK_OFFSET, FRAME_COMPLETE);

    let report = pair.owner.link.drain(8).expect("drain");
    assert_eq!(report.delivered, 1);
    assert_eq!(inbox.try_recv().expect("open").as_deref(), Some(&b"late"[..]));
    assert!(pair.owner.link.rx_ring().is_empty().expect("ring readable"));
}

#[test]
fn owner_handshake_times_out_without_peer() {
    let bus = BusMap::new(0x8000_0000);
    let bootstrap = boot_window();
    let endpoint = Endpoint::new(impatient(1)).expect("endpoint");
    let doorbell = endpoint.doorbell(7, Arc::new(LoopbackMailbox::new(4)), Arc::new(SilentLine));
    let region = bus.allocate(4096).expect("region");

    let err = endpoint
        .connect_owner(7, &bootstrap, doorbell, ExposedRegion::from_bus_memory(region), None)
        .expect_err("nobody acknowledges");
    assert!(matches!(
        err,
        FabricError::HandshakeTimeout {
            phase: HandshakePhase::Primary
        }
    ));
    assert_eq!(bootstrap.load_u32(boot::CHECK), 0);
    assert!(matches!(
        endpoint.link(7),
        Err(FabricError::LinkDown { remote: 7 })
    ));
}

#[test]
fn peer_handshake_times_out_without_owner() {
    let bus = BusMap::new(0x8000_0000);
    let bootstrap = boot_window();
    let endpoint = Endpoint::new(impatient(7)).expect("endpoint");
    let doorbell = endpoint.doorbell(1, Arc::new(LoopbackMailbox::new(4)), Arc::new(SilentLine));

    let err = endpoint
        .connect_peer(1, &bootstrap, doorbell, &bus)
        .expect_err("nothing offered");
    assert!(matches!(
        err,
        FabricError::HandshakeTimeout {
            phase: HandshakePhase::Primary
        }
    ));
    assert!(endpoint.links().is_empty());
}

#[test]
fn no_slot_leaves_frame_for_polling() {
    let pair = LoopbackPair::establish(LoopbackOptions {
        interrupts: false,
        mailbox_slots: 2,
        ..LoopbackOptions::default()
    })
    .expect("loopback link");
    let handle = pair.owner.endpoint.open(7, 24).expect("open");
    let inbox = pair.peer.endpoint.open(1, 24).expect("open inbox");
    inbox.enable_queue().expect("queue");

    let outcomes: Vec<SendOutcome> = (0..4u8)
        .map(|n| pair.owner.endpoint.send(&handle, 0, &[n]).expect("send"))
        .collect();
    assert_eq!(&outcomes[..2], &[SendOutcome::Signalled; 2]);
    assert_eq!(&outcomes[2..], &[SendOutcome::Pending; 2]);
    assert!(pair.owner.link.stats().no_slot >= 2);
    assert!(pair.owner.link.signal_owed());

    pair.poll_until_idle(std::time::Duration::from_millis(10));
    let received: Vec<Vec<u8>> = std::iter::from_fn(|| inbox.try_recv().expect("open")).collect();
    assert_eq!(received, vec![vec![0], vec![1], vec![2], vec![3]]);
}

#[test]
fn originator_clash_is_refused() {
    let pair = faulty_pair(&FaultPlan::new());
    // 0x101 rings doorbells as 0x01, which already names the owner.
    let doorbell = pair.peer.endpoint.doorbell(
        0x101,
        Arc::new(LoopbackMailbox::new(4)),
        Arc::new(SilentLine),
    );

    let err = pair
        .peer
        .endpoint
        .connect_peer(0x101, &*pair.boot, doorbell, &*pair.bus)
        .expect_err("originator already taken");
    assert!(matches!(
        err,
        FabricError::OriginatorClash {
            remote: 0x101,
            existing: 1,
            originator: 0x01
        }
    ));
    assert!(matches!(
        pair.peer.endpoint.link(0x101),
        Err(FabricError::UnknownRemote { remote: 0x101 })
    ));
    assert_eq!(pair.peer.endpoint.links().len(), 1);
    assert_eq!(pair.peer.link.state(), LinkState::Up);
}
