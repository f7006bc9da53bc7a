//! Heartbeat consumer round-trip: activation, timeout, remote reset

use integration_tests::{leak, CallRecorder, TestHarness};
use sentrycan_common::messages::{CanId, CanMessage, EmcyMessage, NmtState};
use sentrycan_node::heartbeat::HbState;

const PEER: u8 = 0x20;

fn peer_heartbeat(state: NmtState) -> CanMessage {
    CanMessage::new(CanId::Std(0x700 + PEER as u16), &[state as u8])
}

fn peer_bootup() -> CanMessage {
    CanMessage::new(CanId::Std(0x700 + PEER as u16), &[0])
}

#[test]
fn test_timeout_then_recovery() {
    let mut harness = TestHarness::booted(5);

    // Monitor node 0x20 with a 150 ms period
    let value: u32 = ((PEER as u32) << 16) | 150;
    harness.sdo_download(0x1016, 1, &value.to_le_bytes()).unwrap();

    let timeouts: &'static CallRecorder<(u8, u8)> = leak(CallRecorder::new());
    harness
        .ctx
        .hb_consumer
        .on_timeout(leak(move |node, idx| timeouts.record((node, idx))));
    let resets: &'static CallRecorder<(u8, u8)> = leak(CallRecorder::new());
    harness
        .ctx
        .hb_consumer
        .on_remote_reset(leak(move |node, idx| resets.record((node, idx))));

    // Boot-up followed by heartbeats every 50 ms for one second
    harness.inject(peer_bootup());
    harness.tick();
    for _ in 0..20 {
        harness.inject(peer_heartbeat(NmtState::Operational));
        harness.tick_ms(50);
    }
    assert_eq!(HbState::Active, harness.ctx.hb_consumer.entries()[0].state());
    assert!(harness.ctx.hb_consumer.all_monitored_operational());

    // Silence for 160 ms triggers the timeout
    harness.sent.clear();
    harness.tick_ms(160);
    assert_eq!(HbState::Timeout, harness.ctx.hb_consumer.entries()[0].state());
    assert!(!harness.ctx.hb_consumer.all_monitored_operational());
    assert_eq!(vec![(PEER, 1)], timeouts.calls());

    let emcy = harness.take_sent_with_id(0x85);
    assert_eq!(1, emcy.len());
    let emcy = EmcyMessage::try_from(emcy[0]).unwrap();
    assert_eq!(0x8130, emcy.code);
    assert_eq!(1, emcy.detail);

    // The peer reboots: remote reset event, then back to Active
    harness.inject(peer_bootup());
    harness.tick();
    assert_eq!(vec![(PEER, 1)], resets.calls());
    let emcy = harness.take_sent_with_id(0x85);
    assert!(!emcy.is_empty());

    harness.inject(peer_heartbeat(NmtState::Operational));
    harness.tick();
    assert_eq!(HbState::Active, harness.ctx.hb_consumer.entries()[0].state());
    assert!(harness.ctx.hb_consumer.all_monitored_operational());
}

#[test]
fn test_half_period_heartbeats_stay_active() {
    let mut harness = TestHarness::booted(5);
    let value: u32 = ((PEER as u32) << 16) | 150;
    harness.sdo_download(0x1016, 1, &value.to_le_bytes()).unwrap();

    for _ in 0..10 {
        harness.inject(peer_heartbeat(NmtState::Operational));
        harness.tick_ms(75);
        assert_eq!(HbState::Active, harness.ctx.hb_consumer.entries()[0].state());
    }
}

#[test]
fn test_non_operational_peer_clears_aggregate() {
    let mut harness = TestHarness::booted(5);
    let value: u32 = ((PEER as u32) << 16) | 150;
    harness.sdo_download(0x1016, 1, &value.to_le_bytes()).unwrap();

    harness.inject(peer_heartbeat(NmtState::PreOperational));
    harness.tick();
    assert_eq!(HbState::Active, harness.ctx.hb_consumer.entries()[0].state());
    assert!(!harness.ctx.hb_consumer.all_monitored_operational());
}

#[test]
fn test_disabled_entry_ignores_heartbeats() {
    let mut harness = TestHarness::booted(5);
    // time == 0 disables monitoring
    let value: u32 = (PEER as u32) << 16;
    harness.sdo_download(0x1016, 1, &value.to_le_bytes()).unwrap();

    harness.inject(peer_heartbeat(NmtState::Operational));
    harness.tick_ms(500);
    assert_eq!(
        HbState::Unconfigured,
        harness.ctx.hb_consumer.entries()[0].state()
    );
    assert!(harness.take_sent_with_id(0x85).is_empty());
}

#[test]
fn test_readback_of_consumer_time() {
    let mut harness = TestHarness::booted(5);
    let value: u32 = ((PEER as u32) << 16) | 150;
    harness.sdo_download(0x1016, 1, &value.to_le_bytes()).unwrap();
    assert_eq!(value.to_le_bytes().to_vec(), harness.sdo_upload(0x1016, 1).unwrap());
    assert_eq!(vec![2], harness.sdo_upload(0x1016, 0).unwrap());
}
