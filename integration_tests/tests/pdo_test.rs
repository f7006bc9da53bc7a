//! PDO transport tests: event-driven TPDO, sync TPDO with window abort, and
//! RPDO application

use integration_tests::{map_entry, TestHarness};
use sentrycan_common::messages::{CanId, CanMessage, NmtCommandSpecifier, SyncObject};
use sentrycan_node::object_dict::ObjectAccess as _;

fn configure_tpdo(harness: &mut TestHarness, cob: u32, transmission_type: u8) {
    harness
        .sdo_download(0x1A00, 0, &[0])
        .unwrap();
    harness
        .sdo_download(0x1A00, 1, &map_entry(0x2000, 1, 16).to_le_bytes())
        .unwrap();
    harness.sdo_download(0x1A00, 0, &[1]).unwrap();
    harness.sdo_download(0x1800, 2, &[transmission_type]).unwrap();
    harness.sdo_download(0x1800, 1, &cob.to_le_bytes()).unwrap();
}

#[test]
fn test_event_tpdo() {
    let mut harness = TestHarness::booted(5);
    configure_tpdo(&mut harness, 0x185, 254);
    harness.nmt_command(NmtCommandSpecifier::Start);
    harness.sent.clear();

    // Nothing goes out until the application raises an event
    harness.tick_ms(5);
    assert!(harness.take_sent_with_id(0x185).is_empty());

    harness.ctx.tx_var.value.store(0xBEEF);
    harness.ctx.tx_var.set_event_flag(1).unwrap();
    harness.tick_ms(2);

    let frames = harness.take_sent_with_id(0x185);
    assert_eq!(1, frames.len());
    assert_eq!(&[0xEF, 0xBE], frames[0].data());
}

#[test]
fn test_sync_tpdo() {
    let mut harness = TestHarness::booted(5);
    // Transmission type 1: send on every SYNC
    configure_tpdo(&mut harness, 0x185, 1);
    harness.nmt_command(NmtCommandSpecifier::Start);
    harness.sent.clear();

    harness.tick_ms(3);
    assert!(harness.take_sent_with_id(0x185).is_empty());

    harness.inject(SyncObject::new(Some(1)).into());
    harness.tick();
    let frames = harness.take_sent_with_id(0x185);
    assert_eq!(1, frames.len());
    assert_eq!(&[0x34, 0x12], frames[0].data());
}

#[test]
fn test_rpdo_applies_on_tick() {
    let mut harness = TestHarness::booted(5);
    harness.sdo_download(0x1600, 0, &[0]).unwrap();
    harness
        .sdo_download(0x1600, 1, &map_entry(0x2010, 1, 16).to_le_bytes())
        .unwrap();
    harness.sdo_download(0x1600, 0, &[1]).unwrap();
    harness.sdo_download(0x1400, 1, &0x205u32.to_le_bytes()).unwrap();
    harness.nmt_command(NmtCommandSpecifier::Start);

    harness.inject(CanMessage::new(CanId::Std(0x205), &[0x22, 0x11]));
    harness.tick();
    assert_eq!(0x1122, harness.ctx.rx_var.value.load());
}

#[test]
fn test_rpdo_ignored_outside_operational() {
    let mut harness = TestHarness::booted(5);
    harness.sdo_download(0x1600, 0, &[0]).unwrap();
    harness
        .sdo_download(0x1600, 1, &map_entry(0x2010, 1, 16).to_le_bytes())
        .unwrap();
    harness.sdo_download(0x1600, 0, &[1]).unwrap();
    harness.sdo_download(0x1400, 1, &0x205u32.to_le_bytes()).unwrap();

    // Still pre-operational: the frame is staged but not applied
    harness.inject(CanMessage::new(CanId::Std(0x205), &[0x22, 0x11]));
    harness.tick_ms(3);
    assert_eq!(0, harness.ctx.rx_var.value.load());
}

#[test]
fn test_disabled_pdo_via_invalid_bit() {
    let mut harness = TestHarness::booted(5);
    configure_tpdo(&mut harness, 0x185, 254);
    // Set bit 31 to disable the PDO again
    harness
        .sdo_download(0x1800, 1, &(0x185u32 | (1 << 31)).to_le_bytes())
        .unwrap();
    harness.nmt_command(NmtCommandSpecifier::Start);
    harness.sent.clear();

    harness.ctx.tx_var.set_event_flag(1).unwrap();
    harness.tick_ms(2);
    assert!(harness.take_sent_with_id(0x185).is_empty());
}
