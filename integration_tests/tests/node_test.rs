//! Node lifecycle tests: boot-up, NMT state machine, heartbeat producer,
//! node guarding and the storage commands

use std::convert::Infallible;
use std::sync::Mutex;

use integration_tests::{leak, CallRecorder, TestHarness};
use sentrycan_common::constants::values::{LOAD_CMD, SAVE_CMD};
use sentrycan_common::messages::{
    CanId, CanMessage, Heartbeat, NmtCommandSpecifier, NmtState,
};

#[test]
fn test_bootup_message() {
    let mut harness = TestHarness::new(5);
    harness.tick();
    let bootup = harness.take_sent_with_id(0x705);
    assert_eq!(1, bootup.len());
    assert_eq!(1, bootup[0].dlc);
    assert_eq!(&[0], bootup[0].data());
    assert_eq!(NmtState::PreOperational, harness.node.nmt_state());
}

#[test]
fn test_unconfigured_node_stays_silent() {
    let mut harness = TestHarness::new(255);
    harness.tick_ms(10);
    assert!(harness.take_sent().is_empty());
}

#[test]
fn test_nmt_state_machine() {
    let mut harness = TestHarness::booted(5);
    assert_eq!(NmtState::PreOperational, harness.node.nmt_state());

    harness.nmt_command(NmtCommandSpecifier::Start);
    assert_eq!(NmtState::Operational, harness.node.nmt_state());

    harness.nmt_command(NmtCommandSpecifier::Stop);
    assert_eq!(NmtState::Stopped, harness.node.nmt_state());

    harness.nmt_command(NmtCommandSpecifier::EnterPreOp);
    assert_eq!(NmtState::PreOperational, harness.node.nmt_state());

    // A communication reset runs through Bootup and announces itself
    harness.sent.clear();
    harness.nmt_command(NmtCommandSpecifier::ResetComm);
    assert_eq!(NmtState::PreOperational, harness.node.nmt_state());
    assert_eq!(1, harness.take_sent_with_id(0x705).len());
}

#[test]
fn test_broadcast_nmt_command() {
    let mut harness = TestHarness::booted(5);
    harness.inject(
        sentrycan_common::messages::NmtCommand {
            cs: NmtCommandSpecifier::Start,
            node: 0,
        }
        .into(),
    );
    harness.tick();
    assert_eq!(NmtState::Operational, harness.node.nmt_state());
}

#[test]
fn test_nmt_command_for_other_node_ignored() {
    let mut harness = TestHarness::booted(5);
    harness.inject(
        sentrycan_common::messages::NmtCommand {
            cs: NmtCommandSpecifier::Start,
            node: 9,
        }
        .into(),
    );
    harness.tick();
    assert_eq!(NmtState::PreOperational, harness.node.nmt_state());
}

#[test]
fn test_app_reset_callback() {
    let mut harness = TestHarness::booted(5);
    let resets: &'static CallRecorder<()> = leak(CallRecorder::new());
    harness.node.register_app_reset(leak(move || resets.record(())));

    harness.nmt_command(NmtCommandSpecifier::ResetApp);
    assert_eq!(1, resets.count());
    assert_eq!(NmtState::PreOperational, harness.node.nmt_state());
}

#[test]
fn test_heartbeat_producer_period() {
    let mut harness = TestHarness::booted(5);
    harness.sdo_download(0x1017, 0, &100u16.to_le_bytes()).unwrap();
    harness.nmt_command(NmtCommandSpecifier::ResetComm);
    harness.sent.clear();

    harness.tick_ms(450);
    let heartbeats = harness.take_sent_with_id(0x705);
    // One heartbeat roughly every 100 ms
    assert!((4..=5).contains(&heartbeats.len()), "{}", heartbeats.len());
    for hb in &heartbeats {
        let hb = Heartbeat::try_from(*hb).unwrap();
        assert_eq!(NmtState::PreOperational, hb.state);
        assert!(!hb.toggle);
    }
}

#[test]
fn test_node_guarding_response_toggles() {
    let mut harness = TestHarness::booted(5);

    harness.inject(CanMessage::new_rtr(CanId::Std(0x705)));
    harness.tick();
    let resp = harness.take_sent_with_id(0x705);
    assert_eq!(1, resp.len());
    assert_eq!(&[127], resp[0].data());

    harness.inject(CanMessage::new_rtr(CanId::Std(0x705)));
    harness.tick();
    let resp = harness.take_sent_with_id(0x705);
    assert_eq!(&[127 | 0x80], resp[0].data());

    harness.nmt_command(NmtCommandSpecifier::Start);
    harness.inject(CanMessage::new_rtr(CanId::Std(0x705)));
    harness.tick();
    let resp = harness.take_sent_with_id(0x705);
    assert_eq!(&[0x05], resp[0].data());
}

#[test]
fn test_store_parameters_command() {
    let mut harness = TestHarness::booted(5);

    // Without a registered callback the save command is refused
    assert!(harness.sdo_download(0x1010, 1, &SAVE_CMD.to_le_bytes()).is_err());

    let stored: &'static Mutex<Vec<u8>> = leak(Mutex::new(Vec::new()));
    harness.node.register_store_objects(leak(
        move |reader: &mut dyn embedded_io::Read<Error = Infallible>, _size: usize| {
            let mut buf = [0u8; 16];
            loop {
                let n = reader.read(&mut buf).unwrap();
                stored.lock().unwrap().extend_from_slice(&buf[..n]);
                if n < buf.len() {
                    break;
                }
            }
        },
    ));

    // A wrong magic is refused, the real one triggers serialization
    assert!(harness.sdo_download(0x1010, 1, &0x1234u32.to_le_bytes()).is_err());
    harness.ctx.tx_var.value.store(0xAA55);
    harness.sdo_download(0x1010, 1, &SAVE_CMD.to_le_bytes()).unwrap();

    let data = stored.lock().unwrap().clone();
    assert!(!data.is_empty());
    // The persisted stream can be restored into a fresh context
    let other = integration_tests::TestContext::new();
    sentrycan_node::persist::restore_stored_objects(other.od, &data);
    assert_eq!(0xAA55, other.tx_var.value.load());
}

#[test]
fn test_restore_defaults_command() {
    let mut harness = TestHarness::booted(5);
    let restores: &'static CallRecorder<()> = leak(CallRecorder::new());
    harness
        .node
        .register_restore_defaults(leak(move || restores.record(())));

    assert!(harness.sdo_download(0x1011, 1, &SAVE_CMD.to_le_bytes()).is_err());
    harness.sdo_download(0x1011, 1, &LOAD_CMD.to_le_bytes()).unwrap();
    assert_eq!(1, restores.count());
}

#[test]
fn test_time_consumer_receives_stamp() {
    use sentrycan_common::messages::TimeOfDay;
    use sentrycan_node::node_state::NodeStateAccess as _;

    let mut harness = TestHarness::booted(5);
    let stamp = TimeOfDay {
        millis: 123456,
        days: 15000,
    };
    harness.inject(stamp.into());
    harness.tick();
    assert_eq!(Some(stamp), harness.ctx.state.time_consumer().last());
}

#[test]
fn test_error_register_and_history_objects() {
    let mut harness = TestHarness::booted(5);
    assert_eq!(vec![0], harness.sdo_upload(0x1001, 0).unwrap());

    harness
        .ctx
        .state
        .em()
        .raise(sentrycan_node::emergency::ErrorKind::GenericSoftware, 7);
    harness.tick();

    // Generic error bit set
    assert_eq!(vec![1], harness.sdo_upload(0x1001, 0).unwrap());
    assert_eq!(vec![1], harness.sdo_upload(0x1003, 0).unwrap());
    let entry = harness.sdo_upload(0x1003, 1).unwrap();
    assert_eq!(0x6100 | (7 << 16), u32::from_le_bytes(entry.try_into().unwrap()));
}
