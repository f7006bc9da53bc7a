//! LSS slave tests over the wire: fastscan discovery, node ID configuration
//! and the deferred application of the pending ID

use integration_tests::TestHarness;
use sentrycan_common::lss::{LssRequest, LssResponse, LSS_FASTSCAN_CONFIRM};
use sentrycan_common::messages::{CanId, CanMessage};

fn lss_request(harness: &mut TestHarness, req: LssRequest) -> Option<LssResponse> {
    let msg: CanMessage = req.into();
    harness.inject(msg);
    harness.tick();
    let responses = harness.take_sent_with_id(0x7E4);
    assert!(responses.len() <= 1);
    responses
        .first()
        .map(|m| LssResponse::try_from(m.data()).unwrap())
}

fn fastscan_probe(harness: &mut TestHarness, id: u32, bit_check: u8, sub: u8, next: u8) -> bool {
    matches!(
        lss_request(
            harness,
            LssRequest::FastScan {
                id,
                bit_check,
                sub,
                next,
            },
        ),
        Some(LssResponse::IdentifySlave)
    )
}

#[test]
fn test_fastscan_discovers_identity() {
    // Identity configured in the test OD: vendor 0x10, product 0x20,
    // revision 0x30, serial 0x40
    let mut harness = TestHarness::booted(255);

    assert!(fastscan_probe(&mut harness, 0, LSS_FASTSCAN_CONFIRM, 0, 0));

    let mut id = [0u32; 4];
    let mut next = 0;
    for sub in 0..4u8 {
        let mut bit_check = 32;
        while bit_check > 0 {
            bit_check -= 1;
            if !fastscan_probe(&mut harness, id[sub as usize], bit_check, sub, next) {
                id[sub as usize] |= 1 << bit_check;
            }
        }
        next = (sub + 1) % 4;
        assert!(fastscan_probe(&mut harness, id[sub as usize], 0, sub, next));
    }

    assert_eq!([0x10, 0x20, 0x30, 0x40], id);

    // The slave is now configurable: the inquiry returns the unconfigured ID
    assert_eq!(
        Some(LssResponse::InquireNodeIdAck { node_id: 255 }),
        lss_request(&mut harness, LssRequest::InquireNodeId)
    );
}

#[test]
fn test_configured_node_ignores_fastscan() {
    let mut harness = TestHarness::booted(5);
    assert!(!fastscan_probe(&mut harness, 0, LSS_FASTSCAN_CONFIRM, 0, 0));
}

#[test]
fn test_selective_switch_and_inquire() {
    let mut harness = TestHarness::booted(255);

    assert!(lss_request(&mut harness, LssRequest::SwitchStateVendor { vendor_id: 0x10 }).is_none());
    assert!(
        lss_request(&mut harness, LssRequest::SwitchStateProduct { product_code: 0x20 }).is_none()
    );
    assert!(
        lss_request(&mut harness, LssRequest::SwitchStateRevision { revision: 0x30 }).is_none()
    );
    assert_eq!(
        Some(LssResponse::SwitchStateResponse),
        lss_request(&mut harness, LssRequest::SwitchStateSerial { serial: 0x40 })
    );

    assert_eq!(
        Some(LssResponse::InquireVendorAck { vendor_id: 0x10 }),
        lss_request(&mut harness, LssRequest::InquireVendor)
    );
    assert_eq!(
        Some(LssResponse::InquireSerialAck { serial: 0x40 }),
        lss_request(&mut harness, LssRequest::InquireSerial)
    );
}

#[test]
fn test_configure_node_id_applies_at_switch_to_waiting() {
    let mut harness = TestHarness::booted(255);

    // Select the slave by identity
    lss_request(&mut harness, LssRequest::SwitchStateVendor { vendor_id: 0x10 });
    lss_request(&mut harness, LssRequest::SwitchStateProduct { product_code: 0x20 });
    lss_request(&mut harness, LssRequest::SwitchStateRevision { revision: 0x30 });
    lss_request(&mut harness, LssRequest::SwitchStateSerial { serial: 0x40 });

    assert_eq!(
        Some(LssResponse::ConfigureNodeIdAck {
            error: 0,
            spec_error: 0
        }),
        lss_request(&mut harness, LssRequest::ConfigureNodeId { node_id: 0x42 })
    );

    // Nothing changes until the master switches the slave back to waiting:
    // still no boot-up, still unconfigured
    harness.tick_ms(10);
    assert_eq!(255, harness.node.node_id());
    assert!(harness.take_sent().is_empty());

    // Switching to waiting applies the pending ID and triggers the
    // communication reset with its boot-up message
    lss_request(&mut harness, LssRequest::SwitchModeGlobal { mode: 0 });
    harness.tick();
    assert_eq!(0x42, harness.node.node_id());
    let bootup = harness.take_sent_with_id(0x742);
    assert_eq!(1, bootup.len());
    assert_eq!(&[0], bootup[0].data());
}

#[test]
fn test_invalid_node_id_rejected() {
    let mut harness = TestHarness::booted(255);
    lss_request(&mut harness, LssRequest::SwitchModeGlobal { mode: 1 });

    assert_eq!(
        Some(LssResponse::ConfigureNodeIdAck {
            error: 1,
            spec_error: 0
        }),
        lss_request(&mut harness, LssRequest::ConfigureNodeId { node_id: 0 })
    );
}
