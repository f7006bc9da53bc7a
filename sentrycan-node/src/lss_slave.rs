//! LSS slave state machine
//!
//! Responds to master requests for identity based selection (selective
//! switch and fastscan), node ID and bit rate configuration, and identity
//! inquiry. Invalid or non-addressed requests are silently dropped.
//!
//! A newly configured node ID does not take effect immediately: it is stored
//! as pending and handed to the node (as [`LssEvent::ApplyNodeId`]) when the
//! master switches the slave back to the *Waiting* state.

use sentrycan_common::{
    lss::{
        LssConfigureError, LssIdentity, LssRequest, LssResponse, LssState, LSS_FASTSCAN_CONFIRM,
        LSS_STORE_NOT_SUPPORTED,
    },
    AtomicCell, NodeId,
};

use defmt_or_log::info;

/// Staging cell for LSS requests, shared with the receive context
#[allow(missing_debug_implementations)]
pub struct LssReceiver {
    request: AtomicCell<Option<LssRequest>>,
}

impl Default for LssReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl LssReceiver {
    /// Create an empty receiver
    pub const fn new() -> Self {
        Self {
            request: AtomicCell::new(None),
        }
    }

    /// Stage a received request; safe to call from interrupt context
    ///
    /// Returns true, as every staged request requires a process call.
    pub fn handle_req(&self, req: LssRequest) -> bool {
        self.request.store(Some(req));
        true
    }

    fn take(&self) -> Option<LssRequest> {
        self.request.take()
    }
}

/// Configuration of the LSS slave, provided by the node
#[derive(Debug, Clone, Copy)]
pub struct LssConfig {
    /// The identity to respond to, from object 0x1018
    pub identity: LssIdentity,
    /// The currently active node ID
    pub node_id: NodeId,
    /// Whether a store-configuration callback is available
    pub store_supported: bool,
}

/// Events surfaced to the node by the slave
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LssEvent {
    /// The master commanded the configuration to be stored persistently
    StoreConfiguration {
        /// The pending node ID to store
        node_id: NodeId,
        /// The pending bit timing to store, as (table, index)
        bit_timing: Option<(u8, u8)>,
    },
    /// The master commanded a new bit timing to be activated
    ActivateBitTiming {
        /// The baudrate table selector
        table: u8,
        /// The index into the baudrate table
        index: u8,
        /// Switch delay in ms; the bus must be quiet for `2 * delay`
        delay: u16,
    },
    /// A pending node ID became effective; the node must perform a
    /// communication reset with it
    ApplyNodeId {
        /// The new node ID
        node_id: NodeId,
    },
}

/// Callback deciding whether a requested bit timing is supported
pub type BitTimingCheckCallback = dyn Fn(u8, u8) -> bool + Sync;

/// The LSS slave
#[allow(missing_debug_implementations)]
pub struct LssSlave {
    state: LssState,
    config: LssConfig,
    pending_node_id: NodeId,
    pending_bit_timing: Option<(u8, u8)>,
    /// Values accumulated by the selective switch sequence
    /// (vendor, product, revision)
    select: [u32; 3],
    fast_scan_sub: u8,
    pending_event: Option<LssEvent>,
    bit_timing_check: Option<&'static BitTimingCheckCallback>,
}

impl LssSlave {
    /// Create a new slave in the Waiting state
    pub fn new(config: LssConfig) -> Self {
        Self {
            state: LssState::Waiting,
            pending_node_id: config.node_id,
            config,
            pending_bit_timing: None,
            select: [0; 3],
            fast_scan_sub: 0,
            pending_event: None,
            bit_timing_check: None,
        }
    }

    /// Replace the configuration, e.g. after a communication reset
    pub fn update_config(&mut self, config: LssConfig) {
        self.pending_node_id = config.node_id;
        self.config = config;
        self.state = LssState::Waiting;
        self.fast_scan_sub = 0;
    }

    /// Register a callback to validate bit timing requests
    pub fn set_bit_timing_check(&mut self, cb: &'static BitTimingCheckCallback) {
        self.bit_timing_check = Some(cb);
    }

    /// The current slave state
    pub fn state(&self) -> LssState {
        self.state
    }

    /// The node ID that will become active at the next apply
    pub fn pending_node_id(&self) -> NodeId {
        self.pending_node_id
    }

    /// Take the most recent event, if one is pending
    pub fn pending_event(&mut self) -> Option<LssEvent> {
        self.pending_event.take()
    }

    /// Process a staged request, if any
    ///
    /// Returns the response to transmit, or None when the request does not
    /// address this slave (or no request is staged).
    pub fn process(&mut self, rx: &LssReceiver) -> Option<LssResponse> {
        let request = rx.take()?;
        self.handle_request(request)
    }

    fn handle_request(&mut self, request: LssRequest) -> Option<LssResponse> {
        match request {
            LssRequest::SwitchModeGlobal { mode } => {
                let new_state = LssState::from_byte(mode).ok()?;
                let prev = self.state;
                self.state = new_state;
                if prev == LssState::Configuring
                    && new_state == LssState::Waiting
                    && self.pending_node_id != self.config.node_id
                {
                    info!("LSS: applying pending node id {}", self.pending_node_id.raw());
                    self.pending_event = Some(LssEvent::ApplyNodeId {
                        node_id: self.pending_node_id,
                    });
                }
                None
            }
            LssRequest::SwitchStateVendor { vendor_id } => {
                self.select[0] = vendor_id;
                None
            }
            LssRequest::SwitchStateProduct { product_code } => {
                self.select[1] = product_code;
                None
            }
            LssRequest::SwitchStateRevision { revision } => {
                self.select[2] = revision;
                None
            }
            LssRequest::SwitchStateSerial { serial } => {
                let identity = &self.config.identity;
                if self.select[0] == identity.vendor_id
                    && self.select[1] == identity.product_code
                    && self.select[2] == identity.revision
                    && serial == identity.serial
                {
                    self.state = LssState::Configuring;
                    Some(LssResponse::SwitchStateResponse)
                } else {
                    None
                }
            }
            LssRequest::FastScan {
                id,
                bit_check,
                sub,
                next,
            } => self.handle_fastscan(id, bit_check, sub, next),
            LssRequest::ConfigureNodeId { node_id } => {
                if self.state != LssState::Configuring {
                    return None;
                }
                match NodeId::new(node_id) {
                    Ok(node_id) => {
                        self.pending_node_id = node_id;
                        Some(LssResponse::ConfigureNodeIdAck {
                            error: LssConfigureError::Ok as u8,
                            spec_error: 0,
                        })
                    }
                    Err(_) => Some(LssResponse::ConfigureNodeIdAck {
                        error: LssConfigureError::OutOfRange as u8,
                        spec_error: 0,
                    }),
                }
            }
            LssRequest::ConfigureBitTiming { table, index } => {
                if self.state != LssState::Configuring {
                    return None;
                }
                let supported = match self.bit_timing_check {
                    Some(check) => check(table, index),
                    // Without an application check only the standard table is
                    // accepted
                    None => table == 0 && index <= 8,
                };
                if supported {
                    self.pending_bit_timing = Some((table, index));
                    Some(LssResponse::ConfigureBitTimingAck {
                        error: LssConfigureError::Ok as u8,
                        spec_error: 0,
                    })
                } else {
                    Some(LssResponse::ConfigureBitTimingAck {
                        error: LssConfigureError::OutOfRange as u8,
                        spec_error: 0,
                    })
                }
            }
            LssRequest::ActivateBitTiming { delay } => {
                if self.state != LssState::Configuring {
                    return None;
                }
                let (table, index) = self.pending_bit_timing?;
                self.pending_event = Some(LssEvent::ActivateBitTiming {
                    table,
                    index,
                    delay,
                });
                None
            }
            LssRequest::StoreConfiguration => {
                if self.state != LssState::Configuring {
                    return None;
                }
                if self.config.store_supported {
                    self.pending_event = Some(LssEvent::StoreConfiguration {
                        node_id: self.pending_node_id,
                        bit_timing: self.pending_bit_timing,
                    });
                    Some(LssResponse::StoreConfigurationAck {
                        error: LssConfigureError::Ok as u8,
                        spec_error: 0,
                    })
                } else {
                    Some(LssResponse::StoreConfigurationAck {
                        error: LSS_STORE_NOT_SUPPORTED,
                        spec_error: 0,
                    })
                }
            }
            LssRequest::InquireVendor => (self.state == LssState::Configuring).then(|| {
                LssResponse::InquireVendorAck {
                    vendor_id: self.config.identity.vendor_id,
                }
            }),
            LssRequest::InquireProduct => (self.state == LssState::Configuring).then(|| {
                LssResponse::InquireProductAck {
                    product_code: self.config.identity.product_code,
                }
            }),
            LssRequest::InquireRev => (self.state == LssState::Configuring).then(|| {
                LssResponse::InquireRevAck {
                    revision: self.config.identity.revision,
                }
            }),
            LssRequest::InquireSerial => (self.state == LssState::Configuring).then(|| {
                LssResponse::InquireSerialAck {
                    serial: self.config.identity.serial,
                }
            }),
            LssRequest::InquireNodeId => (self.state == LssState::Configuring).then(|| {
                LssResponse::InquireNodeIdAck {
                    node_id: self.config.node_id.raw(),
                }
            }),
        }
    }

    fn handle_fastscan(
        &mut self,
        id: u32,
        bit_check: u8,
        sub: u8,
        next: u8,
    ) -> Option<LssResponse> {
        // Only unconfigured slaves in Waiting participate in fastscan
        if self.state != LssState::Waiting || self.config.node_id.is_configured() {
            return None;
        }
        if bit_check == LSS_FASTSCAN_CONFIRM {
            // Reset the scan state machine and confirm
            self.fast_scan_sub = 0;
            return Some(LssResponse::IdentifySlave);
        }
        if bit_check > 32 || sub > 3 || self.fast_scan_sub != sub {
            return None;
        }
        let mask = if bit_check == 32 {
            0
        } else {
            0xFFFF_FFFFu32 << bit_check
        };
        if self.config.identity.by_addr(sub) & mask == (id & mask) {
            self.fast_scan_sub = next;
            if bit_check == 0 && next < sub {
                // All identity words matched, enter configuration state
                info!("LSS: fastscan complete, entering configuring state");
                self.state = LssState::Configuring;
            }
            Some(LssResponse::IdentifySlave)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTITY: LssIdentity = LssIdentity {
        vendor_id: 0x10,
        product_code: 0x20,
        revision: 0x30,
        serial: 0x40,
    };

    fn unconfigured_slave() -> LssSlave {
        LssSlave::new(LssConfig {
            identity: IDENTITY,
            node_id: NodeId::Unconfigured,
            store_supported: false,
        })
    }

    fn send_fs(slave: &mut LssSlave, id: &[u32; 4], bit_check: u8, sub: u8, next: u8) -> bool {
        let resp = slave.handle_request(LssRequest::FastScan {
            id: id[sub as usize],
            bit_check,
            sub,
            next,
        });
        matches!(resp, Some(LssResponse::IdentifySlave))
    }

    #[test]
    fn test_fast_scan_bit_probe() {
        let mut slave = unconfigured_slave();

        // Confirmation probe always ACKs
        assert!(send_fs(&mut slave, &[0; 4], LSS_FASTSCAN_CONFIRM, 0, 1));
        // Matching probe ACKs (vendor 0x10 has bit 31..5 clear)
        assert!(send_fs(&mut slave, &[0, 0, 0, 0], 31, 0, 0));
        // Non-matching probe is silent
        assert!(!send_fs(&mut slave, &[1 << 31, 0, 0, 0], 31, 0, 0));
    }

    #[test]
    fn test_fast_scan_full_discovery() {
        let mut slave = unconfigured_slave();

        let mut id = [0u32; 4];
        let mut next = 0;

        assert!(
            send_fs(&mut slave, &id, LSS_FASTSCAN_CONFIRM, 0, next),
            "No confirmation response"
        );

        for sub in 0..4u8 {
            let mut bit_check = 32;
            while bit_check > 0 {
                bit_check -= 1;
                if !send_fs(&mut slave, &id, bit_check, sub, next) {
                    id[sub as usize] |= 1 << bit_check;
                }
            }
            next = (sub + 1) % 4;
            assert!(
                send_fs(&mut slave, &id, 0, sub, next),
                "No ack after completing sub {}, id: {:?}",
                sub,
                id
            );
        }

        assert_eq!([0x10, 0x20, 0x30, 0x40], id);
        assert_eq!(LssState::Configuring, slave.state());
    }

    #[test]
    fn test_selective_switch() {
        let mut slave = unconfigured_slave();
        assert!(slave
            .handle_request(LssRequest::SwitchStateVendor { vendor_id: 0x10 })
            .is_none());
        assert!(slave
            .handle_request(LssRequest::SwitchStateProduct { product_code: 0x20 })
            .is_none());
        assert!(slave
            .handle_request(LssRequest::SwitchStateRevision { revision: 0x30 })
            .is_none());
        assert_eq!(
            Some(LssResponse::SwitchStateResponse),
            slave.handle_request(LssRequest::SwitchStateSerial { serial: 0x40 })
        );
        assert_eq!(LssState::Configuring, slave.state());
    }

    #[test]
    fn test_selective_switch_wrong_serial_silent() {
        let mut slave = unconfigured_slave();
        slave.handle_request(LssRequest::SwitchStateVendor { vendor_id: 0x10 });
        slave.handle_request(LssRequest::SwitchStateProduct { product_code: 0x20 });
        slave.handle_request(LssRequest::SwitchStateRevision { revision: 0x30 });
        assert!(slave
            .handle_request(LssRequest::SwitchStateSerial { serial: 0x99 })
            .is_none());
        assert_eq!(LssState::Waiting, slave.state());
    }

    #[test]
    fn test_configure_node_id_pending_until_waiting() {
        let mut slave = unconfigured_slave();
        slave.state = LssState::Configuring;

        // Configuration requests are ignored in Waiting
        let resp = slave.handle_request(LssRequest::ConfigureNodeId { node_id: 0x42 });
        assert_eq!(
            Some(LssResponse::ConfigureNodeIdAck {
                error: 0,
                spec_error: 0
            }),
            resp
        );
        assert_eq!(NodeId::new(0x42).unwrap(), slave.pending_node_id());
        assert!(slave.pending_event().is_none());

        // Out-of-range IDs are rejected
        let resp = slave.handle_request(LssRequest::ConfigureNodeId { node_id: 0 });
        assert_eq!(
            Some(LssResponse::ConfigureNodeIdAck {
                error: 1,
                spec_error: 0
            }),
            resp
        );

        // Switching back to waiting applies the pending ID
        slave.handle_request(LssRequest::SwitchModeGlobal { mode: 0 });
        assert_eq!(
            Some(LssEvent::ApplyNodeId {
                node_id: NodeId::new(0x42).unwrap()
            }),
            slave.pending_event()
        );
    }

    #[test]
    fn test_inquire_in_configuring_only() {
        let mut slave = unconfigured_slave();
        assert!(slave.handle_request(LssRequest::InquireSerial).is_none());
        slave.state = LssState::Configuring;
        assert_eq!(
            Some(LssResponse::InquireSerialAck { serial: 0x40 }),
            slave.handle_request(LssRequest::InquireSerial)
        );
        assert_eq!(
            Some(LssResponse::InquireNodeIdAck { node_id: 255 }),
            slave.handle_request(LssRequest::InquireNodeId)
        );
    }

    #[test]
    fn test_store_configuration_unsupported() {
        let mut slave = unconfigured_slave();
        slave.state = LssState::Configuring;
        assert_eq!(
            Some(LssResponse::StoreConfigurationAck {
                error: LSS_STORE_NOT_SUPPORTED,
                spec_error: 0
            }),
            slave.handle_request(LssRequest::StoreConfiguration)
        );
        assert!(slave.pending_event().is_none());
    }

    #[test]
    fn test_bit_timing_and_activate() {
        let mut slave = unconfigured_slave();
        slave.state = LssState::Configuring;

        // Default check accepts the standard table only
        assert_eq!(
            Some(LssResponse::ConfigureBitTimingAck {
                error: 0,
                spec_error: 0
            }),
            slave.handle_request(LssRequest::ConfigureBitTiming { table: 0, index: 2 })
        );
        assert_eq!(
            Some(LssResponse::ConfigureBitTimingAck {
                error: 1,
                spec_error: 0
            }),
            slave.handle_request(LssRequest::ConfigureBitTiming { table: 5, index: 2 })
        );

        // Activation produces no response, only an event
        assert!(slave
            .handle_request(LssRequest::ActivateBitTiming { delay: 100 })
            .is_none());
        assert_eq!(
            Some(LssEvent::ActivateBitTiming {
                table: 0,
                index: 2,
                delay: 100
            }),
            slave.pending_event()
        );
    }
}
