//! Implements the core Node object
//!
//! The [`Node`] assembles the protocol services over the application's
//! static object dictionary, [`NodeState`](crate::NodeState) and
//! [`NodeMbox`](crate::NodeMbox), and drives them from a single non-blocking
//! [`Node::process`] call.
//!
//! Within one tick the service order is fixed: NMT command handling first,
//! then the emergency producer, the SDO server, the heartbeat consumer, node
//! guarding, LSS and TIME; then the realtime pass handles SYNC, RPDO
//! application, TPDO transmission and finally the SRDOs, before the transmit
//! buffers are drained to the driver.

use sentrycan_common::{
    constants::object_ids,
    lss::LssIdentity,
    messages::{CanMessage, Heartbeat, NmtCommand, NmtCommandSpecifier, NmtState, LSS_RESP_ID},
    CanId, NodeId,
};

use crate::can::CanBusStatus;
use crate::emergency::ErrorKind;
use crate::lss_slave::{LssConfig, LssEvent, LssSlave};
use crate::node_mbox::NodeMbox;
use crate::node_state::NodeStateAccess;
use crate::object_dict::{find_object, ODEntry, ObjectAccess};
use crate::sdo_server::SdoServer;

use defmt_or_log::{debug, info};

/// Callback to persist the node configuration (node ID and bit timing) on an
/// LSS store-configuration command
pub type StoreNodeConfigCallback = dyn Fn(NodeId, Option<(u8, u8)>) + Sync;

/// Callback invoked when an NMT reset-application command is received,
/// before the communication reset is performed
pub type AppResetCallback = dyn Fn() + Sync;

/// Callback invoked when the LSS master activates a new bit timing; receives
/// (table, index, delay_ms). The driver must switch after `delay_ms` and
/// keep the bus quiet for another `delay_ms`.
pub type ActivateBitTimingCallback = dyn Fn(u8, u8, u16) + Sync;

#[derive(Default)]
struct Callbacks {
    store_node_config: Option<&'static StoreNodeConfigCallback>,
    app_reset: Option<&'static AppResetCallback>,
    activate_bit_timing: Option<&'static ActivateBitTimingCallback>,
}

fn read_identity(od: &[ODEntry]) -> Option<LssIdentity> {
    let obj = find_object(od, object_ids::IDENTITY)?;
    Some(LssIdentity {
        vendor_id: obj.read_u32(1).ok()?,
        product_code: obj.read_u32(2).ok()?,
        revision: obj.read_u32(3).ok()?,
        serial: obj.read_u32(4).ok()?,
    })
}

fn read_heartbeat_period(od: &[ODEntry]) -> u16 {
    find_object(od, object_ids::HEARTBEAT_PRODUCER_TIME)
        .and_then(|obj| obj.read_u16(0).ok())
        .unwrap_or(0)
}

fn read_sync_config(od: &[ODEntry]) -> (u32, u8) {
    let window = find_object(od, object_ids::SYNC_WINDOW_LENGTH)
        .and_then(|obj| obj.read_u32(0).ok())
        .unwrap_or(0);
    let overflow = find_object(od, object_ids::SYNC_COUNTER_OVERFLOW)
        .and_then(|obj| obj.read_u8(0).ok())
        .unwrap_or(0);
    (window, overflow)
}

/// The first step of creating a node
///
/// Created by [`Node::init`]. The split lets the application load restored
/// object values (e.g. from flash, via
/// [`restore_stored_objects`](crate::persist::restore_stored_objects))
/// between init and [`InitNode::finalize`], so the restored configuration is
/// in place before the first communication reset runs.
#[derive(Clone)]
#[allow(missing_debug_implementations)]
pub struct InitNode {
    node_id: NodeId,
    mbox: &'static NodeMbox,
    state: &'static dyn NodeStateAccess,
    od: &'static [ODEntry<'static>],
}

impl InitNode {
    fn new(
        node_id: NodeId,
        mbox: &'static NodeMbox,
        state: &'static dyn NodeStateAccess,
        od: &'static [ODEntry<'static>],
    ) -> Self {
        Self::set_pdo_defaults(state, node_id);
        Self {
            node_id,
            mbox,
            state,
            od,
        }
    }

    fn set_pdo_defaults(state: &dyn NodeStateAccess, node_id: NodeId) {
        for (i, pdo) in state.get_rpdos().iter().enumerate() {
            if i < 4 {
                pdo.set_cob_id(CanId::Std(0x200 + i as u16 * 0x100 + node_id.raw() as u16));
            } else {
                pdo.set_cob_id(CanId::Std(0));
            }
            pdo.set_valid(false);
            pdo.set_transmission_type(0);
            pdo.buffered_value.store(None);
        }

        for (i, pdo) in state.get_tpdos().iter().enumerate() {
            if i < 4 {
                pdo.set_cob_id(CanId::Std(0x180 + i as u16 * 0x100 + node_id.raw() as u16));
            } else {
                pdo.set_cob_id(CanId::Std(0));
            }
            pdo.set_valid(false);
            pdo.set_transmission_type(0);
            pdo.buffered_value.store(None);
        }
    }

    /// Convert the InitNode into a ready-to-operate [`Node`]
    ///
    /// Before calling finalize, make sure any persisted object values have
    /// been restored to the object dictionary.
    pub fn finalize(self) -> Node {
        Node::new(self)
    }
}

/// The main object representing a node
///
/// # Operation
///
/// The node is run by polling the [`Node::process`] method from the
/// application, typically from a periodic task at about 1 ms. It is safe to
/// call more frequently; responses to messages are only produced during
/// process, so a [`NodeMbox::set_process_notify_callback`] hook can be used
/// to accelerate the call when a message arrives.
#[allow(missing_debug_implementations)]
pub struct Node {
    node_id: NodeId,
    nmt_state: NmtState,
    sdo_server: SdoServer,
    lss_slave: LssSlave,
    message_count: u32,
    od: &'static [ODEntry<'static>],
    mbox: &'static NodeMbox,
    state: &'static dyn NodeStateAccess,
    reassigned_node_id: Option<NodeId>,
    callbacks: Callbacks,
    next_heartbeat_time_us: u64,
    heartbeat_period_ms: u16,
    guard_toggle: bool,
    last_process_time_us: Option<u64>,
}

impl Node {
    /// Create an [`InitNode`], the first step in creating a Node
    ///
    /// # Arguments
    ///
    /// - `node_id`: The initial ID for the node. It may be restored from
    ///   storage by the application, or left as [`NodeId::Unconfigured`] for
    ///   assignment via LSS.
    /// - `mbox`: The static [`NodeMbox`]
    /// - `state`: The static [`NodeState`](crate::NodeState)
    /// - `od`: The static object dictionary table, sorted by index
    pub fn init(
        node_id: NodeId,
        mbox: &'static NodeMbox,
        state: &'static dyn NodeStateAccess,
        od: &'static [ODEntry<'static>],
    ) -> InitNode {
        InitNode::new(node_id, mbox, state, od)
    }

    fn new(source: InitNode) -> Self {
        let InitNode {
            node_id,
            mbox,
            state,
            od,
        } = source;

        let lss_slave = LssSlave::new(LssConfig {
            identity: read_identity(od).unwrap_or(LssIdentity::new(0, 0, 0, 0)),
            node_id,
            store_supported: false,
        });

        Self {
            node_id,
            nmt_state: NmtState::Bootup,
            sdo_server: SdoServer::new(),
            lss_slave,
            message_count: 0,
            od,
            mbox,
            state,
            reassigned_node_id: None,
            callbacks: Callbacks::default(),
            next_heartbeat_time_us: 0,
            heartbeat_period_ms: 0,
            guard_toggle: false,
            last_process_time_us: None,
        }
    }

    /// Manually set the node ID
    ///
    /// Changing the node ID causes an NMT communication reset, resetting
    /// communication parameter defaults and triggering a boot-up message if
    /// the new ID is valid. Setting [`NodeId::Unconfigured`] puts the node
    /// into unconfigured mode.
    pub fn set_node_id(&mut self, node_id: NodeId) {
        self.reassigned_node_id = Some(node_id);
    }

    /// Register a callback to store node configuration data persistently
    pub fn register_store_node_config(&mut self, cb: &'static StoreNodeConfigCallback) {
        self.callbacks.store_node_config = Some(cb);
    }

    /// Register a callback to store object data persistently
    pub fn register_store_objects(&mut self, cb: &'static crate::persist::StoreObjectsCallback) {
        self.state.storage_context().store_callback.store(Some(cb));
    }

    /// Register a callback to restore default parameters on a 0x1011
    /// command
    pub fn register_restore_defaults(&mut self, cb: &'static crate::storage::RestoreDefaultsCallback) {
        self.state
            .storage_context()
            .restore_callback
            .store(Some(cb));
    }

    /// Register a callback invoked on an NMT application reset command
    pub fn register_app_reset(&mut self, cb: &'static AppResetCallback) {
        self.callbacks.app_reset = Some(cb);
    }

    /// Register a callback invoked when the LSS master activates a new bit
    /// timing
    pub fn register_activate_bit_timing(&mut self, cb: &'static ActivateBitTimingCallback) {
        self.callbacks.activate_bit_timing = Some(cb);
    }

    /// Report the CAN controller status
    ///
    /// The application should call this when the controller error state
    /// changes; transitions are reported once each via Emergency.
    pub fn report_bus_status(&mut self, status: CanBusStatus, monitor: &crate::can::BusErrorMonitor) {
        monitor.update(status, self.state.emergency());
    }

    /// Get the current Node ID
    pub fn node_id(&self) -> u8 {
        self.node_id.into()
    }

    /// Get the current NMT state of the node
    pub fn nmt_state(&self) -> NmtState {
        self.nmt_state
    }

    /// Get the number of received messages processed
    pub fn rx_message_count(&self) -> u32 {
        self.message_count
    }

    fn sdo_tx_cob_id(&self) -> CanId {
        CanId::Std(0x580 + self.node_id.raw() as u16)
    }

    /// Run periodic processing
    ///
    /// # Arguments
    /// - `now_us`: A monotonic time in microseconds, used for measuring time
    ///   and triggering time-based actions
    /// - `send_cb`: A callback transmitting CAN messages to the driver
    ///
    /// # Returns
    ///
    /// A boolean indicating whether object values were updated, i.e. an SDO
    /// download completed or one or more RPDOs / SRDOs were received.
    pub fn process(&mut self, now_us: u64, send_cb: &mut dyn FnMut(CanMessage)) -> bool {
        let mut update_flag = false;
        let dt_us = match self.last_process_time_us {
            Some(last) => now_us.saturating_sub(last).min(u32::MAX as u64) as u32,
            None => 0,
        };
        self.last_process_time_us = Some(now_us);

        if let Some(new_node_id) = self.reassigned_node_id.take() {
            self.node_id = new_node_id;
            self.nmt_state = NmtState::Bootup;
        }

        if self.nmt_state == NmtState::Bootup {
            self.comm_reset(send_cb);
        }

        // NMT commands are handled first so every later service sees the
        // current state
        if let Some(msg) = self.mbox.read_nmt_mbox() {
            if let Ok(cmd) = NmtCommand::try_from(msg) {
                self.message_count += 1;
                // We cannot respond to NMT commands without a valid node ID
                if let NodeId::Configured(node_id) = self.node_id {
                    if cmd.node == 0 || cmd.node == node_id.raw() {
                        debug!("Received NMT command: {:?}", cmd.cs);
                        self.handle_nmt_command(cmd.cs);
                    }
                }
            }
        }
        let em = self.state.emergency();
        let guard = self.state.srdo_guard();
        guard.set_nmt_state(self.nmt_state);

        // A communication reset may have been commanded; perform it now so
        // the boot-up message goes out this tick
        if self.nmt_state == NmtState::Bootup {
            self.comm_reset(send_cb);
        }

        if self.node_id.is_configured() {
            em.process(self.node_id.raw(), send_cb);
        }

        // SDO server
        if self.node_id.is_configured() {
            let (resp, updated) = self.sdo_server.process(self.mbox.sdo_receiver(), dt_us, self.od);
            if let Some(resp) = resp {
                self.message_count += 1;
                send_cb(resp.to_can_message(self.sdo_tx_cob_id()));
            }
            if updated.is_some() {
                update_flag = true;
            }
        }

        // Heartbeat consumer
        self.mbox.heartbeat_consumer().process(dt_us, em);

        // Node guarding response
        if self.mbox.take_guard_request() {
            if let NodeId::Configured(node_id) = self.node_id {
                let response = Heartbeat {
                    node: node_id.raw(),
                    toggle: self.guard_toggle,
                    state: self.nmt_state,
                };
                self.guard_toggle = !self.guard_toggle;
                send_cb(response.into());
            }
        }

        // LSS slave
        if let Some(resp) = self.lss_slave.process(self.mbox.lss_receiver()) {
            send_cb(resp.to_can_message(LSS_RESP_ID));
        }
        if let Some(event) = self.lss_slave.pending_event() {
            info!("LSS slave event: {:?}", event);
            match event {
                LssEvent::StoreConfiguration {
                    node_id,
                    bit_timing,
                } => {
                    if let Some(cb) = self.callbacks.store_node_config {
                        cb(node_id, bit_timing);
                    }
                }
                LssEvent::ActivateBitTiming {
                    table,
                    index,
                    delay,
                } => {
                    if let Some(cb) = self.callbacks.activate_bit_timing {
                        cb(table, index, delay);
                    }
                }
                LssEvent::ApplyNodeId { node_id } => self.set_node_id(node_id),
            }
        }

        // TIME consumer
        if let Some(time) = self.mbox.take_time() {
            self.state.time_consumer().process(time);
        }

        // Heartbeat producer
        if self.heartbeat_period_ms != 0 && now_us >= self.next_heartbeat_time_us {
            self.send_heartbeat(send_cb);
            // Catch up if we are far behind, e.g. when the node was
            // unconfigured for a while
            if self.next_heartbeat_time_us < now_us {
                self.next_heartbeat_time_us = now_us;
            }
        }

        // Realtime pass: SYNC window first, then RPDO, TPDO, SRDO
        let sync_tick = self.state.sync_consumer().process(self.mbox.take_sync(), dt_us);
        if sync_tick.window_elapsed {
            let aborted = self.state.tx_buffers().clear_pending_sync();
            if aborted > 0 {
                em.raise(ErrorKind::TpdoOutsideWindow, aborted as u32);
            }
        }

        if let Some(cob) = self.mbox.take_rpdo_length_error() {
            em.raise(ErrorKind::RpdoLength, cob as u32);
        }

        if self.nmt_state == NmtState::Operational {
            for rpdo in self.state.get_rpdos() {
                if !rpdo.valid() {
                    continue;
                }
                if let Some(new_data) = rpdo.buffered_value.take() {
                    rpdo.store_pdo_data(&new_data);
                    update_flag = true;
                }
            }

            self.process_tpdos(sync_tick.sync, send_cb);

            // SRDO pass: the guard detects the Operational edge and CRC
            // check requests, each SRDO consumes the same command word
            let commands = guard.process(self.nmt_state);
            for srdo in self.state.get_srdos() {
                update_flag |= srdo.process(
                    commands,
                    self.nmt_state,
                    guard,
                    dt_us,
                    self.od,
                    self.state.tx_buffers(),
                    em,
                );
            }
        } else {
            let commands = guard.process(self.nmt_state);
            for srdo in self.state.get_srdos() {
                srdo.process(
                    commands,
                    self.nmt_state,
                    guard,
                    dt_us,
                    self.od,
                    self.state.tx_buffers(),
                    em,
                );
            }
        }

        self.state.tx_buffers().drain(send_cb);

        update_flag
    }

    fn process_tpdos(&mut self, sync: bool, send_cb: &mut dyn FnMut(CanMessage)) {
        // Swap the active event flag bank. Tracking the global trigger keeps
        // process cheap in the frequent case where no events were raised.
        let global_trigger = self.state.get_pdo_sync().toggle();

        for (j, tpdo) in self.state.get_tpdos().iter().enumerate() {
            if !tpdo.valid() {
                continue;
            }
            let transmission_type = tpdo.transmission_type();
            let (send, sync_bound) = if transmission_type >= 254 {
                (global_trigger && tpdo.read_events(), false)
            } else {
                (sync && tpdo.sync_update(), true)
            };
            if !send {
                continue;
            }

            let mut data = [0u8; 8];
            tpdo.read_pdo_data(&mut data);
            let dlc = tpdo.mapped_length().min(8);
            match tpdo.cob_id() {
                CanId::Std(id) => {
                    // TPDO buffers occupy the first slots of the set; see
                    // comm_reset
                    let tx = self.state.tx_buffers();
                    if tx.init(j, id, false, dlc as u8, sync_bound).is_ok() {
                        tx.store_data(j, &data[..dlc]).ok();
                        tx.send(j).ok();
                    }
                }
                id @ CanId::Extended(_) => {
                    send_cb(CanMessage::new(id, &data[..dlc]));
                }
            }
        }

        for tpdo in self.state.get_tpdos() {
            tpdo.clear_events();
        }
    }

    fn handle_nmt_command(&mut self, cmd: NmtCommandSpecifier) {
        let prev_state = self.nmt_state;

        match cmd {
            NmtCommandSpecifier::Start => self.nmt_state = NmtState::Operational,
            NmtCommandSpecifier::Stop => self.nmt_state = NmtState::Stopped,
            NmtCommandSpecifier::EnterPreOp => self.nmt_state = NmtState::PreOperational,
            NmtCommandSpecifier::ResetApp => {
                if let Some(cb) = self.callbacks.app_reset {
                    cb();
                }
                self.nmt_state = NmtState::Bootup;
            }
            NmtCommandSpecifier::ResetComm => self.nmt_state = NmtState::Bootup,
        }

        debug!(
            "NMT state changed from {:?} to {:?}",
            prev_state, self.nmt_state
        );
    }

    /// Perform the communication reset
    ///
    /// Re-reads the communication configuration from the object dictionary,
    /// rewires all services for the (possibly new) node ID, and announces
    /// the reset with a boot-up message.
    fn comm_reset(&mut self, send_cb: &mut dyn FnMut(CanMessage)) {
        let state = self.state;

        self.sdo_server.reset();
        state.sync_consumer().reset();
        self.mbox.heartbeat_consumer().reset();
        state.tx_buffers().reset();
        self.guard_toggle = false;

        let (window_us, counter_overflow) = read_sync_config(self.od);
        state.sync_consumer().set_window_length_us(window_us);
        state.sync_consumer().set_counter_overflow(counter_overflow);

        self.heartbeat_period_ms = read_heartbeat_period(self.od);
        self.next_heartbeat_time_us = 0;

        // Transmit buffer allocation: one buffer per TPDO first, then two
        // per SRDO (normal, inverted)
        let tpdo_count = state.get_tpdos().len();
        for (i, srdo) in state.get_srdos().iter().enumerate() {
            srdo.reset(
                i as u8,
                self.node_id.raw(),
                tpdo_count + 2 * i,
                tpdo_count + 2 * i + 1,
            );
        }
        state.srdo_guard().reset();
        state.srdo_guard().set_nmt_state(NmtState::PreOperational);

        // Reset the LSS slave with the current ID
        self.lss_slave.update_config(LssConfig {
            identity: read_identity(self.od).unwrap_or(LssIdentity::new(0, 0, 0, 0)),
            node_id: self.node_id,
            store_supported: self.callbacks.store_node_config.is_some(),
        });

        let configured_id = match self.node_id {
            NodeId::Configured(id) => Some(id.raw()),
            NodeId::Unconfigured => None,
        };
        self.mbox.install_filters(configured_id);

        self.nmt_state = NmtState::PreOperational;

        if let NodeId::Configured(node_id) = self.node_id {
            info!("Booting node with ID {}", node_id.raw());
            // Boot-up is announced with a zero payload on the heartbeat COB
            send_cb(
                Heartbeat {
                    node: node_id.raw(),
                    toggle: false,
                    state: NmtState::Bootup,
                }
                .into(),
            );
        }
    }

    fn send_heartbeat(&mut self, sender: &mut dyn FnMut(CanMessage)) {
        if let NodeId::Configured(node_id) = self.node_id {
            let heartbeat = Heartbeat {
                node: node_id.raw(),
                toggle: false,
                state: self.nmt_state,
            };
            sender(heartbeat.into());
            self.next_heartbeat_time_us += (self.heartbeat_period_ms as u64) * 1000;
        }
    }
}
