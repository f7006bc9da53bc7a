//! Receive mailbox
//!
//! The mailbox is the boundary between the CAN receive context (typically an
//! interrupt) and the node tick: [`NodeMbox::store_message`] dispatches each
//! incoming frame to a per-service staging slot, and the node consumes the
//! staged data during [`Node::process`](crate::Node::process).
//!
//! Dispatch happens in two stages: a fixed filter slot table for the
//! broadcast and node-addressed services (installed at communication reset,
//! lowest slot wins), followed by the SRDO and RPDO matchers whose
//! identifiers are only known once the respective engine is configured.

use defmt_or_log::warn;
use sentrycan_common::{
    messages::{CanId, CanMessage, TimeOfDay, HEARTBEAT_BASE, SDO_REQ_BASE},
    AtomicCell,
};

use crate::can::{RxFilter, RxFilterTable};
use crate::heartbeat::HeartbeatConsumer;
use crate::lss_slave::LssReceiver;
use crate::pdo::Pdo;
use crate::sdo_server::SdoReceiver;
use crate::srdo::Srdo;

/// Fixed receive services dispatched through the filter slot table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ServiceSlot {
    Nmt,
    Sync,
    Time,
    Lss,
    Sdo,
    NodeGuard,
    Heartbeat,
}

const N_FILTER_SLOTS: usize = 8;

/// A data structure shared between the receiving context and the
/// [`Node`](crate::Node) object
#[allow(missing_debug_implementations)]
pub struct NodeMbox {
    rx_pdos: &'static [Pdo],
    srdos: &'static [Srdo],
    hb_consumer: &'static HeartbeatConsumer,
    filters: RxFilterTable<ServiceSlot, N_FILTER_SLOTS>,
    sdo_receiver: SdoReceiver,
    lss_receiver: LssReceiver,
    nmt_mbox: AtomicCell<Option<CanMessage>>,
    /// A received SYNC, carrying its optional counter byte
    sync_mbox: AtomicCell<Option<Option<u8>>>,
    time_mbox: AtomicCell<Option<TimeOfDay>>,
    guard_request: AtomicCell<bool>,
    /// COB of an RPDO dropped because its payload was shorter than the
    /// mapped length
    rpdo_length_error: AtomicCell<Option<u16>>,
    notify_cb: AtomicCell<Option<&'static (dyn Fn() + Sync)>>,
}

impl NodeMbox {
    /// Create a new NodeMbox
    ///
    /// # Args
    ///
    /// - `rx_pdos`: The receive PDOs, from the node state
    /// - `srdos`: The SRDO engines, from the node state
    /// - `hb_consumer`: The heartbeat consumer
    pub const fn new(
        rx_pdos: &'static [Pdo],
        srdos: &'static [Srdo],
        hb_consumer: &'static HeartbeatConsumer,
    ) -> Self {
        Self {
            rx_pdos,
            srdos,
            hb_consumer,
            filters: RxFilterTable::new(),
            sdo_receiver: SdoReceiver::new(),
            lss_receiver: LssReceiver::new(),
            nmt_mbox: AtomicCell::new(None),
            sync_mbox: AtomicCell::new(None),
            time_mbox: AtomicCell::new(None),
            guard_request: AtomicCell::new(false),
            rpdo_length_error: AtomicCell::new(None),
            notify_cb: AtomicCell::new(None),
        }
    }

    /// Set a callback for notification when a received message requires
    /// processing
    ///
    /// It must be static. Usually this will be a static fn, but in some
    /// circumstances it may be desirable to use Box::leak to pass a heap
    /// allocated closure instead.
    pub fn set_process_notify_callback(&self, callback: &'static (dyn Fn() + Sync)) {
        self.notify_cb.store(Some(callback));
    }

    fn notify(&self) {
        if let Some(notify_cb) = self.notify_cb.load() {
            notify_cb();
        }
    }

    /// Install the filter slot table for the broadcast and node-addressed
    /// services
    ///
    /// Called at communication reset. Without a configured node ID only the
    /// broadcast services and LSS are received.
    pub(crate) fn install_filters(&self, node_id: Option<u8>) {
        self.filters.clear();
        // Unwrap: the table has enough slots for every fixed service
        self.filters
            .register(0, RxFilter::exact(0x000), ServiceSlot::Nmt)
            .unwrap();
        self.filters
            .register(1, RxFilter::exact(0x080), ServiceSlot::Sync)
            .unwrap();
        self.filters
            .register(2, RxFilter::exact(0x100), ServiceSlot::Time)
            .unwrap();
        self.filters
            .register(3, RxFilter::exact(0x7E5), ServiceSlot::Lss)
            .unwrap();
        if let Some(node_id) = node_id {
            self.filters
                .register(
                    4,
                    RxFilter::exact(SDO_REQ_BASE + node_id as u16),
                    ServiceSlot::Sdo,
                )
                .unwrap();
            self.filters
                .register(
                    5,
                    RxFilter::exact_rtr(HEARTBEAT_BASE + node_id as u16),
                    ServiceSlot::NodeGuard,
                )
                .unwrap();
        }
        // All heartbeat producers; monitored nodes are selected by the
        // consumer entries
        self.filters
            .register(
                6,
                RxFilter {
                    id: HEARTBEAT_BASE,
                    mask: 0x780,
                    rtr: false,
                },
                ServiceSlot::Heartbeat,
            )
            .unwrap();
    }

    pub(crate) fn sdo_receiver(&self) -> &SdoReceiver {
        &self.sdo_receiver
    }

    pub(crate) fn lss_receiver(&self) -> &LssReceiver {
        &self.lss_receiver
    }

    pub(crate) fn heartbeat_consumer(&self) -> &'static HeartbeatConsumer {
        self.hb_consumer
    }

    pub(crate) fn read_nmt_mbox(&self) -> Option<CanMessage> {
        self.nmt_mbox.take()
    }

    pub(crate) fn take_sync(&self) -> Option<Option<u8>> {
        self.sync_mbox.take()
    }

    pub(crate) fn take_time(&self) -> Option<TimeOfDay> {
        self.time_mbox.take()
    }

    pub(crate) fn take_guard_request(&self) -> bool {
        self.guard_request.take()
    }

    pub(crate) fn take_rpdo_length_error(&self) -> Option<u16> {
        self.rpdo_length_error.take()
    }

    /// Store a received CAN message
    ///
    /// Safe to call from the CAN receive interrupt. Returns the message back
    /// when no service accepted it.
    pub fn store_message(&self, msg: CanMessage) -> Result<(), CanMessage> {
        if let Some(slot) = self.filters.match_frame(&msg) {
            match slot {
                ServiceSlot::Nmt => {
                    self.nmt_mbox.store(Some(msg));
                    self.notify();
                }
                ServiceSlot::Sync => {
                    self.sync_mbox.store(Some(msg.data().first().copied()));
                    self.notify();
                }
                ServiceSlot::Time => {
                    if let Ok(time) = TimeOfDay::try_from(msg) {
                        self.time_mbox.store(Some(time));
                        self.notify();
                    } else {
                        warn!("Invalid TIME message");
                        return Err(msg);
                    }
                }
                ServiceSlot::Lss => {
                    if let Ok(lss_req) = msg.data().try_into() {
                        if self.lss_receiver.handle_req(lss_req) {
                            self.notify();
                        }
                    } else {
                        warn!("Invalid LSS request");
                        return Err(msg);
                    }
                }
                ServiceSlot::Sdo => {
                    if self.sdo_receiver.handle_req(msg.data()) {
                        self.notify();
                    }
                }
                ServiceSlot::NodeGuard => {
                    self.guard_request.store(true);
                    self.notify();
                }
                ServiceSlot::Heartbeat => {
                    if let Some(&payload) = msg.data().first() {
                        let node = (msg.id().raw() & 0x7F) as u8;
                        if self.hb_consumer.store_rx(node, payload) {
                            self.notify();
                        }
                    }
                }
            }
            return Ok(());
        }

        let id = match msg.id() {
            CanId::Std(id) => id,
            CanId::Extended(_) => return Err(msg),
        };

        for srdo in self.srdos {
            if srdo.try_receive(id, msg.data()) {
                self.notify();
                return Ok(());
            }
        }

        for rpdo in self.rx_pdos {
            if !rpdo.valid() {
                continue;
            }
            if msg.id() == rpdo.cob_id() {
                if msg.data().len() < rpdo.mapped_length() {
                    self.rpdo_length_error.store(Some(id));
                    self.notify();
                    return Ok(());
                }
                let mut data = [0u8; 8];
                data[0..msg.data().len()].copy_from_slice(msg.data());
                rpdo.buffered_value.store(Some(data));
                self.notify();
                return Ok(());
            }
        }

        Err(msg)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::heartbeat::HbConsumerEntry;

    fn leak<T>(value: T) -> &'static T {
        std::boxed::Box::leak(std::boxed::Box::new(value))
    }

    fn make_mbox() -> &'static NodeMbox {
        let entries: &'static [HbConsumerEntry] = leak([HbConsumerEntry::new()]);
        let hb = leak(HeartbeatConsumer::new(entries));
        let rpdos: &'static [Pdo] = leak([Pdo::new()]);
        let srdos: &'static [Srdo] = leak([Srdo::new()]);
        leak(NodeMbox::new(rpdos, srdos, hb))
    }

    #[test]
    fn test_nmt_dispatch() {
        let mbox = make_mbox();
        mbox.install_filters(Some(5));
        let msg = CanMessage::new(CanId::Std(0), &[1, 5]);
        mbox.store_message(msg).unwrap();
        assert!(mbox.read_nmt_mbox().is_some());
        assert!(mbox.read_nmt_mbox().is_none());
    }

    #[test]
    fn test_sdo_requires_node_id() {
        let mbox = make_mbox();
        mbox.install_filters(None);
        let msg = CanMessage::new(CanId::Std(0x605), &[0x40, 0, 0x10, 0, 0, 0, 0, 0]);
        assert!(mbox.store_message(msg).is_err());

        mbox.install_filters(Some(5));
        mbox.store_message(msg).unwrap();
        // Short frames are ignored by the receiver
        assert!(!mbox.sdo_receiver().handle_req(&[0; 7]));
    }

    #[test]
    fn test_node_guard_rtr() {
        let mbox = make_mbox();
        mbox.install_filters(Some(5));
        mbox.store_message(CanMessage::new_rtr(CanId::Std(0x705)))
            .unwrap();
        assert!(mbox.take_guard_request());
        assert!(!mbox.take_guard_request());
    }

    #[test]
    fn test_unmatched_frame_returned() {
        let mbox = make_mbox();
        mbox.install_filters(Some(5));
        let msg = CanMessage::new(CanId::Std(0x345), &[1]);
        assert_eq!(Err(msg), mbox.store_message(msg));
    }

    #[test]
    fn test_rpdo_short_frame_reports_length_error() {
        let mbox = make_mbox();
        mbox.install_filters(Some(5));

        let rpdo = &mbox.rx_pdos[0];
        rpdo.set_cob_id(CanId::Std(0x205));
        rpdo.set_valid(true);

        let msg = CanMessage::new(CanId::Std(0x205), &[1, 2, 3, 4]);
        mbox.store_message(msg).unwrap();
        assert!(rpdo.buffered_value.take().is_some());
        assert!(mbox.take_rpdo_length_error().is_none());
    }
}
