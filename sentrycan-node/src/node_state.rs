//! Per-node static storage
//!
//! The [`NodeState`] bundles all statically pre-sized, `Sync` storage a node
//! needs: the PDO and SRDO engines, the SRDO guard, the emergency producer,
//! the SYNC/TIME consumers, the transmit buffer set, the heartbeat consumer
//! entries and the storage context. It is instantiated once as a static by
//! the application and accessed by the [`Node`](crate::Node) through the
//! [`NodeStateAccess`] trait, which hides the const-generic sizing.

use crate::can::{TxBufferAccess, TxBufferSet};
use crate::emergency::Emergency;
use crate::heartbeat::HbConsumerEntry;
use crate::object_dict::ObjectFlagSync;
use crate::pdo::Pdo;
use crate::srdo::{Srdo, SrdoGuard};
use crate::storage::StorageContext;
use crate::sync::{SyncConsumer, TimeConsumer};

/// A trait by which the node accesses its static state
pub trait NodeStateAccess: Sync + Send {
    /// Get the receive PDO objects
    fn get_rpdos(&self) -> &[Pdo];
    /// Get the transmit PDO objects
    fn get_tpdos(&self) -> &[Pdo];
    /// Get the SRDO engines
    fn get_srdos(&self) -> &[Srdo];
    /// Get the SRDO guard
    fn srdo_guard(&self) -> &SrdoGuard;
    /// Get the PDO event flag sync object
    fn get_pdo_sync(&self) -> &ObjectFlagSync;
    /// Get the emergency producer
    fn emergency(&self) -> &Emergency;
    /// Get the SYNC consumer
    fn sync_consumer(&self) -> &SyncConsumer;
    /// Get the TIME consumer
    fn time_consumer(&self) -> &TimeConsumer;
    /// Get the transmit buffer set
    fn tx_buffers(&self) -> &dyn TxBufferAccess;
    /// Get the storage context object
    fn storage_context(&self) -> &StorageContext;
}

/// The statically sized state storage for one node
///
/// The transmit buffer set holds one buffer per TPDO plus two per SRDO
/// (normal and inverted), allocated in that order at communication reset.
pub struct NodeState<
    const N_RPDO: usize,
    const N_TPDO: usize,
    const N_SRDO: usize,
    const N_HB: usize,
    const N_TXBUF: usize,
> {
    rpdos: [Pdo; N_RPDO],
    tpdos: [Pdo; N_TPDO],
    srdos: [Srdo; N_SRDO],
    srdo_guard: SrdoGuard,
    pdo_sync: ObjectFlagSync,
    emergency: Emergency,
    sync_consumer: SyncConsumer,
    time_consumer: TimeConsumer,
    tx_buffers: TxBufferSet<N_TXBUF>,
    hb_entries: [HbConsumerEntry; N_HB],
    storage_context: StorageContext,
}

impl<
        const N_RPDO: usize,
        const N_TPDO: usize,
        const N_SRDO: usize,
        const N_HB: usize,
        const N_TXBUF: usize,
    > Default for NodeState<N_RPDO, N_TPDO, N_SRDO, N_HB, N_TXBUF>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<
        const N_RPDO: usize,
        const N_TPDO: usize,
        const N_SRDO: usize,
        const N_HB: usize,
        const N_TXBUF: usize,
    > NodeState<N_RPDO, N_TPDO, N_SRDO, N_HB, N_TXBUF>
{
    /// Create a new NodeState
    pub const fn new() -> Self {
        Self {
            rpdos: [const { Pdo::new() }; N_RPDO],
            tpdos: [const { Pdo::new() }; N_TPDO],
            srdos: [const { Srdo::new() }; N_SRDO],
            srdo_guard: SrdoGuard::new(),
            pdo_sync: ObjectFlagSync::new(),
            emergency: Emergency::new(),
            sync_consumer: SyncConsumer::new(),
            time_consumer: TimeConsumer::new(),
            tx_buffers: TxBufferSet::new(),
            hb_entries: [const { HbConsumerEntry::new() }; N_HB],
            storage_context: StorageContext::new(),
        }
    }

    /// Access the RPDOs as a const function
    ///
    /// Required so they can be shared with the [`NodeMbox`](crate::NodeMbox)
    /// in a static initializer.
    pub const fn rpdos(&'static self) -> &'static [Pdo] {
        &self.rpdos
    }

    /// Access the TPDOs as a const function
    pub const fn tpdos(&'static self) -> &'static [Pdo] {
        &self.tpdos
    }

    /// Access the SRDOs as a const function
    ///
    /// Required so they can be shared with the mailbox and the SRDO OD
    /// objects in static initializers.
    pub const fn srdos(&'static self) -> &'static [Srdo] {
        &self.srdos
    }

    /// Access the SRDO guard as a const function
    pub const fn guard(&'static self) -> &'static SrdoGuard {
        &self.srdo_guard
    }

    /// Access the heartbeat consumer entries as a const function
    ///
    /// Required so they can be shared with the
    /// [`HeartbeatConsumer`](crate::heartbeat::HeartbeatConsumer) in a
    /// static initializer.
    pub const fn hb_entries(&'static self) -> &'static [HbConsumerEntry] {
        &self.hb_entries
    }

    /// Access the emergency producer as a const function
    pub const fn em(&'static self) -> &'static Emergency {
        &self.emergency
    }

    /// Access the PDO flag sync as a const function
    pub const fn pdo_sync(&'static self) -> &'static ObjectFlagSync {
        &self.pdo_sync
    }

    /// Access the storage context as a const function
    pub const fn storage(&'static self) -> &'static StorageContext {
        &self.storage_context
    }
}

impl<
        const N_RPDO: usize,
        const N_TPDO: usize,
        const N_SRDO: usize,
        const N_HB: usize,
        const N_TXBUF: usize,
    > NodeStateAccess for NodeState<N_RPDO, N_TPDO, N_SRDO, N_HB, N_TXBUF>
{
    fn get_rpdos(&self) -> &[Pdo] {
        &self.rpdos
    }

    fn get_tpdos(&self) -> &[Pdo] {
        &self.tpdos
    }

    fn get_srdos(&self) -> &[Srdo] {
        &self.srdos
    }

    fn srdo_guard(&self) -> &SrdoGuard {
        &self.srdo_guard
    }

    fn get_pdo_sync(&self) -> &ObjectFlagSync {
        &self.pdo_sync
    }

    fn emergency(&self) -> &Emergency {
        &self.emergency
    }

    fn sync_consumer(&self) -> &SyncConsumer {
        &self.sync_consumer
    }

    fn time_consumer(&self) -> &TimeConsumer {
        &self.time_consumer
    }

    fn tx_buffers(&self) -> &dyn TxBufferAccess {
        &self.tx_buffers
    }

    fn storage_context(&self) -> &StorageContext {
        &self.storage_context
    }
}
