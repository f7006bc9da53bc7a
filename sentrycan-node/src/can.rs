//! CAN module abstraction
//!
//! This module holds the pieces of the CAN driver contract which are
//! hardware independent: the receive filter table used by the mailbox to
//! dispatch frames to services, the set of persistent transmit buffers, and
//! the bus-error monitor which turns controller status edges into emergency
//! reports. The hardware driver itself stays outside the stack; it feeds
//! received frames into [`crate::NodeMbox::store_message`] and periodically
//! reports its status via [`BusErrorMonitor::update`].

use core::cell::UnsafeCell;

use sentrycan_common::{
    messages::{CanId, CanMessage},
    AtomicCell,
};

use crate::emergency::{Emergency, ErrorKind};

/// An 11-bit acceptance filter
///
/// A frame is accepted when `(frame_id & mask) == (id & mask)` and the RTR
/// bit matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxFilter {
    /// The 11-bit identifier to match
    pub id: u16,
    /// The 11-bit mask applied to both sides of the comparison
    pub mask: u16,
    /// Whether this filter accepts remote transmission requests
    pub rtr: bool,
}

impl RxFilter {
    /// Create a filter matching exactly one identifier
    pub const fn exact(id: u16) -> Self {
        Self {
            id,
            mask: 0x7FF,
            rtr: false,
        }
    }

    /// Create a filter matching exactly one identifier, RTR frames only
    pub const fn exact_rtr(id: u16) -> Self {
        Self {
            id,
            mask: 0x7FF,
            rtr: true,
        }
    }

    /// Check whether a frame is selected by this filter
    pub fn matches(&self, id: u16, rtr: bool) -> bool {
        (id & self.mask) == (self.id & self.mask) && rtr == self.rtr
    }
}

/// A fixed-size table of receive filter slots
///
/// Each slot binds a filter to a service tag of type `T`. Slots are installed
/// at communication reset and not mutated at runtime. When multiple slots
/// match a frame, the lowest-index slot wins.
#[allow(missing_debug_implementations)]
pub struct RxFilterTable<T: Copy + Send, const N: usize> {
    slots: [AtomicCell<Option<(RxFilter, T)>>; N],
}

impl<T: Copy + Send, const N: usize> Default for RxFilterTable<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Send, const N: usize> RxFilterTable<T, N> {
    /// Create a table with all slots empty
    pub const fn new() -> Self {
        Self {
            slots: [const { AtomicCell::new(None) }; N],
        }
    }

    /// Bind `filter` to `slot`, tagging matches with `tag`
    ///
    /// Fails when the slot index is out of range.
    pub fn register(&self, slot: usize, filter: RxFilter, tag: T) -> Result<(), OutOfSlots> {
        if slot >= N {
            return Err(OutOfSlots);
        }
        self.slots[slot].store(Some((filter, tag)));
        Ok(())
    }

    /// Clear all slots
    pub fn clear(&self) {
        for slot in &self.slots {
            slot.store(None);
        }
    }

    /// Find the service slot selecting this frame, if any
    pub fn match_frame(&self, msg: &CanMessage) -> Option<T> {
        let id = match msg.id() {
            CanId::Std(id) => id,
            // Only 11-bit identifiers are used by the pre-defined connection set
            CanId::Extended(_) => return None,
        };
        for slot in &self.slots {
            if let Some((filter, tag)) = slot.load() {
                if filter.matches(id, msg.is_rtr()) {
                    return Some(tag);
                }
            }
        }
        None
    }
}

/// Error returned when a filter or buffer index is out of range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutOfSlots;

/// A persistent transmit buffer
///
/// Configured once per communication reset; the owning service fills
/// `data[..dlc]` and marks it for transmission. The `full` flag clears only
/// when the buffer is drained to the driver.
#[allow(missing_debug_implementations)]
pub struct TxBuffer {
    id: AtomicCell<u16>,
    dlc: AtomicCell<u8>,
    rtr: AtomicCell<bool>,
    sync_flag: AtomicCell<bool>,
    full: AtomicCell<bool>,
    data: UnsafeCell<[u8; 8]>,
}

unsafe impl Sync for TxBuffer {}

impl TxBuffer {
    const fn new() -> Self {
        Self {
            id: AtomicCell::new(0),
            dlc: AtomicCell::new(0),
            rtr: AtomicCell::new(false),
            sync_flag: AtomicCell::new(false),
            full: AtomicCell::new(false),
            data: UnsafeCell::new([0; 8]),
        }
    }

    /// Store payload bytes into the buffer
    pub fn store_data(&self, data: &[u8]) {
        critical_section::with(|_| {
            let bytes = unsafe { &mut *self.data.get() };
            bytes[..data.len()].copy_from_slice(data);
        });
    }

    /// Returns true if the buffer holds a frame waiting for transmission
    pub fn is_full(&self) -> bool {
        self.full.load()
    }

    fn to_message(&self) -> CanMessage {
        let data = critical_section::with(|_| unsafe { *self.data.get() });
        let dlc = self.dlc.load();
        let mut msg = CanMessage::new(CanId::Std(self.id.load()), &data[..dlc as usize]);
        msg.rtr = self.rtr.load();
        msg
    }
}

/// A fixed-size set of transmit buffers
///
/// Each buffer is owned by exactly one service, assigned by index at
/// communication reset.
#[allow(missing_debug_implementations)]
pub struct TxBufferSet<const N: usize> {
    buffers: [TxBuffer; N],
}

impl<const N: usize> Default for TxBufferSet<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> TxBufferSet<N> {
    /// Create a set with all buffers unconfigured
    pub const fn new() -> Self {
        Self {
            buffers: [const { TxBuffer::new() }; N],
        }
    }

    /// Configure a buffer and get its handle
    ///
    /// Fails when the index is out of range. Reconfiguring drops any pending
    /// frame.
    pub fn init_buffer(
        &self,
        index: usize,
        id: u16,
        rtr: bool,
        dlc: u8,
        sync_flag: bool,
    ) -> Result<&TxBuffer, OutOfSlots> {
        let buffer = self.buffers.get(index).ok_or(OutOfSlots)?;
        buffer.id.store(id);
        buffer.rtr.store(rtr);
        buffer.dlc.store(dlc);
        buffer.sync_flag.store(sync_flag);
        buffer.full.store(false);
        Ok(buffer)
    }

    /// Get a previously configured buffer
    pub fn buffer(&self, index: usize) -> Result<&TxBuffer, OutOfSlots> {
        self.buffers.get(index).ok_or(OutOfSlots)
    }

    /// Mark a buffer for transmission
    ///
    /// Fails when the previous frame in this buffer has not been drained
    /// yet; the caller reports this as a TX overflow.
    pub fn send(&self, index: usize) -> Result<(), TxOverflow> {
        let buffer = self.buffers.get(index).ok_or(TxOverflow)?;
        if buffer.full.fetch_update(|f| (!f).then_some(true)).is_err() {
            return Err(TxOverflow);
        }
        Ok(())
    }

    /// Drain all pending frames, in index order, to the driver
    pub fn drain(&self, send: &mut dyn FnMut(CanMessage)) {
        for buffer in &self.buffers {
            if buffer.full.take() {
                send(buffer.to_message());
            }
        }
    }

    /// Abort unsent sync-flagged frames
    ///
    /// Called when the synchronous window elapses. Returns the number of
    /// aborted frames; the caller reports a nonzero count as
    /// TPDO-outside-window.
    pub fn clear_pending_sync(&self) -> usize {
        let mut cleared = 0;
        for buffer in &self.buffers {
            if buffer.sync_flag.load() && buffer.full.take() {
                cleared += 1;
            }
        }
        cleared
    }

    /// Drop all pending frames and sync flags
    pub fn reset(&self) {
        for buffer in &self.buffers {
            buffer.full.store(false);
            buffer.sync_flag.store(false);
        }
    }
}

/// Error returned by [`TxBufferSet::send`] when the buffer is still occupied
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxOverflow;

/// Index-based access to a transmit buffer set of any size
///
/// Lets the non-generic service objects (SRDO, PDO, Node) share one
/// [`TxBufferSet`] without carrying its size parameter.
pub trait TxBufferAccess: Sync + Send {
    /// Configure the buffer at `index`; see [`TxBufferSet::init_buffer`]
    fn init(&self, index: usize, id: u16, rtr: bool, dlc: u8, sync_flag: bool)
        -> Result<(), OutOfSlots>;
    /// Store payload bytes into the buffer at `index`
    fn store_data(&self, index: usize, data: &[u8]) -> Result<(), OutOfSlots>;
    /// Mark the buffer at `index` for transmission
    fn send(&self, index: usize) -> Result<(), TxOverflow>;
    /// Drain all pending frames to the driver
    fn drain(&self, send: &mut dyn FnMut(CanMessage));
    /// Abort unsent sync-flagged frames, returning the number aborted
    fn clear_pending_sync(&self) -> usize;
    /// Drop all pending frames and sync flags
    fn reset(&self);
}

impl<const N: usize> TxBufferAccess for TxBufferSet<N> {
    fn init(
        &self,
        index: usize,
        id: u16,
        rtr: bool,
        dlc: u8,
        sync_flag: bool,
    ) -> Result<(), OutOfSlots> {
        self.init_buffer(index, id, rtr, dlc, sync_flag).map(|_| ())
    }

    fn store_data(&self, index: usize, data: &[u8]) -> Result<(), OutOfSlots> {
        self.buffer(index)?.store_data(data);
        Ok(())
    }

    fn send(&self, index: usize) -> Result<(), TxOverflow> {
        TxBufferSet::send(self, index)
    }

    fn drain(&self, send: &mut dyn FnMut(CanMessage)) {
        TxBufferSet::drain(self, send)
    }

    fn clear_pending_sync(&self) -> usize {
        TxBufferSet::clear_pending_sync(self)
    }

    fn reset(&self) {
        TxBufferSet::reset(self)
    }
}

/// Bus status as reported by the CAN controller driver
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CanBusStatus {
    /// The controller has reached the error warning limit
    pub warning: bool,
    /// The controller is error passive
    pub passive: bool,
    /// The controller is bus off
    pub bus_off: bool,
}

/// Latches bus status transitions and reports each once via Emergency
#[derive(Debug, Default)]
pub struct BusErrorMonitor {
    prev: AtomicCell<CanBusStatus>,
}

impl BusErrorMonitor {
    /// Create a new monitor with all statuses clear
    pub const fn new() -> Self {
        Self {
            prev: AtomicCell::new(CanBusStatus {
                warning: false,
                passive: false,
                bus_off: false,
            }),
        }
    }

    /// Feed the current controller status, raising or resetting emergencies
    /// on each edge
    pub fn update(&self, status: CanBusStatus, em: &Emergency) {
        let prev = self.prev.load();
        if status == prev {
            return;
        }
        self.prev.store(status);

        if status.bus_off != prev.bus_off {
            if status.bus_off {
                em.raise(ErrorKind::CanTxBusOff, 0);
            } else {
                em.reset(ErrorKind::CanTxBusOff, 0);
            }
        }
        if status.warning != prev.warning {
            if status.warning {
                em.raise(ErrorKind::CanBusWarning, 0);
            } else {
                em.reset(ErrorKind::CanBusWarning, 0);
            }
        }
        if status.passive != prev.passive {
            if status.passive {
                em.raise(ErrorKind::CanBusPassive, 0);
            } else {
                em.reset(ErrorKind::CanBusPassive, 0);
            }
        }
    }

    /// Returns true if the last reported status was bus off
    pub fn bus_off(&self) -> bool {
        self.prev.load().bus_off
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_lowest_slot_wins() {
        let table: RxFilterTable<u8, 4> = RxFilterTable::new();
        table
            .register(
                2,
                RxFilter {
                    id: 0x100,
                    mask: 0x700,
                    rtr: false,
                },
                2,
            )
            .unwrap();
        table.register(1, RxFilter::exact(0x101), 1).unwrap();

        let msg = CanMessage::new(CanId::Std(0x101), &[0]);
        assert_eq!(Some(1), table.match_frame(&msg));
        let msg = CanMessage::new(CanId::Std(0x102), &[0]);
        assert_eq!(Some(2), table.match_frame(&msg));
        let msg = CanMessage::new(CanId::Std(0x200), &[0]);
        assert_eq!(None, table.match_frame(&msg));
    }

    #[test]
    fn test_filter_rtr_match() {
        let table: RxFilterTable<u8, 2> = RxFilterTable::new();
        table.register(0, RxFilter::exact_rtr(0x705), 9).unwrap();
        assert_eq!(
            Some(9),
            table.match_frame(&CanMessage::new_rtr(CanId::Std(0x705)))
        );
        assert_eq!(
            None,
            table.match_frame(&CanMessage::new(CanId::Std(0x705), &[5]))
        );
    }

    #[test]
    fn test_tx_buffer_send_and_drain() {
        let set: TxBufferSet<2> = TxBufferSet::new();
        let buf = set.init_buffer(0, 0x181, false, 2, false).unwrap();
        buf.store_data(&[0x34, 0x12]);
        set.send(0).unwrap();
        // Second send before drain overflows
        assert_eq!(Err(TxOverflow), set.send(0));

        let mut sent = heapless::Vec::<CanMessage, 4>::new();
        set.drain(&mut |msg| sent.push(msg).unwrap());
        assert_eq!(1, sent.len());
        assert_eq!(CanId::Std(0x181), sent[0].id());
        assert_eq!(&[0x34, 0x12], sent[0].data());

        // Buffer is free again
        set.send(0).unwrap();
    }

    #[test]
    fn test_clear_pending_sync() {
        let set: TxBufferSet<2> = TxBufferSet::new();
        set.init_buffer(0, 0x181, false, 1, true).unwrap();
        set.init_buffer(1, 0x182, false, 1, false).unwrap();
        set.send(0).unwrap();
        set.send(1).unwrap();
        assert_eq!(1, set.clear_pending_sync());
        let mut count = 0;
        set.drain(&mut |_| count += 1);
        assert_eq!(1, count);
    }

    #[test]
    fn test_bus_error_monitor_edges() {
        let em = Emergency::new();
        let monitor = BusErrorMonitor::new();
        monitor.update(
            CanBusStatus {
                warning: true,
                ..Default::default()
            },
            &em,
        );
        assert!(em.is_raised(ErrorKind::CanBusWarning));
        // Same status again does not change anything
        monitor.update(
            CanBusStatus {
                warning: true,
                ..Default::default()
            },
            &em,
        );
        monitor.update(CanBusStatus::default(), &em);
        assert!(!em.is_raised(ErrorKind::CanBusWarning));
    }
}
