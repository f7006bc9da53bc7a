//! Safety-Relevant Data Object (SRDO) engine
//!
//! An SRDO ships each payload twice per cycle: a normal frame followed by a
//! bitwise-inverted frame on a second COB-ID. Receivers accept the data only
//! when both halves arrive within the configured times and every byte of the
//! inverted frame is the complement of the normal frame; any mismatch or
//! timeout triggers the application's safe-state callback and leaves the
//! mapped object dictionary values untouched.
//!
//! The configuration (communication record 0x1301+, mapping record 0x1381+)
//! is guarded by a CRC signature (0x13FF) and a validity flag (0x13FE, magic
//! 0xA5), arbitrated by the [`SrdoGuard`]. Mapping and communication
//! parameters are resolved once, on the transition to NMT Operational; CiA
//! 304 forbids runtime reconfiguration.

use sentrycan_common::{messages::NmtState, sdo::AbortCode, AtomicCell};

use core::cell::UnsafeCell;

use crate::can::TxBufferAccess;
use crate::crc::crc16_ccitt;
use crate::emergency::{Emergency, ErrorKind};
use crate::object_dict::{find_object_entry, ODEntry, ObjectAccess};

use defmt_or_log::{debug, warn};

/// Maximum number of entries which can be mapped to one SRDO
///
/// All mapped objects are specified twice, once for the normal and once for
/// the inverted frame, so this allows 8 entries per frame.
pub const SRDO_MAX_MAPPED_ENTRIES: usize = 16;

/// Minimum delay between the normal and inverted frame of a pair, in
/// microseconds
///
/// The inverted frame is scheduled this long after the normal frame; with a
/// zero value it goes out on the next process call.
pub const SRDO_MINIMUM_DELAY_US: u32 = 0;

/// Value of the configuration valid flag when the configuration is accepted
pub const SRDO_VALID_MAGIC: u8 = sentrycan_common::constants::values::SRDO_VALID_MAGIC;

/// Base COB-ID seed for the first SRDO's normal frame
///
/// Slot `i` defaults to `0xFF + 2*i` (normal) and `0x100 + 2*i` (inverted);
/// when the configured COB-ID equals the seed and the node ID is at most 64,
/// `2 * node_id` is added, placing the IDs in the 0x101..=0x180 SRDO range.
pub const SRDO_DEFAULT_COB_BASE: u16 = 0xFF;

/// Validity state of one SRDO
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SrdoValid {
    /// Not configured, or configuration rejected
    Invalid,
    /// Transmitting
    Tx,
    /// Receiving
    Rx,
}

/// Information direction values of the communication record
pub mod direction {
    /// SRDO not used
    pub const INVALID: u8 = 0;
    /// SRDO is transmitted by this node
    pub const TX: u8 = 1;
    /// SRDO is received by this node
    pub const RX: u8 = 2;
}

/// Command word produced by [`SrdoGuard::process`] for [`Srdo::process`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GuardCommands {
    /// The node just entered NMT Operational; (re)configure mapping and
    /// communication
    pub entered_operational: bool,
    /// A checksum verification was requested via object 0x13FE
    pub validate_checksum: bool,
}

/// Arbiter for the shared SRDO configuration validity
///
/// Owns the configuration-valid byte (magic 0xA5 when accepted), the
/// CRC-check-request latch, and the NMT state edge detector.
#[allow(missing_debug_implementations)]
pub struct SrdoGuard {
    /// The accepted state used to gate the SRDO engines
    configuration_valid: AtomicCell<u8>,
    /// The OD-visible (persisted) flag value of object 0x13FE
    valid_flag: AtomicCell<u8>,
    check_crc: AtomicCell<bool>,
    nmt_state: AtomicCell<NmtState>,
    prev_nmt_state: AtomicCell<Option<NmtState>>,
}

impl Default for SrdoGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl SrdoGuard {
    /// Create a new guard with an invalid configuration
    pub const fn new() -> Self {
        Self {
            configuration_valid: AtomicCell::new(0),
            valid_flag: AtomicCell::new(0),
            check_crc: AtomicCell::new(false),
            nmt_state: AtomicCell::new(NmtState::Bootup),
            prev_nmt_state: AtomicCell::new(None),
        }
    }

    /// Reinitialize at communication reset
    ///
    /// The stored flag value (restored from persistent storage before this
    /// call) becomes the accepted state; a CRC verification is requested iff
    /// it carries the magic.
    pub fn reset(&self) {
        let flag = self.valid_flag.load();
        self.configuration_valid.store(flag);
        self.check_crc.store(flag == SRDO_VALID_MAGIC);
        self.prev_nmt_state.store(None);
    }

    /// True when the configuration is accepted
    pub fn config_valid(&self) -> bool {
        self.configuration_valid.load() == SRDO_VALID_MAGIC
    }

    /// Mark the configuration invalid
    ///
    /// Called by every write to an SRDO communication, mapping or CRC
    /// object, and by a failed CRC verification.
    pub fn invalidate(&self) {
        self.configuration_valid.store(0);
    }

    /// The OD-visible flag value (object 0x13FE sub 1)
    pub fn valid_flag(&self) -> u8 {
        self.valid_flag.load()
    }

    /// Store the flag value and latch a CRC check request when it carries
    /// the magic
    pub fn set_valid_flag(&self, value: u8) {
        self.valid_flag.store(value);
        self.check_crc.store(value == SRDO_VALID_MAGIC);
    }

    /// Record the current NMT state; used to gate SDO writes
    pub fn set_nmt_state(&self, state: NmtState) {
        self.nmt_state.store(state);
    }

    /// True when the node is NMT Operational
    pub fn is_operational(&self) -> bool {
        self.nmt_state.load() == NmtState::Operational
    }

    /// Detect state edges and pending CRC requests
    ///
    /// Returns the command word consumed by each [`Srdo::process`] this
    /// tick.
    pub fn process(&self, state: NmtState) -> GuardCommands {
        self.nmt_state.store(state);
        let mut commands = GuardCommands::default();

        if self.prev_nmt_state.load() != Some(state) {
            self.prev_nmt_state.store(Some(state));
            if state == NmtState::Operational {
                commands.entered_operational = true;
            }
        }

        if self.check_crc.take() {
            // The verification itself runs in Srdo::process, before any
            // reconfiguration triggered by an Operational edge
            commands.validate_checksum = true;
        }

        commands
    }
}

/// One byte-source resolved from a mapping descriptor
#[derive(Clone, Copy)]
enum ResolvedMap {
    /// A mapped object dictionary sub-object
    Object {
        entry: &'static ODEntry<'static>,
        sub: u8,
        len: u8,
    },
    /// A dummy mapping (index <= 7, sub 0), a zero source / byte sink used
    /// to pad receive payloads
    Dummy { len: u8 },
}

impl ResolvedMap {
    fn len(&self) -> usize {
        match self {
            ResolvedMap::Object { len, .. } => *len as usize,
            ResolvedMap::Dummy { len } => *len as usize,
        }
    }

    /// True when both maps refer to the same storage
    fn same_source(&self, other: &ResolvedMap) -> bool {
        match (self, other) {
            (
                ResolvedMap::Object {
                    entry: a, sub: sa, ..
                },
                ResolvedMap::Object {
                    entry: b, sub: sb, ..
                },
            ) => a.index == b.index && sa == sb,
            (ResolvedMap::Dummy { .. }, ResolvedMap::Dummy { .. }) => true,
            _ => false,
        }
    }
}

/// Receive staging buffer for one half of the pair
struct RxStage {
    new_flag: AtomicCell<bool>,
    data: UnsafeCell<[u8; 8]>,
}

unsafe impl Sync for RxStage {}

impl RxStage {
    const fn new() -> Self {
        Self {
            new_flag: AtomicCell::new(false),
            data: UnsafeCell::new([0; 8]),
        }
    }

    fn store(&self, data: &[u8]) {
        critical_section::with(|_| {
            let bytes = unsafe { &mut *self.data.get() };
            bytes[..data.len()].copy_from_slice(data);
        });
        self.new_flag.store(true);
    }

    fn load(&self) -> [u8; 8] {
        critical_section::with(|_| unsafe { *self.data.get() })
    }
}

/// Callback invoked when the SRDO enters the safe state
///
/// The argument is the SRDO slot number. Called on a receive validation
/// failure (complement mismatch or timeout) and, when the transmit
/// consistency check is enabled, on inconsistent transmit data.
pub type SafeStateCallback = dyn Fn(u8) + Sync;

const ENTRIES_PER_FRAME: usize = SRDO_MAX_MAPPED_ENTRIES / 2;

/// One SRDO engine
///
/// Holds the communication and mapping record storage (accessed through the
/// OD objects in [`crate::srdo_objects`]), the resolved mapping, and the
/// cycle state machine.
#[allow(missing_debug_implementations)]
pub struct Srdo {
    /// Slot number, 0-based; assigned at communication reset
    slot: AtomicCell<u8>,

    // Communication record storage (0x1301 + slot)
    direction: AtomicCell<u8>,
    refresh_time_or_sct: AtomicCell<u16>,
    srvt: AtomicCell<u8>,
    transmission_type: AtomicCell<u8>,
    cob_id: [AtomicCell<u32>; 2],
    channel: AtomicCell<u8>,

    // Mapping record storage (0x1381 + slot)
    num_mapped: AtomicCell<u8>,
    map: [AtomicCell<u32>; SRDO_MAX_MAPPED_ENTRIES],

    /// Persisted configuration signature (0x13FF sub slot+1)
    checksum: AtomicCell<u16>,

    // Runtime state
    valid: AtomicCell<SrdoValid>,
    data_length: AtomicCell<u8>,
    resolved: [[AtomicCell<Option<ResolvedMap>>; ENTRIES_PER_FRAME]; 2],
    /// Bit j set when normal byte j and inverted byte j map the same OD
    /// location (dual-use mode)
    dual_bytes: AtomicCell<u8>,
    /// Bit k set when inverted entry k maps the same sub-object as normal
    /// entry k
    dual_entries: AtomicCell<u8>,
    /// Change-of-state flag mask for TPDO-attributed bytes; informational,
    /// SRDO transmission is purely cyclic
    cos_mask: AtomicCell<u8>,
    toggle: AtomicCell<bool>,
    timer_us: AtomicCell<u32>,
    /// Resolved 11-bit identifiers, normal and inverted
    assigned_id: [AtomicCell<u16>; 2],
    /// Transmit buffer slots assigned by the node
    tx_index: [AtomicCell<usize>; 2],
    rx: [RxStage; 2],
    node_id: AtomicCell<u8>,
    default_cob_id: [AtomicCell<u16>; 2],
    check_tx_consistency: AtomicCell<bool>,
    safe_state_cb: AtomicCell<Option<&'static SafeStateCallback>>,
}

impl Srdo {
    /// Create a new SRDO
    pub const fn new() -> Self {
        Self {
            slot: AtomicCell::new(0),
            direction: AtomicCell::new(direction::INVALID),
            refresh_time_or_sct: AtomicCell::new(0),
            srvt: AtomicCell::new(0),
            transmission_type: AtomicCell::new(254),
            cob_id: [AtomicCell::new(0), AtomicCell::new(0)],
            channel: AtomicCell::new(0),
            num_mapped: AtomicCell::new(0),
            map: [const { AtomicCell::new(0) }; SRDO_MAX_MAPPED_ENTRIES],
            checksum: AtomicCell::new(0),
            valid: AtomicCell::new(SrdoValid::Invalid),
            data_length: AtomicCell::new(0),
            resolved: [
                [const { AtomicCell::new(None) }; ENTRIES_PER_FRAME],
                [const { AtomicCell::new(None) }; ENTRIES_PER_FRAME],
            ],
            dual_bytes: AtomicCell::new(0),
            dual_entries: AtomicCell::new(0),
            cos_mask: AtomicCell::new(0),
            toggle: AtomicCell::new(false),
            timer_us: AtomicCell::new(0),
            assigned_id: [AtomicCell::new(0), AtomicCell::new(0)],
            tx_index: [AtomicCell::new(0), AtomicCell::new(0)],
            rx: [RxStage::new(), RxStage::new()],
            node_id: AtomicCell::new(0),
            default_cob_id: [AtomicCell::new(0), AtomicCell::new(0)],
            check_tx_consistency: AtomicCell::new(true),
            safe_state_cb: AtomicCell::new(None),
        }
    }

    /// The slot number of this SRDO
    pub fn slot(&self) -> u8 {
        self.slot.load()
    }

    /// The current validity
    pub fn valid(&self) -> SrdoValid {
        self.valid.load()
    }

    /// The resolved payload length in bytes
    pub fn data_length(&self) -> u8 {
        self.data_length.load()
    }

    /// Register the safe-state callback
    pub fn set_safe_state_callback(&self, cb: &'static SafeStateCallback) {
        self.safe_state_cb.store(Some(cb));
    }

    /// Enable or disable the transmit-side consistency check
    pub fn set_check_tx_consistency(&self, value: bool) {
        self.check_tx_consistency.store(value);
    }

    /// Reinitialize at communication reset
    ///
    /// Assigns the slot number, the node ID, the default COB-ID seeds, and
    /// the transmit buffer slots. The configuration record storage is left
    /// untouched; it is applied on the next transition to Operational.
    pub fn reset(&self, slot: u8, node_id: u8, tx_index_normal: usize, tx_index_inverted: usize) {
        self.slot.store(slot);
        self.node_id.store(node_id);
        self.default_cob_id[0].store(SRDO_DEFAULT_COB_BASE + 2 * slot as u16);
        self.default_cob_id[1].store(SRDO_DEFAULT_COB_BASE + 1 + 2 * slot as u16);
        self.tx_index[0].store(tx_index_normal);
        self.tx_index[1].store(tx_index_inverted);
        self.valid.store(SrdoValid::Invalid);
        self.toggle.store(false);
        self.timer_us.store(0);
        self.assigned_id[0].store(0);
        self.assigned_id[1].store(0);
        self.rx[0].new_flag.store(false);
        self.rx[1].new_flag.store(false);
    }

    // --- Communication and mapping record storage accessors, used by the
    // --- OD objects

    pub(crate) fn direction_raw(&self) -> u8 {
        self.direction.load()
    }

    pub(crate) fn set_direction_raw(&self, value: u8) {
        self.direction.store(value);
    }

    pub(crate) fn refresh_time(&self) -> u16 {
        self.refresh_time_or_sct.load()
    }

    pub(crate) fn set_refresh_time(&self, value: u16) {
        self.refresh_time_or_sct.store(value);
    }

    pub(crate) fn srvt(&self) -> u8 {
        self.srvt.load()
    }

    pub(crate) fn set_srvt(&self, value: u8) {
        self.srvt.store(value);
    }

    pub(crate) fn transmission_type(&self) -> u8 {
        self.transmission_type.load()
    }

    pub(crate) fn set_transmission_type(&self, value: u8) {
        self.transmission_type.store(value);
    }

    pub(crate) fn cob_id_raw(&self, half: usize) -> u32 {
        self.cob_id[half].load()
    }

    pub(crate) fn set_cob_id_raw(&self, half: usize, value: u32) {
        self.cob_id[half].store(value);
    }

    pub(crate) fn channel(&self) -> u8 {
        self.channel.load()
    }

    pub(crate) fn set_channel(&self, value: u8) {
        self.channel.store(value);
    }

    pub(crate) fn num_mapped(&self) -> u8 {
        self.num_mapped.load()
    }

    pub(crate) fn set_num_mapped(&self, value: u8) {
        self.num_mapped.store(value);
    }

    pub(crate) fn map_raw(&self, entry: usize) -> u32 {
        self.map[entry].load()
    }

    pub(crate) fn set_map_raw(&self, entry: usize, value: u32) {
        self.map[entry].store(value);
    }

    pub(crate) fn checksum(&self) -> u16 {
        self.checksum.load()
    }

    pub(crate) fn set_checksum(&self, value: u16) {
        self.checksum.store(value);
    }

    // --- Receive path, called from the mailbox (interrupt context)

    /// Offer a received frame to this SRDO
    ///
    /// Returns true when the frame was consumed. The normal frame is staged
    /// only while the previous pair's inverted half has been processed; the
    /// inverted frame only after its normal half.
    pub fn try_receive(&self, id: u16, data: &[u8]) -> bool {
        if self.valid.load() != SrdoValid::Rx {
            return false;
        }
        if id == self.assigned_id[0].load() {
            if data.len() >= self.data_length.load() as usize && !self.rx[1].new_flag.load() {
                self.rx[0].store(data);
            }
            true
        } else if id == self.assigned_id[1].load() {
            if data.len() >= self.data_length.load() as usize
                && self.rx[0].new_flag.load()
                && !self.rx[1].new_flag.load()
            {
                self.rx[1].store(data);
            }
            true
        } else {
            false
        }
    }

    // --- Configuration, applied on the Operational edge

    /// Compute the configuration signature
    ///
    /// Hashes the communication record fields and the mapping descriptors in
    /// the CiA 304 order, little-endian.
    pub fn calc_crc(&self) -> u16 {
        let mut crc = crc16_ccitt(&[self.direction.load()], 0);
        crc = crc16_ccitt(&self.refresh_time_or_sct.load().to_le_bytes(), crc);
        crc = crc16_ccitt(&[self.srvt.load()], crc);
        crc = crc16_ccitt(&self.cob_id[0].load().to_le_bytes(), crc);
        crc = crc16_ccitt(&self.cob_id[1].load().to_le_bytes(), crc);
        let num_mapped = self.num_mapped.load();
        crc = crc16_ccitt(&[num_mapped], crc);
        for i in 0..num_mapped as usize {
            crc = crc16_ccitt(&[(i + 1) as u8], crc);
            crc = crc16_ccitt(&self.map[i].load().to_le_bytes(), crc);
        }
        crc
    }

    /// Resolve one mapping descriptor
    fn find_map(
        od: &'static [ODEntry<'static>],
        map: u32,
        length: &mut u8,
        cos_mask: &mut u8,
    ) -> Result<ResolvedMap, AbortCode> {
        let index = (map >> 16) as u16;
        let sub = (map >> 8) as u8;
        let bits = map as u8;

        if bits % 8 != 0 {
            return Err(AbortCode::UnallowedPdo);
        }
        let len = bits / 8;
        let start = *length;
        *length += len;
        if *length > 8 {
            return Err(AbortCode::PdoTooLong);
        }

        // Dummy mappings fill gaps in receive payloads
        if index <= 7 && sub == 0 {
            let dummy_size = match index {
                0 | 1 => 0,
                2 | 5 => 1,
                3 | 6 => 2,
                _ => 4,
            };
            if dummy_size < len {
                return Err(AbortCode::UnallowedPdo);
            }
            return Ok(ResolvedMap::Dummy { len });
        }

        let entry = find_object_entry(od, index).ok_or(AbortCode::NoSuchObject)?;
        let info = entry.data.sub_info(sub)?;
        if !info.pdo_mapping.is_mappable() {
            return Err(AbortCode::UnallowedPdo);
        }
        if info.size < len as usize {
            return Err(AbortCode::UnallowedPdo);
        }
        if info.pdo_mapping.is_tpdo_mappable() {
            for j in start..*length {
                *cos_mask |= 1 << j;
            }
        }
        Ok(ResolvedMap::Object { entry, sub, len })
    }

    /// Resolve the mapping record into per-frame source lists
    ///
    /// Entries alternate: even descriptors belong to the normal frame, odd
    /// descriptors to the inverted frame. Both sides must resolve to the
    /// same total length. Any resolution failure rejects the whole SRDO and
    /// reports a wrong-mapping emergency.
    fn config_map(&self, od: &'static [ODEntry<'static>], em: &Emergency) -> Result<(), AbortCode> {
        let mut lengths = [0u8; 2];
        let mut counts = [0usize; 2];
        let mut cos_mask = 0u8;

        for parity in &self.resolved {
            for cell in parity {
                cell.store(None);
            }
        }
        self.dual_bytes.store(0);
        self.dual_entries.store(0);

        let num_mapped = (self.num_mapped.load() as usize).min(SRDO_MAX_MAPPED_ENTRIES);
        for i in 0..num_mapped {
            let parity = i % 2;
            let map = self.map[i].load();
            match Self::find_map(od, map, &mut lengths[parity], &mut cos_mask) {
                Ok(resolved) => {
                    self.resolved[parity][counts[parity]].store(Some(resolved));
                    counts[parity] += 1;
                }
                Err(code) => {
                    self.data_length.store(0);
                    em.raise(ErrorKind::PdoWrongMapping, map);
                    return Err(code);
                }
            }
        }

        // Normal and inverted frames must carry the same number of bytes
        if lengths[0] != lengths[1] {
            self.data_length.store(0);
            em.raise(ErrorKind::PdoWrongMapping, 0);
            return Err(AbortCode::PdoTooLong);
        }

        // Mark the bytes and entries where both frames map the same storage;
        // for those, the inverted frame carries the complement of the normal
        // data and receive commits write the OD only once
        let mut dual_bytes = 0u8;
        let mut dual_entries = 0u8;
        let mut offset = 0usize;
        for k in 0..counts[0].min(counts[1]) {
            let normal = self.resolved[0][k].load();
            let inverted = self.resolved[1][k].load();
            if let (Some(normal), Some(inverted)) = (normal, inverted) {
                if normal.same_source(&inverted) && normal.len() == inverted.len() {
                    dual_entries |= 1 << k;
                    for j in offset..offset + normal.len() {
                        dual_bytes |= 1 << j;
                    }
                }
                offset += normal.len();
            }
        }
        self.dual_bytes.store(dual_bytes);
        self.dual_entries.store(dual_entries);
        self.cos_mask.store(cos_mask);
        self.data_length.store(lengths[0]);
        Ok(())
    }

    /// Validate the COB-IDs and activate the SRDO
    ///
    /// Both identifiers must carry no stray bits, fall in the SRDO range
    /// 0x101..=0x180 after the optional node-id offset, and have the parity
    /// of their half (normal odd, inverted even). Transmit SRDOs get their
    /// buffers installed and a node-indexed start stagger; receive SRDOs
    /// arm the refresh timeout.
    fn config_com(&self, guard: &SrdoGuard, tx: &dyn TxBufferAccess, em: &Emergency) {
        self.valid.store(SrdoValid::Invalid);

        let dir = self.direction.load();
        let node_id = self.node_id.load();
        let gated = (dir == direction::TX || dir == direction::RX)
            && guard.config_valid()
            && self.data_length.load() > 0;

        let mut ids = [0u16; 2];
        let mut success = 0;
        if gated {
            for (i, id_slot) in ids.iter_mut().enumerate() {
                let cob = self.cob_id[i].load();
                if cob & 0xBFFF_F800 == 0 {
                    let mut id = (cob & 0x7FF) as u16;
                    if id == self.default_cob_id[i].load() && node_id <= 64 {
                        id += 2 * node_id as u16;
                    }
                    if (0x101..=0x180).contains(&id) && (id & 1) != i as u16 {
                        *id_slot = id;
                        success += 1;
                    }
                }
            }
        }

        if success == 2 {
            self.assigned_id[0].store(ids[0]);
            self.assigned_id[1].store(ids[1]);
            self.toggle.store(false);

            if dir == direction::TX {
                // Node-indexed start stagger so a shared bus doesn't pulse
                // at once; clamped at the refresh period
                let refresh_us = self.refresh_time_or_sct.load() as u32 * 1000;
                self.timer_us.store((500 * node_id as u32).min(refresh_us));

                let dlc = self.data_length.load();
                let mut ok = true;
                for i in 0..2 {
                    ok &= tx
                        .init(self.tx_index[i].load(), ids[i], false, dlc, false)
                        .is_ok();
                }
                if ok {
                    self.valid.store(SrdoValid::Tx);
                } else {
                    em.raise(ErrorKind::GenericSoftware, self.slot() as u32);
                }
            } else {
                self.timer_us
                    .store(self.refresh_time_or_sct.load() as u32 * 1000);
                self.valid.store(SrdoValid::Rx);
            }
            debug!(
                "SRDO {}: configured {} with ids {:x}/{:x}",
                self.slot(),
                if dir == direction::TX { "TX" } else { "RX" },
                ids[0],
                ids[1]
            );
        } else {
            self.assigned_id[0].store(0);
            self.assigned_id[1].store(0);
            self.rx[0].new_flag.store(false);
            self.rx[1].new_flag.store(false);
        }
    }

    /// Assemble the payload of one frame from the mapped OD values
    fn read_frame_payload(&self, parity: usize, buf: &mut [u8; 8]) {
        let mut offset = 0;
        for cell in &self.resolved[parity] {
            let resolved = match cell.load() {
                Some(r) => r,
                None => break,
            };
            match resolved {
                ResolvedMap::Object { entry, sub, len } => {
                    entry
                        .data
                        .read(sub, 0, &mut buf[offset..offset + len as usize])
                        .ok();
                    offset += len as usize;
                }
                ResolvedMap::Dummy { len } => {
                    buf[offset..offset + len as usize].fill(0);
                    offset += len as usize;
                }
            }
        }
    }

    /// Write a validated received payload through the mappings into the OD
    ///
    /// The inverted half is written only for entries mapping a distinct OD
    /// location; dummy entries discard their bytes.
    fn commit_rx_payload(&self, normal: &[u8], inverted: &[u8]) {
        let dual_entries = self.dual_entries.load();
        for (parity, data) in [normal, inverted].into_iter().enumerate() {
            let mut offset = 0;
            for (k, cell) in self.resolved[parity].iter().enumerate() {
                let resolved = match cell.load() {
                    Some(r) => r,
                    None => break,
                };
                let len = resolved.len();
                if let ResolvedMap::Object { entry, sub, .. } = resolved {
                    let skip = parity == 1 && (dual_entries & (1 << k)) != 0;
                    if !skip {
                        entry.data.write(sub, &data[offset..offset + len]).ok();
                    }
                }
                offset += len;
            }
        }
    }

    fn enter_safe_state(&self) {
        warn!("SRDO {}: entering safe state", self.slot());
        if let Some(cb) = self.safe_state_cb.load() {
            cb(self.slot());
        }
    }

    /// Run one tick of the SRDO engine
    ///
    /// `commands` comes from [`SrdoGuard::process`] for this tick; `od` must
    /// be the dictionary the mapping record refers to. Returns true when a
    /// validated receive pair was committed to the object dictionary.
    pub fn process(
        &self,
        commands: GuardCommands,
        state: NmtState,
        guard: &SrdoGuard,
        dt_us: u32,
        od: &'static [ODEntry<'static>],
        tx: &dyn TxBufferAccess,
        em: &Emergency,
    ) -> bool {
        if commands.validate_checksum {
            let crc = self.calc_crc();
            if crc != self.checksum.load() {
                warn!(
                    "SRDO {}: signature mismatch (stored {:04x}, computed {:04x})",
                    self.slot(),
                    self.checksum.load(),
                    crc
                );
                guard.invalidate();
            }
        }

        if commands.entered_operational && guard.config_valid() {
            match self.config_map(od, em) {
                Ok(()) => self.config_com(guard, tx, em),
                Err(_) => self.valid.store(SrdoValid::Invalid),
            }
        }

        let valid = self.valid.load();
        if valid == SrdoValid::Invalid || state != NmtState::Operational {
            // Leaving Operational deactivates the SRDO until the next
            // Operational edge reconfigures it
            self.valid.store(SrdoValid::Invalid);
            self.rx[0].new_flag.store(false);
            self.rx[1].new_flag.store(false);
            return false;
        }

        let timer = self.timer_us.load().saturating_sub(dt_us);
        self.timer_us.store(timer);

        match valid {
            SrdoValid::Tx => {
                self.process_tx(timer, tx, em);
                false
            }
            SrdoValid::Rx => self.process_rx(timer),
            SrdoValid::Invalid => false,
        }
    }

    fn process_tx(&self, timer: u32, tx: &dyn TxBufferAccess, em: &Emergency) {
        if timer != 0 {
            return;
        }

        if self.toggle.load() {
            // The inverted frame was prepared together with the normal one
            if tx.send(self.tx_index[1].load()).is_err() {
                em.raise(ErrorKind::CanTxOverflow, self.assigned_id[1].load() as u32);
            }
            self.timer_us.store(
                (self.refresh_time_or_sct.load() as u32 * 1000)
                    .saturating_sub(SRDO_MINIMUM_DELAY_US),
            );
            self.toggle.store(false);
        } else {
            let len = self.data_length.load() as usize;
            let dual_bytes = self.dual_bytes.load();
            let mut normal = [0u8; 8];
            let mut inverted = [0u8; 8];
            self.read_frame_payload(0, &mut normal);
            self.read_frame_payload(1, &mut inverted);

            // Where both frames map separate objects the application must
            // have kept them complementary
            let mut data_ok = true;
            if self.check_tx_consistency.load() {
                for j in 0..len {
                    if dual_bytes & (1 << j) == 0 && inverted[j] != !normal[j] {
                        data_ok = false;
                        break;
                    }
                }
            }

            if data_ok {
                for j in 0..len {
                    if dual_bytes & (1 << j) != 0 {
                        inverted[j] = !normal[j];
                    }
                }
                tx.store_data(self.tx_index[0].load(), &normal[..len]).ok();
                tx.store_data(self.tx_index[1].load(), &inverted[..len]).ok();
                if tx.send(self.tx_index[0].load()).is_err() {
                    em.raise(ErrorKind::CanTxOverflow, self.assigned_id[0].load() as u32);
                }
                self.timer_us.store(SRDO_MINIMUM_DELAY_US);
                self.toggle.store(true);
            } else {
                // Timer stays at zero, so the whole computation is retried
                // on the next cycle instead of transmitting the stale
                // inverted half
                self.enter_safe_state();
            }
        }
    }

    fn process_rx(&self, timer: u32) -> bool {
        let mut committed = false;
        let expected = self.toggle.load() as usize;
        if self.rx[expected].new_flag.load() {
            if expected == 1 {
                // Both halves present: every byte of the inverted frame must
                // be the complement of the normal frame
                let len = self.data_length.load() as usize;
                let normal = self.rx[0].load();
                let inverted = self.rx[1].load();

                let data_ok = (0..len).all(|j| inverted[j] == !normal[j]);
                if data_ok {
                    self.commit_rx_payload(&normal[..len], &inverted[..len]);
                    committed = true;
                } else {
                    self.enter_safe_state();
                }
                self.rx[0].new_flag.store(false);
                self.rx[1].new_flag.store(false);
                self.timer_us
                    .store(self.refresh_time_or_sct.load() as u32 * 1000);
            } else {
                // Normal frame received; the inverted half must follow
                // within the sub-cycle validation time
                self.timer_us.store(self.srvt.load() as u32 * 1000);
            }
            self.toggle.store(expected == 0);
        } else if timer == 0 {
            // Half of the pair is missing; never propagate to the OD
            self.toggle.store(false);
            self.timer_us.store(self.srvt.load() as u32 * 1000);
            self.rx[0].new_flag.store(false);
            self.rx[1].new_flag.store(false);
            self.enter_safe_state();
        }
        committed
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use crate::can::TxBufferSet;
    use crate::object_dict::{ProvidesSubObjects, ScalarField, SubObjectAccess};
    use sentrycan_common::objects::{ObjectCode, PdoMapping, SubInfo};

    struct MappableVar {
        value: ScalarField<u16>,
    }

    impl ProvidesSubObjects for MappableVar {
        fn get_sub_object(&self, sub: u8) -> Option<(SubInfo, &dyn SubObjectAccess)> {
            match sub {
                1 => Some((
                    SubInfo::new_u16().rw_access().mappable(PdoMapping::Both),
                    &self.value,
                )),
                _ => None,
            }
        }

        fn object_code(&self) -> ObjectCode {
            ObjectCode::Record
        }
    }

    fn leak<T>(value: T) -> &'static T {
        std::boxed::Box::leak(std::boxed::Box::new(value))
    }

    fn test_od() -> &'static [ODEntry<'static>] {
        let var = leak(MappableVar {
            value: ScalarField::<u16>::new(0x1234),
        });
        leak([ODEntry {
            index: 0x2000,
            data: var,
        }])
    }

    fn map_descriptor(index: u16, sub: u8, bits: u8) -> u32 {
        ((index as u32) << 16) | ((sub as u32) << 8) | bits as u32
    }

    #[test]
    fn test_guard_edge_detection() {
        let guard = SrdoGuard::new();
        guard.set_valid_flag(SRDO_VALID_MAGIC);
        guard.reset();

        // First tick in pre-operational consumes the CRC latch
        let commands = guard.process(NmtState::PreOperational);
        assert!(commands.validate_checksum);

        // Entering operational is reported once
        let commands = guard.process(NmtState::Operational);
        assert!(commands.entered_operational);
        assert!(!commands.validate_checksum);
        let commands = guard.process(NmtState::Operational);
        assert_eq!(GuardCommands::default(), commands);
    }

    #[test]
    fn test_guard_invalidate_blocks() {
        let guard = SrdoGuard::new();
        guard.set_valid_flag(SRDO_VALID_MAGIC);
        guard.reset();
        assert!(guard.config_valid());
        guard.invalidate();
        assert!(!guard.config_valid());
        // The stored flag is unchanged; a reset re-arms the check
        assert_eq!(SRDO_VALID_MAGIC, guard.valid_flag());
    }

    fn configured_tx_srdo() -> (&'static Srdo, &'static SrdoGuard) {
        let srdo = leak(Srdo::new());
        let guard = leak(SrdoGuard::new());
        guard.set_valid_flag(SRDO_VALID_MAGIC);
        guard.reset();

        srdo.reset(0, 5, 0, 1);
        srdo.set_direction_raw(direction::TX);
        srdo.set_refresh_time(100);
        srdo.set_srvt(20);
        srdo.set_cob_id_raw(0, 0x101);
        srdo.set_cob_id_raw(1, 0x102);
        srdo.set_num_mapped(2);
        srdo.set_map_raw(0, map_descriptor(0x2000, 1, 16));
        srdo.set_map_raw(1, map_descriptor(0x2000, 1, 16));
        srdo.set_checksum(srdo.calc_crc());
        (srdo, guard)
    }

    #[test]
    fn test_config_map_dual_use() {
        let od = test_od();
        let em = leak(Emergency::new());
        let (srdo, _) = configured_tx_srdo();

        srdo.config_map(od, em).unwrap();
        assert_eq!(2, srdo.data_length());
        assert_eq!(0b11, srdo.dual_bytes.load());
        assert_eq!(0b1, srdo.dual_entries.load());
    }

    #[test]
    fn test_config_map_length_mismatch_rejected() {
        let od = test_od();
        let em = leak(Emergency::new());
        let (srdo, _) = configured_tx_srdo();

        // 8-bit normal vs 16-bit inverted
        srdo.set_map_raw(0, map_descriptor(0x2000, 1, 8));
        srdo.set_map_raw(1, map_descriptor(0x2000, 1, 16));
        assert!(srdo.config_map(od, em).is_err());
        assert_eq!(0, srdo.data_length());
        assert!(em.is_raised(ErrorKind::PdoWrongMapping));
    }

    #[test]
    fn test_config_map_dummy_padding() {
        let od = test_od();
        let em = leak(Emergency::new());
        let (srdo, _) = configured_tx_srdo();

        // Map the variable normally, pad the inverted side with a 2-byte
        // dummy (index 3)
        srdo.set_map_raw(0, map_descriptor(0x2000, 1, 16));
        srdo.set_map_raw(1, map_descriptor(0x0003, 0, 16));
        srdo.config_map(od, em).unwrap();
        assert_eq!(2, srdo.data_length());
        assert_eq!(0, srdo.dual_bytes.load());
    }

    #[test]
    fn test_config_map_rejects_non_byte_width() {
        let od = test_od();
        let em = leak(Emergency::new());
        let (srdo, _) = configured_tx_srdo();
        srdo.set_map_raw(0, map_descriptor(0x2000, 1, 12));
        assert_eq!(Err(AbortCode::UnallowedPdo), srdo.config_map(od, em));
    }

    #[test]
    fn test_config_com_cob_validation() {
        let od = test_od();
        let em = leak(Emergency::new());
        let tx = leak(TxBufferSet::<4>::new());
        let (srdo, guard) = configured_tx_srdo();
        srdo.config_map(od, em).unwrap();

        // Parity swapped: normal id must be odd
        srdo.set_cob_id_raw(0, 0x102);
        srdo.set_cob_id_raw(1, 0x101);
        srdo.config_com(guard, tx, em);
        assert_eq!(SrdoValid::Invalid, srdo.valid());

        // Out of range
        srdo.set_cob_id_raw(0, 0x1F1);
        srdo.set_cob_id_raw(1, 0x1F2);
        srdo.config_com(guard, tx, em);
        assert_eq!(SrdoValid::Invalid, srdo.valid());

        // Valid pair
        srdo.set_cob_id_raw(0, 0x101);
        srdo.set_cob_id_raw(1, 0x102);
        srdo.config_com(guard, tx, em);
        assert_eq!(SrdoValid::Tx, srdo.valid());
        // Transmit start is staggered by the node id
        assert_eq!(2500, srdo.timer_us.load());
    }

    #[test]
    fn test_config_com_applies_default_offset() {
        let od = test_od();
        let em = leak(Emergency::new());
        let tx = leak(TxBufferSet::<4>::new());
        let (srdo, guard) = configured_tx_srdo();
        srdo.config_map(od, em).unwrap();

        // Writing the default seed activates the node-indexed pair
        srdo.set_cob_id_raw(0, SRDO_DEFAULT_COB_BASE as u32);
        srdo.set_cob_id_raw(1, SRDO_DEFAULT_COB_BASE as u32 + 1);
        srdo.config_com(guard, tx, em);
        assert_eq!(SrdoValid::Tx, srdo.valid());
        // node 5: 0xFF + 10 = 0x109 / 0x100 + 10 = 0x10A
        assert_eq!(0x109, srdo.assigned_id[0].load());
        assert_eq!(0x10A, srdo.assigned_id[1].load());
    }

    #[test]
    fn test_config_com_requires_guard() {
        let od = test_od();
        let em = leak(Emergency::new());
        let tx = leak(TxBufferSet::<4>::new());
        let (srdo, guard) = configured_tx_srdo();
        srdo.config_map(od, em).unwrap();

        guard.invalidate();
        srdo.config_com(guard, tx, em);
        assert_eq!(SrdoValid::Invalid, srdo.valid());
    }

    #[test]
    fn test_crc_covers_all_fields() {
        let od = test_od();
        let (srdo, _) = configured_tx_srdo();
        let base = srdo.calc_crc();

        srdo.set_srvt(21);
        assert_ne!(base, srdo.calc_crc());
        srdo.set_srvt(20);
        assert_eq!(base, srdo.calc_crc());

        srdo.set_map_raw(1, map_descriptor(0x2000, 1, 8));
        assert_ne!(base, srdo.calc_crc());
    }
}
