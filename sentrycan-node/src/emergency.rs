//! Emergency (EMCY) producer
//!
//! Collects error conditions raised by the other services, maintains the
//! error register (object 0x1001) and the pre-defined error field history
//! (object 0x1003), and emits EMCY frames. Each error kind is latched: a
//! raise while already raised does nothing, and a reset emits a no-error
//! EMCY once.

use core::cell::RefCell;

use critical_section::Mutex;
use heapless::Deque;
use sentrycan_common::{
    messages::{CanMessage, EmcyMessage},
    objects::{ObjectCode, SubInfo},
    sdo::AbortCode,
    AtomicCell,
};

use crate::object_dict::ObjectAccess;

/// CiA 301 emergency error codes
pub mod error_codes {
    /// Error reset or no error
    pub const NO_ERROR: u16 = 0x0000;
    /// Generic error
    pub const GENERIC: u16 = 0x1000;
    /// Internal software error
    pub const SOFTWARE_INTERNAL: u16 = 0x6100;
    /// Communication error
    pub const COMMUNICATION: u16 = 0x8100;
    /// CAN overrun (objects lost)
    pub const CAN_OVERRUN: u16 = 0x8110;
    /// CAN in error passive mode
    pub const CAN_PASSIVE: u16 = 0x8120;
    /// Life guard or heartbeat error
    pub const HEARTBEAT: u16 = 0x8130;
    /// CAN bus off
    pub const BUS_OFF: u16 = 0x8140;
    /// Protocol error (e.g. a bad PDO/SRDO mapping)
    pub const PROTOCOL_ERROR: u16 = 0x8200;
    /// PDO not processed due to length error
    pub const PDO_LENGTH: u16 = 0x8210;
}

/// The error conditions tracked by the Emergency module
///
/// Each kind is one latched status bit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    /// CAN controller reached the warning limit
    CanBusWarning = 0,
    /// CAN controller is error passive
    CanBusPassive,
    /// CAN controller is bus off
    CanTxBusOff,
    /// A received frame was lost
    CanRxOverflow,
    /// A frame could not be queued for transmission
    CanTxOverflow,
    /// A received PDO was shorter than its mapping
    RpdoLength,
    /// A PDO or SRDO mapping could not be resolved
    PdoWrongMapping,
    /// A synchronous TPDO was dropped because the SYNC window elapsed
    TpdoOutsideWindow,
    /// A monitored heartbeat producer timed out
    HeartbeatConsumer,
    /// A monitored heartbeat producer rebooted
    HeartbeatRemoteReset,
    /// Generic software error
    GenericSoftware,
}

impl ErrorKind {
    /// The EMCY error code reported for this kind
    pub fn code(&self) -> u16 {
        use error_codes::*;
        match self {
            ErrorKind::CanBusWarning => COMMUNICATION,
            ErrorKind::CanBusPassive => CAN_PASSIVE,
            ErrorKind::CanTxBusOff => BUS_OFF,
            ErrorKind::CanRxOverflow => CAN_OVERRUN,
            ErrorKind::CanTxOverflow => CAN_OVERRUN,
            ErrorKind::RpdoLength => PDO_LENGTH,
            ErrorKind::PdoWrongMapping => PROTOCOL_ERROR,
            ErrorKind::TpdoOutsideWindow => COMMUNICATION,
            ErrorKind::HeartbeatConsumer => HEARTBEAT,
            ErrorKind::HeartbeatRemoteReset => HEARTBEAT,
            ErrorKind::GenericSoftware => SOFTWARE_INTERNAL,
        }
    }

    fn is_communication(&self) -> bool {
        !matches!(self, ErrorKind::GenericSoftware)
    }

    fn mask(&self) -> u32 {
        1 << (*self as u32)
    }
}

const HISTORY_DEPTH: usize = 8;
const PENDING_DEPTH: usize = 8;

/// The EMCY producer
///
/// Shared between all services; raises are queued and drained to the bus by
/// [`Emergency::process`].
#[allow(missing_debug_implementations)]
pub struct Emergency {
    status_bits: AtomicCell<u32>,
    pending: Mutex<RefCell<Deque<EmcyMessage, PENDING_DEPTH>>>,
    history: Mutex<RefCell<Deque<u32, HISTORY_DEPTH>>>,
}

impl Default for Emergency {
    fn default() -> Self {
        Self::new()
    }
}

impl Emergency {
    /// Create a new Emergency producer with no errors latched
    pub const fn new() -> Self {
        Self {
            status_bits: AtomicCell::new(0),
            pending: Mutex::new(RefCell::new(Deque::new())),
            history: Mutex::new(RefCell::new(Deque::new())),
        }
    }

    /// Raise an error condition
    ///
    /// If the condition is already raised, nothing happens. Otherwise an
    /// EMCY frame with `detail` in the manufacturer field is queued and the
    /// condition is recorded in the history.
    pub fn raise(&self, kind: ErrorKind, detail: u32) {
        let newly_set = self
            .status_bits
            .fetch_update(|bits| {
                if bits & kind.mask() == 0 {
                    Some(bits | kind.mask())
                } else {
                    None
                }
            })
            .is_ok();
        if !newly_set {
            return;
        }

        let msg = EmcyMessage {
            code: kind.code(),
            register: self.error_register(),
            detail,
        };
        critical_section::with(|cs| {
            let mut pending = self.pending.borrow_ref_mut(cs);
            if pending.is_full() {
                pending.pop_front();
            }
            pending.push_back(msg).ok();

            let mut history = self.history.borrow_ref_mut(cs);
            if history.is_full() {
                history.pop_back();
            }
            history
                .push_front((kind.code() as u32) | (detail << 16))
                .ok();
        });
    }

    /// Reset an error condition
    ///
    /// If the condition is raised, it is cleared and a no-error EMCY frame
    /// is queued.
    pub fn reset(&self, kind: ErrorKind, detail: u32) {
        let newly_cleared = self
            .status_bits
            .fetch_update(|bits| {
                if bits & kind.mask() != 0 {
                    Some(bits & !kind.mask())
                } else {
                    None
                }
            })
            .is_ok();
        if !newly_cleared {
            return;
        }

        let msg = EmcyMessage {
            code: error_codes::NO_ERROR,
            register: self.error_register(),
            detail,
        };
        critical_section::with(|cs| {
            let mut pending = self.pending.borrow_ref_mut(cs);
            if pending.is_full() {
                pending.pop_front();
            }
            pending.push_back(msg).ok();
        });
    }

    /// Returns true if the condition is currently raised
    pub fn is_raised(&self, kind: ErrorKind) -> bool {
        self.status_bits.load() & kind.mask() != 0
    }

    /// The current value of the error register (object 0x1001)
    pub fn error_register(&self) -> u8 {
        let bits = self.status_bits.load();
        if bits == 0 {
            return 0;
        }
        let mut register = 1; // generic error bit
        for kind in [
            ErrorKind::CanBusWarning,
            ErrorKind::CanBusPassive,
            ErrorKind::CanTxBusOff,
            ErrorKind::CanRxOverflow,
            ErrorKind::CanTxOverflow,
            ErrorKind::RpdoLength,
            ErrorKind::PdoWrongMapping,
            ErrorKind::TpdoOutsideWindow,
            ErrorKind::HeartbeatConsumer,
            ErrorKind::HeartbeatRemoteReset,
        ] {
            if bits & kind.mask() != 0 && kind.is_communication() {
                register |= 1 << 4; // communication error bit
                break;
            }
        }
        register
    }

    /// Drain queued EMCY frames to the bus
    pub fn process(&self, node_id: u8, send: &mut dyn FnMut(CanMessage)) {
        loop {
            let msg = critical_section::with(|cs| self.pending.borrow_ref_mut(cs).pop_front());
            match msg {
                Some(msg) => send(msg.to_can_message(node_id)),
                None => break,
            }
        }
    }

    /// Number of entries in the error history
    pub fn history_len(&self) -> usize {
        critical_section::with(|cs| self.history.borrow_ref(cs).len())
    }

    /// Get a history entry; 0 is the most recent
    pub fn history_get(&self, index: usize) -> Option<u32> {
        critical_section::with(|cs| self.history.borrow_ref(cs).iter().nth(index).copied())
    }

    /// Clear the error history
    pub fn clear_history(&self) {
        critical_section::with(|cs| self.history.borrow_ref_mut(cs).clear());
    }

    /// Drop any queued frames and latched conditions
    pub fn reset_all(&self) {
        self.status_bits.store(0);
        critical_section::with(|cs| {
            self.pending.borrow_ref_mut(cs).clear();
        });
    }
}

/// Implements the error register object (0x1001)
#[allow(missing_debug_implementations)]
pub struct ErrorRegisterObject {
    em: &'static Emergency,
}

impl ErrorRegisterObject {
    /// Create a new object reading from `em`
    pub const fn new(em: &'static Emergency) -> Self {
        Self { em }
    }
}

impl ObjectAccess for ErrorRegisterObject {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        if sub != 0 {
            return Err(AbortCode::NoSuchSubIndex);
        }
        if offset > 0 || buf.is_empty() {
            return Ok(0);
        }
        buf[0] = self.em.error_register();
        Ok(1)
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        self.sub_info(sub).map(|i| i.size)
    }

    fn write(&self, sub: u8, _data: &[u8]) -> Result<(), AbortCode> {
        if sub != 0 {
            return Err(AbortCode::NoSuchSubIndex);
        }
        Err(AbortCode::ReadOnly)
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Var
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        if sub != 0 {
            return Err(AbortCode::NoSuchSubIndex);
        }
        Ok(SubInfo::new_u8())
    }
}

/// Implements the pre-defined error field object (0x1003)
///
/// Sub 0 holds the number of recorded errors and accepts only a write of 0,
/// which clears the history. Subs 1..=8 hold the most recent errors, newest
/// first, as `(code as u32) | (detail << 16)`.
#[allow(missing_debug_implementations)]
pub struct ErrorHistoryObject {
    em: &'static Emergency,
}

impl ErrorHistoryObject {
    /// Create a new object reading from `em`
    pub const fn new(em: &'static Emergency) -> Self {
        Self { em }
    }
}

impl ObjectAccess for ErrorHistoryObject {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        if sub == 0 {
            if offset > 0 || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.em.history_len() as u8;
            Ok(1)
        } else if sub as usize <= HISTORY_DEPTH {
            let value = self
                .em
                .history_get(sub as usize - 1)
                .ok_or(AbortCode::NoData)?;
            Ok(crate::object_dict::read_bytes(
                &value.to_le_bytes(),
                offset,
                buf,
            ))
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        self.sub_info(sub).map(|i| i.size)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        if sub == 0 {
            if data.len() != 1 {
                return Err(AbortCode::DataTypeMismatch);
            }
            if data[0] != 0 {
                return Err(AbortCode::InvalidValue);
            }
            self.em.clear_history();
            Ok(())
        } else if sub as usize <= HISTORY_DEPTH {
            Err(AbortCode::ReadOnly)
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Array
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        if sub == 0 {
            Ok(SubInfo::new_u8().rw_access())
        } else if sub as usize <= HISTORY_DEPTH {
            Ok(SubInfo::new_u32())
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentrycan_common::messages::CanId;

    #[test]
    fn test_raise_is_latched() {
        let em = Emergency::new();
        em.raise(ErrorKind::HeartbeatConsumer, 1);
        em.raise(ErrorKind::HeartbeatConsumer, 1);
        assert!(em.is_raised(ErrorKind::HeartbeatConsumer));

        let mut sent: heapless::Vec<CanMessage, 4> = heapless::Vec::new();
        em.process(5, &mut |msg| sent.push(msg).unwrap());
        assert_eq!(1, sent.len());
        assert_eq!(CanId::Std(0x85), sent[0].id());
        let emcy = EmcyMessage::try_from(sent[0]).unwrap();
        assert_eq!(0x8130, emcy.code);
        assert_eq!(1, emcy.detail);
        assert_eq!(0x11, emcy.register);
    }

    #[test]
    fn test_reset_sends_no_error() {
        let em = Emergency::new();
        em.raise(ErrorKind::CanBusWarning, 0);
        em.reset(ErrorKind::CanBusWarning, 0);
        // Resetting twice does not queue twice
        em.reset(ErrorKind::CanBusWarning, 0);

        let mut sent: heapless::Vec<CanMessage, 4> = heapless::Vec::new();
        em.process(5, &mut |msg| sent.push(msg).unwrap());
        assert_eq!(2, sent.len());
        let emcy = EmcyMessage::try_from(sent[1]).unwrap();
        assert_eq!(error_codes::NO_ERROR, emcy.code);
        assert_eq!(0, emcy.register);
        assert!(!em.is_raised(ErrorKind::CanBusWarning));
    }

    #[test]
    fn test_history_newest_first() {
        let em = Emergency::new();
        em.raise(ErrorKind::CanBusWarning, 0);
        em.raise(ErrorKind::HeartbeatConsumer, 2);
        assert_eq!(2, em.history_len());
        assert_eq!(
            Some(0x8130 | (2 << 16)),
            em.history_get(0)
        );
        assert_eq!(Some(0x8100), em.history_get(1));
        em.clear_history();
        assert_eq!(0, em.history_len());
    }

    #[test]
    fn test_history_object_access() {
        static EM: Emergency = Emergency::new();
        EM.raise(ErrorKind::RpdoLength, 3);
        let obj = ErrorHistoryObject::new(&EM);
        assert_eq!(1, obj.read_u8(0).unwrap());
        assert_eq!(0x8210 | (3 << 16), obj.read_u32(1).unwrap());
        assert_eq!(Err(AbortCode::InvalidValue), obj.write(0, &[1]));
        obj.write(0, &[0]).unwrap();
        assert_eq!(0, obj.read_u8(0).unwrap());
    }
}
