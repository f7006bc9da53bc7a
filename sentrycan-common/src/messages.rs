//! Message definitions for the standard CANopen services

use snafu::Snafu;

/// An 11-bit or 29-bit CAN identifier
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CanId {
    /// An extended 29-bit identifier
    Extended(u32),
    /// A standard 11-bit identifier
    Std(u16),
}

impl CanId {
    /// Create a new extended ID
    pub const fn extended(id: u32) -> CanId {
        CanId::Extended(id)
    }

    /// Create a new standard ID
    pub const fn std(id: u16) -> CanId {
        CanId::Std(id)
    }

    /// Get the raw ID as a u32
    pub fn raw(&self) -> u32 {
        match self {
            CanId::Extended(id) => *id,
            CanId::Std(id) => *id as u32,
        }
    }

    /// Returns true if this ID is an extended ID
    pub fn is_extended(&self) -> bool {
        matches!(self, CanId::Extended(_))
    }
}

const MAX_DATA_LENGTH: usize = 8;

/// A classic CAN 2.0 frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CanMessage {
    /// The data payload of the message
    ///
    /// Note, some bytes may be unused. Check dlc.
    pub data: [u8; MAX_DATA_LENGTH],
    /// The length of the data payload
    pub dlc: u8,
    /// Indicates this message is a remote transmission request
    pub rtr: bool,
    /// The id of this message
    pub id: CanId,
}

impl Default for CanMessage {
    fn default() -> Self {
        Self {
            data: [0; MAX_DATA_LENGTH],
            dlc: 0,
            id: CanId::Std(0),
            rtr: false,
        }
    }
}

impl CanMessage {
    /// Create a new CAN message
    ///
    /// Panics if `data` is longer than 8 bytes.
    pub fn new(id: CanId, data: &[u8]) -> Self {
        let dlc = data.len() as u8;
        assert!(
            data.len() <= MAX_DATA_LENGTH,
            "Data length exceeds maximum size of {} bytes",
            MAX_DATA_LENGTH
        );
        let mut buf = [0u8; MAX_DATA_LENGTH];
        buf[0..dlc as usize].copy_from_slice(data);

        Self {
            id,
            dlc,
            data: buf,
            rtr: false,
        }
    }

    /// Create a new RTR message
    ///
    /// RTR messages have no data payload
    pub fn new_rtr(id: CanId) -> Self {
        Self {
            id,
            rtr: true,
            ..Default::default()
        }
    }

    /// Get the id of the message
    pub fn id(&self) -> CanId {
        self.id
    }

    /// Get a slice containing the data payload
    pub fn data(&self) -> &[u8] {
        &self.data[0..self.dlc as usize]
    }

    /// Returns true if this message is a remote transmission request
    pub fn is_rtr(&self) -> bool {
        self.rtr
    }
}

/// The COB ID used for sending NMT commands
pub const NMT_CMD_ID: CanId = CanId::Std(0);
/// The COB ID used for sending SYNC objects
pub const SYNC_ID: CanId = CanId::Std(0x80);
/// The COB ID used for TIME objects
pub const TIME_ID: CanId = CanId::Std(0x100);
/// The COB ID used for LSS slave responses
pub const LSS_RESP_ID: CanId = CanId::Std(0x7E4);
/// The COB ID used for LSS master requests
pub const LSS_REQ_ID: CanId = CanId::Std(0x7E5);
/// The base COB ID for heartbeat messages (producer node ID is added)
pub const HEARTBEAT_BASE: u16 = 0x700;
/// The base COB ID for EMCY messages (producer node ID is added)
pub const EMCY_BASE: u16 = 0x80;
/// The base COB ID for SDO requests (server node ID is added)
pub const SDO_REQ_BASE: u16 = 0x600;
/// The base COB ID for SDO responses (server node ID is added)
pub const SDO_RESP_BASE: u16 = 0x580;

/// The NMT state transition command specifier
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum NmtCommandSpecifier {
    /// Device should transition to the Operational state
    Start = 1,
    /// Device should transition to the Stopped state
    Stop = 2,
    /// Device should transition to the PreOperational state
    EnterPreOp = 128,
    /// Device should perform an application reset
    ResetApp = 129,
    /// Device should perform a communications reset
    ResetComm = 130,
}

impl NmtCommandSpecifier {
    /// Create an NmtCommandSpecifier from the byte value in the message
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            1 => Ok(Self::Start),
            2 => Ok(Self::Stop),
            128 => Ok(Self::EnterPreOp),
            129 => Ok(Self::ResetApp),
            130 => Ok(Self::ResetComm),
            _ => Err(MessageError::InvalidField),
        }
    }
}

/// An NMT command message
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NmtCommand {
    /// The type of command
    pub cs: NmtCommandSpecifier,
    /// The node it applies to; 0 indicates a broadcast to all nodes
    pub node: u8,
}

impl TryFrom<CanMessage> for NmtCommand {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let payload = msg.data();
        if msg.id() != NMT_CMD_ID {
            Err(MessageError::UnexpectedId {
                cob_id: msg.id(),
                expected: NMT_CMD_ID,
            })
        } else if payload.len() >= 2 {
            let cs = NmtCommandSpecifier::from_byte(payload[0])?;
            Ok(NmtCommand {
                cs,
                node: payload[1],
            })
        } else {
            Err(MessageError::MessageTooShort)
        }
    }
}

impl From<NmtCommand> for CanMessage {
    fn from(cmd: NmtCommand) -> Self {
        let mut msg = CanMessage {
            id: NMT_CMD_ID,
            dlc: 2,
            ..Default::default()
        };
        msg.data[0] = cmd.cs as u8;
        msg.data[1] = cmd.node;
        msg
    }
}

/// Possible NMT states of a node
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum NmtState {
    /// Initial state; nodes leave it automatically at the end of the
    /// communication reset, announcing the transition with a boot-up frame
    Bootup = 0,
    /// Node has been stopped
    Stopped = 4,
    /// Normal operating state
    Operational = 5,
    /// Node is awaiting the command to enter operation
    PreOperational = 127,
}

impl core::fmt::Display for NmtState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NmtState::Bootup => write!(f, "Bootup"),
            NmtState::Stopped => write!(f, "Stopped"),
            NmtState::Operational => write!(f, "Operational"),
            NmtState::PreOperational => write!(f, "PreOperational"),
        }
    }
}

/// An error for [`NmtState::try_from()`]
#[derive(Clone, Copy, Debug)]
pub struct InvalidNmtStateError(pub u8);

impl TryFrom<u8> for NmtState {
    type Error = InvalidNmtStateError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use NmtState::*;
        match value {
            x if x == Bootup as u8 => Ok(Bootup),
            x if x == Stopped as u8 => Ok(Stopped),
            x if x == Operational as u8 => Ok(Operational),
            x if x == PreOperational as u8 => Ok(PreOperational),
            _ => Err(InvalidNmtStateError(value)),
        }
    }
}

/// A heartbeat message
///
/// Also used as a node guarding response, where the toggle bit alternates.
/// Heartbeat producers always send it with toggle = false.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Heartbeat {
    /// The ID of the node transmitting the heartbeat
    pub node: u8,
    /// The node guarding toggle bit
    pub toggle: bool,
    /// The current NMT state of the node
    pub state: NmtState,
}

impl From<Heartbeat> for CanMessage {
    fn from(value: Heartbeat) -> Self {
        let mut msg = CanMessage {
            id: CanId::Std(HEARTBEAT_BASE | value.node as u16),
            dlc: 1,
            ..Default::default()
        };
        msg.data[0] = value.state as u8;
        if value.toggle {
            msg.data[0] |= 1 << 7;
        }
        msg
    }
}

impl TryFrom<CanMessage> for Heartbeat {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let cob_id = msg.id();
        if cob_id.raw() & !0x7F != HEARTBEAT_BASE as u32 || cob_id.is_extended() {
            return Err(MessageError::UnrecognizedId { cob_id });
        }
        if msg.data().is_empty() {
            return Err(MessageError::MessageTooShort);
        }
        let node = (cob_id.raw() & 0x7F) as u8;
        let toggle = (msg.data[0] & (1 << 7)) != 0;
        let state: NmtState = (msg.data[0] & 0x7F)
            .try_into()
            .map_err(|e: InvalidNmtStateError| MessageError::InvalidNmtState { value: e.0 })?;
        Ok(Heartbeat {
            node,
            toggle,
            state,
        })
    }
}

/// A SYNC object
///
/// A single node serves as the SYNC producer. The optional one byte counter
/// starts at 1 and increments up to the configured overflow value, then wraps
/// back to 1.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SyncObject {
    /// The counter value, if the producer sends one
    pub count: Option<u8>,
}

impl SyncObject {
    /// Create a new SyncObject
    pub fn new(count: Option<u8>) -> Self {
        Self { count }
    }
}

impl From<SyncObject> for CanMessage {
    fn from(value: SyncObject) -> Self {
        match value.count {
            Some(count) => CanMessage::new(SYNC_ID, &[count]),
            None => CanMessage::new(SYNC_ID, &[]),
        }
    }
}

impl TryFrom<CanMessage> for SyncObject {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        if msg.id() != SYNC_ID {
            return Err(MessageError::UnexpectedId {
                cob_id: msg.id(),
                expected: SYNC_ID,
            });
        }
        Ok(Self {
            count: msg.data().first().copied(),
        })
    }
}

/// A TIME object carrying a time-of-day value
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimeOfDay {
    /// Milliseconds since midnight (28 bits used)
    pub millis: u32,
    /// Days since January 1, 1984
    pub days: u16,
}

impl From<TimeOfDay> for CanMessage {
    fn from(value: TimeOfDay) -> Self {
        let mut data = [0u8; 6];
        data[0..4].copy_from_slice(&(value.millis & 0x0FFF_FFFF).to_le_bytes());
        data[4..6].copy_from_slice(&value.days.to_le_bytes());
        CanMessage::new(TIME_ID, &data)
    }
}

impl TryFrom<CanMessage> for TimeOfDay {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        if msg.id() != TIME_ID {
            return Err(MessageError::UnexpectedId {
                cob_id: msg.id(),
                expected: TIME_ID,
            });
        }
        let data = msg.data();
        if data.len() < 6 {
            return Err(MessageError::MessageTooShort);
        }
        Ok(TimeOfDay {
            millis: u32::from_le_bytes(data[0..4].try_into().unwrap()) & 0x0FFF_FFFF,
            days: u16::from_le_bytes(data[4..6].try_into().unwrap()),
        })
    }
}

/// An emergency (EMCY) message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EmcyMessage {
    /// The CiA 301 emergency error code
    pub code: u16,
    /// The current value of the error register (object 0x1001)
    pub register: u8,
    /// Manufacturer specific detail value
    pub detail: u32,
}

impl EmcyMessage {
    /// Build the CAN message for this EMCY, for the given producer node
    pub fn to_can_message(&self, node: u8) -> CanMessage {
        let mut data = [0u8; 8];
        data[0..2].copy_from_slice(&self.code.to_le_bytes());
        data[2] = self.register;
        data[3..7].copy_from_slice(&self.detail.to_le_bytes());
        CanMessage::new(CanId::Std(EMCY_BASE + node as u16), &data)
    }
}

impl TryFrom<CanMessage> for EmcyMessage {
    type Error = MessageError;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        let data = msg.data();
        if data.len() < 8 {
            return Err(MessageError::MessageTooShort);
        }
        Ok(EmcyMessage {
            code: u16::from_le_bytes(data[0..2].try_into().unwrap()),
            register: data[2],
            detail: u32::from_le_bytes(data[3..7].try_into().unwrap()),
        })
    }
}

/// An error for problems converting CanMessages to typed messages
#[derive(Debug, Clone, Copy, PartialEq, Snafu)]
pub enum MessageError {
    /// Not enough bytes were present in the message
    MessageTooShort,
    /// The message was malformed in some way
    MalformedMsg {
        /// The COB ID of the malformed message
        cob_id: CanId,
    },
    /// The message ID was not the expected value
    #[snafu(display("Unexpected message ID found: {cob_id:?}, expected: {expected:?}"))]
    UnexpectedId {
        /// Received ID
        cob_id: CanId,
        /// Expected ID
        expected: CanId,
    },
    /// A field in the message contained an unallowed value for that field
    InvalidField,
    /// The COB ID of the message does not correspond to a known service
    UnrecognizedId {
        /// The unrecognized COB
        cob_id: CanId,
    },
    /// The NMT state integer in the message is not a valid NMT state
    InvalidNmtState {
        /// The invalid byte
        value: u8,
    },
    /// An invalid LSS command specifier was found in the message
    #[snafu(display("Unexpected LSS command: {value}"))]
    UnexpectedLssCommand {
        /// The invalid byte
        value: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nmt_command_round_trip() {
        let cmd = NmtCommand {
            cs: NmtCommandSpecifier::Start,
            node: 5,
        };
        let msg: CanMessage = cmd.into();
        assert_eq!(msg.id(), NMT_CMD_ID);
        assert_eq!(msg.data(), &[1, 5]);
        let parsed = NmtCommand::try_from(msg).unwrap();
        assert_eq!(parsed.cs, NmtCommandSpecifier::Start);
        assert_eq!(parsed.node, 5);
    }

    #[test]
    fn test_heartbeat_parse() {
        let msg = CanMessage::new(CanId::Std(0x720), &[0x05]);
        let hb = Heartbeat::try_from(msg).unwrap();
        assert_eq!(hb.node, 0x20);
        assert_eq!(hb.state, NmtState::Operational);
        assert!(!hb.toggle);

        // Node guard response with toggle set
        let msg = CanMessage::new(CanId::Std(0x705), &[0x85]);
        let hb = Heartbeat::try_from(msg).unwrap();
        assert!(hb.toggle);
        assert_eq!(hb.state, NmtState::Operational);
    }

    #[test]
    fn test_heartbeat_rejects_bad_state() {
        let msg = CanMessage::new(CanId::Std(0x705), &[0x33]);
        assert_eq!(
            Heartbeat::try_from(msg),
            Err(MessageError::InvalidNmtState { value: 0x33 })
        );
    }

    #[test]
    fn test_time_of_day_round_trip() {
        let time = TimeOfDay {
            millis: 0x0ABCDEF0 & 0x0FFF_FFFF,
            days: 15000,
        };
        let msg: CanMessage = time.into();
        assert_eq!(msg.dlc, 6);
        assert_eq!(TimeOfDay::try_from(msg).unwrap(), time);
    }

    #[test]
    fn test_emcy_layout() {
        let emcy = EmcyMessage {
            code: 0x8130,
            register: 0x11,
            detail: 1,
        };
        let msg = emcy.to_can_message(9);
        assert_eq!(msg.id(), CanId::Std(0x89));
        assert_eq!(msg.data(), &[0x30, 0x81, 0x11, 1, 0, 0, 0, 0]);
        assert_eq!(EmcyMessage::try_from(msg).unwrap(), emcy);
    }
}
