//! Wire model for the Layer Setting Services (LSS) protocol
//!
//! LSS is used to assign node IDs and bit rates to nodes which have none
//! configured, and to discover the identity of unconfigured nodes. This
//! module holds the command specifiers and the request/response message
//! serialization; the slave state machine lives in the node crate.

use crate::messages::{CanId, CanMessage, MessageError, LSS_REQ_ID, LSS_RESP_ID};

/// Defines all possible values for the LSS command specifier field
#[derive(Debug, Clone, Copy)]
pub enum LssCommandSpecifier {
    /// Change the LSS mode for all nodes on the bus
    SwitchModeGlobal = 0x04,
    /// Set the node ID of the node(s) currently in *Configuring* mode
    ConfigureNodeId = 0x11,
    /// Set the bit timing (baud rate) of the node(s) currently in
    /// *Configuring* mode
    ConfigureBitTiming = 0x13,
    /// Command nodes to activate a new bit rate setting
    ActivateBitTiming = 0x15,
    /// Command nodes to store their config (node ID and bit rate)
    /// persistently
    StoreConfiguration = 0x17,
    /// Sends Vendor ID for activating an LSS node via its identity
    SwitchStateVendor = 0x40,
    /// Sends Product Code for activating an LSS node via its identity
    SwitchStateProduct = 0x41,
    /// Sends Revision Number for activating an LSS node via its identity
    SwitchStateRev = 0x42,
    /// Sends Serial Number for activating an LSS node via its identity
    ///
    /// This command comes last (after vendor, product, rev); a node which
    /// recognizes its own identity responds on receipt of this message.
    SwitchStateSerial = 0x43,
    /// Response by a node to indicate it has recognized its identity and is
    /// entering *Configuring* mode
    SwitchStateResponse = 0x44,
    /// Response to a FastScan message
    IdentifySlave = 0x4F,
    /// Fast scan protocol probe, used to discover unconfigured nodes without
    /// knowing their identity
    FastScan = 0x51,
    /// Inquire the vendor ID of a node in *Configuring* mode
    InquireVendor = 0x5A,
    /// Inquire the product code of a node in *Configuring* mode
    InquireProduct = 0x5B,
    /// Inquire the revision number of a node in *Configuring* mode
    InquireRev = 0x5C,
    /// Inquire the serial number of a node in *Configuring* mode
    InquireSerial = 0x5D,
    /// Inquire the node ID of a node in *Configuring* mode
    InquireNodeId = 0x5E,
}

impl LssCommandSpecifier {
    /// Attempt to create an [`LssCommandSpecifier`] from a byte code
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            0x04 => Ok(Self::SwitchModeGlobal),
            0x11 => Ok(Self::ConfigureNodeId),
            0x13 => Ok(Self::ConfigureBitTiming),
            0x15 => Ok(Self::ActivateBitTiming),
            0x17 => Ok(Self::StoreConfiguration),
            0x40 => Ok(Self::SwitchStateVendor),
            0x41 => Ok(Self::SwitchStateProduct),
            0x42 => Ok(Self::SwitchStateRev),
            0x43 => Ok(Self::SwitchStateSerial),
            0x44 => Ok(Self::SwitchStateResponse),
            0x4F => Ok(Self::IdentifySlave),
            0x51 => Ok(Self::FastScan),
            0x5A => Ok(Self::InquireVendor),
            0x5B => Ok(Self::InquireProduct),
            0x5C => Ok(Self::InquireRev),
            0x5D => Ok(Self::InquireSerial),
            0x5E => Ok(Self::InquireNodeId),
            _ => Err(MessageError::UnexpectedLssCommand { value: b }),
        }
    }
}

/// Error codes for the configure node-id response
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum LssConfigureError {
    /// Success
    Ok = 0,
    /// The value is out of range (node ID outside 1..=127, or an unsupported
    /// bit timing)
    OutOfRange = 1,
    /// A manufacturer specific error is stored in the `spec_error` field
    Manufacturer = 0xFF,
}

/// Error code for a store-configuration response when storage is not
/// supported
pub const LSS_STORE_NOT_SUPPORTED: u8 = 1;
/// Error code for a store-configuration response when storage failed
pub const LSS_STORE_FAILED: u8 = 2;

/// Special value for the fastscan bit_check field which resets all slave scan
/// state machines
pub const LSS_FASTSCAN_CONFIRM: u8 = 0x80;

/// An LSS request, sent by the master to the slaves
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LssRequest {
    /// Switch the mode of all LSS slaves
    SwitchModeGlobal {
        /// The mode -- 0 = *Waiting*, 1 = *Configuring*
        mode: u8,
    },
    /// Set the node ID of the node currently in *Configuring* state
    ConfigureNodeId {
        /// The new node ID to set
        node_id: u8,
    },
    /// Set the bit timing of the node currently in *Configuring* state
    ConfigureBitTiming {
        /// Selects the baudrate table; 0 is the standard CiA table,
        /// 128..=255 are user definable
        table: u8,
        /// The index into the baudrate table
        index: u8,
    },
    /// Command a previously configured bit timing to be activated
    ActivateBitTiming {
        /// Duration in ms to wait before switching, and to keep the bus
        /// quiet after switching
        delay: u16,
    },
    /// Command the slave in *Configuring* state to persist its configuration
    StoreConfiguration,
    /// Send the vendor ID to activate by identity
    SwitchStateVendor {
        /// The vendor ID to match
        vendor_id: u32,
    },
    /// Send the product code to activate by identity
    SwitchStateProduct {
        /// The product code to match
        product_code: u32,
    },
    /// Send the revision number to activate by identity
    SwitchStateRevision {
        /// The revision number to match
        revision: u32,
    },
    /// Send the serial number to activate by identity
    ///
    /// Sent last; it triggers the slave to compare its identity against the
    /// accumulated values and respond on a full match.
    SwitchStateSerial {
        /// The serial number to match
        serial: u32,
    },
    /// Request the vendor ID from a node in *Configuring* state
    InquireVendor,
    /// Request the product code from a node in *Configuring* state
    InquireProduct,
    /// Request the revision from a node in *Configuring* state
    InquireRev,
    /// Request the serial number from a node in *Configuring* state
    InquireSerial,
    /// Request the node ID from a node in *Configuring* state
    InquireNodeId,
    /// Send a FastScan probe
    FastScan {
        /// The ID value under test
        id: u32,
        /// The number of unchecked low bits; [`LSS_FASTSCAN_CONFIRM`] resets
        /// the scan
        bit_check: u8,
        /// The identity word being checked: 0 = vendor, 1 = product,
        /// 2 = revision, 3 = serial
        sub: u8,
        /// The identity word to be checked by the next probe
        next: u8,
    },
}

impl TryFrom<&[u8]> for LssRequest {
    type Error = MessageError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        fn le_u32(value: &[u8]) -> Result<u32, MessageError> {
            if value.len() < 5 {
                return Err(MessageError::MessageTooShort);
            }
            Ok(u32::from_le_bytes(value[1..5].try_into().unwrap()))
        }

        if value.is_empty() {
            return Err(MessageError::MessageTooShort);
        }
        let cs = LssCommandSpecifier::from_byte(value[0])?;
        match cs {
            LssCommandSpecifier::SwitchModeGlobal => {
                if value.len() < 2 {
                    return Err(MessageError::MessageTooShort);
                }
                Ok(Self::SwitchModeGlobal { mode: value[1] })
            }
            LssCommandSpecifier::ConfigureNodeId => {
                if value.len() < 2 {
                    return Err(MessageError::MessageTooShort);
                }
                Ok(Self::ConfigureNodeId { node_id: value[1] })
            }
            LssCommandSpecifier::ConfigureBitTiming => {
                if value.len() < 3 {
                    return Err(MessageError::MessageTooShort);
                }
                Ok(Self::ConfigureBitTiming {
                    table: value[1],
                    index: value[2],
                })
            }
            LssCommandSpecifier::ActivateBitTiming => {
                if value.len() < 3 {
                    return Err(MessageError::MessageTooShort);
                }
                Ok(Self::ActivateBitTiming {
                    delay: u16::from_le_bytes([value[1], value[2]]),
                })
            }
            LssCommandSpecifier::StoreConfiguration => Ok(Self::StoreConfiguration),
            LssCommandSpecifier::SwitchStateVendor => Ok(Self::SwitchStateVendor {
                vendor_id: le_u32(value)?,
            }),
            LssCommandSpecifier::SwitchStateProduct => Ok(Self::SwitchStateProduct {
                product_code: le_u32(value)?,
            }),
            LssCommandSpecifier::SwitchStateRev => Ok(Self::SwitchStateRevision {
                revision: le_u32(value)?,
            }),
            LssCommandSpecifier::SwitchStateSerial => Ok(Self::SwitchStateSerial {
                serial: le_u32(value)?,
            }),
            LssCommandSpecifier::FastScan => {
                if value.len() < 8 {
                    return Err(MessageError::MessageTooShort);
                }
                Ok(Self::FastScan {
                    id: u32::from_le_bytes(value[1..5].try_into().unwrap()),
                    bit_check: value[5],
                    sub: value[6],
                    next: value[7],
                })
            }
            LssCommandSpecifier::InquireVendor => Ok(LssRequest::InquireVendor),
            LssCommandSpecifier::InquireProduct => Ok(LssRequest::InquireProduct),
            LssCommandSpecifier::InquireRev => Ok(LssRequest::InquireRev),
            LssCommandSpecifier::InquireSerial => Ok(LssRequest::InquireSerial),
            LssCommandSpecifier::InquireNodeId => Ok(LssRequest::InquireNodeId),
            // Only valid as responses
            LssCommandSpecifier::SwitchStateResponse | LssCommandSpecifier::IdentifySlave => {
                Err(MessageError::UnexpectedLssCommand { value: value[0] })
            }
        }
    }
}

impl From<LssRequest> for CanMessage {
    fn from(value: LssRequest) -> Self {
        let mut data = [0u8; 8];
        match value {
            LssRequest::SwitchModeGlobal { mode } => {
                data[0] = LssCommandSpecifier::SwitchModeGlobal as u8;
                data[1] = mode;
            }
            LssRequest::ConfigureNodeId { node_id } => {
                data[0] = LssCommandSpecifier::ConfigureNodeId as u8;
                data[1] = node_id;
            }
            LssRequest::ConfigureBitTiming { table, index } => {
                data[0] = LssCommandSpecifier::ConfigureBitTiming as u8;
                data[1] = table;
                data[2] = index;
            }
            LssRequest::ActivateBitTiming { delay } => {
                data[0] = LssCommandSpecifier::ActivateBitTiming as u8;
                data[1..3].copy_from_slice(&delay.to_le_bytes());
            }
            LssRequest::StoreConfiguration => {
                data[0] = LssCommandSpecifier::StoreConfiguration as u8;
            }
            LssRequest::SwitchStateVendor { vendor_id } => {
                data[0] = LssCommandSpecifier::SwitchStateVendor as u8;
                data[1..5].copy_from_slice(&vendor_id.to_le_bytes());
            }
            LssRequest::SwitchStateProduct { product_code } => {
                data[0] = LssCommandSpecifier::SwitchStateProduct as u8;
                data[1..5].copy_from_slice(&product_code.to_le_bytes());
            }
            LssRequest::SwitchStateRevision { revision } => {
                data[0] = LssCommandSpecifier::SwitchStateRev as u8;
                data[1..5].copy_from_slice(&revision.to_le_bytes());
            }
            LssRequest::SwitchStateSerial { serial } => {
                data[0] = LssCommandSpecifier::SwitchStateSerial as u8;
                data[1..5].copy_from_slice(&serial.to_le_bytes());
            }
            LssRequest::InquireVendor => {
                data[0] = LssCommandSpecifier::InquireVendor as u8;
            }
            LssRequest::InquireProduct => {
                data[0] = LssCommandSpecifier::InquireProduct as u8;
            }
            LssRequest::InquireRev => {
                data[0] = LssCommandSpecifier::InquireRev as u8;
            }
            LssRequest::InquireSerial => {
                data[0] = LssCommandSpecifier::InquireSerial as u8;
            }
            LssRequest::InquireNodeId => {
                data[0] = LssCommandSpecifier::InquireNodeId as u8;
            }
            LssRequest::FastScan {
                id,
                bit_check,
                sub,
                next,
            } => {
                data[0] = LssCommandSpecifier::FastScan as u8;
                data[1..5].copy_from_slice(&id.to_le_bytes());
                data[5] = bit_check;
                data[6] = sub;
                data[7] = next;
            }
        }
        CanMessage::new(LSS_REQ_ID, &data)
    }
}

/// An LSS response, sent from a slave to the master
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LssResponse {
    /// Sent when a slave's identity matches a FastScan probe
    IdentifySlave,
    /// Sent in response to a [`LssRequest::SwitchStateSerial`] when the slave
    /// recognizes its identity
    SwitchStateResponse,
    /// Sent in response to a [`LssRequest::ConfigureNodeId`]
    ConfigureNodeIdAck {
        /// The error code
        error: u8,
        /// The manufacturer specific error code; valid when error is 0xFF
        spec_error: u8,
    },
    /// Sent in response to a [`LssRequest::ConfigureBitTiming`]
    ConfigureBitTimingAck {
        /// The error code
        error: u8,
        /// The manufacturer specific error code; valid when error is 0xFF
        spec_error: u8,
    },
    /// Sent in response to a [`LssRequest::StoreConfiguration`]
    StoreConfigurationAck {
        /// The error code
        error: u8,
        /// The manufacturer specific error code; valid when error is 0xFF
        spec_error: u8,
    },
    /// Sent in response to a [`LssRequest::InquireVendor`]
    InquireVendorAck {
        /// The vendor id of the responding node
        vendor_id: u32,
    },
    /// Sent in response to a [`LssRequest::InquireProduct`]
    InquireProductAck {
        /// The product code of the responding node
        product_code: u32,
    },
    /// Sent in response to a [`LssRequest::InquireRev`]
    InquireRevAck {
        /// The revision number of the responding node
        revision: u32,
    },
    /// Sent in response to a [`LssRequest::InquireSerial`]
    InquireSerialAck {
        /// The serial number of the responding node
        serial: u32,
    },
    /// Sent in response to a [`LssRequest::InquireNodeId`]
    InquireNodeIdAck {
        /// The node ID of the responding node
        node_id: u8,
    },
}

impl TryFrom<&[u8]> for LssResponse {
    type Error = MessageError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        fn le_u32(value: &[u8]) -> Result<u32, MessageError> {
            if value.len() < 5 {
                return Err(MessageError::MessageTooShort);
            }
            Ok(u32::from_le_bytes(value[1..5].try_into().unwrap()))
        }
        fn err_pair(value: &[u8]) -> Result<(u8, u8), MessageError> {
            if value.len() < 3 {
                return Err(MessageError::MessageTooShort);
            }
            Ok((value[1], value[2]))
        }

        if value.is_empty() {
            return Err(MessageError::MessageTooShort);
        }
        let cs = LssCommandSpecifier::from_byte(value[0])?;
        match cs {
            LssCommandSpecifier::IdentifySlave => Ok(Self::IdentifySlave),
            LssCommandSpecifier::SwitchStateResponse => Ok(Self::SwitchStateResponse),
            LssCommandSpecifier::ConfigureNodeId => {
                let (error, spec_error) = err_pair(value)?;
                Ok(Self::ConfigureNodeIdAck { error, spec_error })
            }
            LssCommandSpecifier::ConfigureBitTiming => {
                let (error, spec_error) = err_pair(value)?;
                Ok(Self::ConfigureBitTimingAck { error, spec_error })
            }
            LssCommandSpecifier::StoreConfiguration => {
                let (error, spec_error) = err_pair(value)?;
                Ok(Self::StoreConfigurationAck { error, spec_error })
            }
            LssCommandSpecifier::InquireVendor => Ok(Self::InquireVendorAck {
                vendor_id: le_u32(value)?,
            }),
            LssCommandSpecifier::InquireProduct => Ok(Self::InquireProductAck {
                product_code: le_u32(value)?,
            }),
            LssCommandSpecifier::InquireRev => Ok(Self::InquireRevAck {
                revision: le_u32(value)?,
            }),
            LssCommandSpecifier::InquireSerial => Ok(Self::InquireSerialAck {
                serial: le_u32(value)?,
            }),
            LssCommandSpecifier::InquireNodeId => {
                if value.len() < 2 {
                    return Err(MessageError::MessageTooShort);
                }
                Ok(Self::InquireNodeIdAck { node_id: value[1] })
            }
            _ => Err(MessageError::UnexpectedLssCommand { value: value[0] }),
        }
    }
}

impl TryFrom<CanMessage> for LssResponse {
    type Error = MessageError;

    fn try_from(value: CanMessage) -> Result<Self, Self::Error> {
        if value.id != LSS_RESP_ID {
            return Err(MessageError::UnexpectedId {
                cob_id: value.id,
                expected: LSS_RESP_ID,
            });
        }
        LssResponse::try_from(&value.data[..])
    }
}

impl LssResponse {
    /// Convert an LssResponse to a CanMessage
    pub fn to_can_message(&self, id: CanId) -> CanMessage {
        // LSS messages are required to always be 8 bytes long
        let mut msg = CanMessage::new(id, &[0; 8]);
        match self {
            LssResponse::IdentifySlave => {
                msg.data[0] = LssCommandSpecifier::IdentifySlave as u8;
            }
            LssResponse::SwitchStateResponse => {
                msg.data[0] = LssCommandSpecifier::SwitchStateResponse as u8;
            }
            LssResponse::ConfigureNodeIdAck { error, spec_error } => {
                msg.data[0] = LssCommandSpecifier::ConfigureNodeId as u8;
                msg.data[1] = *error;
                msg.data[2] = *spec_error;
            }
            LssResponse::ConfigureBitTimingAck { error, spec_error } => {
                msg.data[0] = LssCommandSpecifier::ConfigureBitTiming as u8;
                msg.data[1] = *error;
                msg.data[2] = *spec_error;
            }
            LssResponse::StoreConfigurationAck { error, spec_error } => {
                msg.data[0] = LssCommandSpecifier::StoreConfiguration as u8;
                msg.data[1] = *error;
                msg.data[2] = *spec_error;
            }
            LssResponse::InquireVendorAck { vendor_id } => {
                msg.data[0] = LssCommandSpecifier::InquireVendor as u8;
                msg.data[1..5].copy_from_slice(&vendor_id.to_le_bytes());
            }
            LssResponse::InquireProductAck { product_code } => {
                msg.data[0] = LssCommandSpecifier::InquireProduct as u8;
                msg.data[1..5].copy_from_slice(&product_code.to_le_bytes());
            }
            LssResponse::InquireRevAck { revision } => {
                msg.data[0] = LssCommandSpecifier::InquireRev as u8;
                msg.data[1..5].copy_from_slice(&revision.to_le_bytes());
            }
            LssResponse::InquireSerialAck { serial } => {
                msg.data[0] = LssCommandSpecifier::InquireSerial as u8;
                msg.data[1..5].copy_from_slice(&serial.to_le_bytes());
            }
            LssResponse::InquireNodeIdAck { node_id } => {
                msg.data[0] = LssCommandSpecifier::InquireNodeId as u8;
                msg.data[1] = *node_id;
            }
        }
        msg
    }
}

/// The possible LSS slave states
#[derive(Debug, Clone, Copy, PartialEq)]
#[repr(u8)]
pub enum LssState {
    /// The default state of a node
    Waiting = 0,
    /// The state of a node which has been activated and may be configured or
    /// queried via LSS
    Configuring = 1,
}

impl LssState {
    /// Create an LSS state from a mode byte
    pub fn from_byte(b: u8) -> Result<Self, MessageError> {
        match b {
            0x00 => Ok(Self::Waiting),
            0x01 => Ok(Self::Configuring),
            _ => Err(MessageError::InvalidField),
        }
    }
}

/// The 128-bit LSS identity in its four components
///
/// The identity is stored in the 0x1018 record object. Every device on the
/// bus must have a unique identity for selective switching and fastscan to
/// work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LssIdentity {
    /// A number indicating the vendor of the device
    pub vendor_id: u32,
    /// A number indicating a product / model of the device
    pub product_code: u32,
    /// A number indicating the revision of the product
    pub revision: u32,
    /// A serial number unique among devices with the same
    /// vendor/product/revision
    pub serial: u32,
}

impl LssIdentity {
    /// Create a new LssIdentity
    pub fn new(vendor_id: u32, product_code: u32, revision: u32, serial: u32) -> Self {
        Self {
            vendor_id,
            product_code,
            revision,
            serial,
        }
    }

    /// Read one identity word by its LSS address (0 = vendor .. 3 = serial)
    pub fn by_addr(&self, addr: u8) -> u32 {
        match addr {
            0 => self.vendor_id,
            1 => self.product_code,
            2 => self.revision,
            3 => self.serial,
            _ => panic!("Invalid LSS identity address"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_round_trips() {
        let reqs = [
            LssRequest::SwitchModeGlobal { mode: 1 },
            LssRequest::ConfigureNodeId { node_id: 0x42 },
            LssRequest::ConfigureBitTiming { table: 0, index: 2 },
            LssRequest::ActivateBitTiming { delay: 500 },
            LssRequest::StoreConfiguration,
            LssRequest::SwitchStateVendor { vendor_id: 0x10 },
            LssRequest::SwitchStateSerial { serial: 0x40 },
            LssRequest::FastScan {
                id: 0xDEADBEEF,
                bit_check: 7,
                sub: 2,
                next: 3,
            },
            LssRequest::InquireNodeId,
        ];
        for req in reqs {
            let msg: CanMessage = req.into();
            assert_eq!(msg.dlc, 8);
            assert_eq!(LssRequest::try_from(msg.data()).unwrap(), req);
        }
    }

    #[test]
    fn test_response_round_trips() {
        let resps = [
            LssResponse::IdentifySlave,
            LssResponse::SwitchStateResponse,
            LssResponse::ConfigureNodeIdAck {
                error: 0,
                spec_error: 0,
            },
            LssResponse::StoreConfigurationAck {
                error: LSS_STORE_NOT_SUPPORTED,
                spec_error: 0,
            },
            LssResponse::InquireSerialAck { serial: 0x40 },
            LssResponse::InquireNodeIdAck { node_id: 9 },
        ];
        for resp in resps {
            let msg = resp.to_can_message(LSS_RESP_ID);
            assert_eq!(msg.dlc, 8);
            assert_eq!(LssResponse::try_from(msg).unwrap(), resp);
        }
    }
}
