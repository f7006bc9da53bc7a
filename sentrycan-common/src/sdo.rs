//! SDO protocol messages and abort codes
//!
//! Defines the request/response messages for the expedited and segmented SDO
//! transfer protocols. Block transfers are not implemented by this stack;
//! block initiate requests are decoded only far enough for a server to abort
//! them cleanly.

use int_enum::IntEnum;

use crate::messages::{CanId, CanMessage};

/// SDO Abort Code
///
/// Defines the various reasons an SDO transfer can be aborted. The same codes
/// also serve as the error taxonomy for object dictionary access.
#[derive(Clone, Copy, Debug, PartialEq, Eq, IntEnum)]
#[repr(u32)]
pub enum AbortCode {
    /// Toggle bit not alternated
    ToggleNotAlternated = 0x0503_0000,
    /// SDO protocol timed out
    SdoTimeout = 0x0504_0000,
    /// Client/server command specifier not valid or unknown
    InvalidCommandSpecifier = 0x0504_0001,
    /// Out of memory
    OutOfMemory = 0x0504_0005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x0601_0000,
    /// Attempt to read a write only object
    WriteOnly = 0x0601_0001,
    /// Attempt to write a read only object
    ReadOnly = 0x0601_0002,
    /// Object does not exist in the dictionary
    NoSuchObject = 0x0602_0000,
    /// Object cannot be mapped to the PDO
    UnallowedPdo = 0x0604_0041,
    /// The number and length of objects would exceed PDO length
    PdoTooLong = 0x0604_0042,
    /// General parameter incompatibility
    IncompatibleParameter = 0x0604_0043,
    /// Access failed due to hardware error
    HardwareError = 0x0606_0000,
    /// Data type does not match, length of service parameter does not match
    DataTypeMismatch = 0x0607_0010,
    /// Data type does not match, length of service parameter too high
    DataTypeMismatchLengthHigh = 0x0607_0012,
    /// Data type does not match, length of service parameter too low
    DataTypeMismatchLengthLow = 0x0607_0013,
    /// Sub-index does not exist
    NoSuchSubIndex = 0x0609_0011,
    /// Invalid value for parameter (download only)
    InvalidValue = 0x0609_0030,
    /// Value of parameter too high (download only)
    ValueTooHigh = 0x0609_0031,
    /// Value of parameter too low (download only)
    ValueTooLow = 0x0609_0032,
    /// Resource isn't available
    ResourceNotAvailable = 0x060A_0023,
    /// General error
    GeneralError = 0x0800_0000,
    /// Data cannot be transferred or stored to the application
    CantStore = 0x0800_0020,
    /// Data cannot be transferred or stored because of local control
    CantStoreLocalControl = 0x0800_0021,
    /// Data cannot be transferred or stored because of the device state
    CantStoreDeviceState = 0x0800_0022,
    /// No object dictionary is present
    NoObjectDict = 0x0800_0023,
    /// No data available
    NoData = 0x0800_0024,
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
enum ClientCommand {
    DownloadSegment = 0,
    InitiateDownload = 1,
    InitiateUpload = 2,
    ReqUploadSegment = 3,
    Abort = 4,
    BlockUpload = 5,
    BlockDownload = 6,
}

impl TryFrom<u8> for ClientCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ClientCommand::*;
        match value {
            0 => Ok(DownloadSegment),
            1 => Ok(InitiateDownload),
            2 => Ok(InitiateUpload),
            3 => Ok(ReqUploadSegment),
            4 => Ok(Abort),
            5 => Ok(BlockUpload),
            6 => Ok(BlockDownload),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(u8)]
enum ServerCommand {
    SegmentUpload = 0,
    SegmentDownload = 1,
    Upload = 2,
    Download = 3,
    Abort = 4,
}

impl TryFrom<u8> for ServerCommand {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ServerCommand::*;
        match value {
            0 => Ok(SegmentUpload),
            1 => Ok(SegmentDownload),
            2 => Ok(Upload),
            3 => Ok(Download),
            4 => Ok(Abort),
            _ => Err(()),
        }
    }
}

/// An SDO request, sent from client to server
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SdoRequest {
    /// Begin a download, writing data to an object on the server
    InitiateDownload {
        /// Number of unused bytes in data
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size valid flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value bytes on expedited transfer, size when e=0 and s=1
        data: [u8; 4],
    },
    /// Send a segment of data to the server
    DownloadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// When set, indicates there are no more segments to be sent
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Begin an upload of data from an object on the server
    InitiateUpload {
        /// The requested object index
        index: u16,
        /// The requested sub object
        sub: u8,
    },
    /// Request the next segment in an upload
    ReqUploadSegment {
        /// Toggle flag
        t: bool,
    },
    /// A block download initiation; recognized but not served
    InitiateBlockDownload {
        /// Index of object to download to
        index: u16,
        /// Sub object to download to
        sub: u8,
    },
    /// A block upload initiation; recognized but not served
    InitiateBlockUpload {
        /// Index of the object to upload
        index: u16,
        /// Sub index of the object to upload
        sub: u8,
    },
    /// Sent by client to abort an ongoing transaction
    Abort {
        /// The object index of the active transaction
        index: u16,
        /// The sub object of the active transaction
        sub: u8,
        /// The abort reason
        abort_code: u32,
    },
}

impl SdoRequest {
    /// Create an abort message
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> Self {
        SdoRequest::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Create an expedited download message
    ///
    /// Panics if data is longer than 4 bytes.
    pub fn expedited_download(index: u16, sub: u8, data: &[u8]) -> Self {
        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);

        SdoRequest::InitiateDownload {
            n: (4 - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: msg_data,
        }
    }

    /// Create a segmented download initiation
    pub fn initiate_download(index: u16, sub: u8, size: Option<u32>) -> Self {
        SdoRequest::InitiateDownload {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data: size.unwrap_or(0).to_le_bytes(),
        }
    }

    /// Create a `DownloadSegment` request
    pub fn download_segment(toggle: bool, last_segment: bool, segment_data: &[u8]) -> Self {
        let mut data = [0; 7];
        data[0..segment_data.len()].copy_from_slice(segment_data);
        SdoRequest::DownloadSegment {
            t: toggle,
            n: 7 - segment_data.len() as u8,
            c: last_segment,
            data,
        }
    }

    /// Create an `InitiateUpload` request
    pub fn initiate_upload(index: u16, sub: u8) -> Self {
        SdoRequest::InitiateUpload { index, sub }
    }

    /// Create a `ReqUploadSegment` request
    pub fn upload_segment_request(toggle: bool) -> Self {
        SdoRequest::ReqUploadSegment { t: toggle }
    }

    /// Convert the request to message payload bytes
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0; 8];

        match self {
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = ((ClientCommand::InitiateDownload as u8) << 5)
                    | (n << 2)
                    | ((e as u8) << 1)
                    | s as u8;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                payload[0] = ((ClientCommand::DownloadSegment as u8) << 5)
                    | ((t as u8) << 4)
                    | ((n & 7) << 1)
                    | (c as u8);
                payload[1..8].copy_from_slice(&data);
            }
            SdoRequest::InitiateUpload { index, sub } => {
                payload[0] = (ClientCommand::InitiateUpload as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoRequest::ReqUploadSegment { t } => {
                payload[0] = ((ClientCommand::ReqUploadSegment as u8) << 5) | ((t as u8) << 4);
            }
            SdoRequest::InitiateBlockDownload { index, sub } => {
                payload[0] = (ClientCommand::BlockDownload as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoRequest::InitiateBlockUpload { index, sub } => {
                payload[0] = (ClientCommand::BlockUpload as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoRequest::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ClientCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        payload
    }

    /// Convert the request to a CanMessage using the provided COB ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

impl TryFrom<&[u8]> for SdoRequest {
    type Error = AbortCode;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(AbortCode::DataTypeMismatchLengthLow);
        }
        let ccs: ClientCommand = (value[0] >> 5)
            .try_into()
            .map_err(|_| AbortCode::InvalidCommandSpecifier)?;
        let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
        let sub = value[3];

        match ccs {
            ClientCommand::InitiateDownload => Ok(SdoRequest::InitiateDownload {
                n: (value[0] >> 2) & 0x3,
                e: (value[0] & (1 << 1)) != 0,
                s: (value[0] & 1) != 0,
                index,
                sub,
                data: value[4..8].try_into().unwrap(),
            }),
            ClientCommand::DownloadSegment => Ok(SdoRequest::DownloadSegment {
                t: (value[0] & (1 << 4)) != 0,
                n: (value[0] >> 1) & 0x7,
                c: (value[0] & 1) != 0,
                data: value[1..8].try_into().unwrap(),
            }),
            ClientCommand::InitiateUpload => Ok(SdoRequest::InitiateUpload { index, sub }),
            ClientCommand::ReqUploadSegment => Ok(SdoRequest::ReqUploadSegment {
                t: (value[0] & (1 << 4)) != 0,
            }),
            ClientCommand::Abort => Ok(SdoRequest::Abort {
                index,
                sub,
                abort_code: u32::from_le_bytes(value[4..8].try_into().unwrap()),
            }),
            ClientCommand::BlockDownload => Ok(SdoRequest::InitiateBlockDownload { index, sub }),
            ClientCommand::BlockUpload => Ok(SdoRequest::InitiateBlockUpload { index, sub }),
        }
    }
}

/// An SDO response, sent from server to client
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SdoResponse {
    /// Accepts a download initiation
    DownloadAcknowledge {
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
    },
    /// Accepts one download segment
    DownloadSegmentAcknowledge {
        /// Toggle flag, matching the acknowledged segment
        t: bool,
    },
    /// Answers an upload initiation
    UploadAcknowledge {
        /// Number of unused bytes in data (expedited only)
        n: u8,
        /// Expedited flag
        e: bool,
        /// Size valid flag
        s: bool,
        /// Object index
        index: u16,
        /// Object sub-index
        sub: u8,
        /// Value bytes on expedited transfer, total size when e=0 and s=1
        data: [u8; 4],
    },
    /// Carries one upload segment
    UploadSegment {
        /// Toggle flag
        t: bool,
        /// Number of unused bytes in data
        n: u8,
        /// When set, indicates this is the last segment
        c: bool,
        /// Segment data
        data: [u8; 7],
    },
    /// Aborts the transaction
    Abort {
        /// The object index of the active transaction
        index: u16,
        /// The sub object of the active transaction
        sub: u8,
        /// The abort reason
        abort_code: u32,
    },
}

impl SdoResponse {
    /// Create an expedited upload response
    ///
    /// Panics if data is longer than 4 bytes.
    pub fn expedited_upload(index: u16, sub: u8, data: &[u8]) -> SdoResponse {
        let mut msg_data = [0; 4];
        msg_data[0..data.len()].copy_from_slice(data);
        SdoResponse::UploadAcknowledge {
            n: (4 - data.len()) as u8,
            e: true,
            s: true,
            index,
            sub,
            data: msg_data,
        }
    }

    /// Create a segmented upload acknowledgement
    ///
    /// If `size` is None, the total transfer size is not communicated to the
    /// client.
    pub fn upload_acknowledge(index: u16, sub: u8, size: Option<u32>) -> SdoResponse {
        SdoResponse::UploadAcknowledge {
            n: 0,
            e: false,
            s: size.is_some(),
            index,
            sub,
            data: size.unwrap_or(0).to_le_bytes(),
        }
    }

    /// Create an upload segment response
    pub fn upload_segment(t: bool, c: bool, data: &[u8]) -> SdoResponse {
        let mut msg_data = [0; 7];
        msg_data[0..data.len()].copy_from_slice(data);
        SdoResponse::UploadSegment {
            t,
            n: (7 - data.len()) as u8,
            c,
            data: msg_data,
        }
    }

    /// Create a download acknowledgement
    pub fn download_acknowledge(index: u16, sub: u8) -> SdoResponse {
        SdoResponse::DownloadAcknowledge { index, sub }
    }

    /// Create a download segment acknowledgement
    pub fn download_segment_acknowledge(t: bool) -> SdoResponse {
        SdoResponse::DownloadSegmentAcknowledge { t }
    }

    /// Create an abort response
    pub fn abort(index: u16, sub: u8, abort_code: AbortCode) -> SdoResponse {
        SdoResponse::Abort {
            index,
            sub,
            abort_code: abort_code as u32,
        }
    }

    /// Convert the response to message payload bytes
    pub fn to_bytes(self) -> [u8; 8] {
        let mut payload = [0u8; 8];
        match self {
            SdoResponse::DownloadAcknowledge { index, sub } => {
                payload[0] = (ServerCommand::Download as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
            }
            SdoResponse::DownloadSegmentAcknowledge { t } => {
                payload[0] = ((ServerCommand::SegmentDownload as u8) << 5) | ((t as u8) << 4);
            }
            SdoResponse::UploadAcknowledge {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                payload[0] = ((ServerCommand::Upload as u8) << 5)
                    | ((n & 3) << 2)
                    | ((e as u8) << 1)
                    | (s as u8);
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&data);
            }
            SdoResponse::UploadSegment { t, n, c, data } => {
                payload[0] = ((ServerCommand::SegmentUpload as u8) << 5)
                    | ((t as u8) << 4)
                    | ((n & 7) << 1)
                    | (c as u8);
                payload[1..8].copy_from_slice(&data);
            }
            SdoResponse::Abort {
                index,
                sub,
                abort_code,
            } => {
                payload[0] = (ServerCommand::Abort as u8) << 5;
                payload[1..3].copy_from_slice(&index.to_le_bytes());
                payload[3] = sub;
                payload[4..8].copy_from_slice(&abort_code.to_le_bytes());
            }
        }
        payload
    }

    /// Convert the response to a CanMessage using the provided COB ID
    pub fn to_can_message(self, id: CanId) -> CanMessage {
        CanMessage::new(id, &self.to_bytes())
    }
}

impl TryFrom<&[u8]> for SdoResponse {
    type Error = AbortCode;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() < 8 {
            return Err(AbortCode::DataTypeMismatchLengthLow);
        }
        let scs: ServerCommand = (value[0] >> 5)
            .try_into()
            .map_err(|_| AbortCode::InvalidCommandSpecifier)?;
        let index = u16::from_le_bytes(value[1..3].try_into().unwrap());
        let sub = value[3];

        match scs {
            ServerCommand::Download => Ok(SdoResponse::DownloadAcknowledge { index, sub }),
            ServerCommand::SegmentDownload => Ok(SdoResponse::DownloadSegmentAcknowledge {
                t: (value[0] & (1 << 4)) != 0,
            }),
            ServerCommand::Upload => Ok(SdoResponse::UploadAcknowledge {
                n: (value[0] >> 2) & 0x3,
                e: (value[0] & (1 << 1)) != 0,
                s: (value[0] & 1) != 0,
                index,
                sub,
                data: value[4..8].try_into().unwrap(),
            }),
            ServerCommand::SegmentUpload => Ok(SdoResponse::UploadSegment {
                t: (value[0] & (1 << 4)) != 0,
                n: (value[0] >> 1) & 0x7,
                c: (value[0] & 1) != 0,
                data: value[1..8].try_into().unwrap(),
            }),
            ServerCommand::Abort => Ok(SdoResponse::Abort {
                index,
                sub,
                abort_code: u32::from_le_bytes(value[4..8].try_into().unwrap()),
            }),
        }
    }
}

impl TryFrom<CanMessage> for SdoResponse {
    type Error = AbortCode;

    fn try_from(msg: CanMessage) -> Result<Self, Self::Error> {
        msg.data().try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expedited_download_round_trip() {
        let req = SdoRequest::expedited_download(0x2000, 1, &0x1234u16.to_le_bytes());
        let bytes = req.to_bytes();
        assert_eq!(bytes[0], 0x2B); // ccs=1, n=2, e=1, s=1
        assert_eq!(&bytes[1..4], &[0x00, 0x20, 1]);
        let parsed = SdoRequest::try_from(&bytes[..]).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_upload_segment_round_trip() {
        let resp = SdoResponse::upload_segment(true, false, &[1, 2, 3, 4, 5, 6, 7]);
        let parsed = SdoResponse::try_from(&resp.to_bytes()[..]).unwrap();
        assert_eq!(parsed, resp);
    }

    #[test]
    fn test_abort_round_trip() {
        let resp = SdoResponse::abort(0x1301, 2, AbortCode::CantStoreDeviceState);
        let bytes = resp.to_bytes();
        assert_eq!(bytes[0], 0x80);
        let parsed = SdoResponse::try_from(&bytes[..]).unwrap();
        assert_eq!(
            parsed,
            SdoResponse::Abort {
                index: 0x1301,
                sub: 2,
                abort_code: 0x0800_0022
            }
        );
    }

    #[test]
    fn test_block_download_recognized() {
        let mut bytes = [0u8; 8];
        bytes[0] = 6 << 5;
        bytes[1..3].copy_from_slice(&0x2000u16.to_le_bytes());
        bytes[3] = 3;
        assert_eq!(
            SdoRequest::try_from(&bytes[..]).unwrap(),
            SdoRequest::InitiateBlockDownload {
                index: 0x2000,
                sub: 3
            }
        );
    }
}
