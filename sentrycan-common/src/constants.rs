//! Constants for standard objects and special protocol values

/// Object indices for standard objects
pub mod object_ids {
    /// Device type object index
    pub const DEVICE_TYPE: u16 = 0x1000;
    /// Error register object index
    pub const ERROR_REGISTER: u16 = 0x1001;
    /// Pre-defined error field (emergency history) object index
    pub const PREDEFINED_ERROR_FIELD: u16 = 0x1003;
    /// SYNC COB-ID object index
    pub const COB_ID_SYNC: u16 = 0x1005;
    /// Communication cycle period object index
    pub const COMM_CYCLE_PERIOD: u16 = 0x1006;
    /// Synchronous window length object index
    pub const SYNC_WINDOW_LENGTH: u16 = 0x1007;
    /// Device name object index
    pub const DEVICE_NAME: u16 = 0x1008;
    /// Hardware version object index
    pub const HARDWARE_VERSION: u16 = 0x1009;
    /// Software version object index
    pub const SOFTWARE_VERSION: u16 = 0x100A;
    /// Store parameters command object index
    pub const SAVE_OBJECTS: u16 = 0x1010;
    /// Restore default parameters command object index
    pub const RESTORE_DEFAULTS: u16 = 0x1011;
    /// Heartbeat consumer time object index
    pub const HEARTBEAT_CONSUMER_TIME: u16 = 0x1016;
    /// Heartbeat producer time object index
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
    /// Identity record object index
    pub const IDENTITY: u16 = 0x1018;
    /// SYNC counter overflow object index
    pub const SYNC_COUNTER_OVERFLOW: u16 = 0x1019;
    /// First SRDO communication record (one per SRDO, up to 0x1340)
    pub const SRDO_COMM_BASE: u16 = 0x1301;
    /// First SRDO mapping record (one per SRDO, up to 0x13C0)
    pub const SRDO_MAPPING_BASE: u16 = 0x1381;
    /// SRDO configuration valid flag object index
    pub const SRDO_VALID: u16 = 0x13FE;
    /// SRDO CRC table object index
    pub const SRDO_CRC: u16 = 0x13FF;
}

/// Special values used to access standard objects
pub mod values {
    /// Magic value ("save" in ASCII) triggering object storage via 0x1010
    pub const SAVE_CMD: u32 = 0x65766173;
    /// Magic value ("load" in ASCII) triggering restore via 0x1011
    pub const LOAD_CMD: u32 = 0x64616F6C;
    /// Value of the SRDO configuration valid flag when the configuration has
    /// been accepted
    pub const SRDO_VALID_MAGIC: u8 = 0xA5;
}
