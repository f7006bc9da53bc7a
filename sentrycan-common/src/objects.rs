//! Object model metadata types
//!
//! These types describe objects and sub-objects in the object dictionary.
//! They carry no storage themselves; storage and access live in the node
//! crate's `object_dict` module.

/// The CiA 301 object code of an object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectCode {
    /// A non-object placeholder
    Null = 0,
    /// A large block of data with application defined structure
    Domain = 2,
    /// A type definition
    DefType = 5,
    /// A struct definition
    DefStruct = 6,
    /// A single value
    #[default]
    Var = 7,
    /// An array of values of one type, with the count at sub 0
    Array = 8,
    /// A collection of heterogenous values, with the highest sub at sub 0
    Record = 9,
}

impl TryFrom<u8> for ObjectCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ObjectCode::Null),
            2 => Ok(ObjectCode::Domain),
            5 => Ok(ObjectCode::DefType),
            6 => Ok(ObjectCode::DefStruct),
            7 => Ok(ObjectCode::Var),
            8 => Ok(ObjectCode::Array),
            9 => Ok(ObjectCode::Record),
            _ => Err(()),
        }
    }
}

/// Allowed SDO access to a sub-object
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum AccessType {
    /// Read-only
    #[default]
    Ro,
    /// Write-only
    Wo,
    /// Read-write
    Rw,
    /// Read-only, and never changed internally by the device either
    Const,
}

impl AccessType {
    /// Returns true if reads are allowed
    pub fn is_readable(&self) -> bool {
        matches!(self, AccessType::Ro | AccessType::Rw | AccessType::Const)
    }

    /// Returns true if writes are allowed
    pub fn is_writable(&self) -> bool {
        matches!(self, AccessType::Wo | AccessType::Rw)
    }
}

/// PDO/SRDO mappability of a sub-object
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PdoMapping {
    /// The sub-object cannot be mapped
    #[default]
    None,
    /// The sub-object may be mapped into receive PDOs/SRDOs
    Rpdo,
    /// The sub-object may be mapped into transmit PDOs/SRDOs
    Tpdo,
    /// The sub-object may be mapped in either direction
    Both,
}

impl PdoMapping {
    /// Returns true if any mapping is allowed
    pub fn is_mappable(&self) -> bool {
        !matches!(self, PdoMapping::None)
    }

    /// Returns true if mapping into a TPDO is allowed
    pub fn is_tpdo_mappable(&self) -> bool {
        matches!(self, PdoMapping::Tpdo | PdoMapping::Both)
    }
}

/// The CiA 301 data type of a sub-object
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DataType {
    /// One byte boolean
    Boolean,
    /// Signed 8-bit integer
    #[default]
    Int8,
    /// Signed 16-bit integer
    Int16,
    /// Signed 32-bit integer
    Int32,
    /// Unsigned 8-bit integer
    UInt8,
    /// Unsigned 16-bit integer
    UInt16,
    /// Unsigned 32-bit integer
    UInt32,
    /// 32-bit float
    Real32,
    /// ASCII string
    VisibleString,
    /// Arbitrary bytes
    OctetString,
    /// UTF-16 string
    UnicodeString,
    /// Time of day value
    TimeOfDay,
    /// Application defined large data
    Domain,
}

impl DataType {
    /// Returns true if data type is one of the string types
    pub fn is_str(&self) -> bool {
        matches!(
            self,
            Self::VisibleString | Self::OctetString | Self::UnicodeString
        )
    }
}

/// Identifies a sub-object by object index and sub index
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ObjectId {
    /// The 16-bit object index
    pub index: u16,
    /// The 8-bit sub index
    pub sub: u8,
}

/// Metadata about one sub-object
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SubInfo {
    /// The size (or max size) of this sub-object, in bytes
    pub size: usize,
    /// The data type of this sub-object
    pub data_type: DataType,
    /// What accesses (read/write) are allowed on this sub-object
    pub access_type: AccessType,
    /// Whether and in which direction this sub-object may be PDO/SRDO mapped
    pub pdo_mapping: PdoMapping,
    /// Whether this sub-object's value is saved by the store-parameters
    /// command
    pub persist: bool,
}

impl Default for SubInfo {
    fn default() -> Self {
        Self {
            size: 0,
            data_type: DataType::default(),
            access_type: AccessType::default(),
            pdo_mapping: PdoMapping::default(),
            persist: false,
        }
    }
}

impl SubInfo {
    /// Metadata for the conventional read-only u8 at sub 0 of arrays and
    /// records holding the highest supported sub index
    pub const MAX_SUB_NUMBER: SubInfo = SubInfo {
        size: 1,
        data_type: DataType::UInt8,
        access_type: AccessType::Const,
        pdo_mapping: PdoMapping::None,
        persist: false,
    };

    /// New u8 sub-object metadata (read-only until modified by builders)
    pub const fn new_u8() -> Self {
        Self::scalar(1, DataType::UInt8)
    }

    /// New u16 sub-object metadata
    pub const fn new_u16() -> Self {
        Self::scalar(2, DataType::UInt16)
    }

    /// New u32 sub-object metadata
    pub const fn new_u32() -> Self {
        Self::scalar(4, DataType::UInt32)
    }

    /// New i8 sub-object metadata
    pub const fn new_i8() -> Self {
        Self::scalar(1, DataType::Int8)
    }

    /// New i16 sub-object metadata
    pub const fn new_i16() -> Self {
        Self::scalar(2, DataType::Int16)
    }

    /// New i32 sub-object metadata
    pub const fn new_i32() -> Self {
        Self::scalar(4, DataType::Int32)
    }

    /// New f32 sub-object metadata
    pub const fn new_f32() -> Self {
        Self::scalar(4, DataType::Real32)
    }

    /// New visible string sub-object metadata with the given max size
    pub const fn new_visible_str(size: usize) -> Self {
        Self::scalar(size, DataType::VisibleString)
    }

    const fn scalar(size: usize, data_type: DataType) -> Self {
        SubInfo {
            size,
            data_type,
            access_type: AccessType::Ro,
            pdo_mapping: PdoMapping::None,
            persist: false,
        }
    }

    /// Make this sub-object read-write
    pub const fn rw_access(mut self) -> Self {
        self.access_type = AccessType::Rw;
        self
    }

    /// Make this sub-object read-only
    pub const fn ro_access(mut self) -> Self {
        self.access_type = AccessType::Ro;
        self
    }

    /// Set the persist flag
    pub const fn persist(mut self, value: bool) -> Self {
        self.persist = value;
        self
    }

    /// Set the mapping attribute
    pub const fn mappable(mut self, value: PdoMapping) -> Self {
        self.pdo_mapping = value;
        self
    }
}
