//! Handling for the persistent storage command objects
//!
//! Object 0x1010 triggers storage of all persist-flagged object values when
//! the ASCII magic "save" is written; object 0x1011 arms a restore of the
//! factory defaults when "load" is written. The actual storage medium is
//! application provided via callbacks.

use sentrycan_common::{
    constants::values::{LOAD_CMD, SAVE_CMD},
    objects::{ObjectCode, SubInfo},
    sdo::AbortCode,
    AtomicCell,
};

use crate::object_dict::{ODEntry, ObjectAccess};
use crate::persist::StoreObjectsCallback;

/// A callback invoked when a restore-defaults command is received
///
/// The application typically erases its stored parameter image; the defaults
/// take effect at the next communication reset.
pub type RestoreDefaultsCallback = dyn Fn() + Sync;

/// Shared state for supporting object storage
#[allow(missing_debug_implementations)]
#[derive(Default)]
pub struct StorageContext {
    pub(crate) store_callback: AtomicCell<Option<&'static StoreObjectsCallback>>,
    pub(crate) restore_callback: AtomicCell<Option<&'static RestoreDefaultsCallback>>,
}

impl StorageContext {
    /// Create a new StorageContext
    pub const fn new() -> Self {
        Self {
            store_callback: AtomicCell::new(None),
            restore_callback: AtomicCell::new(None),
        }
    }
}

/// Implements the store parameters command object (0x1010)
#[allow(missing_debug_implementations)]
pub struct StorageCommandObject {
    od: &'static [ODEntry<'static>],
    storage_context: &'static StorageContext,
}

impl StorageCommandObject {
    /// Create a new storage command object
    pub const fn new(
        od: &'static [ODEntry<'static>],
        storage_context: &'static StorageContext,
    ) -> Self {
        Self {
            od,
            storage_context,
        }
    }
}

impl ObjectAccess for StorageCommandObject {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        match sub {
            0 => {
                if offset > 0 || buf.is_empty() {
                    return Ok(0);
                }
                buf[0] = 1;
                Ok(1)
            }
            1 => {
                // Bit 0 indicates the node is capable of saving objects on
                // command; set when a callback has been registered
                let mut value = 0u32;
                if self.storage_context.store_callback.load().is_some() {
                    value |= 1;
                }
                Ok(crate::object_dict::read_bytes(
                    &value.to_le_bytes(),
                    offset,
                    buf,
                ))
            }
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        self.sub_info(sub).map(|i| i.size)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        match sub {
            0 => Err(AbortCode::ReadOnly),
            1 => {
                if data.len() != 4 {
                    return Err(AbortCode::DataTypeMismatch);
                }
                let value = u32::from_le_bytes(data.try_into().unwrap());
                if value != SAVE_CMD {
                    return Err(AbortCode::IncompatibleParameter);
                }
                if let Some(cb) = self.storage_context.store_callback.load() {
                    crate::persist::serialize(self.od, cb);
                    Ok(())
                } else {
                    Err(AbortCode::ResourceNotAvailable)
                }
            }
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Array
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        match sub {
            0 => Ok(SubInfo::MAX_SUB_NUMBER),
            1 => Ok(SubInfo::new_u32().rw_access()),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }
}

/// Implements the restore default parameters command object (0x1011)
#[allow(missing_debug_implementations)]
pub struct RestoreCommandObject {
    storage_context: &'static StorageContext,
}

impl RestoreCommandObject {
    /// Create a new restore command object
    pub const fn new(storage_context: &'static StorageContext) -> Self {
        Self { storage_context }
    }
}

impl ObjectAccess for RestoreCommandObject {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        match sub {
            0 => {
                if offset > 0 || buf.is_empty() {
                    return Ok(0);
                }
                buf[0] = 1;
                Ok(1)
            }
            1 => {
                // Bit 0 indicates the node is capable of restoring defaults
                let mut value = 0u32;
                if self.storage_context.restore_callback.load().is_some() {
                    value |= 1;
                }
                Ok(crate::object_dict::read_bytes(
                    &value.to_le_bytes(),
                    offset,
                    buf,
                ))
            }
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        self.sub_info(sub).map(|i| i.size)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        match sub {
            0 => Err(AbortCode::ReadOnly),
            1 => {
                if data.len() != 4 {
                    return Err(AbortCode::DataTypeMismatch);
                }
                let value = u32::from_le_bytes(data.try_into().unwrap());
                if value != LOAD_CMD {
                    return Err(AbortCode::IncompatibleParameter);
                }
                if let Some(cb) = self.storage_context.restore_callback.load() {
                    cb();
                    Ok(())
                } else {
                    Err(AbortCode::ResourceNotAvailable)
                }
            }
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Array
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        match sub {
            0 => Ok(SubInfo::MAX_SUB_NUMBER),
            1 => Ok(SubInfo::new_u32().rw_access()),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_save_requires_magic_and_callback() {
        static CONTEXT: StorageContext = StorageContext::new();
        static OD: [ODEntry; 0] = [];
        let obj = StorageCommandObject::new(&OD, &CONTEXT);

        // No callback registered yet
        assert_eq!(0, obj.read_u32(1).unwrap() & 1);
        assert_eq!(
            Err(AbortCode::ResourceNotAvailable),
            obj.write(1, &SAVE_CMD.to_le_bytes())
        );

        static CALLED: AtomicBool = AtomicBool::new(false);
        fn store_cb(
            _reader: &mut dyn embedded_io::Read<Error = core::convert::Infallible>,
            _size: usize,
        ) {
            CALLED.store(true, Ordering::Relaxed);
        }
        CONTEXT.store_callback.store(Some(&store_cb));
        assert_eq!(1, obj.read_u32(1).unwrap() & 1);
        assert_eq!(
            Err(AbortCode::IncompatibleParameter),
            obj.write(1, &0x12345678u32.to_le_bytes())
        );
        obj.write(1, &SAVE_CMD.to_le_bytes()).unwrap();
        assert!(CALLED.load(Ordering::Relaxed));
    }

    #[test]
    fn test_restore_command() {
        static CONTEXT: StorageContext = StorageContext::new();
        let obj = RestoreCommandObject::new(&CONTEXT);

        static CALLED: AtomicBool = AtomicBool::new(false);
        fn restore_cb() {
            CALLED.store(true, Ordering::Relaxed);
        }
        CONTEXT.restore_callback.store(Some(&restore_cb));
        assert_eq!(
            Err(AbortCode::IncompatibleParameter),
            obj.write(1, &SAVE_CMD.to_le_bytes())
        );
        obj.write(1, &LOAD_CMD.to_le_bytes()).unwrap();
        assert!(CALLED.load(Ordering::Relaxed));
    }
}
