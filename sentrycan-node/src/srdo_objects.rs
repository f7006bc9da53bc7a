//! Object dictionary records for the SRDO subsystem
//!
//! - 0x1301 + slot: communication record (direction, refresh time / SCT,
//!   SRVT, transmission type, both COB-IDs, channel)
//! - 0x1381 + slot: mapping record
//! - 0x13FE: configuration valid flag
//! - 0x13FF: configuration signature (CRC) table
//!
//! All writes are refused while the node is Operational, and every accepted
//! write to a communication, mapping or CRC sub clears the guard's
//! configuration-valid state: a modified configuration must be re-signed and
//! accepted again before any SRDO goes valid.

use sentrycan_common::{
    objects::{ObjectCode, SubInfo},
    sdo::AbortCode,
};

use crate::object_dict::{read_bytes, ObjectAccess};
use crate::srdo::{direction, Srdo, SrdoGuard, SRDO_MAX_MAPPED_ENTRIES, SRDO_VALID_MAGIC};

/// Implements an SRDO communication record (0x1301 + slot)
#[allow(missing_debug_implementations)]
pub struct SrdoCommObject {
    srdo: &'static Srdo,
    guard: &'static SrdoGuard,
}

impl SrdoCommObject {
    /// Create the record over one SRDO
    pub const fn new(srdo: &'static Srdo, guard: &'static SrdoGuard) -> Self {
        Self { srdo, guard }
    }
}

impl ObjectAccess for SrdoCommObject {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        match sub {
            0 => Ok(read_bytes(&[7u8], offset, buf)),
            1 => Ok(read_bytes(&[self.srdo.direction_raw()], offset, buf)),
            2 => Ok(read_bytes(
                &self.srdo.refresh_time().to_le_bytes(),
                offset,
                buf,
            )),
            3 => Ok(read_bytes(&[self.srdo.srvt()], offset, buf)),
            4 => Ok(read_bytes(&[self.srdo.transmission_type()], offset, buf)),
            5 => Ok(read_bytes(&self.srdo.cob_id_raw(0).to_le_bytes(), offset, buf)),
            6 => Ok(read_bytes(&self.srdo.cob_id_raw(1).to_le_bytes(), offset, buf)),
            7 => Ok(read_bytes(&[self.srdo.channel()], offset, buf)),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn read_size(&self, sub: u8) -> Result<usize, AbortCode> {
        self.sub_info(sub).map(|i| i.size)
    }

    fn write(&self, sub: u8, data: &[u8]) -> Result<(), AbortCode> {
        // The communication record is locked while Operational
        if self.guard.is_operational() {
            return Err(AbortCode::CantStoreDeviceState);
        }
        let expected = self.sub_info(sub)?.size;
        if data.len() != expected {
            return Err(if data.len() < expected {
                AbortCode::DataTypeMismatchLengthLow
            } else {
                AbortCode::DataTypeMismatchLengthHigh
            });
        }

        match sub {
            0 => return Err(AbortCode::ReadOnly),
            1 => {
                let value = data[0];
                if value > direction::RX {
                    return Err(AbortCode::InvalidValue);
                }
                self.srdo.set_direction_raw(value);
            }
            2 => {
                let value = u16::from_le_bytes(data.try_into().unwrap());
                if value == 0 {
                    return Err(AbortCode::InvalidValue);
                }
                self.srdo.set_refresh_time(value);
            }
            3 => {
                let value = data[0];
                if value == 0 {
                    return Err(AbortCode::InvalidValue);
                }
                self.srdo.set_srvt(value);
            }
            4 => {
                if data[0] != 254 {
                    return Err(AbortCode::InvalidValue);
                }
                self.srdo.set_transmission_type(data[0]);
            }
            5 | 6 => {
                let value = u32::from_le_bytes(data.try_into().unwrap());
                let half = (sub - 5) as u32;
                // Normal COB-IDs are odd, inverted even, and both lie in the
                // SRDO range
                if !(0x101..=0x180).contains(&value) || (value & 1) == half {
                    return Err(AbortCode::InvalidValue);
                }
                self.srdo.set_cob_id_raw(half as usize, value);
            }
            7 => {
                let value = data[0];
                if value > 3 && value != 0xAA && value != 0xFF {
                    return Err(AbortCode::InvalidValue);
                }
                self.srdo.set_channel(value);
            }
            _ => return Err(AbortCode::NoSuchSubIndex),
        }

        // The modified configuration must be re-accepted
        self.guard.invalidate();
        Ok(())
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Record
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        match sub {
            0 => Ok(SubInfo::MAX_SUB_NUMBER),
            1 => Ok(SubInfo::new_u8().rw_access().persist(true)),
            2 => Ok(SubInfo::new_u16().rw_access().persist(true)),
            3 => Ok(SubInfo::new_u8().rw_access().persist(true)),
            4 => Ok(SubInfo::new_u8().rw_access().persist(true)),
            5 | 6 => Ok(SubInfo::new_u32().rw_access().persist(true)),
            7 => Ok(SubInfo::new_u8().rw_access().persist(true)),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }
}

/// Implements an SRDO mapping record (0x1381 + slot)
#[allow(missing_debug_implementations)]
pub struct SrdoMapObject {
    srdo: &'static Srdo,
    guard: &'static SrdoGuard,
}

impl SrdoMapObject {
    /// Create the record over one SRDO
    pub const fn new(srdo: &'static Srdo, guard: &'static SrdoGuard) -> Self {
        Self { srdo, guard }
    }
}

impl ObjectAccess for SrdoMapObject {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        if sub == 0 {
            Ok(read_bytes(&[self.srdo.num_mapped()], offset, buf))
        } else if sub as usize <= SRDO_MAX_MAPPED_ENTRIES {
            Ok(read_bytes(
                &self.srdo.map_raw((sub - 1) as usize).to_le_bytes(),
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
        if self.guard.is_operational() {
            return Err(AbortCode::CantStoreDeviceState);
        }
        // The SRDO must be disabled before its mapping may change
        if self.srdo.direction_raw() != direction::INVALID {
            return Err(AbortCode::UnsupportedAccess);
        }

        if sub == 0 {
            if data.len() != 1 {
                return Err(AbortCode::DataTypeMismatch);
            }
            let value = data[0];
            // Maps come in (normal, inverted) pairs
            if value as usize > SRDO_MAX_MAPPED_ENTRIES || value & 1 != 0 {
                return Err(AbortCode::PdoTooLong);
            }
            self.srdo.set_num_mapped(value);
        } else if sub as usize <= SRDO_MAX_MAPPED_ENTRIES {
            if data.len() != 4 {
                return Err(AbortCode::DataTypeMismatch);
            }
            // Individual maps may only change while the map count is zero
            if self.srdo.num_mapped() != 0 {
                return Err(AbortCode::UnsupportedAccess);
            }
            let value = u32::from_le_bytes(data.try_into().unwrap());
            self.srdo.set_map_raw((sub - 1) as usize, value);
        } else {
            return Err(AbortCode::NoSuchSubIndex);
        }

        self.guard.invalidate();
        Ok(())
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Record
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        if sub == 0 {
            Ok(SubInfo::new_u8().rw_access().persist(true))
        } else if sub as usize <= SRDO_MAX_MAPPED_ENTRIES {
            Ok(SubInfo::new_u32().rw_access().persist(true))
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }
}

/// Implements the SRDO configuration valid flag object (0x13FE)
#[allow(missing_debug_implementations)]
pub struct SrdoValidObject {
    guard: &'static SrdoGuard,
}

impl SrdoValidObject {
    /// Create the object over the guard
    pub const fn new(guard: &'static SrdoGuard) -> Self {
        Self { guard }
    }
}

impl ObjectAccess for SrdoValidObject {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        match sub {
            0 => Ok(read_bytes(&[1u8], offset, buf)),
            1 => Ok(read_bytes(&[self.guard.valid_flag()], offset, buf)),
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
                if self.guard.is_operational() {
                    return Err(AbortCode::CantStoreDeviceState);
                }
                if data.len() != 1 {
                    return Err(AbortCode::DataTypeMismatch);
                }
                // Writing the magic requests a CRC verification; the flag
                // only becomes effective at the next communication reset
                self.guard.set_valid_flag(data[0]);
                Ok(())
            }
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Record
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        match sub {
            0 => Ok(SubInfo::MAX_SUB_NUMBER),
            1 => Ok(SubInfo::new_u8().rw_access().persist(true)),
            _ => Err(AbortCode::NoSuchSubIndex),
        }
    }
}

/// Implements the SRDO CRC table object (0x13FF)
///
/// Sub `slot + 1` holds the 16-bit configuration signature for SRDO `slot`.
#[allow(missing_debug_implementations)]
pub struct SrdoCrcObject {
    srdos: &'static [Srdo],
    guard: &'static SrdoGuard,
}

impl SrdoCrcObject {
    /// Create the table over all SRDOs
    pub const fn new(srdos: &'static [Srdo], guard: &'static SrdoGuard) -> Self {
        Self { srdos, guard }
    }
}

impl ObjectAccess for SrdoCrcObject {
    fn read(&self, sub: u8, offset: usize, buf: &mut [u8]) -> Result<usize, AbortCode> {
        if sub == 0 {
            Ok(read_bytes(&[self.srdos.len() as u8], offset, buf))
        } else if (sub as usize) <= self.srdos.len() {
            Ok(read_bytes(
                &self.srdos[(sub - 1) as usize].checksum().to_le_bytes(),
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
            Err(AbortCode::ReadOnly)
        } else if (sub as usize) <= self.srdos.len() {
            if self.guard.is_operational() {
                return Err(AbortCode::CantStoreDeviceState);
            }
            if data.len() != 2 {
                return Err(AbortCode::DataTypeMismatch);
            }
            let value = u16::from_le_bytes(data.try_into().unwrap());
            self.srdos[(sub - 1) as usize].set_checksum(value);
            self.guard.invalidate();
            Ok(())
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }

    fn object_code(&self) -> ObjectCode {
        ObjectCode::Array
    }

    fn sub_info(&self, sub: u8) -> Result<SubInfo, AbortCode> {
        if sub == 0 {
            Ok(SubInfo::MAX_SUB_NUMBER)
        } else if (sub as usize) <= self.srdos.len() {
            Ok(SubInfo::new_u16().rw_access().persist(true))
        } else {
            Err(AbortCode::NoSuchSubIndex)
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use sentrycan_common::messages::NmtState;

    fn leak<T>(value: T) -> &'static T {
        std::boxed::Box::leak(std::boxed::Box::new(value))
    }

    fn setup() -> (&'static Srdo, &'static SrdoGuard) {
        let srdo = leak(Srdo::new());
        let guard = leak(SrdoGuard::new());
        guard.set_valid_flag(SRDO_VALID_MAGIC);
        guard.reset();
        guard.set_nmt_state(NmtState::PreOperational);
        (srdo, guard)
    }

    #[test]
    fn test_comm_writes_locked_in_operational() {
        let (srdo, guard) = setup();
        let obj = SrdoCommObject::new(srdo, guard);
        guard.set_nmt_state(NmtState::Operational);
        assert_eq!(
            Err(AbortCode::CantStoreDeviceState),
            obj.write(2, &100u16.to_le_bytes())
        );
        guard.set_nmt_state(NmtState::PreOperational);
        obj.write(2, &100u16.to_le_bytes()).unwrap();
        assert_eq!(100, obj.read_u16(2).unwrap());
    }

    #[test]
    fn test_comm_write_clears_valid() {
        let (srdo, guard) = setup();
        let obj = SrdoCommObject::new(srdo, guard);
        assert!(guard.config_valid());
        obj.write(1, &[direction::TX]).unwrap();
        assert!(!guard.config_valid());
    }

    #[test]
    fn test_cob_id_range_and_parity() {
        let (srdo, guard) = setup();
        let obj = SrdoCommObject::new(srdo, guard);

        // Out of range
        assert_eq!(
            Err(AbortCode::InvalidValue),
            obj.write(5, &0x100u32.to_le_bytes())
        );
        assert_eq!(
            Err(AbortCode::InvalidValue),
            obj.write(5, &0x181u32.to_le_bytes())
        );
        // Wrong parity: normal must be odd, inverted even
        assert_eq!(
            Err(AbortCode::InvalidValue),
            obj.write(5, &0x102u32.to_le_bytes())
        );
        assert_eq!(
            Err(AbortCode::InvalidValue),
            obj.write(6, &0x101u32.to_le_bytes())
        );
        obj.write(5, &0x101u32.to_le_bytes()).unwrap();
        obj.write(6, &0x102u32.to_le_bytes()).unwrap();
    }

    #[test]
    fn test_comm_value_validation() {
        let (srdo, guard) = setup();
        let obj = SrdoCommObject::new(srdo, guard);
        assert_eq!(Err(AbortCode::InvalidValue), obj.write(1, &[3]));
        assert_eq!(
            Err(AbortCode::InvalidValue),
            obj.write(2, &0u16.to_le_bytes())
        );
        assert_eq!(Err(AbortCode::InvalidValue), obj.write(3, &[0]));
        assert_eq!(Err(AbortCode::InvalidValue), obj.write(4, &[1]));
        assert_eq!(Err(AbortCode::InvalidValue), obj.write(7, &[4]));
        obj.write(7, &[0xAA]).unwrap();
    }

    #[test]
    fn test_map_requires_disabled_srdo() {
        let (srdo, guard) = setup();
        let obj = SrdoMapObject::new(srdo, guard);

        srdo.set_direction_raw(direction::TX);
        assert_eq!(Err(AbortCode::UnsupportedAccess), obj.write(0, &[2]));

        srdo.set_direction_raw(direction::INVALID);
        // Individual maps only writable while the count is zero
        obj.write(1, &0x20000110u32.to_le_bytes()).unwrap();
        obj.write(0, &[2]).unwrap();
        assert_eq!(
            Err(AbortCode::UnsupportedAccess),
            obj.write(1, &0x20000110u32.to_le_bytes())
        );
        // Odd or oversized counts are rejected
        assert_eq!(Err(AbortCode::PdoTooLong), obj.write(0, &[3]));
        assert_eq!(Err(AbortCode::PdoTooLong), obj.write(0, &[18]));
    }

    #[test]
    fn test_valid_flag_latches_crc_check() {
        let (srdo, guard) = setup();
        let _ = srdo;
        let obj = SrdoValidObject::new(guard);
        obj.write(1, &[SRDO_VALID_MAGIC]).unwrap();
        assert_eq!(SRDO_VALID_MAGIC, obj.read_u8(1).unwrap());
        let commands = guard.process(NmtState::PreOperational);
        assert!(commands.validate_checksum);
    }

    #[test]
    fn test_crc_table_write() {
        let (srdo, guard) = setup();
        let srdos = core::slice::from_ref(srdo);
        let obj = SrdoCrcObject::new(srdos, guard);
        assert_eq!(1, obj.read_u8(0).unwrap());
        obj.write(1, &0xBEEFu16.to_le_bytes()).unwrap();
        assert_eq!(0xBEEF, srdo.checksum());
        assert!(!guard.config_valid());
        assert_eq!(Err(AbortCode::NoSuchSubIndex), obj.write(2, &[0, 0]));
    }
}
