//! Chainable CRC-16 computation used for the SRDO configuration signature

use crc16::CrcType as _;

/// Compute the CRC-16/CCITT value of `data`, continuing from `seed`
///
/// Polynomial 0x1021, no reflection, no final xor. Passing the output of one
/// call as the seed of the next produces the same result as hashing the
/// concatenated input, which is how the SRDO signature is built up
/// field-by-field.
pub fn crc16_ccitt(data: &[u8], seed: u16) -> u16 {
    crc16::XMODEM::update(seed, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        // The standard check value for poly 0x1021 with zero init
        assert_eq!(0x31C3, crc16_ccitt(b"123456789", 0));
    }

    #[test]
    fn test_chaining() {
        let whole = crc16_ccitt(b"123456789", 0);
        let first = crc16_ccitt(b"1234", 0);
        assert_eq!(whole, crc16_ccitt(b"56789", first));
    }

    #[test]
    fn test_nonzero_seed() {
        // With an all-ones seed this is the CCITT-FALSE check value
        assert_eq!(0x29B1, crc16_ccitt(b"123456789", 0xFFFF));
    }
}
