//! The compact 32-bit "bits" encoding of a 256-bit proof-of-work target,
//! and the work a target represents.

use crate::hash::H256;
use crate::u256::U256;

/// A fully expanded proof-of-work threshold.
pub type Target = U256;
/// Expected hash attempts to find a block at some target.
pub type Work = U256;

/// Expands a compact encoding into a target.
///
/// This is a floating-point format originally used by OpenSSL, which
/// satoshi put into consensus code, so we're stuck with it: the top byte
/// is a base-256 exponent and the low 24 bits a signed mantissa. Returns
/// `None` when the mantissa is negative or the value does not fit in 256
/// bits; such bits can never label honest work.
#[must_use]
pub fn target_from_bits(bits: u32) -> Option<Target> {
    let exponent = bits >> 24;
    let mantissa = bits & 0x00FF_FFFF;

    if mantissa & 0x0080_0000 != 0 {
        return None;
    }

    if exponent <= 3 {
        // The mantissa itself is shifted down; nothing can overflow.
        Some(U256::from(mantissa >> (8 * (3 - exponent))))
    } else {
        let shift = 8 * (exponent - 3);
        let value = U256::from(mantissa) << shift;
        // A non-zero mantissa shifted entirely (or partially) out of range
        // means the encoded value exceeds 2^256.
        if mantissa != 0 && (value >> shift) != U256::from(mantissa) {
            return None;
        }
        Some(value)
    }
}

/// Packs a target back into compact form. Inverse of [`target_from_bits`]
/// for canonical encodings.
#[must_use]
pub fn target_to_bits(target: &Target) -> u32 {
    let mut size = (target.bits() + 7) / 8;
    let mut compact: u32 = if size <= 3 {
        let shifted = *target << (8 * (3 - size));
        low_u32(&shifted)
    } else {
        let shifted = *target >> (8 * (size - 3));
        low_u32(&shifted) & 0x00FF_FFFF
    };

    // A mantissa with its sign bit set would read back negative; shift it
    // into the exponent instead.
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }

    compact | (size << 24)
}

/// The work a target encodes: `floor(2^256 / (target + 1))`.
#[must_use]
pub fn work_from_target(target: &Target) -> Work {
    target.inverse()
}

/// Whether a block hash satisfies a target. The hash's natural bytes are
/// read as a little-endian 256-bit integer, i.e. the reversed display
/// form is the number being compared.
#[must_use]
pub fn target_met(hash: &H256, target: &Target) -> bool {
    U256::from_le_bytes(&hash.0) <= *target
}

fn low_u32(value: &U256) -> u32 {
    u32::from_be_bytes(value.to_be_bytes()[28..].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_bits_expand_to_known_target() {
        let target = target_from_bits(0x1d00_ffff).unwrap();
        // 0x00000000ffff0000...0000: the mantissa sits 26 bytes up.
        let mut expected = [0u8; 32];
        expected[4] = 0xff;
        expected[5] = 0xff;
        assert_eq!(target, U256::from_be_bytes(&expected));
        assert_eq!(target_to_bits(&target), 0x1d00_ffff);
    }

    #[test]
    fn small_exponents_shift_the_mantissa_down() {
        assert_eq!(target_from_bits(0x0100_0012), Some(U256::ZERO));
        assert_eq!(target_from_bits(0x0200_1234), Some(U256::from(0x12u32)));
        assert_eq!(target_from_bits(0x0300_1234), Some(U256::from(0x1234u32)));
        assert_eq!(target_from_bits(0x0400_1234), Some(U256::from(0x123400u32)));
    }

    #[test]
    fn negative_mantissa_rejected() {
        assert_eq!(target_from_bits(0x0480_0001), None);
        assert_eq!(target_from_bits(0x1d80_0000), None);
    }

    #[test]
    fn oversized_target_rejected() {
        // Exponent 0x22 shifts a full mantissa past 256 bits, as does a
        // 23-bit mantissa under exponent 0x21.
        assert_eq!(target_from_bits(0x2200_ffff), None);
        assert_eq!(target_from_bits(0x217f_ffff), None);
        assert_eq!(target_from_bits(0xff00_0001), None);
        // The largest encodable value still fits in 256 bits.
        assert_eq!(
            target_from_bits(0x2100_ffff),
            Some(U256::from(0xffffu32) << 240)
        );
        // And a zero mantissa is just zero, however wild the exponent.
        assert_eq!(target_from_bits(0xff00_0000), Some(U256::ZERO));
    }

    #[test]
    fn round_trip_over_real_mainnet_bits() {
        for bits in [0x1d00_ffffu32, 0x1b04_04cb, 0x1729_d72d, 0x1703_4219] {
            let target = target_from_bits(bits).unwrap();
            assert_eq!(target_to_bits(&target), bits);
        }
    }

    #[test]
    fn encode_avoids_negative_mantissa() {
        // 0x80 in the top mantissa byte must be pushed into the exponent.
        let target = U256::from(0x0080_0000u32);
        let bits = target_to_bits(&target);
        assert_eq!(bits, 0x0400_8000);
        assert_eq!(target_from_bits(bits), Some(target));
    }

    #[test]
    fn work_of_genesis_target() {
        let target = target_from_bits(0x1d00_ffff).unwrap();
        assert_eq!(work_from_target(&target), U256::from(0x1_0001_0001u64));
    }

    #[test]
    fn hash_meets_target_iff_numerically_below() {
        let target = target_from_bits(0x1d00_ffff).unwrap();
        // The genesis hash famously satisfies the genesis target.
        let genesis: H256 = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
            .parse()
            .unwrap();
        assert!(target_met(&genesis, &target));

        // All-ones can satisfy nothing but the maximal target.
        let worst = H256([0xff; 32]);
        assert!(!target_met(&worst, &target));
        assert!(target_met(&worst, &U256::MAX));
    }
}
