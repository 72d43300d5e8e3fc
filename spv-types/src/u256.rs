use std::ops::{Div, Not, Rem, Shl, Shr};

use serde::{Deserialize, Serialize};

/// An unsigned 256-bit integer, stored as two 128-bit halves, most
/// significant first. Only the operations difficulty and chain-work
/// arithmetic need are implemented.
#[derive(
    Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
pub struct U256(u128, u128);

const LIMB_MASK: u128 = u64::MAX as u128;

impl U256 {
    pub const ZERO: U256 = U256(0, 0);

    pub const ONE: U256 = U256(0, 1);

    pub const MAX: U256 = U256(u128::MAX, u128::MAX);

    #[must_use]
    pub const fn new(high: u128, low: u128) -> Self {
        U256(high, low)
    }

    /// Builds a `U256` from 32 big-endian bytes.
    #[must_use]
    pub fn from_be_bytes(bytes: &[u8; 32]) -> U256 {
        let (high, low) = split_in_half(bytes);
        U256(u128::from_be_bytes(high), u128::from_be_bytes(low))
    }

    /// Builds a `U256` from 32 little-endian bytes. This is how a block
    /// hash is read when compared against a target.
    #[must_use]
    pub fn from_le_bytes(bytes: &[u8; 32]) -> U256 {
        let (first, second) = split_in_half(bytes);
        U256(u128::from_le_bytes(second), u128::from_le_bytes(first))
    }

    /// The value as 32 big-endian bytes.
    #[must_use]
    pub fn to_be_bytes(self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..16].copy_from_slice(&self.0.to_be_bytes());
        out[16..].copy_from_slice(&self.1.to_be_bytes());
        out
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == 0 && self.1 == 0
    }

    /// The least number of bits needed to represent the value.
    #[must_use]
    pub fn bits(&self) -> u32 {
        if self.0 > 0 {
            256 - self.0.leading_zeros()
        } else {
            128 - self.1.leading_zeros()
        }
    }

    /// Whether the value fits in `n` bytes, i.e. all higher bytes are zero.
    #[must_use]
    pub fn fits_in_bytes(&self, n: u32) -> bool {
        self.bits() <= n * 8
    }

    /// Calculates 2^256 / (x + 1), the amount of work a target encodes.
    ///
    /// 2**256 / (x + 1) == ~x / (x + 1) + 1
    ///
    /// (Equation shamelessly stolen from bitcoind.)
    #[must_use]
    pub fn inverse(&self) -> U256 {
        // A target of zero or one can never be hit; call the work maximal
        // rather than dividing by zero. The all-ones target does one unit
        // of work per attempt.
        if *self <= U256::ONE {
            return U256::MAX;
        }
        if *self == U256::MAX {
            return U256::ONE;
        }

        let ret = !*self / self.wrapping_inc();
        ret.wrapping_inc()
    }

    /// `self + rhs`, with a flag reporting 256-bit overflow.
    #[must_use = "this returns the result of the operation, without modifying the original"]
    pub fn overflowing_add(self, rhs: Self) -> (Self, bool) {
        let (low, carry) = self.1.overflowing_add(rhs.1);
        let (high, over1) = self.0.overflowing_add(rhs.0);
        let (high, over2) = high.overflowing_add(u128::from(carry));
        (U256(high, low), over1 | over2)
    }

    /// `self * rhs` for a 64-bit multiplier, with an overflow flag.
    #[must_use = "this returns the result of the operation, without modifying the original"]
    pub fn mul_u64(self, rhs: u64) -> (Self, bool) {
        let r = u128::from(rhs);
        // Schoolbook multiply over four 64-bit limbs, least significant
        // first; each partial product fits in 128 bits.
        let products = [
            (self.1 & LIMB_MASK) * r,
            (self.1 >> 64) * r,
            (self.0 & LIMB_MASK) * r,
            (self.0 >> 64) * r,
        ];

        let mut limbs = [0u128; 4];
        let mut carry = 0u128;
        for (limb, product) in limbs.iter_mut().zip(products) {
            // Partial products top out at (2^64-1)^2, so adding the carry
            // cannot wrap a u128.
            let t = product + carry;
            *limb = t & LIMB_MASK;
            carry = t >> 64;
        }

        let value = U256((limbs[3] << 64) | limbs[2], (limbs[1] << 64) | limbs[0]);
        (value, carry != 0)
    }

    /// Quotient and remainder by bitwise long division.
    ///
    /// # Panics
    ///
    /// If `rhs` is zero.
    fn div_rem(self, rhs: Self) -> (Self, Self) {
        let my_bits = self.bits();
        let your_bits = rhs.bits();
        assert!(your_bits != 0, "attempted to divide by zero");

        if my_bits < your_bits {
            return (U256::ZERO, self);
        }

        let mut quotient = U256::ZERO;
        let mut remainder = self;
        let mut shift = my_bits - your_bits;
        let mut divisor = rhs << shift;
        loop {
            if remainder >= divisor {
                remainder = remainder.wrapping_sub(divisor);
                quotient = quotient.set_bit(shift);
            }
            if shift == 0 {
                break;
            }
            shift -= 1;
            divisor = divisor >> 1;
        }

        (quotient, remainder)
    }

    fn set_bit(self, bit: u32) -> Self {
        if bit >= 128 {
            U256(self.0 | (1 << (bit - 128)), self.1)
        } else {
            U256(self.0, self.1 | (1 << bit))
        }
    }

    fn wrapping_sub(self, rhs: Self) -> Self {
        // Two's complement: a - b == a + !b + 1.
        let (ret, _) = self.overflowing_add(!rhs);
        let (ret, _) = ret.overflowing_add(U256::ONE);
        ret
    }

    fn wrapping_inc(&self) -> U256 {
        let low = self.1.wrapping_add(1);
        let high = if low == 0 {
            self.0.wrapping_add(1)
        } else {
            self.0
        };
        U256(high, low)
    }
}

/// Splits a 32 byte array into two 16 byte halves.
fn split_in_half(bytes: &[u8; 32]) -> ([u8; 16], [u8; 16]) {
    let mut first = [0u8; 16];
    let mut second = [0u8; 16];
    first.copy_from_slice(&bytes[..16]);
    second.copy_from_slice(&bytes[16..]);
    (first, second)
}

impl<T: Into<u128>> From<T> for U256 {
    fn from(x: T) -> Self {
        U256(0, x.into())
    }
}

impl Div for U256 {
    type Output = Self;
    fn div(self, rhs: Self) -> Self {
        self.div_rem(rhs).0
    }
}

impl Rem for U256 {
    type Output = Self;
    fn rem(self, rhs: Self) -> Self {
        self.div_rem(rhs).1
    }
}

impl Not for U256 {
    type Output = Self;
    fn not(self) -> Self {
        U256(!self.0, !self.1)
    }
}

impl Shl<u32> for U256 {
    type Output = Self;

    /// Panic-free shift-left; shifts of 256 or more yield zero.
    fn shl(self, shift: u32) -> U256 {
        if shift >= 256 {
            return U256::ZERO;
        }
        if shift >= 128 {
            return U256(self.1 << (shift - 128), 0);
        }
        if shift == 0 {
            return self;
        }
        U256((self.0 << shift) | (self.1 >> (128 - shift)), self.1 << shift)
    }
}

impl Shr<u32> for U256 {
    type Output = Self;

    /// Panic-free shift-right; shifts of 256 or more yield zero.
    fn shr(self, shift: u32) -> U256 {
        if shift >= 256 {
            return U256::ZERO;
        }
        if shift >= 128 {
            return U256(0, self.0 >> (shift - 128));
        }
        if shift == 0 {
            return self;
        }
        U256(self.0 >> shift, (self.1 >> shift) | (self.0 << (128 - shift)))
    }
}
