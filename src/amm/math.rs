//! Fixed-width big-integer helpers
//!
//! All amount math runs in base units on `U256`, widening through `U512` for
//! every multiply so intermediates cannot overflow. Narrowing back saturates
//! to zero, which callers treat as "no output". Floating point appears only
//! when a value is reduced to a scalar score or ratio.

use alloy::primitives::{U256, U512};

pub(crate) fn widen(x: U256) -> U512 {
    U512::from_be_slice(&x.to_be_bytes::<32>())
}

/// Narrow a 512-bit value back to 256 bits. None when the upper half is
/// non-zero.
pub(crate) fn narrow(x: U512) -> Option<U256> {
    let bytes = x.to_be_bytes::<64>();
    if bytes[..32].iter().any(|b| *b != 0) {
        return None;
    }
    Some(U256::from_be_slice(&bytes[32..]))
}

/// `a * b / den` with a 512-bit intermediate. None when `den` is zero or the
/// result does not fit 256 bits.
pub fn mul_div(a: U256, b: U256, den: U256) -> Option<U256> {
    if den.is_zero() {
        return None;
    }
    narrow(widen(a) * widen(b) / widen(den))
}

/// Lossy conversion keeping the top 128 bits of precision.
pub fn to_f64_lossy(x: U256) -> f64 {
    let bits = x.bit_len();
    if bits <= 128 {
        x.to::<u128>() as f64
    } else {
        let shift = bits - 128;
        (x >> shift).to::<u128>() as f64 * 2f64.powi(shift as i32)
    }
}

pub(crate) fn u512_to_f64_lossy(x: U512) -> f64 {
    let bits = x.bit_len();
    if bits <= 128 {
        x.to::<u128>() as f64
    } else {
        let shift = bits - 128;
        (x >> shift).to::<u128>() as f64 * 2f64.powi(shift as i32)
    }
}

/// `num / den` as a scalar. Zero when the denominator is zero.
pub fn ratio_f64(num: U256, den: U256) -> f64 {
    if den.is_zero() {
        return 0.0;
    }
    to_f64_lossy(num) / to_f64_lossy(den)
}

/// Fixed-point scale factor used when multiplying amounts by scalar
/// fractions.
const SCALE: u64 = 1_000_000_000;

/// Multiply an amount by a non-negative scalar via 1e9 fixed point.
/// Factors above ~1.8e10 saturate the fixed-point representation.
pub fn scale_u256(x: U256, factor: f64) -> U256 {
    if factor <= 0.0 || x.is_zero() {
        return U256::ZERO;
    }
    let fp = (factor * SCALE as f64).round();
    let fp = if fp >= u128::MAX as f64 {
        u128::MAX
    } else {
        fp as u128
    };
    mul_div(x, U256::from(fp), U256::from(SCALE)).unwrap_or(U256::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mul_div_widens() {
        // (2^200 * 2^200) / 2^200 = 2^200; the product alone would overflow
        // U256.
        let big = U256::from(1u8) << 200;
        assert_eq!(mul_div(big, big, big), Some(big));
    }

    #[test]
    fn test_mul_div_zero_denominator() {
        assert_eq!(mul_div(U256::from(1u8), U256::from(1u8), U256::ZERO), None);
    }

    #[test]
    fn test_mul_div_overflow_is_none() {
        let big = U256::MAX;
        assert_eq!(mul_div(big, big, U256::from(1u8)), None);
    }

    #[test]
    fn test_to_f64_lossy_small_exact() {
        assert_eq!(to_f64_lossy(U256::from(12_345u64)), 12_345.0);
    }

    #[test]
    fn test_to_f64_lossy_large() {
        let x = U256::from(1u8) << 250;
        let f = to_f64_lossy(x);
        let expected = 2f64.powi(250);
        assert!((f / expected - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_ratio_f64() {
        assert!((ratio_f64(U256::from(1u8), U256::from(4u8)) - 0.25).abs() < 1e-12);
        assert_eq!(ratio_f64(U256::from(1u8), U256::ZERO), 0.0);
    }

    #[test]
    fn test_scale_u256() {
        let x = U256::from(1_000_000u64);
        assert_eq!(scale_u256(x, 0.5), U256::from(500_000u64));
        assert_eq!(scale_u256(x, 0.0), U256::ZERO);
        assert_eq!(scale_u256(x, 1.0), x);
    }
}
