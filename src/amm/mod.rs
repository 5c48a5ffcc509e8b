//! AMM quoting and marginal pricing
//!
//! Forward quotes and zero-size marginal prices for every pool variant. All
//! amount math is 256-bit base units widened through 512 bits for
//! multiplies; quotes never exceed the output-side reserve. Pure and
//! synchronous: this layer never touches I/O.

pub mod math;
mod stable;

use crate::errors::EngineError;
use crate::types::{Pool, PoolVariant};
use alloy::primitives::{Address, U256, U512};
use math::{mul_div, narrow, u512_to_f64_lossy, widen};

/// 2^96, the fixed-point scale of `sqrt_price_x96`.
fn q96() -> U512 {
    U512::from(1u8) << 96
}

/// Outcome of quoting one hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopQuote {
    pub amount_out: U256,
    /// True when the quote came from a degraded approximation (stable pool
    /// without amplification data). The evaluator folds this into path
    /// confidence.
    pub degraded: bool,
}

impl HopQuote {
    fn exact(amount_out: U256) -> Self {
        Self {
            amount_out,
            degraded: false,
        }
    }
}

/// Spot price of output per unit input at zero size, as a rational.
/// Used only by the ranker; never for sizing.
#[derive(Debug, Clone, Copy)]
pub struct Price {
    pub num: U256,
    pub den: U256,
}

impl Price {
    pub fn to_f64(&self) -> f64 {
        math::ratio_f64(self.num, self.den)
    }
}

/// Quote `amount_in` of `token_in` through `pool`.
///
/// Fails with `UnknownPair` when the token does not belong to the pool,
/// `EmptyReserve` when the input side holds nothing, and `Unquotable` when a
/// concentrated pool has no tick snapshot.
pub fn quote(pool: &Pool, token_in: Address, amount_in: U256) -> Result<HopQuote, EngineError> {
    if !pool.contains(token_in) {
        return Err(EngineError::UnknownPair {
            pool: pool.address,
            token: token_in,
        });
    }
    if amount_in.is_zero() {
        return Ok(HopQuote::exact(U256::ZERO));
    }

    match pool.variant {
        PoolVariant::ConstantProduct => {
            let (rin, rout) = oriented_or_empty(pool, token_in)?;
            Ok(HopQuote::exact(constant_product_out(
                amount_in,
                rin,
                rout,
                pool.fee_bps,
            )))
        }
        PoolVariant::Stable => {
            let (rin, rout) = oriented_or_empty(pool, token_in)?;
            let after_fee = apply_fee(amount_in, pool.fee_bps);
            match pool.metadata.amplification {
                Some(amp) => match stable::get_dy(rin, rout, amp, after_fee) {
                    Some(out) => Ok(HopQuote::exact(out.min(rout))),
                    // Iteration failed on this state; fall back like a pool
                    // with no amplification data.
                    None => Ok(HopQuote {
                        amount_out: constant_product_out(amount_in, rin, rout, pool.fee_bps),
                        degraded: true,
                    }),
                },
                None => Ok(HopQuote {
                    amount_out: constant_product_out(amount_in, rin, rout, pool.fee_bps),
                    degraded: true,
                }),
            }
        }
        PoolVariant::Concentrated => {
            let (rin, rout) = virtual_reserves(pool, token_in)?;
            if rin.is_zero() {
                return Err(EngineError::EmptyReserve { pool: pool.address });
            }
            Ok(HopQuote::exact(constant_product_out(
                amount_in,
                rin,
                rout,
                pool.fee_bps,
            )))
        }
        PoolVariant::Weighted { .. } => {
            let (rin, rout) = oriented_or_empty(pool, token_in)?;
            let (w_in, w_out) = pool.oriented_weights(token_in).ok_or(EngineError::UnknownPair {
                pool: pool.address,
                token: token_in,
            })?;
            Ok(HopQuote::exact(weighted_out(
                amount_in,
                rin,
                rout,
                pool.fee_bps,
                w_in,
                w_out,
            )))
        }
    }
}

/// Marginal price of the output token per unit of `token_in` at zero size.
pub fn marginal_price(pool: &Pool, token_in: Address) -> Result<Price, EngineError> {
    if !pool.contains(token_in) {
        return Err(EngineError::UnknownPair {
            pool: pool.address,
            token: token_in,
        });
    }
    let keep = U256::from(10_000 - pool.fee_bps);
    let scale = U256::from(10_000u64);
    match pool.variant {
        PoolVariant::ConstantProduct => {
            let (rin, rout) = oriented_or_empty(pool, token_in)?;
            Ok(Price {
                num: rout.saturating_mul(keep),
                den: rin.saturating_mul(scale),
            })
        }
        PoolVariant::Concentrated => {
            let (rin, rout) = virtual_reserves(pool, token_in)?;
            if rin.is_zero() {
                return Err(EngineError::EmptyReserve { pool: pool.address });
            }
            Ok(Price {
                num: rout.saturating_mul(keep),
                den: rin.saturating_mul(scale),
            })
        }
        PoolVariant::Weighted { .. } => {
            let (rin, rout) = oriented_or_empty(pool, token_in)?;
            let (w_in, w_out) = pool.oriented_weights(token_in).ok_or(EngineError::UnknownPair {
                pool: pool.address,
                token: token_in,
            })?;
            // Spot price is (rout / w_out) / (rin / w_in); fold the weight
            // ratio into the fee numerator at 1e6 fixed point.
            let w_scale = 1_000_000.0;
            let w_fp = U256::from((w_in / w_out * w_scale) as u64);
            Ok(Price {
                num: mul_div(rout.saturating_mul(keep), w_fp, U256::from(w_scale as u64))
                    .unwrap_or(U256::MAX),
                den: rin.saturating_mul(scale),
            })
        }
        PoolVariant::Stable => {
            // No closed form worth carrying; probe a millionth of the input
            // reserve.
            let (rin, _) = oriented_or_empty(pool, token_in)?;
            let probe = (rin / U256::from(1_000_000u64)).max(U256::from(1u8));
            let out = quote(pool, token_in, probe)?;
            Ok(Price {
                num: out.amount_out,
                den: probe,
            })
        }
    }
}

fn oriented_or_empty(pool: &Pool, token_in: Address) -> Result<(U256, U256), EngineError> {
    let (rin, rout) = pool
        .oriented_reserves(token_in)
        .ok_or(EngineError::EmptyReserve { pool: pool.address })?;
    if rin.is_zero() || rout.is_zero() {
        return Err(EngineError::EmptyReserve { pool: pool.address });
    }
    Ok((rin, rout))
}

/// `amount_in * (1 - fee)` rounded down.
fn apply_fee(amount_in: U256, fee_bps: u32) -> U256 {
    mul_div(
        amount_in,
        U256::from(10_000 - fee_bps),
        U256::from(10_000u64),
    )
    .unwrap_or(U256::ZERO)
}

/// x*y=k output with the fee applied on the way in. Runs in 512 bits end to
/// end; the result is strictly below `rout` so narrowing cannot fail.
fn constant_product_out(amount_in: U256, rin: U256, rout: U256, fee_bps: u32) -> U256 {
    let keep = U512::from(10_000 - fee_bps);
    let scale = U512::from(10_000u64);
    let ain = widen(amount_in) * keep / scale;
    let den = widen(rin) + ain;
    if den.is_zero() {
        return U256::ZERO;
    }
    narrow(ain * widen(rout) / den).unwrap_or(U256::ZERO)
}

/// Weighted-pool output: rout * (1 - (rin / (rin + ain))^(w_in/w_out)).
/// The power term is evaluated as a scalar; amounts stay in base units.
fn weighted_out(
    amount_in: U256,
    rin: U256,
    rout: U256,
    fee_bps: u32,
    w_in: f64,
    w_out: f64,
) -> U256 {
    let keep = U512::from(10_000 - fee_bps);
    let scale = U512::from(10_000u64);
    let ain = widen(amount_in) * keep / scale;
    let rin_w = widen(rin);
    let base = u512_to_f64_lossy(rin_w) / u512_to_f64_lossy(rin_w + ain);
    let factor = (1.0 - base.powf(w_in / w_out)).clamp(0.0, 1.0);
    math::scale_u256(rout, factor).min(rout)
}

/// Virtual reserves of a concentrated pool around its current price:
/// x0 = L * 2^96 / sqrtP, y1 = L * sqrtP / 2^96, oriented for `token_in`.
pub(crate) fn virtual_reserves(pool: &Pool, token_in: Address) -> Result<(U256, U256), EngineError> {
    let snapshot = pool
        .metadata
        .tick_snapshot
        .ok_or_else(|| EngineError::Unquotable {
            pool: pool.address,
            reason: "missing tick snapshot".into(),
        })?;
    if snapshot.sqrt_price_x96.is_zero() || snapshot.liquidity == 0 {
        return Err(EngineError::Unquotable {
            pool: pool.address,
            reason: "empty tick snapshot".into(),
        });
    }
    let liq = U512::from(snapshot.liquidity);
    let sqrt_p = widen(snapshot.sqrt_price_x96);
    let virt0 = narrow(liq * q96() / sqrt_p).ok_or_else(|| EngineError::Unquotable {
        pool: pool.address,
        reason: "virtual reserve overflow".into(),
    })?;
    let virt1 = narrow(liq * sqrt_p / q96()).ok_or_else(|| EngineError::Unquotable {
        pool: pool.address,
        reason: "virtual reserve overflow".into(),
    })?;
    if pool.token0.address == token_in {
        Ok((virt0, virt1))
    } else {
        Ok((virt1, virt0))
    }
}
