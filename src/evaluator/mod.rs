//! Path evaluation
//!
//! Computes the optimal input amount for a cyclic path by golden-section
//! search on f(x) = output(x) - x, along with expected output, confidence,
//! and the gas estimate. Pure over quoted hops; never yields.

use crate::amm::{self, math};
use crate::config::EvaluatorConfig;
use crate::errors::EngineError;
use crate::gas;
use crate::types::{Path, PoolVariant};
use alloy::primitives::U256;
use std::cmp::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Confidence factor for a hop whose reserves are older than the staleness
/// threshold.
const STALE_CONFIDENCE: f64 = 0.95;
/// Confidence factor for the degraded stable-swap approximation.
const DEGRADED_STABLE_CONFIDENCE: f64 = 0.9;
/// Confidence factor for the single-range concentrated approximation.
const CONCENTRATED_CONFIDENCE: f64 = 0.95;

/// Extra decades probed past the standard grid before the evaluator decides
/// the profit curve is not unimodal.
const GRID_EXTENSIONS: usize = 2;

#[derive(Debug, Clone)]
pub struct PathEvaluator {
    config: EvaluatorConfig,
}

impl PathEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { config }
    }

    /// Populate the derived fields of a cyclic path. `gas_price_gwei` prices
    /// the gas estimate into native base units.
    ///
    /// Fails with `NotCyclic` for open paths and `NoProfitableInput` when no
    /// probe bracketed a profitable amount. Quote failures (e.g. a hop going
    /// unquotable) propagate so the caller can drop the path.
    pub fn evaluate(&self, path: &mut Path, gas_price_gwei: f64) -> Result<(), EngineError> {
        if !path.is_cyclic() {
            return Err(EngineError::NotCyclic);
        }

        let (optimal, out) = self.optimal_input(path)?;
        let profit = out.saturating_sub(optimal);
        if profit.is_zero() {
            return Err(EngineError::NoProfitableInput);
        }

        path.optimal_amount_in = optimal;
        path.expected_amount_out = out;
        path.expected_profit = profit;
        path.confidence = self.path_confidence(path);
        path.gas_estimate = gas::estimate_path_gas(path, self.config.gas_buffer);
        path.gas_cost = gas::gas_cost_base_units(path.gas_estimate, gas_price_gwei);

        debug!(
            path = %path,
            optimal = %optimal,
            profit = %profit,
            confidence = path.confidence,
            "evaluated path"
        );
        Ok(())
    }

    /// Product of per-hop confidences. Fresh, fully populated pools score
    /// 1.0; staleness, degraded stable math, and the concentrated
    /// approximation each degrade the hop.
    fn path_confidence(&self, path: &Path) -> f64 {
        let threshold = Duration::from_secs(self.config.pool_staleness_threshold_seconds);
        let now = Instant::now();
        path.pools
            .iter()
            .map(|pool| {
                let mut hop = 1.0f64;
                if pool.is_stale(threshold, now) {
                    hop *= STALE_CONFIDENCE;
                }
                match pool.variant {
                    PoolVariant::Stable if pool.metadata.amplification.is_none() => {
                        hop *= DEGRADED_STABLE_CONFIDENCE;
                    }
                    PoolVariant::Concentrated => {
                        hop *= CONCENTRATED_CONFIDENCE;
                    }
                    _ => {}
                }
                hop
            })
            .product()
    }

    /// Compose the per-hop quotes along the whole cycle.
    fn path_output(&self, path: &Path, amount_in: U256) -> Result<U256, EngineError> {
        let mut amount = amount_in;
        for (i, pool) in path.pools.iter().enumerate() {
            amount = amm::quote(pool, path.tokens[i].address, amount)?.amount_out;
            if amount.is_zero() {
                return Ok(U256::ZERO);
            }
        }
        Ok(amount)
    }

    /// Bracket by geometric probes, then contract with golden-section until
    /// the relative bracket width drops below the configured tolerance.
    fn optimal_input(&self, path: &Path) -> Result<(U256, U256), EngineError> {
        let unit = path.start_token().one();
        let mut probes: Vec<U256> = [
            unit / U256::from(100u64),
            unit / U256::from(10u64),
            unit,
            unit * U256::from(10u64),
            unit * U256::from(100u64),
        ]
        .into_iter()
        .filter(|p| !p.is_zero())
        .collect();

        let mut best_idx = None;
        let mut best_profit = Profit::LOSS;
        let mut evaluate = |x: U256, path: &Path| -> Result<Profit, EngineError> {
            let out = self.path_output(path, x)?;
            Ok(Profit::of(out, x))
        };

        let mut i = 0;
        while i < probes.len() {
            let p = evaluate(probes[i], path)?;
            if p.gain && best_profit.cmp_to(&p) == Ordering::Less {
                best_profit = p;
                best_idx = Some(i);
            }
            // Profit still rising at the grid edge: extend before concluding.
            if i + 1 == probes.len()
                && best_idx == Some(i)
                && probes.len() < 5 + GRID_EXTENSIONS
            {
                probes.push(probes[i] * U256::from(10u64));
            }
            i += 1;
        }

        let best = match best_idx {
            Some(idx) => idx,
            None => return Err(EngineError::NoProfitableInput),
        };

        if best + 1 == probes.len() && probes.len() > 5 {
            // Still rising after two extra decades: the curve is not
            // behaving unimodally. Fall back to a dense grid rather than
            // guessing.
            warn!(path = %path, "profit not unimodal across probe grid; using grid search");
            return self.grid_search(path, probes[0], probes[best]);
        }

        let lo = if best == 0 {
            probes[best] / U256::from(10u64)
        } else {
            probes[best - 1]
        };
        let hi = if best + 1 < probes.len() {
            probes[best + 1]
        } else {
            probes[best] * U256::from(10u64)
        };

        self.golden_section(path, lo, hi)
    }

    fn golden_section(
        &self,
        path: &Path,
        mut lo: U256,
        mut hi: U256,
    ) -> Result<(U256, U256), EngineError> {
        // 1 - 1/phi and 1/phi at 1e3 fixed point.
        let a_num = U256::from(382u64);
        let b_num = U256::from(618u64);
        let den = U256::from(1_000u64);

        for _ in 0..200 {
            let span = hi.saturating_sub(lo);
            let floor = math::scale_u256(hi, self.config.optimal_search_tolerance).max(U256::from(1u8));
            if span <= floor {
                break;
            }
            let x1 = lo + span * a_num / den;
            let x2 = lo + span * b_num / den;
            let p1 = Profit::of(self.path_output(path, x1)?, x1);
            let p2 = Profit::of(self.path_output(path, x2)?, x2);
            if p1.cmp_to(&p2) == Ordering::Greater {
                hi = x2;
            } else {
                lo = x1;
            }
        }

        let mid = (lo + hi) / U256::from(2u8);
        let out = self.path_output(path, mid)?;
        if out <= mid {
            return Err(EngineError::NoProfitableInput);
        }
        Ok((mid, out))
    }

    /// Dense geometric sweep between `lo` and `hi`; the non-unimodal escape
    /// hatch.
    fn grid_search(&self, path: &Path, lo: U256, hi: U256) -> Result<(U256, U256), EngineError> {
        let mut best: Option<(U256, U256)> = None;
        let mut best_profit = Profit::LOSS;
        let mut x = lo.max(U256::from(1u8));
        // 16 points per decade: step of 10^(1/16) ~ 1.155.
        let step_num = U256::from(1_155u64);
        let step_den = U256::from(1_000u64);
        while x <= hi {
            let out = self.path_output(path, x)?;
            let p = Profit::of(out, x);
            if p.gain && best_profit.cmp_to(&p) == Ordering::Less {
                best_profit = p;
                best = Some((x, out));
            }
            let next = x * step_num / step_den;
            x = if next > x { next } else { x + U256::from(1u8) };
        }
        best.ok_or(EngineError::NoProfitableInput)
    }
}

/// Signed profit of a probe, ordered loss < smaller gain < larger gain.
#[derive(Debug, Clone, Copy)]
struct Profit {
    gain: bool,
    magnitude: U256,
}

impl Profit {
    const LOSS: Self = Self {
        gain: false,
        magnitude: U256::MAX,
    };

    fn of(out: U256, x: U256) -> Self {
        if out > x {
            Self {
                gain: true,
                magnitude: out - x,
            }
        } else {
            Self {
                gain: false,
                magnitude: x - out,
            }
        }
    }

    fn cmp_to(&self, other: &Self) -> Ordering {
        match (self.gain, other.gain) {
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (true, true) => self.magnitude.cmp(&other.magnitude),
            // Both losing: the smaller loss ranks higher.
            (false, false) => other.magnitude.cmp(&self.magnitude),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Pool, PoolMetadata, Token};
    use alloy::primitives::Address;
    use std::sync::Arc;

    fn tok(last: u8, decimals: u8) -> Token {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Token::new(Address::from(bytes), decimals)
    }

    fn cp_pool(addr_last: u8, a: Token, b: Token, ra: u128, rb: u128, fee: u32) -> Arc<Pool> {
        let mut bytes = [0u8; 20];
        bytes[18] = 0xee;
        bytes[19] = addr_last;
        Arc::new(
            Pool::new(
                Address::from(bytes),
                a,
                b,
                Some((U256::from(ra), U256::from(rb))),
                fee,
                PoolVariant::ConstantProduct,
                "uniswap_v2",
                PoolMetadata::default(),
            )
            .unwrap(),
        )
    }

    fn evaluator() -> PathEvaluator {
        PathEvaluator::new(EvaluatorConfig::default())
    }

    const WAD: u128 = 1_000_000_000_000_000_000;

    /// Pool A: 1000 TKN / 2000 USD, pool B: 2000 USD / 1010 TKN, both 30 bps.
    fn arb_path() -> Path {
        let tkn = tok(1, 18);
        let usd = tok(2, 18);
        let a = cp_pool(1, tkn, usd, 1_000 * WAD, 2_000 * WAD, 30);
        let b = cp_pool(2, tkn, usd, 1_010 * WAD, 2_000 * WAD, 30);
        Path::new(vec![tkn, usd, tkn], vec![a, b]).unwrap()
    }

    #[test]
    fn test_single_cycle_positive_arb() {
        let mut path = arb_path();
        evaluator().evaluate(&mut path, 30.0).unwrap();

        // Analytic optimum for these reserves/fees is ~0.99 TKN with
        // ~0.0020 TKN profit.
        let optimal = path.optimal_amount_in.to::<u128>() as f64 / WAD as f64;
        assert!((0.8..1.2).contains(&optimal), "optimal {optimal}");
        let profit = path.expected_profit.to::<u128>() as f64 / WAD as f64;
        assert!(profit > 0.0018 && profit < 0.0022, "profit {profit}");
        assert_eq!(
            path.expected_amount_out,
            path.optimal_amount_in + path.expected_profit
        );
        assert_eq!(path.confidence, 1.0);
        assert!(path.gas_estimate > 21_000);
        assert!(!path.gas_cost.is_zero());
    }

    #[test]
    fn test_optimum_beats_half_optimum() {
        let mut path = arb_path();
        let eval = evaluator();
        eval.evaluate(&mut path, 30.0).unwrap();
        let at = |x: U256| {
            let out = eval.path_output(&path, x).unwrap();
            out.to::<u128>() as i128 - x.to::<u128>() as i128
        };
        let best = at(path.optimal_amount_in);
        let half = at(path.optimal_amount_in / U256::from(2u8));
        // Allow the relative tolerance of the contracted bracket.
        assert!(best as f64 >= half as f64 * (1.0 - 1e-4));
    }

    #[test]
    fn test_no_arb_identical_pools() {
        let tkn = tok(1, 18);
        let usd = tok(2, 18);
        let a = cp_pool(1, tkn, usd, 1_000 * WAD, 2_000 * WAD, 30);
        let b = cp_pool(2, tkn, usd, 1_000 * WAD, 2_000 * WAD, 30);
        let mut path = Path::new(vec![tkn, usd, tkn], vec![a, b]).unwrap();
        let err = evaluator().evaluate(&mut path, 30.0);
        assert!(matches!(err, Err(EngineError::NoProfitableInput)));
    }

    #[test]
    fn test_open_path_rejected() {
        let tkn = tok(1, 18);
        let usd = tok(2, 18);
        let a = cp_pool(1, tkn, usd, 1_000 * WAD, 2_000 * WAD, 30);
        let mut path = Path::new(vec![tkn, usd], vec![a]).unwrap();
        assert!(matches!(
            evaluator().evaluate(&mut path, 30.0),
            Err(EngineError::NotCyclic)
        ));
    }

    #[test]
    fn test_zero_fee_mirror_pools_roundtrip_flat() {
        // Identical reserves, zero fees: output(x) <= x everywhere, profit 0.
        let tkn = tok(1, 18);
        let usd = tok(2, 18);
        let a = cp_pool(1, tkn, usd, 1_000 * WAD, 1_000 * WAD, 0);
        let b = cp_pool(2, tkn, usd, 1_000 * WAD, 1_000 * WAD, 0);
        let path = Path::new(vec![tkn, usd, tkn], vec![a, b]).unwrap();
        let eval = evaluator();
        let x = U256::from(WAD);
        let out = eval.path_output(&path, x).unwrap();
        let loss = x.to::<u128>() - out.to::<u128>();
        // Round trip through mirrored zero-fee pools only loses rounding and
        // its own price impact; at 0.1% of the pool that is tiny.
        assert!(loss < WAD / 400, "loss {loss}");
        assert!(matches!(
            eval.evaluate(&mut path.clone(), 30.0),
            Err(EngineError::NoProfitableInput)
        ));
    }

    #[test]
    fn test_stale_pool_degrades_confidence() {
        let mut path = arb_path();
        {
            let pool = Arc::get_mut(&mut path.pools[0]).unwrap();
            pool.last_refreshed_at = Instant::now() - Duration::from_secs(3_600);
        }
        evaluator().evaluate(&mut path, 30.0).unwrap();
        assert!(path.confidence <= 0.95);
        assert!(path.confidence > 0.9);
    }

    #[test]
    fn test_unquotable_hop_propagates() {
        let tkn = tok(1, 18);
        let usd = tok(2, 18);
        let a = cp_pool(1, tkn, usd, 1_000 * WAD, 2_000 * WAD, 30);
        let concentrated = Arc::new(
            Pool::new(
                Address::repeat_byte(9),
                tkn,
                usd,
                None,
                30,
                PoolVariant::Concentrated,
                "uniswap_v3",
                PoolMetadata::default(),
            )
            .unwrap(),
        );
        let mut path = Path::new(vec![tkn, usd, tkn], vec![a, concentrated]).unwrap();
        assert!(matches!(
            evaluator().evaluate(&mut path, 30.0),
            Err(EngineError::Unquotable { .. })
        ));
    }
}
