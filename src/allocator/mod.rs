//! Multi-path capital allocation
//!
//! Fractional-Kelly sizing across evaluated paths under a reserve fraction,
//! per-path box constraints, and a total budget. Pure and synchronous; the
//! scalar fraction pipeline runs in f64, amounts stay in base units.

use crate::amm::math;
use crate::config::AllocatorConfig;
use crate::errors::EngineError;
use crate::types::{Path, RiskProfile};
use alloy::primitives::U256;
use tracing::debug;

/// Market context supplied by the caller at allocation time.
#[derive(Debug, Clone, Copy)]
pub struct MarketContext {
    /// External volatility hint in [0, 1].
    pub volatility: f64,
    pub risk_profile: RiskProfile,
    /// Input-size damper from the risk model's adaptation protocol, in
    /// (0, 1].
    pub size_scale: f64,
}

impl Default for MarketContext {
    fn default() -> Self {
        Self {
            volatility: 0.0,
            risk_profile: RiskProfile::Moderate,
            size_scale: 1.0,
        }
    }
}

/// Result of one allocation pass.
#[derive(Debug, Clone)]
pub struct AllocationOutcome {
    /// Same length and order as the input paths; zero means "skip".
    pub allocations: Vec<U256>,
    pub budget_used: U256,
    /// Confidence-weighted expected profit in start-token base units.
    pub expected_profit: U256,
    /// Allocation-weighted confidence across funded paths.
    pub combined_confidence: f64,
}

#[derive(Debug, Clone)]
pub struct CapitalAllocator {
    config: AllocatorConfig,
}

impl CapitalAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self { config }
    }

    /// Distribute `budget` across `paths`.
    ///
    /// Fails with `InvalidInput` for a zero budget or structurally bad
    /// paths, and `EmptyCandidateSet` when no path survives the constraint
    /// pass.
    pub fn allocate(
        &self,
        paths: &[Path],
        budget: U256,
        ctx: &MarketContext,
    ) -> Result<AllocationOutcome, EngineError> {
        if budget.is_zero() {
            return Err(EngineError::InvalidInput("allocation budget is zero".into()));
        }
        if paths.is_empty() {
            return Err(EngineError::EmptyCandidateSet);
        }
        let start = paths[0].start_token();
        for path in paths {
            if !path.is_cyclic() {
                return Err(EngineError::NotCyclic);
            }
            if path.start_token() != start {
                return Err(EngineError::InvalidInput(
                    "allocation candidates must share a start token".into(),
                ));
            }
        }

        // Step 1: hold back the reserve.
        let usable = math::scale_u256(budget, 1.0 - self.config.capital_reserve_fraction);
        if usable.is_zero() {
            return Err(EngineError::InvalidInput(
                "capital reserve leaves no usable budget".into(),
            ));
        }

        // Step 2: fractional Kelly per path.
        let mut fractions = self.kelly_fractions(paths)?;

        // Step 3: risk adjustment, then renormalize to keep the budget
        // fully described.
        let multiplier = ctx.risk_profile.risk_multiplier();
        let volatility = ctx.volatility.clamp(0.0, 1.0);
        for (f, path) in fractions.iter_mut().zip(paths) {
            let divisor = 1.0 + (1.0 - path.confidence) * multiplier * (1.0 + volatility);
            *f /= divisor;
        }
        normalize(&mut fractions);

        // Step 4: box constraints and profitability at the allocated size.
        let min_allocation = math::scale_u256(usable, self.config.min_allocation_fraction);
        let max_allocation = math::scale_u256(usable, self.config.max_allocation_fraction);
        let size_scale = ctx.size_scale.clamp(0.0, 1.0);
        let mut allocations: Vec<U256> = fractions
            .iter()
            .zip(paths)
            .map(|(f, path)| {
                let raw = math::scale_u256(usable, *f);
                let path_cap = math::scale_u256(path.optimal_amount_in, size_scale);
                let capped = raw.min(max_allocation).min(path_cap);
                if capped < min_allocation {
                    return U256::ZERO;
                }
                if self.net_profit(path, capped).is_zero() {
                    return U256::ZERO;
                }
                capped
            })
            .collect();

        // Step 5: scale down if the clamped vector exceeds the usable
        // budget.
        let mut total: U256 = allocations
            .iter()
            .fold(U256::ZERO, |acc, a| acc.saturating_add(*a));
        if total > usable {
            for a in allocations.iter_mut() {
                *a = math::mul_div(*a, usable, total).unwrap_or(U256::ZERO);
                if *a < min_allocation {
                    *a = U256::ZERO;
                }
            }
            total = allocations
                .iter()
                .fold(U256::ZERO, |acc, a| acc.saturating_add(*a));
        }

        if total.is_zero() {
            return Err(EngineError::EmptyCandidateSet);
        }

        // Step 6: expected combined profit, confidence-weighted.
        let mut expected_profit = U256::ZERO;
        let mut weighted_confidence = 0.0;
        for (allocation, path) in allocations.iter().zip(paths) {
            if allocation.is_zero() {
                continue;
            }
            let gross = math::mul_div(path.expected_profit, *allocation, path.optimal_amount_in)
                .unwrap_or(U256::ZERO);
            expected_profit =
                expected_profit.saturating_add(math::scale_u256(gross, path.confidence));
            weighted_confidence += path.confidence * math::ratio_f64(*allocation, total);
        }

        debug!(
            candidates = paths.len(),
            funded = allocations.iter().filter(|a| !a.is_zero()).count(),
            budget_used = %total,
            expected_profit = %expected_profit,
            "allocated capital"
        );

        Ok(AllocationOutcome {
            allocations,
            budget_used: total,
            expected_profit,
            combined_confidence: weighted_confidence,
        })
    }

    /// Raw Kelly fractions scaled by `kelly_fraction`, normalized to sum to
    /// one. When every raw fraction is zero (small odds drive Kelly
    /// negative), falls back to weights proportional to the expected edge
    /// p*b so the stronger path still dominates.
    fn kelly_fractions(&self, paths: &[Path]) -> Result<Vec<f64>, EngineError> {
        let kelly_scale = self.config.kelly_fraction.clamp(0.0, 1.0);
        let mut fractions: Vec<f64> = paths
            .iter()
            .map(|path| {
                let p = path.confidence.clamp(0.0, 1.0);
                let b = odds(path);
                if b <= 0.0 {
                    return 0.0;
                }
                let raw = (p * b - (1.0 - p)) / b;
                (raw * kelly_scale).clamp(0.0, 1.0)
            })
            .collect();

        if fractions.iter().sum::<f64>() <= 0.0 {
            for (f, path) in fractions.iter_mut().zip(paths) {
                *f = (path.confidence.clamp(0.0, 1.0) * odds(path)).max(0.0);
            }
        }
        if fractions.iter().sum::<f64>() <= 0.0 {
            return Err(EngineError::EmptyCandidateSet);
        }
        normalize(&mut fractions);
        Ok(fractions)
    }

    /// Expected profit at the allocated size, net of the path's gas cost.
    fn net_profit(&self, path: &Path, allocation: U256) -> U256 {
        if path.optimal_amount_in.is_zero() || path.expected_profit.is_zero() {
            return U256::ZERO;
        }
        let gross = math::mul_div(path.expected_profit, allocation, path.optimal_amount_in)
            .unwrap_or(U256::ZERO);
        gross.saturating_sub(path.gas_cost)
    }
}

/// Odds b = expected_out / optimal_in - 1.
fn odds(path: &Path) -> f64 {
    if path.optimal_amount_in.is_zero() {
        return 0.0;
    }
    math::ratio_f64(path.expected_amount_out, path.optimal_amount_in) - 1.0
}

fn normalize(fractions: &mut [f64]) {
    let sum: f64 = fractions.iter().sum();
    if sum > 0.0 {
        for f in fractions.iter_mut() {
            *f /= sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Pool, PoolMetadata, PoolVariant, Token};
    use alloy::primitives::Address;
    use std::sync::Arc;

    const UNIT: u128 = 1_000_000; // 6-decimal start token

    fn tok(last: u8) -> Token {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Token::new(Address::from(bytes), 6)
    }

    fn dummy_pool(addr_last: u8, a: Token, b: Token) -> Arc<Pool> {
        let mut bytes = [0u8; 20];
        bytes[18] = 0xab;
        bytes[19] = addr_last;
        Arc::new(
            Pool::new(
                Address::from(bytes),
                a,
                b,
                Some((U256::from(100 * UNIT), U256::from(100 * UNIT))),
                30,
                PoolVariant::ConstantProduct,
                "uniswap_v2",
                PoolMetadata::default(),
            )
            .unwrap(),
        )
    }

    /// An evaluated path with the given per-unit profit and confidence.
    fn evaluated_path(mid: u8, profit_fraction: f64, confidence: f64, optimal_units: u128) -> Path {
        let start = tok(1);
        let mid_tok = tok(mid);
        let mut path = Path::new(
            vec![start, mid_tok, start],
            vec![
                dummy_pool(mid.wrapping_mul(2), start, mid_tok),
                dummy_pool(mid.wrapping_mul(2) + 1, start, mid_tok),
            ],
        )
        .unwrap();
        let optimal = optimal_units * UNIT;
        path.optimal_amount_in = U256::from(optimal);
        path.expected_profit = U256::from((optimal as f64 * profit_fraction) as u128);
        path.expected_amount_out = path.optimal_amount_in + path.expected_profit;
        path.confidence = confidence;
        path
    }

    fn allocator() -> CapitalAllocator {
        CapitalAllocator::new(AllocatorConfig::default())
    }

    #[test]
    fn test_two_path_allocation_favors_stronger_path() {
        // Profits 2% and 1%, confidences 0.9 and 0.8, budget 10 with the
        // default 20% reserve.
        let paths = vec![
            evaluated_path(2, 0.02, 0.9, 5),
            evaluated_path(3, 0.01, 0.8, 5),
        ];
        let outcome = allocator()
            .allocate(&paths, U256::from(10 * UNIT), &MarketContext::default())
            .unwrap();
        let a0 = outcome.allocations[0];
        let a1 = outcome.allocations[1];
        assert!(a0 > a1, "stronger path should get more: {a0} vs {a1}");
        assert!(!a1.is_zero());
        assert!(outcome.budget_used <= U256::from(8 * UNIT));
        assert!(!outcome.expected_profit.is_zero());
    }

    #[test]
    fn test_allocations_bounded_by_optimal_input() {
        let mut small = evaluated_path(2, 0.3, 0.95, 1);
        small.gas_cost = U256::ZERO;
        let paths = vec![small];
        let outcome = allocator()
            .allocate(&paths, U256::from(10 * UNIT), &MarketContext::default())
            .unwrap();
        assert!(outcome.allocations[0] <= paths[0].optimal_amount_in);
    }

    #[test]
    fn test_sum_never_exceeds_usable_budget() {
        let paths: Vec<Path> = (0..5)
            .map(|i| evaluated_path(10 + i, 0.25, 0.9, 50))
            .collect();
        let budget = U256::from(10 * UNIT);
        let outcome = allocator()
            .allocate(&paths, budget, &MarketContext::default())
            .unwrap();
        let usable = math::scale_u256(budget, 0.8);
        assert!(outcome.budget_used <= usable);
        for a in &outcome.allocations {
            assert!(*a <= usable);
        }
    }

    #[test]
    fn test_positive_kelly_split_is_even_for_twins() {
        let paths = vec![
            evaluated_path(2, 0.5, 0.9, 10),
            evaluated_path(3, 0.5, 0.9, 10),
        ];
        let outcome = allocator()
            .allocate(&paths, U256::from(20 * UNIT), &MarketContext::default())
            .unwrap();
        let a0 = outcome.allocations[0].to::<u128>() as f64;
        let a1 = outcome.allocations[1].to::<u128>() as f64;
        assert!((a0 / a1 - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_conservative_profile_penalizes_low_confidence_harder() {
        let paths = vec![
            evaluated_path(2, 1.5, 0.95, 10),
            evaluated_path(3, 1.5, 0.55, 10),
        ];
        let share = |profile: RiskProfile| {
            let ctx = MarketContext {
                risk_profile: profile,
                ..MarketContext::default()
            };
            let outcome = allocator()
                .allocate(&paths, U256::from(20 * UNIT), &ctx)
                .unwrap();
            let risky = outcome.allocations[1].to::<u128>() as f64;
            let total = outcome.budget_used.to::<u128>() as f64;
            risky / total
        };
        assert!(share(RiskProfile::Conservative) < share(RiskProfile::Aggressive));
    }

    #[test]
    fn test_gas_cost_can_zero_out_a_path() {
        let mut path = evaluated_path(2, 0.01, 0.9, 5);
        // Gas swamps the expected profit at any allocatable size.
        path.gas_cost = U256::from(UNIT);
        let err = allocator().allocate(
            &[path],
            U256::from(10 * UNIT),
            &MarketContext::default(),
        );
        assert!(matches!(err, Err(EngineError::EmptyCandidateSet)));
    }

    #[test]
    fn test_zero_budget_rejected() {
        let paths = vec![evaluated_path(2, 0.02, 0.9, 5)];
        assert!(matches!(
            allocator().allocate(&paths, U256::ZERO, &MarketContext::default()),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_mismatched_start_tokens_rejected() {
        let a = evaluated_path(2, 0.02, 0.9, 5);
        let mut b = evaluated_path(3, 0.02, 0.9, 5);
        b.tokens[0] = tok(9);
        b.tokens[2] = tok(9);
        assert!(matches!(
            allocator().allocate(&[a, b], U256::from(10 * UNIT), &MarketContext::default()),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_size_scale_caps_allocation() {
        let paths = vec![evaluated_path(2, 0.5, 0.9, 10)];
        let ctx = MarketContext {
            size_scale: 0.5,
            ..MarketContext::default()
        };
        let outcome = allocator()
            .allocate(&paths, U256::from(100 * UNIT), &ctx)
            .unwrap();
        assert!(outcome.allocations[0] <= U256::from(5 * UNIT));
    }
}
