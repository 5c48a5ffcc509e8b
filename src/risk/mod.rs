//! Slippage prediction and risk scoring
//!
//! Per-hop slippage models with rolling observed-slippage windows on three
//! axes (pool, token, DEX), a dynamic tolerance, and the post-execution
//! adaptation protocol. Windows are fed by the execution layer and read
//! during evaluation; DashMap keeps both sides lock-cheap.

use crate::amm::{self, math};
use crate::config::RiskConfig;
use crate::types::{Path, Pool, PoolVariant};
use alloy::primitives::{Address, U256};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::debug;

/// Floor below which the adaptive base tolerance never falls (0.1%).
const MIN_BASE_TOLERANCE: f64 = 0.001;
/// Multiplicative shrink applied to future input sizes after excessive
/// observed slippage.
const SIZE_SHRINK: f64 = 0.8;
/// Floor for the input-size damper.
const MIN_SIZE_SCALE: f64 = 0.1;
/// Tolerance addend per hop beyond the first (0.5%).
const COMPLEXITY_STEP: f64 = 0.005;
/// Maximum tolerance addend driven by market volatility (1%).
const VOLATILITY_STEP: f64 = 0.01;
/// Maximum tolerance addend driven by the input/reserve ratio (1%).
const AMOUNT_STEP: f64 = 0.01;

/// Slippage and risk model with adaptive state.
pub struct RiskModel {
    config: RiskConfig,
    base_tolerance: Mutex<f64>,
    size_scale: Mutex<f64>,
    pool_history: DashMap<Address, VecDeque<f64>>,
    token_history: DashMap<Address, VecDeque<f64>>,
    dex_history: DashMap<String, VecDeque<f64>>,
}

impl RiskModel {
    pub fn new(config: RiskConfig) -> Self {
        let base = config
            .base_slippage_tolerance
            .clamp(MIN_BASE_TOLERANCE, config.max_slippage_tolerance);
        Self {
            config,
            base_tolerance: Mutex::new(base),
            size_scale: Mutex::new(1.0),
            pool_history: DashMap::new(),
            token_history: DashMap::new(),
            dex_history: DashMap::new(),
        }
    }

    /// Current adaptive base tolerance.
    pub fn base_tolerance(&self) -> f64 {
        *self.base_tolerance.lock().expect("tolerance lock")
    }

    /// Multiplicative damper on future input sizes, in (0, 1].
    pub fn size_scale(&self) -> f64 {
        *self.size_scale.lock().expect("size scale lock")
    }

    /// Model-predicted slippage for one hop at the given input amount.
    pub fn hop_slippage(&self, pool: &Pool, token_in: Address, amount_in: U256) -> f64 {
        let reserve_in = match pool.variant {
            PoolVariant::Concentrated => amm::virtual_reserves(pool, token_in)
                .map(|(rin, _)| rin)
                .unwrap_or(U256::ZERO),
            _ => pool
                .oriented_reserves(token_in)
                .map(|(rin, _)| rin)
                .unwrap_or(U256::ZERO),
        };
        if reserve_in.is_zero() {
            return self.config.max_slippage_tolerance;
        }
        let ratio = math::ratio_f64(amount_in, reserve_in);
        match pool.variant {
            PoolVariant::Stable => 0.5 * ratio * ratio,
            // Constant-product, weighted, and the concentrated projection all
            // follow the quadratic impact model.
            _ => ratio * ratio,
        }
    }

    /// Predicted slippage across a whole path: per-hop predictions summed
    /// (a conservative overapproximation), lifted to the historical p95 on
    /// every axis, and capped at the maximum tolerance.
    pub fn predict_path_slippage(&self, path: &Path, amount_in: U256) -> f64 {
        let mut amount = amount_in;
        let mut predicted = 0.0;
        for (i, pool) in path.pools.iter().enumerate() {
            let token_in = path.tokens[i].address;
            predicted += self.hop_slippage(pool, token_in, amount);
            amount = match amm::quote(pool, token_in, amount) {
                Ok(q) => q.amount_out,
                Err(_) => {
                    predicted = self.config.max_slippage_tolerance;
                    break;
                }
            };
        }
        let historical = self.historical_p95(path);
        predicted
            .max(historical)
            .min(self.config.max_slippage_tolerance)
    }

    /// Dynamic tolerance for a path: adaptive base, plus complexity,
    /// volatility, and amount addends, buffered and capped.
    pub fn adjusted_tolerance(&self, path: &Path, market_volatility: f64, amount_in: U256) -> f64 {
        let mut tolerance = self.base_tolerance();
        tolerance += COMPLEXITY_STEP * path.hops().saturating_sub(1) as f64;
        tolerance += VOLATILITY_STEP * market_volatility.clamp(0.0, 1.0);
        tolerance += AMOUNT_STEP * self.amount_factor(path, amount_in);
        tolerance *= self.config.slippage_buffer.max(1.0);
        tolerance.min(self.config.max_slippage_tolerance)
    }

    /// Risk score in [0, 1], higher is riskier.
    pub fn risk_score(&self, path: &Path, market_volatility: f64) -> f64 {
        let hops = (path.hops() as f64 / 5.0).clamp(0.0, 1.0);
        let score = 0.5 * (1.0 - path.confidence.clamp(0.0, 1.0))
            + 0.3 * hops
            + 0.2 * market_volatility.clamp(0.0, 1.0);
        score.clamp(0.0, 1.0)
    }

    /// Feed an observed execution back into the windows and adapt the base
    /// tolerance and size damper.
    pub fn record_execution(&self, path: &Path, observed_slippage: f64) {
        let observed = observed_slippage.max(0.0);
        let window = self.config.history_window.max(1);
        for pool in &path.pools {
            push_sample(&self.pool_history, pool.address, observed, window);
            push_sample(&self.dex_history, pool.dex_id.clone(), observed, window);
        }
        for token in &path.tokens {
            push_sample(&self.token_history, token.address, observed, window);
        }

        let rate = self.config.adaptation_rate.clamp(0.0, 1.0);
        let mut base = self.base_tolerance.lock().expect("tolerance lock");
        let mut scale = self.size_scale.lock().expect("size scale lock");
        if observed > self.config.max_slippage_tolerance {
            *base = (*base * (1.0 + rate)).min(self.config.max_slippage_tolerance);
            *scale = (*scale * SIZE_SHRINK).max(MIN_SIZE_SCALE);
            debug!(
                observed,
                base = *base,
                scale = *scale,
                "observed slippage above tolerance; tightening"
            );
        } else if observed < 0.5 * *base {
            *base = (*base * (1.0 - rate)).max(MIN_BASE_TOLERANCE);
            *scale = (*scale / SIZE_SHRINK).min(1.0);
        }
    }

    /// Worst historical p95 across the path's pool, token, and DEX axes.
    fn historical_p95(&self, path: &Path) -> f64 {
        let mut worst = 0.0f64;
        for pool in &path.pools {
            if let Some(w) = self.pool_history.get(&pool.address) {
                worst = worst.max(p95(&w));
            }
            if let Some(w) = self.dex_history.get(&pool.dex_id) {
                worst = worst.max(p95(&w));
            }
        }
        for token in &path.tokens {
            if let Some(w) = self.token_history.get(&token.address) {
                worst = worst.max(p95(&w));
            }
        }
        worst
    }

    /// Input size relative to the largest input-side reserve on the path,
    /// clamped to [0, 1].
    fn amount_factor(&self, path: &Path, amount_in: U256) -> f64 {
        let mut max_reserve = U256::ZERO;
        for (i, pool) in path.pools.iter().enumerate() {
            if let Some((rin, _)) = pool.oriented_reserves(path.tokens[i].address) {
                max_reserve = max_reserve.max(rin);
            }
        }
        if max_reserve.is_zero() {
            return 1.0;
        }
        math::ratio_f64(amount_in, max_reserve).clamp(0.0, 1.0)
    }
}

fn push_sample<K: std::hash::Hash + Eq>(
    map: &DashMap<K, VecDeque<f64>>,
    key: K,
    value: f64,
    window: usize,
) {
    let mut entry = map.entry(key).or_default();
    entry.push_back(value);
    while entry.len() > window {
        entry.pop_front();
    }
}

/// 95th percentile of a window; zero when empty.
fn p95(window: &VecDeque<f64>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = window.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((sorted.len() as f64) * 0.95).ceil() as usize;
    sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
}
