//! Path ranking and near-duplicate merging
//!
//! Scores evaluated paths on profit, risk, diversity, and execution history,
//! with preset weight strategies, then merges groups of near-duplicate
//! paths into their best representative when the combined execution would
//! not pay for itself. The Jaccard blend and its threshold are heuristics
//! and exposed through configuration.

use crate::amm::{self, math};
use crate::config::RankerConfig;
use crate::types::Path;
use alloy::primitives::Address;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use tracing::debug;

/// Interference discount applied to a merged representative's profit.
const MERGED_PROFIT_DISCOUNT: f64 = 0.9;
/// Storage-warming discount applied to a merged representative's gas.
const MERGED_GAS_DISCOUNT: f64 = 0.7;

/// Preset scoring strategies. `Balanced` uses the configured weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RankStrategy {
    ProfitBiased,
    RiskBiased,
    DiversityBiased,
    #[default]
    Balanced,
}

#[derive(Debug, Clone, Copy)]
struct Weights {
    profit: f64,
    risk: f64,
    diversity: f64,
    history: f64,
}

/// Scores paths and keeps rolling success-rate windows per route, token, and
/// DEX, fed by `record_result` after execution.
pub struct PathRanker {
    config: RankerConfig,
    route_success: DashMap<String, VecDeque<bool>>,
    token_success: DashMap<Address, VecDeque<bool>>,
    dex_success: DashMap<String, VecDeque<bool>>,
}

impl PathRanker {
    pub fn new(config: RankerConfig) -> Self {
        Self {
            config,
            route_success: DashMap::new(),
            token_success: DashMap::new(),
            dex_success: DashMap::new(),
        }
    }

    fn weights(&self) -> Weights {
        match self.config.strategy {
            RankStrategy::ProfitBiased => Weights {
                profit: 0.7,
                risk: 0.1,
                diversity: 0.1,
                history: 0.1,
            },
            RankStrategy::RiskBiased => Weights {
                profit: 0.3,
                risk: 0.5,
                diversity: 0.1,
                history: 0.1,
            },
            RankStrategy::DiversityBiased => Weights {
                profit: 0.3,
                risk: 0.2,
                diversity: 0.4,
                history: 0.1,
            },
            RankStrategy::Balanced => Weights {
                profit: self.config.profit_weight,
                risk: self.config.risk_weight,
                diversity: self.config.diversity_weight,
                history: self.config.history_weight,
            },
        }
    }

    /// Composite score in [0, 1]. `risk` is the C5 risk score for the path.
    pub fn score(&self, path: &Path, risk: f64) -> f64 {
        let w = self.weights();
        let profit_score = (path.profit_fraction() / self.config.target_yield).min(1.0);
        let risk_score = 1.0 - risk.clamp(0.0, 1.0);
        let diversity_score = self.diversity_score(path);
        let history_score = self.history_score(path);
        w.profit * profit_score
            + w.risk * risk_score
            + w.diversity * diversity_score
            + w.history * history_score
    }

    /// Sort paths by descending score; exact ties break on the zero-size
    /// spot edge so the ordering stays deterministic across runs.
    pub fn rank(&self, mut paths: Vec<Path>, risk_of: impl Fn(&Path) -> f64) -> Vec<Path> {
        let mut scored: Vec<(f64, f64, usize)> = paths
            .iter()
            .enumerate()
            .map(|(i, p)| (self.score(p, risk_of(p)), spot_edge(p), i))
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
        });
        let order: Vec<usize> = scored.iter().map(|(_, _, i)| *i).collect();
        let mut out = Vec::with_capacity(paths.len());
        // Drain in score order without cloning path bodies.
        let mut slots: Vec<Option<Path>> = paths.drain(..).map(Some).collect();
        for idx in order {
            if let Some(p) = slots[idx].take() {
                out.push(p);
            }
        }
        out
    }

    /// Group paths whose pairwise similarity exceeds `threshold` and keep
    /// only the best representative of a group when the group's combined
    /// execution would not pay for itself.
    pub fn merge(&self, paths: Vec<Path>, threshold: f64) -> Vec<Path> {
        let mut groups: Vec<Vec<Path>> = Vec::new();
        for path in paths {
            match groups
                .iter_mut()
                .find(|g| self.similarity(&g[0], &path) > threshold)
            {
                Some(group) => group.push(path),
                None => groups.push(vec![path]),
            }
        }

        let mut out = Vec::new();
        for mut group in groups {
            if group.len() == 1 {
                out.append(&mut group);
                continue;
            }
            let rep = group
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.expected_profit.cmp(&b.expected_profit))
                .map(|(i, _)| i)
                .unwrap_or(0);
            let rep_profit = math::to_f64_lossy(group[rep].expected_profit);
            let rep_gas = math::to_f64_lossy(group[rep].gas_cost);
            let individual_net: f64 = group
                .iter()
                .map(|p| math::to_f64_lossy(p.expected_profit) - math::to_f64_lossy(p.gas_cost))
                .sum();
            let merged_net = rep_profit * MERGED_PROFIT_DISCOUNT - rep_gas * MERGED_GAS_DISCOUNT;
            if merged_net > individual_net {
                debug!(
                    group = group.len(),
                    representative = %group[rep],
                    "merged near-duplicate paths"
                );
                out.push(group.swap_remove(rep));
            } else {
                out.append(&mut group);
            }
        }
        out
    }

    /// Feed an execution outcome into the success windows.
    pub fn record_result(&self, path: &Path, success: bool) {
        let window = self.config.history_window.max(1);
        push(&self.route_success, path.route_key(), success, window);
        for token in &path.tokens {
            push(&self.token_success, token.address, success, window);
        }
        for pool in &path.pools {
            push(&self.dex_success, pool.dex_id.clone(), success, window);
        }
    }

    /// Blend of token and DEX variety along the path.
    fn diversity_score(&self, path: &Path) -> f64 {
        if path.tokens.is_empty() || path.pools.is_empty() {
            return 0.0;
        }
        let token_variety = path.unique_token_count() as f64 / path.tokens.len() as f64;
        let dex_variety = path.unique_dex_count() as f64 / path.pools.len() as f64;
        (token_variety + dex_variety) / 2.0
    }

    /// Rolling success rate across route, token, and DEX windows; neutral
    /// 0.5 with no samples. The route's own record dominates when present.
    fn history_score(&self, path: &Path) -> f64 {
        let mut rates: Vec<(f64, f64)> = Vec::new(); // (rate, weight)
        if let Some(w) = self.route_success.get(&path.route_key()) {
            if !w.is_empty() {
                rates.push((success_rate(&w), 0.6));
            }
        }
        let token_rates: Vec<f64> = path
            .tokens
            .iter()
            .filter_map(|t| self.token_success.get(&t.address))
            .filter(|w| !w.is_empty())
            .map(|w| success_rate(&w))
            .collect();
        if !token_rates.is_empty() {
            rates.push((
                token_rates.iter().sum::<f64>() / token_rates.len() as f64,
                0.2,
            ));
        }
        let dex_rates: Vec<f64> = path
            .pools
            .iter()
            .filter_map(|p| self.dex_success.get(&p.dex_id))
            .filter(|w| !w.is_empty())
            .map(|w| success_rate(&w))
            .collect();
        if !dex_rates.is_empty() {
            rates.push((dex_rates.iter().sum::<f64>() / dex_rates.len() as f64, 0.2));
        }

        if rates.is_empty() {
            return 0.5;
        }
        let total_weight: f64 = rates.iter().map(|(_, w)| w).sum();
        rates.iter().map(|(r, w)| r * w).sum::<f64>() / total_weight
    }

    /// Weighted Jaccard blend over token, pool, and DEX overlap.
    pub fn similarity(&self, a: &Path, b: &Path) -> f64 {
        let tokens_a: HashSet<Address> = a.tokens.iter().map(|t| t.address).collect();
        let tokens_b: HashSet<Address> = b.tokens.iter().map(|t| t.address).collect();
        let pools_a: HashSet<Address> = a.pools.iter().map(|p| p.address).collect();
        let pools_b: HashSet<Address> = b.pools.iter().map(|p| p.address).collect();
        let dexes_a: HashSet<&str> = a.pools.iter().map(|p| p.dex_id.as_str()).collect();
        let dexes_b: HashSet<&str> = b.pools.iter().map(|p| p.dex_id.as_str()).collect();

        self.config.token_overlap_weight * jaccard(&tokens_a, &tokens_b)
            + self.config.pool_overlap_weight * jaccard(&pools_a, &pools_b)
            + self.config.dex_overlap_weight * jaccard(&dexes_a, &dexes_b)
    }
}

/// Product of zero-size marginal prices around the cycle: above 1.0 the
/// route carries a standing edge before any size is applied.
pub fn spot_edge(path: &Path) -> f64 {
    let mut edge = 1.0;
    for (i, pool) in path.pools.iter().enumerate() {
        match amm::marginal_price(pool, path.tokens[i].address) {
            Ok(price) => edge *= price.to_f64(),
            Err(_) => return 0.0,
        }
    }
    edge
}

fn jaccard<T: std::hash::Hash + Eq>(a: &HashSet<T>, b: &HashSet<T>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

fn success_rate(window: &VecDeque<bool>) -> f64 {
    if window.is_empty() {
        return 0.5;
    }
    window.iter().filter(|s| **s).count() as f64 / window.len() as f64
}

fn push<K: std::hash::Hash + Eq>(
    map: &DashMap<K, VecDeque<bool>>,
    key: K,
    value: bool,
    window: usize,
) {
    let mut entry = map.entry(key).or_default();
    entry.push_back(value);
    while entry.len() > window {
        entry.pop_front();
    }
}
