//! Configuration management
//!
//! One `EngineConfig` with a section per component, loadable from a TOML
//! file with serde defaults for every field, plus a small set of env-var
//! overrides for the knobs operators most often touch.

use crate::gas::FeeTarget;
use crate::ranker::RankStrategy;
use crate::types::RiskProfile;
use alloy::primitives::Address;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Pool graph section.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_graph_ttl")]
    pub graph_ttl_seconds: u64,
    #[serde(default = "default_max_pools_per_dex")]
    pub max_pools_per_dex: usize,
    /// Base units of token0; zero disables the floor.
    #[serde(default)]
    pub min_liquidity: u128,
    #[serde(default)]
    pub excluded_tokens: Vec<Address>,
    #[serde(default)]
    pub included_tokens: Vec<Address>,
    /// Mirrors the finder's max_hops for callers that configure the graph
    /// layer only.
    #[serde(default = "default_max_hops")]
    pub max_path_length: usize,
    #[serde(default = "default_source_timeout")]
    pub source_timeout_seconds: u64,
    #[serde(default = "default_refresh_concurrency")]
    pub refresh_concurrency: usize,
    #[serde(default = "default_max_pools_per_source")]
    pub max_pools_per_source: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Path finder section.
#[derive(Debug, Clone, Deserialize)]
pub struct FinderConfig {
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
    #[serde(default = "default_max_paths")]
    pub max_paths: usize,
    #[serde(default = "default_max_paths_exploration")]
    pub max_paths_exploration: usize,
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_max_total_fee_bps")]
    pub max_total_fee_bps: u32,
}

/// Path evaluator section.
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluatorConfig {
    #[serde(default = "default_search_tolerance")]
    pub optimal_search_tolerance: f64,
    #[serde(default = "default_gas_buffer")]
    pub gas_buffer: f64,
    #[serde(default = "default_staleness_threshold")]
    pub pool_staleness_threshold_seconds: u64,
}

/// Slippage and risk section.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_base_slippage")]
    pub base_slippage_tolerance: f64,
    #[serde(default = "default_max_slippage")]
    pub max_slippage_tolerance: f64,
    #[serde(default = "default_slippage_buffer")]
    pub slippage_buffer: f64,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_adaptation_rate")]
    pub adaptation_rate: f64,
    /// Path-similarity threshold shared with the ranker's merge pass.
    /// Heuristic; see DESIGN notes.
    #[serde(default = "default_correlation_threshold")]
    pub correlation_threshold: f64,
}

/// Capital allocator section.
#[derive(Debug, Clone, Deserialize)]
pub struct AllocatorConfig {
    #[serde(default = "default_capital_reserve")]
    pub capital_reserve_fraction: f64,
    #[serde(default = "default_min_allocation")]
    pub min_allocation_fraction: f64,
    #[serde(default = "default_max_allocation")]
    pub max_allocation_fraction: f64,
    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,
    #[serde(default)]
    pub risk_profile: RiskProfile,
}

/// Ranker section. The overlap weights are heuristics and deliberately
/// configurable.
#[derive(Debug, Clone, Deserialize)]
pub struct RankerConfig {
    #[serde(default)]
    pub strategy: RankStrategy,
    #[serde(default = "default_target_yield")]
    pub target_yield: f64,
    #[serde(default = "default_profit_weight")]
    pub profit_weight: f64,
    #[serde(default = "default_risk_weight")]
    pub risk_weight: f64,
    #[serde(default = "default_diversity_weight")]
    pub diversity_weight: f64,
    #[serde(default = "default_history_weight")]
    pub history_weight: f64,
    #[serde(default = "default_token_overlap_weight")]
    pub token_overlap_weight: f64,
    #[serde(default = "default_pool_overlap_weight")]
    pub pool_overlap_weight: f64,
    #[serde(default = "default_dex_overlap_weight")]
    pub dex_overlap_weight: f64,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

/// Execution planner section.
#[derive(Debug, Clone, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "default_max_concurrent_paths")]
    pub max_concurrent_paths: usize,
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
    #[serde(default = "default_blocks_into_future")]
    pub blocks_into_future: u64,
    #[serde(default)]
    pub fee_target: FeeTarget,
    #[serde(default = "default_relay_timeout")]
    pub relay_timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Gas oracle section.
#[derive(Debug, Clone, Deserialize)]
pub struct GasConfig {
    #[serde(default = "default_min_priority_fee")]
    pub min_priority_fee_gwei: f64,
    #[serde(default = "default_max_priority_fee")]
    pub max_priority_fee_gwei: f64,
    #[serde(default = "default_max_gas_price")]
    pub max_gas_price_gwei: f64,
    #[serde(default = "default_gas_update_interval")]
    pub gas_price_update_interval_seconds: u64,
    #[serde(default = "default_gas_history_size")]
    pub history_size: usize,
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_seconds: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Full engine configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub finder: FinderConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub allocator: AllocatorConfig,
    #[serde(default)]
    pub ranker: RankerConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub gas: GasConfig,
}

fn default_graph_ttl() -> u64 { 30 }
fn default_max_pools_per_dex() -> usize { 200 }
fn default_max_hops() -> usize { 4 }
fn default_source_timeout() -> u64 { 10 }
fn default_refresh_concurrency() -> usize { 4 }
fn default_max_pools_per_source() -> usize { 500 }
fn default_max_retries() -> u32 { 3 }
fn default_max_paths() -> usize { 100 }
fn default_max_paths_exploration() -> usize { 50_000 }
fn default_concurrency_limit() -> usize { 8 }
fn default_max_total_fee_bps() -> u32 { 200 }
fn default_search_tolerance() -> f64 { 1e-4 }
fn default_gas_buffer() -> f64 { 1.1 }
fn default_staleness_threshold() -> u64 { 30 }
fn default_base_slippage() -> f64 { 0.005 }
fn default_max_slippage() -> f64 { 0.03 }
fn default_slippage_buffer() -> f64 { 1.1 }
fn default_history_window() -> usize { 100 }
fn default_adaptation_rate() -> f64 { 0.1 }
fn default_correlation_threshold() -> f64 { 0.7 }
fn default_capital_reserve() -> f64 { 0.2 }
fn default_min_allocation() -> f64 { 0.05 }
fn default_max_allocation() -> f64 { 0.5 }
fn default_kelly_fraction() -> f64 { 0.5 }
fn default_target_yield() -> f64 { 0.01 }
fn default_profit_weight() -> f64 { 0.5 }
fn default_risk_weight() -> f64 { 0.2 }
fn default_diversity_weight() -> f64 { 0.15 }
fn default_history_weight() -> f64 { 0.15 }
fn default_token_overlap_weight() -> f64 { 0.4 }
fn default_pool_overlap_weight() -> f64 { 0.4 }
fn default_dex_overlap_weight() -> f64 { 0.2 }
fn default_max_concurrent_paths() -> usize { 4 }
fn default_min_success_rate() -> f64 { 0.7 }
fn default_true() -> bool { true }
fn default_blocks_into_future() -> u64 { 2 }
fn default_relay_timeout() -> u64 { 5 }
fn default_min_priority_fee() -> f64 { 1.0 }
fn default_max_priority_fee() -> f64 { 10.0 }
fn default_max_gas_price() -> f64 { 500.0 }
fn default_gas_update_interval() -> u64 { 60 }
fn default_gas_history_size() -> usize { 120 }
fn default_rpc_timeout() -> u64 { 5 }

macro_rules! impl_default_via_serde {
    ($($ty:ty),+ $(,)?) => {
        $(impl Default for $ty {
            fn default() -> Self {
                // Every field carries a serde default, so an empty table
                // deserializes to the canonical defaults.
                toml::from_str("").expect("defaults deserialize")
            }
        })+
    };
}

impl_default_via_serde!(
    GraphConfig,
    FinderConfig,
    EvaluatorConfig,
    RiskConfig,
    AllocatorConfig,
    RankerConfig,
    PlannerConfig,
    GasConfig,
);

impl EngineConfig {
    /// Load configuration from a TOML file and apply env overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read config file: {}", path.as_ref().display()))?;
        let mut config: Self =
            toml::from_str(&content).context("failed to parse TOML configuration")?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides for the knobs operators touch most; `.env`
    /// files are honored for deployment tweaks.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        dotenv::dotenv().ok();
        if let Ok(v) = std::env::var("ENGINE_MAX_HOPS") {
            self.finder.max_hops = v.parse().context("ENGINE_MAX_HOPS")?;
        }
        if let Ok(v) = std::env::var("ENGINE_MAX_GAS_PRICE_GWEI") {
            self.gas.max_gas_price_gwei = v.parse().context("ENGINE_MAX_GAS_PRICE_GWEI")?;
        }
        if let Ok(v) = std::env::var("ENGINE_KELLY_FRACTION") {
            self.allocator.kelly_fraction = v.parse().context("ENGINE_KELLY_FRACTION")?;
        }
        if let Ok(v) = std::env::var("ENGINE_RISK_PROFILE") {
            self.allocator.risk_profile = match v.to_lowercase().as_str() {
                "conservative" => RiskProfile::Conservative,
                "moderate" => RiskProfile::Moderate,
                "aggressive" => RiskProfile::Aggressive,
                other => anyhow::bail!("unknown ENGINE_RISK_PROFILE: {other}"),
            };
        }
        Ok(())
    }

    /// Range checks on every fraction-like knob.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.finder.max_hops >= 2, "max_hops must be at least 2");
        anyhow::ensure!(
            (0.0..1.0).contains(&self.allocator.capital_reserve_fraction),
            "capital_reserve_fraction must be in [0, 1)"
        );
        anyhow::ensure!(
            self.allocator.min_allocation_fraction <= self.allocator.max_allocation_fraction,
            "min_allocation_fraction exceeds max_allocation_fraction"
        );
        anyhow::ensure!(
            self.allocator.kelly_fraction > 0.0 && self.allocator.kelly_fraction <= 1.0,
            "kelly_fraction must be in (0, 1]"
        );
        anyhow::ensure!(
            self.risk.base_slippage_tolerance <= self.risk.max_slippage_tolerance,
            "base_slippage_tolerance exceeds max_slippage_tolerance"
        );
        anyhow::ensure!(
            self.risk.slippage_buffer >= 1.0,
            "slippage_buffer must be at least 1.0"
        );
        anyhow::ensure!(
            self.evaluator.gas_buffer >= 1.0,
            "gas_buffer must be at least 1.0"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.planner.min_success_rate),
            "min_success_rate must be in [0, 1]"
        );
        anyhow::ensure!(
            self.gas.min_priority_fee_gwei <= self.gas.max_priority_fee_gwei,
            "min_priority_fee exceeds max_priority_fee"
        );
        Ok(())
    }
}
