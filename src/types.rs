//! Core data structures shared across the engine
//!
//! Tokens, pools, paths, opportunities, and execution plans. Pools are
//! immutable values owned by a graph generation; paths hold shared handles
//! into that generation's pool arena so the two directed edges of a pool
//! never diverge.

use crate::errors::EngineError;
use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Hard cap on pool fees. Anything above is rejected at construction.
pub const MAX_FEE_BPS: u32 = 1000;

/// A token: 20-byte identifier plus decimals. Equality and ordering are by
/// identifier only; decimals ride along for scaling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Token {
    pub address: Address,
    pub decimals: u8,
}

impl Token {
    pub fn new(address: Address, decimals: u8) -> Self {
        Self { address, decimals }
    }

    /// One whole token in base units (10^decimals).
    pub fn one(&self) -> U256 {
        U256::from(10u64).pow(U256::from(self.decimals))
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Token {}

impl std::hash::Hash for Token {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl PartialOrd for Token {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Token {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.address.cmp(&other.address)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Tick-liquidity snapshot for concentrated pools.
///
/// `sqrt_price_x96` is sqrt(token1/token0) as a Q64.96 fixed-point number,
/// `liquidity` the in-range liquidity. Quoting projects these onto virtual
/// reserves; see the amm module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickSnapshot {
    pub sqrt_price_x96: U256,
    pub liquidity: u128,
}

/// Opaque per-pool metadata. The math layer reads the two typed fields;
/// everything else a source attaches rides along uninterpreted.
#[derive(Debug, Clone, Default)]
pub struct PoolMetadata {
    /// StableSwap amplification coefficient. Absent means the stable quote
    /// degrades to constant-product with a confidence penalty.
    pub amplification: Option<u64>,
    /// Tick snapshot for concentrated pools. Absent means the hop is
    /// unquotable.
    pub tick_snapshot: Option<TickSnapshot>,
    /// Venue-specific payload carried through refreshes, never interpreted
    /// by the engine.
    pub extra: serde_json::Value,
}

/// AMM pricing variants. The math layer dispatches on this tag; adding a
/// variant means extending the tag and the dispatch arms, nothing else.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PoolVariant {
    ConstantProduct,
    Stable,
    Concentrated,
    Weighted { w0: f64, w1: f64 },
}

impl PoolVariant {
    /// Short tag used for gas-table keys and logs.
    pub fn label(&self) -> &'static str {
        match self {
            PoolVariant::ConstantProduct => "constant_product",
            PoolVariant::Stable => "stable",
            PoolVariant::Concentrated => "concentrated",
            PoolVariant::Weighted { .. } => "weighted",
        }
    }
}

impl fmt::Display for PoolVariant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One liquidity venue. The token pair is canonical (`token0 < token1` by
/// identifier) and never changes after construction; reserves may be absent
/// while the pool is stale.
#[derive(Debug, Clone)]
pub struct Pool {
    pub address: Address,
    pub token0: Token,
    pub token1: Token,
    pub reserves: Option<(U256, U256)>,
    pub fee_bps: u32,
    pub variant: PoolVariant,
    pub dex_id: String,
    pub last_refreshed_at: Instant,
    pub metadata: PoolMetadata,
}

impl Pool {
    /// Build a pool, normalizing token order and validating invariants.
    /// Reserves supplied in the caller's token order are swapped along with
    /// the tokens, as are weighted-pool weights.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        address: Address,
        token_a: Token,
        token_b: Token,
        reserves: Option<(U256, U256)>,
        fee_bps: u32,
        variant: PoolVariant,
        dex_id: impl Into<String>,
        metadata: PoolMetadata,
    ) -> Result<Self, EngineError> {
        if token_a == token_b {
            return Err(EngineError::InvalidInput(format!(
                "pool {address} pairs a token with itself"
            )));
        }
        if fee_bps > MAX_FEE_BPS {
            return Err(EngineError::InvalidInput(format!(
                "pool {address} fee {fee_bps} bps exceeds {MAX_FEE_BPS}"
            )));
        }
        if let PoolVariant::Weighted { w0, w1 } = variant {
            if w0 <= 0.0 || w1 <= 0.0 || (w0 + w1 - 1.0).abs() > 1e-9 {
                return Err(EngineError::InvalidInput(format!(
                    "pool {address} has invalid weights ({w0}, {w1})"
                )));
            }
        }

        let (token0, token1, reserves, variant) = if token_a < token_b {
            (token_a, token_b, reserves, variant)
        } else {
            let swapped = reserves.map(|(r0, r1)| (r1, r0));
            let variant = match variant {
                PoolVariant::Weighted { w0, w1 } => PoolVariant::Weighted { w0: w1, w1: w0 },
                v => v,
            };
            (token_b, token_a, swapped, variant)
        };

        Ok(Self {
            address,
            token0,
            token1,
            reserves,
            fee_bps,
            variant,
            dex_id: dex_id.into(),
            last_refreshed_at: Instant::now(),
            metadata,
        })
    }

    pub fn contains(&self, token: Address) -> bool {
        self.token0.address == token || self.token1.address == token
    }

    /// The opposite side of the pair, if `token` belongs to the pool.
    pub fn other_side(&self, token: Address) -> Option<Token> {
        if self.token0.address == token {
            Some(self.token1)
        } else if self.token1.address == token {
            Some(self.token0)
        } else {
            None
        }
    }

    /// Reserves oriented as (input side, output side) for a swap entering
    /// with `token_in`. None when reserves are absent or the token does not
    /// belong to the pool.
    pub fn oriented_reserves(&self, token_in: Address) -> Option<(U256, U256)> {
        let (r0, r1) = self.reserves?;
        if self.token0.address == token_in {
            Some((r0, r1))
        } else if self.token1.address == token_in {
            Some((r1, r0))
        } else {
            None
        }
    }

    /// (input-token weight, output-token weight) for weighted pools.
    pub fn oriented_weights(&self, token_in: Address) -> Option<(f64, f64)> {
        match self.variant {
            PoolVariant::Weighted { w0, w1 } => {
                if self.token0.address == token_in {
                    Some((w0, w1))
                } else if self.token1.address == token_in {
                    Some((w1, w0))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    pub fn fee_fraction(&self) -> f64 {
        self.fee_bps as f64 / 10_000.0
    }

    /// Edge weight -ln(1 - fee), used only for pruning, never for pricing.
    pub fn fee_weight(&self) -> f64 {
        -(1.0 - self.fee_fraction()).ln()
    }

    pub fn is_stale(&self, threshold: Duration, now: Instant) -> bool {
        now.duration_since(self.last_refreshed_at) > threshold
    }

    /// Liquidity score in base units of token0, used by the per-DEX cap and
    /// the min-liquidity filter.
    pub fn liquidity_score(&self) -> U256 {
        self.reserves.map(|(r0, _)| r0).unwrap_or(U256::ZERO)
    }

    /// True when a swap entering with `token_in` can produce output at all.
    pub fn quotable_from(&self, token_in: Address) -> bool {
        if !self.contains(token_in) {
            return false;
        }
        match self.variant {
            PoolVariant::Concentrated => self.metadata.tick_snapshot.is_some(),
            _ => self
                .oriented_reserves(token_in)
                .map(|(rin, rout)| !rin.is_zero() && !rout.is_zero())
                .unwrap_or(false),
        }
    }
}

/// An ordered token sequence with one pool per hop. Cyclic iff the first and
/// last token match. Derived fields start zeroed and are populated by the
/// evaluator and risk model.
#[derive(Debug, Clone)]
pub struct Path {
    pub tokens: Vec<Token>,
    pub pools: Vec<Arc<Pool>>,
    pub optimal_amount_in: U256,
    pub expected_amount_out: U256,
    pub expected_profit: U256,
    pub confidence: f64,
    pub gas_estimate: u64,
    pub gas_cost: U256,
    pub predicted_slippage: f64,
}

impl Path {
    pub fn new(tokens: Vec<Token>, pools: Vec<Arc<Pool>>) -> Result<Self, EngineError> {
        if tokens.len() < 2 || pools.len() + 1 != tokens.len() {
            return Err(EngineError::InvalidInput(format!(
                "path shape mismatch: {} tokens, {} pools",
                tokens.len(),
                pools.len()
            )));
        }
        Ok(Self {
            tokens,
            pools,
            optimal_amount_in: U256::ZERO,
            expected_amount_out: U256::ZERO,
            expected_profit: U256::ZERO,
            confidence: 0.0,
            gas_estimate: 0,
            gas_cost: U256::ZERO,
            predicted_slippage: 0.0,
        })
    }

    pub fn hops(&self) -> usize {
        self.pools.len()
    }

    pub fn start_token(&self) -> Token {
        self.tokens[0]
    }

    pub fn is_cyclic(&self) -> bool {
        self.tokens.first().map(|t| t.address) == self.tokens.last().map(|t| t.address)
    }

    /// Stable identifier for history windows: pool addresses joined in hop
    /// order.
    pub fn route_key(&self) -> String {
        self.pools
            .iter()
            .map(|p| p.address.to_string())
            .collect::<Vec<_>>()
            .join(">")
    }

    /// Profit per unit of input as a scalar ratio.
    pub fn profit_fraction(&self) -> f64 {
        if self.optimal_amount_in.is_zero() {
            return 0.0;
        }
        crate::amm::math::ratio_f64(self.expected_profit, self.optimal_amount_in)
    }

    pub fn unique_token_count(&self) -> usize {
        let mut seen: Vec<Address> = Vec::with_capacity(self.tokens.len());
        for t in &self.tokens {
            if !seen.contains(&t.address) {
                seen.push(t.address);
            }
        }
        seen.len()
    }

    pub fn unique_dex_count(&self) -> usize {
        let mut seen: Vec<&str> = Vec::with_capacity(self.pools.len());
        for p in &self.pools {
            if !seen.contains(&p.dex_id.as_str()) {
                seen.push(&p.dex_id);
            }
        }
        seen.len()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let route = self
            .tokens
            .iter()
            .map(|t| t.address.to_string())
            .collect::<Vec<_>>()
            .join(" -> ");
        write!(f, "[{} hops] {}", self.hops(), route)
    }
}

/// Caller risk appetite; scales the allocator's risk divisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskProfile {
    Conservative,
    #[default]
    Moderate,
    Aggressive,
}

impl RiskProfile {
    pub fn risk_multiplier(&self) -> f64 {
        match self {
            RiskProfile::Conservative => 1.5,
            RiskProfile::Moderate => 1.0,
            RiskProfile::Aggressive => 0.7,
        }
    }
}

/// A bundle of cyclic paths sharing a start token, with capital assigned to
/// each. Lives only until executed or expired.
#[derive(Debug, Clone)]
pub struct MultiPathOpportunity {
    pub paths: Vec<Path>,
    pub allocations: Vec<U256>,
    pub start_token: Token,
    pub budget_used: U256,
    pub expected_profit: U256,
    pub confidence: f64,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl MultiPathOpportunity {
    /// Check the structural invariants: cyclic paths, shared start token,
    /// matching allocation vector, expiry after creation.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.paths.is_empty() {
            return Err(EngineError::InvalidInput("opportunity has no paths".into()));
        }
        if self.paths.len() != self.allocations.len() {
            return Err(EngineError::InvalidInput(format!(
                "{} paths but {} allocations",
                self.paths.len(),
                self.allocations.len()
            )));
        }
        for path in &self.paths {
            if !path.is_cyclic() {
                return Err(EngineError::NotCyclic);
            }
            if path.start_token() != self.start_token {
                return Err(EngineError::InvalidInput(
                    "paths do not share the start token".into(),
                ));
            }
        }
        if self.expires_at <= self.created_at {
            return Err(EngineError::InvalidInput(
                "opportunity expires before it was created".into(),
            ));
        }
        Ok(())
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn total_allocated(&self) -> U256 {
        self.allocations
            .iter()
            .fold(U256::ZERO, |acc, a| acc.saturating_add(*a))
    }
}

/// How a plan submits its transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStrategy {
    /// Single private-orderflow bundle; all-or-nothing.
    Atomic,
    /// One transaction per path, back-to-back with monotonic nonces.
    Sequential,
    /// One transaction per path, broadcast concurrently.
    Parallel,
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecutionStrategy::Atomic => write!(f, "atomic"),
            ExecutionStrategy::Sequential => write!(f, "sequential"),
            ExecutionStrategy::Parallel => write!(f, "parallel"),
        }
    }
}

/// One swap instruction inside a plan step.
#[derive(Debug, Clone)]
pub struct SwapInstruction {
    pub pool: Address,
    pub dex_id: String,
    pub token_in: Address,
    pub token_out: Address,
    pub amount_in: U256,
    pub min_amount_out: U256,
}

/// One transaction worth of swaps: a full cyclic path.
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub path_index: usize,
    /// Offset from the sender's base nonce; sequential plans submit in this
    /// order.
    pub nonce_offset: u64,
    pub gas_limit: u64,
    pub swaps: Vec<SwapInstruction>,
}

/// Ordered transaction plan emitted by the execution planner.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub strategy: ExecutionStrategy,
    pub steps: Vec<PlanStep>,
    pub gas_total: u64,
    pub priority_fee_gwei: f64,
    /// Concurrency bound for parallel plans; 1 otherwise.
    pub max_concurrent: usize,
    /// Required fraction of successful paths for the plan to count as a
    /// success.
    pub min_success_rate: f64,
    /// Target block for bundle inclusion, when known.
    pub target_block: Option<u64>,
    /// Lower-coordination plan to activate exactly once if this one is
    /// rejected by the relay.
    pub fallback: Option<Box<ExecutionPlan>>,
}
