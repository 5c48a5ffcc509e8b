//! Engine facade
//!
//! Owns one pool graph, the pure pipeline components, and the adaptive
//! state (slippage windows, success history, gas ring). `discover` runs the
//! whole pipeline over a single graph generation; `plan` hands an
//! opportunity to the execution planner; `record_execution` feeds observed
//! outcomes back into the risk model and ranker. Multiple engines coexist
//! without interference; there is no global state.

use crate::allocator::{CapitalAllocator, MarketContext};
use crate::clients::{PoolSource, RelayClient, RpcClient};
use crate::config::EngineConfig;
use crate::errors::EngineError;
use crate::evaluator::PathEvaluator;
use crate::execution::ExecutionPlanner;
use crate::gas::GasOracle;
use crate::graph::PoolGraph;
use crate::pathfinder::PathFinder;
use crate::ranker::PathRanker;
use crate::risk::RiskModel;
use crate::types::{ExecutionPlan, ExecutionStrategy, MultiPathOpportunity, Path, Token};
use alloy::primitives::U256;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-call discovery parameters.
#[derive(Debug, Clone, Copy)]
pub struct DiscoverOptions {
    /// Total capital available in start-token base units; the configured
    /// reserve fraction is held back from this.
    pub budget: U256,
    /// External volatility hint in [0, 1].
    pub market_volatility: f64,
}

/// The opportunity engine.
pub struct ArbEngine {
    config: EngineConfig,
    graph: PoolGraph,
    finder: PathFinder,
    evaluator: PathEvaluator,
    risk: RiskModel,
    allocator: CapitalAllocator,
    ranker: PathRanker,
    planner: ExecutionPlanner,
    gas: GasOracle,
    rpc: Arc<dyn RpcClient>,
    relay: Arc<dyn RelayClient>,
}

impl ArbEngine {
    pub fn new(
        config: EngineConfig,
        sources: Vec<Arc<dyn PoolSource>>,
        rpc: Arc<dyn RpcClient>,
        relay: Arc<dyn RelayClient>,
    ) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::InvalidInput(e.to_string()))?;
        Ok(Self {
            graph: PoolGraph::new(sources, &config.graph),
            finder: PathFinder::new(config.finder.clone()),
            evaluator: PathEvaluator::new(config.evaluator.clone()),
            risk: RiskModel::new(config.risk.clone()),
            allocator: CapitalAllocator::new(config.allocator.clone()),
            ranker: PathRanker::new(config.ranker.clone()),
            planner: ExecutionPlanner::new(config.planner.clone()),
            gas: GasOracle::new(config.gas.clone()),
            rpc,
            relay,
            config,
        })
    }

    pub fn graph(&self) -> &PoolGraph {
        &self.graph
    }

    pub fn gas(&self) -> &GasOracle {
        &self.gas
    }

    pub fn risk(&self) -> &RiskModel {
        &self.risk
    }

    /// Refresh the pool graph (TTL-gated, generational).
    pub async fn refresh_graph(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        self.graph.refresh(cancel).await
    }

    /// Run one full discovery pipeline for `start`: refresh inputs, find
    /// cycles over a pinned graph generation, evaluate, risk-adjust, merge,
    /// rank, and allocate capital.
    ///
    /// Individual path failures are logged and skipped; the call returns an
    /// empty list when nothing profitable survives.
    pub async fn discover(
        &self,
        start: Token,
        options: DiscoverOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<MultiPathOpportunity>, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        match self.graph.refresh(cancel).await {
            Ok(()) => {}
            Err(EngineError::RefreshStale) if self.graph.snapshot().generation() > 0 => {
                warn!("graph refresh stale; discovering on previous generation");
            }
            Err(err) => return Err(err),
        }
        match self.gas.refresh(self.rpc.as_ref(), cancel).await {
            Ok(()) => {}
            Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
            Err(err) => warn!(error = %err, "gas refresh failed; pricing with stale data"),
        }

        // The snapshot is pinned here; the finder and evaluator see exactly
        // one generation.
        let snapshot = self.graph.snapshot();
        let candidates = self.finder.find_cycles(&snapshot, start.address);
        debug!(
            generation = snapshot.generation(),
            candidates = candidates.len(),
            "enumerated cyclic paths"
        );
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let gas_price_gwei = self.gas.current().map(|(_, p)| p).unwrap_or(0.0);
        let volatility = options.market_volatility.clamp(0.0, 1.0);
        let mut evaluated: Vec<Path> = Vec::new();
        for mut path in candidates {
            match self.evaluator.evaluate(&mut path, gas_price_gwei) {
                Ok(()) => {}
                Err(err) => {
                    debug!(path = %path, error = %err, "path dropped during evaluation");
                    continue;
                }
            }
            let predicted = self
                .risk
                .predict_path_slippage(&path, path.optimal_amount_in);
            let tolerance =
                self.risk
                    .adjusted_tolerance(&path, volatility, path.optimal_amount_in);
            if predicted > tolerance {
                debug!(
                    path = %path,
                    predicted,
                    tolerance,
                    "path dropped: predicted slippage above tolerance"
                );
                continue;
            }
            path.predicted_slippage = predicted;
            evaluated.push(path);
        }
        if evaluated.is_empty() {
            return Ok(Vec::new());
        }

        let merged = self
            .ranker
            .merge(evaluated, self.config.risk.correlation_threshold);
        let ranked = self
            .ranker
            .rank(merged, |p| self.risk.risk_score(p, volatility));

        let ctx = MarketContext {
            volatility,
            risk_profile: self.config.allocator.risk_profile,
            size_scale: self.risk.size_scale(),
        };
        let outcome = match self.allocator.allocate(&ranked, options.budget, &ctx) {
            Ok(outcome) => outcome,
            Err(EngineError::EmptyCandidateSet) => {
                debug!("no path survived allocation");
                return Ok(Vec::new());
            }
            Err(err) => return Err(err),
        };

        let created_at = Instant::now();
        let opportunity = MultiPathOpportunity {
            paths: ranked,
            allocations: outcome.allocations,
            start_token: start,
            budget_used: outcome.budget_used,
            expected_profit: outcome.expected_profit,
            confidence: outcome.combined_confidence,
            created_at,
            expires_at: self.planner.opportunity_deadline(created_at),
        };
        opportunity.validate()?;
        info!(
            paths = opportunity.paths.len(),
            budget_used = %opportunity.budget_used,
            expected_profit = %opportunity.expected_profit,
            confidence = opportunity.confidence,
            "discovered multi-path opportunity"
        );
        Ok(vec![opportunity])
    }

    /// Re-run capital allocation for a live opportunity under fresh market
    /// conditions. Pure; the paths and expiry are unchanged.
    pub fn rebalance(
        &self,
        opportunity: &MultiPathOpportunity,
        market_volatility: f64,
    ) -> Result<MultiPathOpportunity, EngineError> {
        if opportunity.is_expired(Instant::now()) {
            return Err(EngineError::OpportunityExpired);
        }
        let ctx = MarketContext {
            volatility: market_volatility.clamp(0.0, 1.0),
            risk_profile: self.config.allocator.risk_profile,
            size_scale: self.risk.size_scale(),
        };
        // The reserve was already taken out of budget_used; gross it back up
        // so the allocator's own reserve step lands on the same usable pool.
        let reserve = self.config.allocator.capital_reserve_fraction;
        let gross = crate::amm::math::scale_u256(opportunity.budget_used, 1.0 / (1.0 - reserve))
            .max(opportunity.budget_used)
            .max(U256::from(1u8));
        let outcome = self.allocator.allocate(&opportunity.paths, gross, &ctx)?;
        let mut rebalanced = opportunity.clone();
        rebalanced.allocations = outcome.allocations;
        rebalanced.budget_used = outcome.budget_used;
        rebalanced.expected_profit = outcome.expected_profit;
        rebalanced.confidence = outcome.combined_confidence;
        rebalanced.validate()?;
        Ok(rebalanced)
    }

    /// Build an execution plan for a discovered opportunity.
    pub async fn plan(
        &self,
        opportunity: &MultiPathOpportunity,
        strategy: ExecutionStrategy,
        fallback_enabled: bool,
        cancel: &CancellationToken,
    ) -> Result<ExecutionPlan, EngineError> {
        self.planner
            .plan(
                opportunity,
                strategy,
                fallback_enabled,
                &self.gas,
                self.rpc.as_ref(),
                self.relay.as_ref(),
                cancel,
            )
            .await
    }

    /// Build a plan using the configured fallback policy.
    pub async fn plan_with_policy(
        &self,
        opportunity: &MultiPathOpportunity,
        strategy: ExecutionStrategy,
        cancel: &CancellationToken,
    ) -> Result<ExecutionPlan, EngineError> {
        self.plan(
            opportunity,
            strategy,
            self.config.planner.fallback_enabled,
            cancel,
        )
        .await
    }

    /// Feed an observed execution back into the slippage windows and the
    /// success history.
    pub fn record_execution(
        &self,
        path: &Path,
        observed_slippage: f64,
        gas_used: u64,
        success: bool,
    ) {
        self.risk.record_execution(path, observed_slippage);
        self.ranker.record_result(path, success);
        debug!(
            path = %path,
            observed_slippage,
            gas_used,
            success,
            "recorded execution outcome"
        );
    }
}
