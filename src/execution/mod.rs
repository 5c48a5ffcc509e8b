//! Execution planning
//!
//! Turns a multi-path opportunity into one ordered transaction plan: an
//! atomic private-orderflow bundle, a sequential chain of transactions, or a
//! parallel broadcast. Atomic plans are gated on a relay simulation; when
//! the caller enables fallback, a parallel plan is built in the same pass to
//! be activated exactly once if the relay rejects the bundle.

use crate::amm;
use crate::clients::{Bundle, RelayClient, RpcClient, TxRequest};
use crate::config::PlannerConfig;
use crate::errors::EngineError;
use crate::gas::GasOracle;
use crate::types::{
    ExecutionPlan, ExecutionStrategy, MultiPathOpportunity, Path, PlanStep, SwapInstruction,
};
use alloy::primitives::U256;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Gas discount inside an atomic bundle from shared storage warming.
const BUNDLE_GAS_DISCOUNT: f64 = 0.8;
/// Assumed seconds per block when projecting the opportunity expiry into a
/// target block.
pub const BLOCK_TIME_SECONDS: u64 = 12;

#[derive(Debug, Clone)]
pub struct ExecutionPlanner {
    config: PlannerConfig,
}

impl ExecutionPlanner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    /// Derive the expiry instant for a freshly discovered opportunity.
    pub fn opportunity_deadline(&self, created_at: Instant) -> Instant {
        created_at + Duration::from_secs(self.config.blocks_into_future.max(1) * BLOCK_TIME_SECONDS)
    }

    /// Build a plan for `opportunity` under the chosen strategy.
    ///
    /// Validity preconditions (checked before any I/O): the opportunity is
    /// unexpired, profitable, confident enough, and structurally sound.
    pub async fn plan(
        &self,
        opportunity: &MultiPathOpportunity,
        strategy: ExecutionStrategy,
        fallback_enabled: bool,
        gas: &GasOracle,
        rpc: &dyn RpcClient,
        relay: &dyn RelayClient,
        cancel: &CancellationToken,
    ) -> Result<ExecutionPlan, EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        opportunity.validate()?;
        if opportunity.is_expired(Instant::now()) {
            return Err(EngineError::OpportunityExpired);
        }
        if opportunity.expected_profit.is_zero() {
            let cost: U256 = funded_paths(opportunity)
                .map(|(path, _)| path.gas_cost)
                .fold(U256::ZERO, |acc, c| acc.saturating_add(c));
            return Err(EngineError::InsufficientProfit {
                expected: opportunity.expected_profit.to_string(),
                cost: cost.to_string(),
            });
        }
        if opportunity.confidence < self.config.min_success_rate {
            return Err(EngineError::LowConfidence {
                confidence: opportunity.confidence,
                minimum: self.config.min_success_rate,
            });
        }

        let steps = self.build_steps(opportunity)?;
        if steps.is_empty() {
            return Err(EngineError::EmptyCandidateSet);
        }
        let steps = self.refine_gas_limits(steps, rpc, cancel).await;
        let priority_fee = gas.priority_fee(self.config.fee_target);

        match strategy {
            ExecutionStrategy::Atomic => {
                self.plan_atomic(opportunity, steps, priority_fee, fallback_enabled, rpc, relay, cancel)
                    .await
            }
            ExecutionStrategy::Sequential => Ok(self.assemble(
                ExecutionStrategy::Sequential,
                steps,
                priority_fee,
                None,
                None,
            )),
            ExecutionStrategy::Parallel => {
                Ok(self.assemble(ExecutionStrategy::Parallel, steps, priority_fee, None, None))
            }
        }
    }

    async fn plan_atomic(
        &self,
        opportunity: &MultiPathOpportunity,
        steps: Vec<PlanStep>,
        priority_fee: f64,
        fallback_enabled: bool,
        rpc: &dyn RpcClient,
        relay: &dyn RelayClient,
        cancel: &CancellationToken,
    ) -> Result<ExecutionPlan, EngineError> {
        let target_block = self.target_block(rpc, cancel).await;

        let bundle = Bundle {
            transactions: steps
                .iter()
                .map(|s| self.step_to_tx(s, priority_fee))
                .collect(),
            target_block: target_block.unwrap_or(0),
        };

        let sim = self.simulate(relay, &bundle, cancel).await?;
        let rejected = !sim.success || sim.mev_value <= sim.total_cost;
        if rejected {
            let reason = if sim.success {
                format!(
                    "mev value {} does not cover cost {}",
                    sim.mev_value, sim.total_cost
                )
            } else {
                sim.per_tx
                    .iter()
                    .find_map(|tx| tx.error.clone())
                    .unwrap_or_else(|| "simulation failed".into())
            };
            if fallback_enabled {
                warn!(%reason, "atomic bundle rejected in simulation; falling back to parallel");
                return Ok(self.assemble(
                    ExecutionStrategy::Parallel,
                    steps,
                    priority_fee,
                    target_block,
                    None,
                ));
            }
            return Err(EngineError::SimulationRejected(reason));
        }

        debug!(
            mev_value = %sim.mev_value,
            total_cost = %sim.total_cost,
            "bundle simulation accepted"
        );

        // Build the lower-coordination plan in the same pass so the executor
        // can activate it exactly once if the relay rejects the bundle.
        let fallback = fallback_enabled.then(|| {
            Box::new(self.assemble(
                ExecutionStrategy::Parallel,
                steps.clone(),
                priority_fee,
                target_block,
                None,
            ))
        });

        let mut plan = self.assemble(
            ExecutionStrategy::Atomic,
            steps,
            priority_fee,
            target_block,
            fallback,
        );
        plan.gas_total = (plan.gas_total as f64 * BUNDLE_GAS_DISCOUNT).ceil() as u64;
        info!(
            paths = opportunity.paths.len(),
            gas_total = plan.gas_total,
            target_block = ?plan.target_block,
            "built atomic plan"
        );
        Ok(plan)
    }

    fn assemble(
        &self,
        strategy: ExecutionStrategy,
        steps: Vec<PlanStep>,
        priority_fee: f64,
        target_block: Option<u64>,
        fallback: Option<Box<ExecutionPlan>>,
    ) -> ExecutionPlan {
        let gas_total = steps.iter().map(|s| s.gas_limit).sum();
        let max_concurrent = match strategy {
            ExecutionStrategy::Parallel => self.config.max_concurrent_paths.max(1),
            _ => 1,
        };
        ExecutionPlan {
            strategy,
            steps,
            gas_total,
            priority_fee_gwei: priority_fee,
            max_concurrent,
            min_success_rate: self.config.min_success_rate,
            target_block,
            fallback,
        }
    }

    /// One step per funded path, re-quoting every hop at the allocated size
    /// and floored by the path's predicted slippage.
    fn build_steps(&self, opportunity: &MultiPathOpportunity) -> Result<Vec<PlanStep>, EngineError> {
        let mut steps = Vec::new();
        for (index, (path, allocation)) in funded_paths(opportunity).enumerate() {
            let mut swaps = Vec::with_capacity(path.hops());
            let mut amount = allocation;
            let slip_floor = (1.0 - path.predicted_slippage).clamp(0.0, 1.0);
            for (i, pool) in path.pools.iter().enumerate() {
                let token_in = path.tokens[i].address;
                let out = amm::quote(pool, token_in, amount)?.amount_out;
                swaps.push(SwapInstruction {
                    pool: pool.address,
                    dex_id: pool.dex_id.clone(),
                    token_in,
                    token_out: path.tokens[i + 1].address,
                    amount_in: amount,
                    min_amount_out: crate::amm::math::scale_u256(out, slip_floor),
                });
                amount = out;
            }
            steps.push(PlanStep {
                path_index: index,
                nonce_offset: index as u64,
                gas_limit: path.gas_estimate,
                swaps,
            });
        }
        Ok(steps)
    }

    /// Ask the node for a per-step gas estimate; the lookup-table figure
    /// already in the step stands when estimation is unsupported or slow.
    async fn refine_gas_limits(
        &self,
        mut steps: Vec<PlanStep>,
        rpc: &dyn RpcClient,
        cancel: &CancellationToken,
    ) -> Vec<PlanStep> {
        let timeout = Duration::from_secs(self.config.relay_timeout_seconds);
        for step in steps.iter_mut() {
            if cancel.is_cancelled() {
                break;
            }
            let tx = self.step_to_tx(step, 0.0);
            if let Ok(Ok(Some(estimate))) =
                tokio::time::timeout(timeout, rpc.estimate_gas(&tx)).await
            {
                debug!(path_index = step.path_index, estimate, "node gas estimate");
                step.gas_limit = estimate;
            }
        }
        steps
    }

    fn step_to_tx(&self, step: &PlanStep, priority_fee: f64) -> TxRequest {
        // Calldata encoding belongs to the submitting client; the request
        // carries the routing target and budget.
        TxRequest {
            to: step.swaps.first().map(|s| s.pool).unwrap_or_default(),
            data: Vec::new(),
            value: U256::ZERO,
            gas_limit: step.gas_limit,
            nonce_offset: step.nonce_offset,
            max_fee_per_gas_gwei: 0.0,
            max_priority_fee_gwei: priority_fee,
        }
    }

    /// Current block plus the configured lookahead; best-effort.
    async fn target_block(&self, rpc: &dyn RpcClient, cancel: &CancellationToken) -> Option<u64> {
        let timeout = Duration::from_secs(self.config.relay_timeout_seconds);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return None,
            res = tokio::time::timeout(timeout, rpc.block_number()) => res,
        };
        match outcome {
            Ok(Ok(block)) => Some(block + self.config.blocks_into_future),
            Ok(Err(err)) => {
                debug!(error = %err, "block number unavailable; planning without target");
                None
            }
            Err(_) => None,
        }
    }

    /// Relay simulation with timeout and bounded retries on transient
    /// failures.
    async fn simulate(
        &self,
        relay: &dyn RelayClient,
        bundle: &Bundle,
        cancel: &CancellationToken,
    ) -> Result<crate::clients::SimResult, EngineError> {
        let timeout = Duration::from_secs(self.config.relay_timeout_seconds);
        let mut delay = Duration::from_millis(100);
        let mut attempt = 0u32;
        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                res = tokio::time::timeout(timeout, relay.simulate_bundle(bundle)) => res,
            };
            match outcome {
                Ok(Ok(sim)) => return Ok(sim),
                Ok(Err(err)) if attempt < self.config.max_retries => {
                    debug!(attempt, error = %err, "bundle simulation retry");
                }
                Ok(Err(err)) => {
                    return Err(EngineError::SourceUnavailable {
                        source_name: "relay".into(),
                        reason: err.to_string(),
                    });
                }
                Err(_) if attempt < self.config.max_retries => {
                    debug!(attempt, "bundle simulation timed out; retrying");
                }
                Err(_) => return Err(EngineError::Timeout),
            }
            attempt += 1;
            tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            delay *= 2;
        }
    }
}

fn funded_paths(
    opportunity: &MultiPathOpportunity,
) -> impl Iterator<Item = (&Path, U256)> + '_ {
    opportunity
        .paths
        .iter()
        .zip(&opportunity.allocations)
        .filter(|(_, allocation)| !allocation.is_zero())
        .map(|(path, allocation)| (path, *allocation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{Receipt, SimResult, TxSimOutcome};
    use crate::config::GasConfig;
    use crate::types::{Pool, PoolMetadata, PoolVariant, Token};
    use alloy::primitives::{Address, B256};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Arc;

    const WAD: u128 = 1_000_000_000_000_000_000;

    struct MockRpc;

    #[async_trait]
    impl RpcClient for MockRpc {
        async fn block_number(&self) -> anyhow::Result<u64> {
            Ok(1_000)
        }
        async fn base_fee(&self) -> anyhow::Result<u128> {
            Ok(30_000_000_000)
        }
        async fn gas_price(&self) -> anyhow::Result<u128> {
            Ok(32_000_000_000)
        }
        async fn send_transaction(&self, _tx: TxRequest) -> anyhow::Result<B256> {
            Ok(B256::ZERO)
        }
        async fn wait_for_receipt(
            &self,
            _tx_hash: B256,
            _timeout: Duration,
        ) -> anyhow::Result<Receipt> {
            Err(anyhow!("not supported"))
        }
    }

    struct MockRelay {
        mev_value: U256,
        total_cost: U256,
        succeed: bool,
    }

    #[async_trait]
    impl RelayClient for MockRelay {
        async fn simulate_bundle(&self, bundle: &Bundle) -> anyhow::Result<SimResult> {
            Ok(SimResult {
                success: self.succeed,
                mev_value: self.mev_value,
                total_cost: self.total_cost,
                per_tx: bundle
                    .transactions
                    .iter()
                    .map(|_| TxSimOutcome {
                        gas_used: 200_000,
                        error: if self.succeed {
                            None
                        } else {
                            Some("reverted".into())
                        },
                    })
                    .collect(),
            })
        }

        async fn submit_bundle(&self, _bundle: &Bundle, _target: u64) -> anyhow::Result<B256> {
            Ok(B256::ZERO)
        }
    }

    fn tok(last: u8) -> Token {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Token::new(Address::from(bytes), 18)
    }

    fn cp_pool(addr_last: u8, a: Token, b: Token, ra: u128, rb: u128) -> Arc<Pool> {
        let mut bytes = [0u8; 20];
        bytes[18] = 0xfe;
        bytes[19] = addr_last;
        Arc::new(
            Pool::new(
                Address::from(bytes),
                a,
                b,
                Some((U256::from(ra), U256::from(rb))),
                30,
                PoolVariant::ConstantProduct,
                "uniswap_v2",
                PoolMetadata::default(),
            )
            .unwrap(),
        )
    }

    fn opportunity() -> MultiPathOpportunity {
        let tkn = tok(1);
        let usd = tok(2);
        let a = cp_pool(1, tkn, usd, 1_000 * WAD, 2_000 * WAD);
        let b = cp_pool(2, tkn, usd, 1_010 * WAD, 2_000 * WAD);
        let mut path = Path::new(vec![tkn, usd, tkn], vec![a, b]).unwrap();
        path.optimal_amount_in = U256::from(WAD);
        path.expected_amount_out = U256::from(WAD + WAD / 500);
        path.expected_profit = U256::from(WAD / 500);
        path.confidence = 0.95;
        path.gas_estimate = 220_000;
        path.gas_cost = U256::from(1_000_000u64);
        path.predicted_slippage = 0.01;

        let now = Instant::now();
        MultiPathOpportunity {
            paths: vec![path],
            allocations: vec![U256::from(WAD / 2)],
            start_token: tkn,
            budget_used: U256::from(WAD / 2),
            expected_profit: U256::from(WAD / 1_000),
            confidence: 0.95,
            created_at: now,
            expires_at: now + Duration::from_secs(60),
        }
    }

    fn planner() -> ExecutionPlanner {
        ExecutionPlanner::new(PlannerConfig::default())
    }

    fn funded_gas() -> GasOracle {
        let gas = GasOracle::new(GasConfig::default());
        gas.record_sample(30.0, 32.0);
        gas
    }

    #[tokio::test]
    async fn test_atomic_plan_with_fallback() {
        let relay = MockRelay {
            mev_value: U256::from(10_000_000u64),
            total_cost: U256::from(1_000u64),
            succeed: true,
        };
        let plan = planner()
            .plan(
                &opportunity(),
                ExecutionStrategy::Atomic,
                true,
                &funded_gas(),
                &MockRpc,
                &relay,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(plan.strategy, ExecutionStrategy::Atomic);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.target_block, Some(1_000 + 2));
        // 20% intra-bundle discount against the raw step sum.
        assert_eq!(plan.gas_total, (220_000f64 * 0.8).ceil() as u64);
        let fallback = plan.fallback.as_ref().expect("fallback plan");
        assert_eq!(fallback.strategy, ExecutionStrategy::Parallel);
        assert!(fallback.fallback.is_none());
    }

    #[tokio::test]
    async fn test_simulation_rejection_falls_back_to_parallel() {
        // mev_value of zero never covers cost.
        let relay = MockRelay {
            mev_value: U256::ZERO,
            total_cost: U256::from(1_000u64),
            succeed: true,
        };
        let plan = planner()
            .plan(
                &opportunity(),
                ExecutionStrategy::Atomic,
                true,
                &funded_gas(),
                &MockRpc,
                &relay,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(plan.strategy, ExecutionStrategy::Parallel);
        assert!(plan.fallback.is_none());
    }

    #[tokio::test]
    async fn test_simulation_rejection_without_fallback_errors() {
        let relay = MockRelay {
            mev_value: U256::ZERO,
            total_cost: U256::from(1_000u64),
            succeed: true,
        };
        let err = planner()
            .plan(
                &opportunity(),
                ExecutionStrategy::Atomic,
                false,
                &funded_gas(),
                &MockRpc,
                &relay,
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(err, Err(EngineError::SimulationRejected(_))));
    }

    #[tokio::test]
    async fn test_expired_opportunity_rejected() {
        let mut opp = opportunity();
        opp.created_at = Instant::now() - Duration::from_secs(120);
        opp.expires_at = Instant::now() - Duration::from_secs(60);
        let relay = MockRelay {
            mev_value: U256::from(1u64),
            total_cost: U256::ZERO,
            succeed: true,
        };
        let err = planner()
            .plan(
                &opp,
                ExecutionStrategy::Sequential,
                false,
                &funded_gas(),
                &MockRpc,
                &relay,
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(err, Err(EngineError::OpportunityExpired)));
    }

    #[tokio::test]
    async fn test_low_confidence_rejected() {
        let mut opp = opportunity();
        opp.confidence = 0.2;
        let relay = MockRelay {
            mev_value: U256::from(1u64),
            total_cost: U256::ZERO,
            succeed: true,
        };
        let err = planner()
            .plan(
                &opp,
                ExecutionStrategy::Sequential,
                false,
                &funded_gas(),
                &MockRpc,
                &relay,
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(err, Err(EngineError::LowConfidence { .. })));
    }

    #[tokio::test]
    async fn test_sequential_nonces_monotonic() {
        let mut opp = opportunity();
        // Duplicate the path as a second funded leg.
        let second = opp.paths[0].clone();
        opp.paths.push(second);
        opp.allocations.push(U256::from(WAD / 4));
        let relay = MockRelay {
            mev_value: U256::from(1u64),
            total_cost: U256::ZERO,
            succeed: true,
        };
        let plan = planner()
            .plan(
                &opp,
                ExecutionStrategy::Sequential,
                false,
                &funded_gas(),
                &MockRpc,
                &relay,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(plan.strategy, ExecutionStrategy::Sequential);
        let nonces: Vec<u64> = plan.steps.iter().map(|s| s.nonce_offset).collect();
        assert_eq!(nonces, vec![0, 1]);
        assert_eq!(plan.max_concurrent, 1);
    }

    #[tokio::test]
    async fn test_parallel_plan_never_carries_fallback() {
        let relay = MockRelay {
            mev_value: U256::from(1u64),
            total_cost: U256::ZERO,
            succeed: true,
        };
        let plan = planner()
            .plan(
                &opportunity(),
                ExecutionStrategy::Parallel,
                true,
                &funded_gas(),
                &MockRpc,
                &relay,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(plan.strategy, ExecutionStrategy::Parallel);
        assert!(plan.fallback.is_none());
        assert_eq!(
            plan.max_concurrent,
            PlannerConfig::default().max_concurrent_paths
        );
    }

    #[tokio::test]
    async fn test_min_out_respects_slippage_floor() {
        let relay = MockRelay {
            mev_value: U256::from(1u64),
            total_cost: U256::ZERO,
            succeed: true,
        };
        let plan = planner()
            .plan(
                &opportunity(),
                ExecutionStrategy::Sequential,
                false,
                &funded_gas(),
                &MockRpc,
                &relay,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        for swap in &plan.steps[0].swaps {
            assert!(swap.min_amount_out < swap.amount_in * U256::from(3u8));
            assert!(!swap.min_amount_out.is_zero());
        }
    }
}
