//! Consumed external interfaces
//!
//! Narrow async traits for the collaborators the engine does not own: the
//! blockchain RPC client, the private-orderflow relay, and per-DEX pool
//! sources. Implementations live in the embedding binary; tests use mocks.
//! Collaborators report failures as `anyhow` errors and the engine classifies
//! them (transient vs fatal) at the call site.

use crate::types::Pool;
use alloy::primitives::{Address, B256, U256};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// A transaction request as the planner hands it to the RPC or relay layer.
#[derive(Debug, Clone)]
pub struct TxRequest {
    pub to: Address,
    pub data: Vec<u8>,
    pub value: U256,
    pub gas_limit: u64,
    /// Offset from the sender's pending nonce; the submitting client resolves
    /// the absolute nonce.
    pub nonce_offset: u64,
    pub max_fee_per_gas_gwei: f64,
    pub max_priority_fee_gwei: f64,
}

/// Transaction receipt, trimmed to what the engine consumes.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub status: bool,
    pub block_number: u64,
    pub gas_used: u64,
    pub effective_gas_price: u128,
}

/// An ordered list of transactions submitted for inclusion as a unit.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub transactions: Vec<TxRequest>,
    pub target_block: u64,
}

/// Per-transaction outcome inside a bundle simulation.
#[derive(Debug, Clone)]
pub struct TxSimOutcome {
    pub gas_used: u64,
    pub error: Option<String>,
}

/// Relay simulation result.
#[derive(Debug, Clone)]
pub struct SimResult {
    pub success: bool,
    /// Extractable value the bundle realizes, in native base units.
    pub mev_value: U256,
    /// Gas plus priority-fee cost of the bundle, in native base units.
    pub total_cost: U256,
    pub per_tx: Vec<TxSimOutcome>,
}

/// Blockchain read/submit interface.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn block_number(&self) -> Result<u64>;
    /// Current base fee in wei.
    async fn base_fee(&self) -> Result<u128>;
    /// Legacy gas price in wei.
    async fn gas_price(&self) -> Result<u128>;
    async fn send_transaction(&self, tx: TxRequest) -> Result<B256>;
    async fn wait_for_receipt(&self, tx_hash: B256, timeout: Duration) -> Result<Receipt>;
    /// Optional; the planner falls back to the lookup table when a node does
    /// not support estimation.
    async fn estimate_gas(&self, tx: &TxRequest) -> Result<Option<u64>> {
        let _ = tx;
        Ok(None)
    }
}

/// Private-orderflow relay interface.
#[async_trait]
pub trait RelayClient: Send + Sync {
    async fn simulate_bundle(&self, bundle: &Bundle) -> Result<SimResult>;
    async fn submit_bundle(&self, bundle: &Bundle, target_block: u64) -> Result<B256>;
}

/// One DEX worth of pools. The graph refresh fans out over all registered
/// sources in parallel.
#[async_trait]
pub trait PoolSource: Send + Sync {
    /// Stable tag for logs and the per-DEX pool cap.
    fn dex_id(&self) -> &str;
    async fn list_pools(&self, limit: usize) -> Result<Vec<Pool>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    struct NullRpc;

    #[async_trait]
    impl RpcClient for NullRpc {
        async fn block_number(&self) -> Result<u64> {
            Ok(0)
        }
        async fn base_fee(&self) -> Result<u128> {
            Ok(0)
        }
        async fn gas_price(&self) -> Result<u128> {
            Ok(0)
        }
        async fn send_transaction(&self, _tx: TxRequest) -> Result<B256> {
            Err(anyhow!("read-only client"))
        }
        async fn wait_for_receipt(&self, _tx_hash: B256, _timeout: Duration) -> Result<Receipt> {
            Err(anyhow!("read-only client"))
        }
    }

    #[test]
    fn test_estimate_gas_defaults_to_unsupported() {
        let tx = TxRequest {
            to: Address::ZERO,
            data: Vec::new(),
            value: U256::ZERO,
            gas_limit: 21_000,
            nonce_offset: 0,
            max_fee_per_gas_gwei: 0.0,
            max_priority_fee_gwei: 0.0,
        };
        let estimate = tokio_test::block_on(NullRpc.estimate_gas(&tx)).unwrap();
        assert!(estimate.is_none());
    }
}
