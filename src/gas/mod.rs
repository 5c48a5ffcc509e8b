//! Gas tracking and fee policy
//!
//! Ring buffer of observed (base fee, gas price) samples with least-squares
//! short-horizon prediction, the priority-fee policy, and the per-hop gas
//! cost table used by the evaluator and planner. Gas values are gwei
//! internally and become native base units only when priced into a cost.

use crate::clients::RpcClient;
use crate::config::GasConfig;
use crate::errors::EngineError;
use crate::types::{Path, PoolVariant};
use alloy::primitives::U256;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Intrinsic transaction cost.
pub const BASE_TX_GAS: u64 = 21_000;
/// Conservative per-hop default for unknown (dex, variant) keys.
pub const DEFAULT_HOP_GAS: u64 = 100_000;

/// Per-hop gas keyed "dex_id:variant". Unknown keys fall back to
/// `DEFAULT_HOP_GAS`.
static HOP_GAS_TABLE: Lazy<HashMap<&'static str, u64>> = Lazy::new(|| {
    HashMap::from([
        ("uniswap_v2:constant_product", 90_000),
        ("sushiswap:constant_product", 90_000),
        ("quickswap:constant_product", 92_000),
        ("apeswap:constant_product", 92_000),
        ("uniswap_v3:concentrated", 130_000),
        ("sushiswap_v3:concentrated", 130_000),
        ("quickswap_v3:concentrated", 140_000),
        ("curve:stable", 180_000),
        ("balancer_v2:weighted", 120_000),
        ("balancer_v2:stable", 160_000),
    ])
});

/// Per-hop swap cost for a venue and pool variant.
pub fn hop_gas_cost(dex_id: &str, variant: &PoolVariant) -> u64 {
    let key = format!("{}:{}", dex_id, variant.label());
    HOP_GAS_TABLE
        .get(key.as_str())
        .copied()
        .unwrap_or(DEFAULT_HOP_GAS)
}

/// Intrinsic cost plus per-hop costs, scaled by the configured buffer.
pub fn estimate_path_gas(path: &Path, gas_buffer: f64) -> u64 {
    let raw: u64 = BASE_TX_GAS
        + path
            .pools
            .iter()
            .map(|p| hop_gas_cost(&p.dex_id, &p.variant))
            .sum::<u64>();
    (raw as f64 * gas_buffer.max(1.0)).ceil() as u64
}

/// Price a gas amount into native base units (wei).
pub fn gas_cost_base_units(gas: u64, gas_price_gwei: f64) -> U256 {
    let wei_per_gas = (gas_price_gwei.max(0.0) * 1e9) as u128;
    U256::from(gas as u128) * U256::from(wei_per_gas)
}

pub fn wei_to_gwei(wei: u128) -> f64 {
    wei as f64 / 1e9
}

/// Priority-fee targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FeeTarget {
    Speed,
    Cost,
    #[default]
    Balanced,
}

#[derive(Debug, Clone, Copy)]
pub struct GasSample {
    pub at: Instant,
    pub base_fee_gwei: f64,
    pub gas_price_gwei: f64,
}

/// Point prediction with a 95% interval, all gwei.
#[derive(Debug, Clone, Copy)]
pub struct GasForecast {
    pub point_gwei: f64,
    pub low_gwei: f64,
    pub high_gwei: f64,
}

/// Single-writer (the refresh task), multi-reader gas history.
pub struct GasOracle {
    config: GasConfig,
    window: RwLock<VecDeque<GasSample>>,
    last_update: Mutex<Option<Instant>>,
}

impl GasOracle {
    pub fn new(config: GasConfig) -> Self {
        Self {
            config,
            window: RwLock::new(VecDeque::new()),
            last_update: Mutex::new(None),
        }
    }

    /// Query the RPC client for fresh gas data, rate-limited to the
    /// configured update interval. Transient failures retry with backoff;
    /// exhaustion surfaces `SourceUnavailable`.
    pub async fn refresh(
        &self,
        rpc: &dyn RpcClient,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        {
            let last = self.last_update.lock().expect("gas update lock");
            if let Some(at) = *last {
                if at.elapsed() < Duration::from_secs(self.config.gas_price_update_interval_seconds)
                {
                    return Ok(());
                }
            }
        }

        let timeout = Duration::from_secs(self.config.rpc_timeout_seconds);
        let mut delay = Duration::from_millis(100);
        let mut attempt = 0u32;
        loop {
            let query = async {
                let base_fee = rpc.base_fee().await?;
                let gas_price = rpc.gas_price().await?;
                anyhow::Ok((base_fee, gas_price))
            };
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                res = tokio::time::timeout(timeout, query) => res,
            };
            match outcome {
                Ok(Ok((base_fee, gas_price))) => {
                    self.record_sample(wei_to_gwei(base_fee), wei_to_gwei(gas_price));
                    return Ok(());
                }
                Ok(Err(err)) if attempt < self.config.max_retries => {
                    debug!(attempt, error = %err, "gas query retry");
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "gas query failed");
                    return Err(EngineError::SourceUnavailable {
                        source_name: "rpc gas".into(),
                        reason: err.to_string(),
                    });
                }
                Err(_) if attempt < self.config.max_retries => {
                    debug!(attempt, "gas query timed out; retrying");
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

    /// Append a sample, trimming the ring to its configured size.
    pub fn record_sample(&self, base_fee_gwei: f64, gas_price_gwei: f64) {
        let mut window = self.window.write().expect("gas window lock");
        window.push_back(GasSample {
            at: Instant::now(),
            base_fee_gwei,
            gas_price_gwei,
        });
        while window.len() > self.config.history_size.max(1) {
            window.pop_front();
        }
        *self.last_update.lock().expect("gas update lock") = Some(Instant::now());
    }

    /// Latest (base fee, suggested gas price), clamped to the price ceiling.
    pub fn current(&self) -> Option<(f64, f64)> {
        let window = self.window.read().expect("gas window lock");
        window.back().map(|s| {
            (
                s.base_fee_gwei,
                s.gas_price_gwei.clamp(1.0, self.config.max_gas_price_gwei),
            )
        })
    }

    /// Least-squares extrapolation of the gas price `horizon_seconds` ahead
    /// with a 95% interval, clamped to [1 gwei, max_gas_price].
    pub fn predict(&self, horizon_seconds: f64) -> Option<GasForecast> {
        let window = self.window.read().expect("gas window lock");
        let n = window.len();
        if n == 0 {
            return None;
        }
        let clamp = |v: f64| v.clamp(1.0, self.config.max_gas_price_gwei);
        if n == 1 {
            let p = clamp(window[0].gas_price_gwei);
            return Some(GasForecast {
                point_gwei: p,
                low_gwei: p,
                high_gwei: p,
            });
        }

        let t0 = window.front().expect("non-empty window").at;
        let xs: Vec<f64> = window
            .iter()
            .map(|s| s.at.duration_since(t0).as_secs_f64())
            .collect();
        let ys: Vec<f64> = window.iter().map(|s| s.gas_price_gwei).collect();
        let nf = n as f64;
        let mean_x = xs.iter().sum::<f64>() / nf;
        let mean_y = ys.iter().sum::<f64>() / nf;
        let sxx: f64 = xs.iter().map(|x| (x - mean_x).powi(2)).sum();
        let slope = if sxx.abs() < f64::EPSILON {
            0.0
        } else {
            xs.iter()
                .zip(&ys)
                .map(|(x, y)| (x - mean_x) * (y - mean_y))
                .sum::<f64>()
                / sxx
        };
        let intercept = mean_y - slope * mean_x;
        let target = xs.last().copied().unwrap_or(0.0) + horizon_seconds.max(0.0);
        let point = intercept + slope * target;

        let residual_var = xs
            .iter()
            .zip(&ys)
            .map(|(x, y)| (y - (intercept + slope * x)).powi(2))
            .sum::<f64>()
            / (nf - 1.0);
        let half_interval = 1.96 * residual_var.sqrt();

        Some(GasForecast {
            point_gwei: clamp(point),
            low_gwei: clamp(point - half_interval),
            high_gwei: clamp(point + half_interval),
        })
    }

    /// Priority fee for a target, derived from the latest base fee and
    /// clamped into the configured band.
    pub fn priority_fee(&self, target: FeeTarget) -> f64 {
        let band = |v: f64| {
            v.clamp(
                self.config.min_priority_fee_gwei,
                self.config.max_priority_fee_gwei,
            )
        };
        match target {
            FeeTarget::Cost => self.config.min_priority_fee_gwei,
            FeeTarget::Balanced => {
                let base = self.current().map(|(b, _)| b).unwrap_or(0.0);
                band(base * 0.2)
            }
            FeeTarget::Speed => {
                let base = self.current().map(|(b, _)| b).unwrap_or(0.0);
                band(base * 0.5)
            }
        }
    }

    /// Cloned window for diagnostics.
    pub fn history(&self) -> Vec<GasSample> {
        self.window
            .read()
            .expect("gas window lock")
            .iter()
            .copied()
            .collect()
    }
}
