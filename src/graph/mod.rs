//! Pool graph maintenance
//!
//! Keeps a fresh view of all usable pools across the registered DEX sources.
//! Refresh is generational: a new snapshot is assembled off to the side and
//! published with a single pointer store, so concurrent readers never see a
//! partially built graph and publication is monotonic.

mod snapshot;

pub use snapshot::GraphSnapshot;

use crate::clients::PoolSource;
use crate::config::GraphConfig;
use crate::errors::EngineError;
use crate::types::Pool;
use alloy::primitives::{Address, U256};
use arc_swap::ArcSwap;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pool admission filters, applied in order during refresh.
#[derive(Debug, Clone, Default)]
pub struct GraphFilters {
    /// Any pool touching one of these is dropped.
    pub excluded_tokens: HashSet<Address>,
    /// If non-empty, a pool must touch at least one of these.
    pub included_tokens: HashSet<Address>,
    /// Pools below this token0-reserve floor are dropped.
    pub min_liquidity: U256,
    /// Per-DEX cap; the tail by liquidity is dropped. Zero disables.
    pub max_pools_per_dex: usize,
}

impl GraphFilters {
    fn apply(&self, pools: Vec<Pool>) -> Vec<Pool> {
        let before = pools.len();
        let mut kept: Vec<Pool> = pools
            .into_iter()
            .filter(|p| {
                !self.excluded_tokens.contains(&p.token0.address)
                    && !self.excluded_tokens.contains(&p.token1.address)
            })
            .filter(|p| {
                self.included_tokens.is_empty()
                    || self.included_tokens.contains(&p.token0.address)
                    || self.included_tokens.contains(&p.token1.address)
            })
            .filter(|p| self.min_liquidity.is_zero() || p.liquidity_score() >= self.min_liquidity)
            .collect();

        if self.max_pools_per_dex > 0 {
            let mut by_dex: HashMap<String, Vec<Pool>> = HashMap::new();
            for p in kept.drain(..) {
                by_dex.entry(p.dex_id.clone()).or_default().push(p);
            }
            for (_, mut list) in by_dex {
                list.sort_by(|a, b| b.liquidity_score().cmp(&a.liquidity_score()));
                list.truncate(self.max_pools_per_dex);
                kept.extend(list);
            }
        }

        debug!(
            kept = kept.len(),
            dropped = before - kept.len(),
            "applied graph filters"
        );
        kept
    }
}

/// Directed multigraph of tokens and pools with TTL-gated generational
/// refresh.
pub struct PoolGraph {
    sources: Vec<Arc<dyn PoolSource>>,
    filters: GraphFilters,
    ttl: Duration,
    source_timeout: Duration,
    refresh_concurrency: usize,
    pools_per_source: usize,
    max_retries: u32,
    current: ArcSwap<GraphSnapshot>,
    // Held only while assembling and publishing a generation, never across
    // reader access.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl PoolGraph {
    pub fn new(sources: Vec<Arc<dyn PoolSource>>, config: &GraphConfig) -> Self {
        let filters = GraphFilters {
            excluded_tokens: config.excluded_tokens.iter().copied().collect(),
            included_tokens: config.included_tokens.iter().copied().collect(),
            min_liquidity: U256::from(config.min_liquidity),
            max_pools_per_dex: config.max_pools_per_dex,
        };
        Self {
            sources,
            filters,
            ttl: Duration::from_secs(config.graph_ttl_seconds),
            source_timeout: Duration::from_secs(config.source_timeout_seconds),
            refresh_concurrency: config.refresh_concurrency.max(1),
            pools_per_source: config.max_pools_per_source,
            max_retries: config.max_retries,
            current: ArcSwap::from_pointee(GraphSnapshot::empty()),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Immutable handle to the current generation. Safe to hold across an
    /// entire discovery pipeline; later refreshes do not disturb it.
    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        self.current.load_full()
    }

    /// Refresh the graph if the TTL has lapsed. Idempotent within the TTL.
    ///
    /// Sources are fetched in parallel under a bounded concurrency limit; a
    /// failing source is logged and skipped. If no source yields any pool
    /// the previous generation is preserved and `RefreshStale` is returned.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<(), EngineError> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let _guard = self.refresh_lock.lock().await;

        let prior = self.current.load_full();
        if prior.generation() > 0 && prior.refreshed_at().elapsed() < self.ttl {
            debug!(generation = prior.generation(), "graph still fresh");
            return Ok(());
        }

        let fetched: Vec<Option<Vec<Pool>>> = stream::iter(self.sources.iter().cloned())
            .map(|source| self.fetch_source(source, cancel.clone()))
            .buffer_unordered(self.refresh_concurrency)
            .collect()
            .await;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let pools: Vec<Pool> = fetched.into_iter().flatten().flatten().collect();
        if pools.is_empty() {
            warn!("no source delivered pools; keeping previous generation");
            return Err(EngineError::RefreshStale);
        }

        let kept = self.filters.apply(pools);
        if kept.is_empty() {
            warn!("filters removed every fetched pool; keeping previous generation");
            return Err(EngineError::RefreshStale);
        }

        let next = GraphSnapshot::build(prior.generation() + 1, kept);
        info!(
            generation = next.generation(),
            pools = next.pool_count(),
            tokens = next.token_count(),
            "published graph generation"
        );
        self.current.store(Arc::new(next));
        Ok(())
    }

    /// Fetch one source with timeout, retry, and cancellation. Returns None
    /// on failure so the caller can skip it.
    async fn fetch_source(
        &self,
        source: Arc<dyn PoolSource>,
        cancel: CancellationToken,
    ) -> Option<Vec<Pool>> {
        let started = std::time::Instant::now();
        let mut delay = Duration::from_millis(100);
        let mut attempt = 0u32;
        loop {
            let fetch = tokio::time::timeout(self.source_timeout, source.list_pools(self.pools_per_source));
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return None,
                res = fetch => res,
            };
            match outcome {
                Ok(Ok(pools)) => {
                    debug!(
                        dex = source.dex_id(),
                        pools = pools.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "fetched pool set"
                    );
                    return Some(pools);
                }
                Ok(Err(err)) if attempt < self.max_retries => {
                    debug!(dex = source.dex_id(), attempt, error = %err, "source fetch retry");
                }
                Ok(Err(err)) => {
                    warn!(dex = source.dex_id(), error = %err, "source failed; skipping this cycle");
                    return None;
                }
                Err(_) if attempt < self.max_retries => {
                    debug!(dex = source.dex_id(), attempt, "source fetch timed out; retrying");
                }
                Err(_) => {
                    warn!(dex = source.dex_id(), "source timed out; skipping this cycle");
                    return None;
                }
            }
            attempt += 1;
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            delay *= 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PoolMetadata, PoolVariant, Token};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tok(last: u8) -> Token {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Token::new(Address::from(bytes), 18)
    }

    fn pool(addr_last: u8, a: Token, b: Token, dex: &str, r0: u64) -> Pool {
        let mut bytes = [0u8; 20];
        bytes[18] = 0xaa;
        bytes[19] = addr_last;
        Pool::new(
            Address::from(bytes),
            a,
            b,
            Some((U256::from(r0), U256::from(r0) * U256::from(2u8))),
            30,
            PoolVariant::ConstantProduct,
            dex,
            PoolMetadata::default(),
        )
        .unwrap()
    }

    struct StaticSource {
        dex: String,
        pools: Vec<Pool>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl StaticSource {
        fn ok(dex: &str, pools: Vec<Pool>) -> Arc<Self> {
            Arc::new(Self {
                dex: dex.into(),
                pools,
                fail: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(dex: &str) -> Arc<Self> {
            Arc::new(Self {
                dex: dex.into(),
                pools: Vec::new(),
                fail: true,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PoolSource for StaticSource {
        fn dex_id(&self) -> &str {
            &self.dex
        }

        async fn list_pools(&self, _limit: usize) -> anyhow::Result<Vec<Pool>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(anyhow!("source offline"))
            } else {
                Ok(self.pools.clone())
            }
        }
    }

    fn config() -> GraphConfig {
        GraphConfig {
            graph_ttl_seconds: 300,
            max_retries: 0,
            ..GraphConfig::default()
        }
    }

    #[tokio::test]
    async fn test_refresh_publishes_generation() {
        let (a, b) = (tok(1), tok(2));
        let graph = PoolGraph::new(
            vec![StaticSource::ok("uniswap_v2", vec![pool(1, a, b, "uniswap_v2", 1_000)])],
            &config(),
        );
        assert_eq!(graph.snapshot().generation(), 0);
        graph.refresh(&CancellationToken::new()).await.unwrap();
        let snap = graph.snapshot();
        assert_eq!(snap.generation(), 1);
        assert_eq!(snap.pool_count(), 1);
    }

    #[tokio::test]
    async fn test_refresh_within_ttl_is_noop() {
        let (a, b) = (tok(1), tok(2));
        let source = StaticSource::ok("uniswap_v2", vec![pool(1, a, b, "uniswap_v2", 1_000)]);
        let graph = PoolGraph::new(vec![source.clone()], &config());
        let cancel = CancellationToken::new();
        graph.refresh(&cancel).await.unwrap();
        graph.refresh(&cancel).await.unwrap();
        assert_eq!(graph.snapshot().generation(), 1);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partial_source_failure_is_tolerated() {
        let (a, b) = (tok(1), tok(2));
        let graph = PoolGraph::new(
            vec![
                StaticSource::failing("sushiswap"),
                StaticSource::ok("uniswap_v2", vec![pool(1, a, b, "uniswap_v2", 1_000)]),
            ],
            &config(),
        );
        graph.refresh(&CancellationToken::new()).await.unwrap();
        assert_eq!(graph.snapshot().pool_count(), 1);
    }

    #[tokio::test]
    async fn test_total_failure_keeps_previous_generation() {
        let (a, b) = (tok(1), tok(2));
        let good = StaticSource::ok("uniswap_v2", vec![pool(1, a, b, "uniswap_v2", 1_000)]);
        let mut cfg = config();
        cfg.graph_ttl_seconds = 0;
        let graph = PoolGraph::new(vec![good], &cfg);
        let cancel = CancellationToken::new();
        graph.refresh(&cancel).await.unwrap();
        let before = graph.snapshot();

        // Swap in a graph whose only source now fails.
        let failing = PoolGraph::new(vec![StaticSource::failing("uniswap_v2")], &cfg);
        failing.current.store(before.clone());
        let err = failing.refresh(&cancel).await;
        assert!(matches!(err, Err(EngineError::RefreshStale)));
        assert_eq!(failing.snapshot().generation(), before.generation());
    }

    #[tokio::test]
    async fn test_generations_monotonic() {
        let (a, b) = (tok(1), tok(2));
        let mut cfg = config();
        cfg.graph_ttl_seconds = 0;
        let graph = PoolGraph::new(
            vec![StaticSource::ok("uniswap_v2", vec![pool(1, a, b, "uniswap_v2", 1_000)])],
            &cfg,
        );
        let cancel = CancellationToken::new();
        let mut last = graph.snapshot().generation();
        for _ in 0..3 {
            graph.refresh(&cancel).await.unwrap();
            let gen = graph.snapshot().generation();
            assert!(gen > last);
            last = gen;
        }
    }

    #[tokio::test]
    async fn test_excluded_token_filter() {
        let (a, b, c) = (tok(1), tok(2), tok(3));
        let mut cfg = config();
        cfg.excluded_tokens = vec![c.address];
        let graph = PoolGraph::new(
            vec![StaticSource::ok(
                "uniswap_v2",
                vec![
                    pool(1, a, b, "uniswap_v2", 1_000),
                    pool(2, a, c, "uniswap_v2", 1_000),
                ],
            )],
            &cfg,
        );
        graph.refresh(&CancellationToken::new()).await.unwrap();
        assert_eq!(graph.snapshot().pool_count(), 1);
    }

    #[tokio::test]
    async fn test_min_liquidity_filter() {
        let (a, b) = (tok(1), tok(2));
        let mut cfg = config();
        cfg.min_liquidity = 500;
        let graph = PoolGraph::new(
            vec![StaticSource::ok(
                "uniswap_v2",
                vec![
                    pool(1, a, b, "uniswap_v2", 1_000),
                    pool(2, a, b, "uniswap_v2", 100),
                ],
            )],
            &cfg,
        );
        graph.refresh(&CancellationToken::new()).await.unwrap();
        assert_eq!(graph.snapshot().pool_count(), 1);
    }

    #[tokio::test]
    async fn test_max_pools_per_dex_keeps_deepest() {
        let (a, b) = (tok(1), tok(2));
        let mut cfg = config();
        cfg.max_pools_per_dex = 1;
        let graph = PoolGraph::new(
            vec![StaticSource::ok(
                "uniswap_v2",
                vec![
                    pool(1, a, b, "uniswap_v2", 100),
                    pool(2, a, b, "uniswap_v2", 9_000),
                ],
            )],
            &cfg,
        );
        graph.refresh(&CancellationToken::new()).await.unwrap();
        let snap = graph.snapshot();
        assert_eq!(snap.pool_count(), 1);
        assert_eq!(
            snap.pools()[0].liquidity_score(),
            U256::from(9_000u64)
        );
    }

    #[tokio::test]
    async fn test_cancelled_refresh() {
        let (a, b) = (tok(1), tok(2));
        let graph = PoolGraph::new(
            vec![StaticSource::ok("uniswap_v2", vec![pool(1, a, b, "uniswap_v2", 1_000)])],
            &config(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = graph.refresh(&cancel).await;
        assert!(matches!(err, Err(EngineError::Cancelled)));
        assert_eq!(graph.snapshot().generation(), 0);
    }
}
