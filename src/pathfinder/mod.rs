//! Cyclic path enumeration
//!
//! Depth-limited DFS over a graph snapshot, yielding cycles that start and
//! end at a chosen token. Stateless apart from the borrowed snapshot:
//! repeated calls over the same generation produce identical output, because
//! successor lists are pre-sorted by (dex_id, fee_bps, pool address).

use crate::config::FinderConfig;
use crate::graph::GraphSnapshot;
use crate::types::{Path, Pool, Token};
use alloy::primitives::Address;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Bounded-length cycle finder.
#[derive(Debug, Clone)]
pub struct PathFinder {
    config: FinderConfig,
}

impl PathFinder {
    pub fn new(config: FinderConfig) -> Self {
        Self { config }
    }

    /// Enumerate cyclic paths from `start`, capped at `max_paths` and
    /// bounded by the exploration budget. Branches whose accumulated fee
    /// weight exceeds -ln(1 - max_total_fee) are pruned.
    pub fn find_cycles(&self, graph: &GraphSnapshot, start: Address) -> Vec<Path> {
        let start_token = match graph.token(start) {
            Some(t) => t,
            None => return Vec::new(),
        };

        let mut dfs = Dfs {
            graph,
            start,
            max_hops: self.config.max_hops.max(2),
            max_weight: max_fee_weight(self.config.max_total_fee_bps),
            max_paths: self.config.max_paths,
            budget: self.config.max_paths_exploration,
            visited: HashSet::new(),
            tokens: vec![start_token],
            pools: Vec::new(),
            weight: 0.0,
            explored: 0,
            found: Vec::new(),
        };
        dfs.walk(start);

        if dfs.explored >= dfs.budget {
            debug!(
                start = %start,
                explored = dfs.explored,
                found = dfs.found.len(),
                "exploration budget exhausted"
            );
        }
        dfs.found
    }

    /// Run `find_cycles` for many start tokens concurrently on the blocking
    /// pool, bounded by `concurrency_limit`, and merge the results.
    pub async fn find_for_many(
        &self,
        graph: Arc<GraphSnapshot>,
        tokens: Vec<Address>,
    ) -> Vec<Path> {
        let limit = self.config.concurrency_limit.max(1);
        let results: Vec<Vec<Path>> = stream::iter(tokens)
            .map(|token| {
                let finder = self.clone();
                let graph = Arc::clone(&graph);
                async move {
                    tokio::task::spawn_blocking(move || finder.find_cycles(&graph, token))
                        .await
                        .unwrap_or_default()
                }
            })
            .buffer_unordered(limit)
            .collect()
            .await;
        results.into_iter().flatten().collect()
    }
}

/// Prune threshold for the accumulated -ln(1 - fee) edge weights.
fn max_fee_weight(max_total_fee_bps: u32) -> f64 {
    let fee = (max_total_fee_bps.min(9_999)) as f64 / 10_000.0;
    -(1.0 - fee).ln()
}

struct Dfs<'a> {
    graph: &'a GraphSnapshot,
    start: Address,
    max_hops: usize,
    max_weight: f64,
    max_paths: usize,
    budget: usize,
    visited: HashSet<Address>,
    tokens: Vec<Token>,
    pools: Vec<Arc<Pool>>,
    weight: f64,
    explored: usize,
    found: Vec<Path>,
}

impl<'a> Dfs<'a> {
    fn walk(&mut self, from: Address) {
        if self.found.len() >= self.max_paths {
            return;
        }
        let successors: Vec<(Token, Arc<Pool>)> = self
            .graph
            .successors(from)
            .map(|(t, p)| (t, Arc::clone(p)))
            .collect();

        for (next, pool) in successors {
            if self.found.len() >= self.max_paths || self.explored >= self.budget {
                return;
            }
            self.explored += 1;

            let hop_weight = pool.fee_weight();
            if self.weight + hop_weight > self.max_weight {
                continue;
            }
            // A hop never unwinds through the pool it just crossed; a
            // same-pool round trip is a guaranteed fee loss.
            if self
                .pools
                .last()
                .map(|prev| prev.address == pool.address)
                .unwrap_or(false)
            {
                continue;
            }

            let hops_with_this = self.pools.len() + 1;
            if next.address == self.start {
                // The start token may only close the cycle, never appear in
                // the middle.
                if !self.pools.is_empty() && hops_with_this <= self.max_hops {
                    let mut tokens = self.tokens.clone();
                    tokens.push(next);
                    let mut pools = self.pools.clone();
                    pools.push(pool);
                    if let Ok(path) = Path::new(tokens, pools) {
                        self.found.push(path);
                    }
                }
                continue;
            }
            if self.visited.contains(&next.address) {
                continue;
            }
            // Need room for at least one more hop back to start.
            if hops_with_this >= self.max_hops {
                continue;
            }

            self.visited.insert(next.address);
            self.tokens.push(next);
            self.pools.push(pool);
            self.weight += hop_weight;

            self.walk(next.address);

            self.weight -= hop_weight;
            self.pools.pop();
            self.tokens.pop();
            self.visited.remove(&next.address);
        }
    }
}
