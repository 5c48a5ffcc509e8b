//! Immutable graph generation
//!
//! One atomically published version of the pool graph. Pools live in an
//! arena of shared handles; each pool contributes up to two directed edges
//! (one per quotable direction) that index back into the arena, so both
//! edges of a pool always observe the same record.

use crate::types::{Pool, Token};
use alloy::primitives::Address;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Edge {
    to: Address,
    pool: usize,
}

/// A single generation of the token/pool multigraph. Readers hold an `Arc`
/// to one generation; the writer never mutates a published generation.
#[derive(Debug)]
pub struct GraphSnapshot {
    generation: u64,
    refreshed_at: Instant,
    pools: Vec<Arc<Pool>>,
    edges: HashMap<Address, Vec<Edge>>,
    tokens: HashMap<Address, Token>,
}

impl GraphSnapshot {
    /// The empty zeroth generation, published before the first refresh.
    pub fn empty() -> Self {
        Self {
            generation: 0,
            refreshed_at: Instant::now(),
            pools: Vec::new(),
            edges: HashMap::new(),
            tokens: HashMap::new(),
        }
    }

    /// Build a generation from filtered pools. Successor lists are sorted by
    /// (dex_id, fee_bps, pool address) so traversal order is reproducible.
    pub fn build(generation: u64, pools: Vec<Pool>) -> Self {
        let pools: Vec<Arc<Pool>> = pools.into_iter().map(Arc::new).collect();
        let mut edges: HashMap<Address, Vec<Edge>> = HashMap::new();
        let mut tokens: HashMap<Address, Token> = HashMap::new();

        for (idx, pool) in pools.iter().enumerate() {
            tokens.entry(pool.token0.address).or_insert(pool.token0);
            tokens.entry(pool.token1.address).or_insert(pool.token1);
            if pool.quotable_from(pool.token0.address) {
                edges.entry(pool.token0.address).or_default().push(Edge {
                    to: pool.token1.address,
                    pool: idx,
                });
            }
            if pool.quotable_from(pool.token1.address) {
                edges.entry(pool.token1.address).or_default().push(Edge {
                    to: pool.token0.address,
                    pool: idx,
                });
            }
        }

        for list in edges.values_mut() {
            list.sort_by(|a, b| {
                let pa = &pools[a.pool];
                let pb = &pools[b.pool];
                (&pa.dex_id, pa.fee_bps, pa.address).cmp(&(&pb.dex_id, pb.fee_bps, pb.address))
            });
        }

        Self {
            generation,
            refreshed_at: Instant::now(),
            pools,
            edges,
            tokens,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn refreshed_at(&self) -> Instant {
        self.refreshed_at
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    pub fn pools(&self) -> &[Arc<Pool>] {
        &self.pools
    }

    pub fn token(&self, address: Address) -> Option<Token> {
        self.tokens.get(&address).copied()
    }

    /// Quotable outgoing edges from `token`, in deterministic order.
    pub fn successors(&self, token: Address) -> impl Iterator<Item = (Token, &Arc<Pool>)> + '_ {
        self.edges
            .get(&token)
            .into_iter()
            .flatten()
            .map(move |edge| (self.tokens[&edge.to], &self.pools[edge.pool]))
    }

    /// All pools connecting `from` to `to` in that direction.
    pub fn edge(&self, from: Address, to: Address) -> Vec<Arc<Pool>> {
        self.edges
            .get(&from)
            .into_iter()
            .flatten()
            .filter(|e| e.to == to)
            .map(|e| Arc::clone(&self.pools[e.pool]))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PoolMetadata, PoolVariant};
    use alloy::primitives::U256;

    fn tok(last: u8) -> Token {
        let mut bytes = [0u8; 20];
        bytes[19] = last;
        Token::new(Address::from(bytes), 18)
    }

    fn pool(addr_last: u8, a: Token, b: Token, dex: &str, fee: u32) -> Pool {
        let mut bytes = [0u8; 20];
        bytes[18] = 0xff;
        bytes[19] = addr_last;
        Pool::new(
            Address::from(bytes),
            a,
            b,
            Some((U256::from(1_000_000u64), U256::from(1_000_000u64))),
            fee,
            PoolVariant::ConstantProduct,
            dex,
            PoolMetadata::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_both_directions_share_the_record() {
        let (a, b) = (tok(1), tok(2));
        let snap = GraphSnapshot::build(1, vec![pool(1, a, b, "uniswap_v2", 30)]);
        let fwd = snap.edge(a.address, b.address);
        let back = snap.edge(b.address, a.address);
        assert_eq!(fwd.len(), 1);
        assert_eq!(back.len(), 1);
        assert!(Arc::ptr_eq(&fwd[0], &back[0]));
    }

    #[test]
    fn test_successors_deterministic_order() {
        let (a, b) = (tok(1), tok(2));
        // Same pair on three venues, inserted out of order.
        let snap = GraphSnapshot::build(
            1,
            vec![
                pool(3, a, b, "sushiswap", 30),
                pool(1, a, b, "apeswap", 30),
                pool(2, a, b, "apeswap", 5),
            ],
        );
        let order: Vec<(String, u32)> = snap
            .successors(a.address)
            .map(|(_, p)| (p.dex_id.clone(), p.fee_bps))
            .collect();
        assert_eq!(
            order,
            vec![
                ("apeswap".to_string(), 5),
                ("apeswap".to_string(), 30),
                ("sushiswap".to_string(), 30)
            ]
        );
    }

    #[test]
    fn test_zero_reserve_side_has_no_edge() {
        let (a, b) = (tok(1), tok(2));
        let mut p = pool(1, a, b, "uniswap_v2", 30);
        p.reserves = Some((U256::ZERO, U256::from(1_000u64)));
        let snap = GraphSnapshot::build(1, vec![p]);
        assert_eq!(snap.successors(a.address).count(), 0);
        assert_eq!(snap.successors(b.address).count(), 0);
    }
}
