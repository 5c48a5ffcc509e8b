//! On-chain cyclic arbitrage opportunity engine
//!
//! Maintains a generational pool graph across DEX sources, enumerates
//! profitable cyclic token paths, sizes and allocates capital across them
//! under risk constraints, and emits atomic/sequential/parallel execution
//! plans. RPC, relay, and pool-source collaborators are consumed through
//! narrow traits; the engine itself owns no I/O beyond them.

pub mod allocator;
pub mod amm;
pub mod clients;
pub mod config;
pub mod engine;
pub mod errors;
pub mod evaluator;
pub mod execution;
pub mod gas;
pub mod graph;
pub mod pathfinder;
pub mod ranker;
pub mod risk;
pub mod types;

// Re-export the common surface.
pub use allocator::{AllocationOutcome, CapitalAllocator, MarketContext};
pub use clients::{Bundle, PoolSource, Receipt, RelayClient, RpcClient, SimResult, TxRequest};
pub use config::EngineConfig;
pub use engine::{ArbEngine, DiscoverOptions};
pub use errors::EngineError;
pub use evaluator::PathEvaluator;
pub use execution::ExecutionPlanner;
pub use gas::{FeeTarget, GasOracle};
pub use graph::{GraphSnapshot, PoolGraph};
pub use pathfinder::PathFinder;
pub use ranker::{PathRanker, RankStrategy};
pub use risk::RiskModel;
pub use types::{
    ExecutionPlan, ExecutionStrategy, MultiPathOpportunity, Path, Pool, PoolMetadata, PoolVariant,
    RiskProfile, TickSnapshot, Token,
};
