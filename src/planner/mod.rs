//! Chunk allocation planning
//!
//! Decides how many chunks a file is cut into and which linked account
//! receives each chunk. Planning is a pure function of its inputs, so a plan
//! can be previewed and later recomputed identically.

pub mod error;
pub mod planner;
pub mod strategy;
pub mod types;

pub use error::{PlanError, PlanResult};
pub use planner::ChunkPlanner;
pub use strategy::{AllocationStrategy, BalancedStrategy, StrategyRegistry, BALANCED};
pub use types::{AccountCapacity, ChunkPlan, ChunkPolicy, PlannedChunk};
