use crate::planner::error::{PlanError, PlanResult};
use crate::planner::types::AccountCapacity;
use crate::storage::AccountId;
use std::collections::HashMap;
use std::sync::Arc;

/// Name of the built-in capacity-weighted strategy
pub const BALANCED: &str = "balanced";

/// Allocation policy: maps each chunk to a target account.
///
/// `accounts` carry usable (margin-adjusted) capacity. Implementations must be
/// deterministic and must never assign more bytes to an account than it has.
pub trait AllocationStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn assign(&self, chunk_sizes: &[u64], accounts: &[AccountCapacity])
        -> PlanResult<Vec<AccountId>>;
}

/// Capacity-weighted round-robin.
///
/// Each chunk goes to the eligible account whose committed fraction of its
/// capacity would be lowest after taking the chunk. Weights are re-derived
/// after every assignment; accounts that cannot absorb the chunk are skipped.
/// Equal accounts alternate, ties go to the earlier account.
#[derive(Debug, Default, Clone, Copy)]
pub struct BalancedStrategy;

impl AllocationStrategy for BalancedStrategy {
    fn name(&self) -> &str {
        BALANCED
    }

    fn assign(
        &self,
        chunk_sizes: &[u64],
        accounts: &[AccountCapacity],
    ) -> PlanResult<Vec<AccountId>> {
        let mut committed = vec![0u64; accounts.len()];
        let mut assignment = Vec::with_capacity(chunk_sizes.len());

        for (position, &size) in chunk_sizes.iter().enumerate() {
            let mut best: Option<usize> = None;

            for (i, account) in accounts.iter().enumerate() {
                if account.free_bytes.saturating_sub(committed[i]) < size {
                    continue;
                }
                best = match best {
                    None => Some(i),
                    Some(b) => {
                        // (committed_i + size) / cap_i  <  (committed_b + size) / cap_b
                        let lhs = (committed[i] + size) as u128 * accounts[b].free_bytes as u128;
                        let rhs = (committed[b] + size) as u128 * account.free_bytes as u128;
                        if lhs < rhs {
                            Some(i)
                        } else {
                            Some(b)
                        }
                    }
                };
            }

            let Some(chosen) = best else {
                let required = chunk_sizes[position..].iter().sum();
                let available = accounts
                    .iter()
                    .zip(&committed)
                    .map(|(a, c)| a.free_bytes.saturating_sub(*c))
                    .sum();
                return Err(PlanError::InsufficientCapacity {
                    required,
                    available,
                });
            };

            committed[chosen] += size;
            assignment.push(accounts[chosen].account_id.clone());
        }

        Ok(assignment)
    }
}

/// Strategies available to the planner, by name
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn AllocationStrategy>>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(BalancedStrategy));
        registry
    }
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    pub fn register(&mut self, strategy: Arc<dyn AllocationStrategy>) {
        self.strategies
            .insert(strategy.name().to_string(), strategy);
    }

    pub fn get(&self, name: &str) -> PlanResult<Arc<dyn AllocationStrategy>> {
        self.strategies
            .get(name)
            .cloned()
            .ok_or_else(|| PlanError::UnknownStrategy(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.keys().cloned().collect();
        names.sort();
        names
    }
}
