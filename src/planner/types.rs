use crate::planner::error::{PlanError, PlanResult};
use crate::storage::AccountId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Free space reported by one linked account at planning time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountCapacity {
    pub account_id: AccountId,
    pub free_bytes: u64,
}

impl AccountCapacity {
    pub fn new(account_id: impl Into<AccountId>, free_bytes: u64) -> Self {
        Self {
            account_id: account_id.into(),
            free_bytes,
        }
    }
}

/// Bounds on chunk sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkPolicy {
    pub min_chunk_size: u64,
    pub max_chunk_size: u64,
    /// Preferred number of chunks per eligible account
    pub target_chunks_per_account: u32,
    /// Fraction of each account's free space held back, in `[0, 1)`
    pub safety_margin: f64,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            min_chunk_size: 1024 * 1024,       // 1MB
            max_chunk_size: 64 * 1024 * 1024,  // 64MB
            target_chunks_per_account: 4,
            safety_margin: 0.02,
        }
    }
}

impl ChunkPolicy {
    pub fn validate(&self) -> PlanResult<()> {
        if self.min_chunk_size == 0 {
            return Err(PlanError::InvalidPolicy("min_chunk_size must be positive".into()));
        }
        if self.min_chunk_size > self.max_chunk_size {
            return Err(PlanError::InvalidPolicy(format!(
                "min_chunk_size {} exceeds max_chunk_size {}",
                self.min_chunk_size, self.max_chunk_size
            )));
        }
        if self.target_chunks_per_account == 0 {
            return Err(PlanError::InvalidPolicy(
                "target_chunks_per_account must be positive".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.safety_margin) {
            return Err(PlanError::InvalidPolicy(format!(
                "safety_margin {} outside [0, 1)",
                self.safety_margin
            )));
        }
        Ok(())
    }

    /// Capacity an account may actually be planned against
    pub fn usable(&self, free_bytes: u64) -> u64 {
        let reserved = (free_bytes as f64 * self.safety_margin).floor() as u64;
        free_bytes.saturating_sub(reserved)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedChunk {
    pub index: u32,
    pub size: u64,
    /// Inclusive
    pub start_offset: u64,
    /// Exclusive
    pub end_offset: u64,
    pub account_id: AccountId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub file_size: u64,
    pub strategy: String,
    pub chunk_size: u64,
    pub chunks: Vec<PlannedChunk>,
}

impl ChunkPlan {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Planned chunk starting exactly at `offset`
    pub fn chunk_at_offset(&self, offset: u64) -> Option<&PlannedChunk> {
        self.chunks
            .binary_search_by_key(&offset, |c| c.start_offset)
            .ok()
            .map(|i| &self.chunks[i])
    }

    pub fn chunk(&self, index: u32) -> Option<&PlannedChunk> {
        self.chunks.get(index as usize)
    }

    /// Bytes assigned to each account
    pub fn bytes_per_account(&self) -> BTreeMap<AccountId, u64> {
        let mut totals = BTreeMap::new();
        for chunk in &self.chunks {
            *totals.entry(chunk.account_id.clone()).or_insert(0) += chunk.size;
        }
        totals
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_valid() {
        assert!(ChunkPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_policies() {
        let policy = ChunkPolicy {
            min_chunk_size: 10,
            max_chunk_size: 5,
            ..Default::default()
        };
        assert!(matches!(policy.validate(), Err(PlanError::InvalidPolicy(_))));

        let policy = ChunkPolicy {
            safety_margin: 1.0,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_usable_capacity() {
        let policy = ChunkPolicy {
            safety_margin: 0.1,
            ..Default::default()
        };
        assert_eq!(policy.usable(1000), 900);
        assert_eq!(policy.usable(0), 0);
    }
}
