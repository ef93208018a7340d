use crate::planner::error::{PlanError, PlanResult};
use crate::planner::strategy::StrategyRegistry;
use crate::planner::types::{AccountCapacity, ChunkPlan, ChunkPolicy, PlannedChunk};

pub struct ChunkPlanner {
    policy: ChunkPolicy,
    strategies: StrategyRegistry,
}

impl ChunkPlanner {
    pub fn new(policy: ChunkPolicy) -> PlanResult<Self> {
        Self::with_registry(policy, StrategyRegistry::default())
    }

    pub fn with_registry(policy: ChunkPolicy, strategies: StrategyRegistry) -> PlanResult<Self> {
        policy.validate()?;
        Ok(Self { policy, strategies })
    }

    pub fn policy(&self) -> &ChunkPolicy {
        &self.policy
    }

    pub fn strategies(&self) -> &StrategyRegistry {
        &self.strategies
    }

    /// Target chunk size for a file spread over `eligible_accounts`
    pub fn chunk_size_for(&self, file_size: u64, eligible_accounts: usize) -> u64 {
        let divisor = (eligible_accounts as u64 * self.policy.target_chunks_per_account as u64).max(1);
        file_size
            .div_ceil(divisor)
            .clamp(self.policy.min_chunk_size, self.policy.max_chunk_size)
            .min(file_size)
    }

    /// Compute a chunk plan.
    ///
    /// Pure: the same size, strategy and capacities always give the same plan.
    pub fn plan(
        &self,
        file_size: u64,
        strategy: &str,
        accounts: &[AccountCapacity],
    ) -> PlanResult<ChunkPlan> {
        if file_size == 0 {
            return Err(PlanError::EmptyFile);
        }
        if accounts.is_empty() {
            return Err(PlanError::NoLinkedAccounts);
        }
        let allocator = self.strategies.get(strategy)?;

        let usable: Vec<AccountCapacity> = accounts
            .iter()
            .map(|a| AccountCapacity::new(a.account_id.clone(), self.policy.usable(a.free_bytes)))
            .filter(|a| a.free_bytes > 0)
            .collect();
        if usable.is_empty() {
            return Err(PlanError::NoLinkedAccounts);
        }

        let available: u64 = usable.iter().map(|a| a.free_bytes).sum();
        if available < file_size {
            return Err(PlanError::InsufficientCapacity {
                required: file_size,
                available,
            });
        }

        let chunk_size = self.chunk_size_for(file_size, usable.len());
        let mut sizes = Vec::with_capacity(file_size.div_ceil(chunk_size) as usize);
        let mut offset = 0u64;
        while offset < file_size {
            let size = chunk_size.min(file_size - offset);
            sizes.push(size);
            offset += size;
        }

        let targets = allocator.assign(&sizes, &usable)?;

        let mut chunks = Vec::with_capacity(sizes.len());
        let mut start = 0u64;
        for (index, (size, account_id)) in sizes.into_iter().zip(targets).enumerate() {
            chunks.push(PlannedChunk {
                index: index as u32,
                size,
                start_offset: start,
                end_offset: start + size,
                account_id,
            });
            start += size;
        }

        tracing::debug!(
            file_size,
            strategy,
            chunk_size,
            chunks = chunks.len(),
            "Computed chunk plan"
        );

        Ok(ChunkPlan {
            file_size,
            strategy: strategy.to_string(),
            chunk_size,
            chunks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::strategy::BALANCED;
    use rand::Rng;

    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * MB;

    fn planner() -> ChunkPlanner {
        ChunkPlanner::new(ChunkPolicy::default()).unwrap()
    }

    fn assert_partitions(plan: &ChunkPlan, accounts: &[AccountCapacity], margin: &ChunkPolicy) {
        let mut expected_start = 0;
        for (i, chunk) in plan.chunks.iter().enumerate() {
            assert_eq!(chunk.index as usize, i);
            assert_eq!(chunk.start_offset, expected_start);
            assert_eq!(chunk.end_offset - chunk.start_offset, chunk.size);
            assert!(chunk.size > 0);
            expected_start = chunk.end_offset;
        }
        assert_eq!(expected_start, plan.file_size);

        for (account, bytes) in plan.bytes_per_account() {
            let free = accounts
                .iter()
                .find(|a| a.account_id == account)
                .map(|a| a.free_bytes)
                .unwrap();
            assert!(bytes <= margin.usable(free));
        }
    }

    #[test]
    fn test_thirty_mb_over_two_accounts() {
        let accounts = vec![
            AccountCapacity::new("drive-a", GB),
            AccountCapacity::new("drive-b", GB),
        ];
        let plan = planner().plan(30 * MB, BALANCED, &accounts).unwrap();

        assert_partitions(&plan, &accounts, planner().policy());
        let per_account = plan.bytes_per_account();
        assert_eq!(per_account.len(), 2);
        assert!(plan.chunk_count() >= 2);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let accounts = vec![
            AccountCapacity::new("a", 5 * GB),
            AccountCapacity::new("b", 2 * GB),
            AccountCapacity::new("c", 800 * MB),
        ];
        let first = planner().plan(777 * MB + 13, BALANCED, &accounts).unwrap();
        let second = planner().plan(777 * MB + 13, BALANCED, &accounts).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_random_sizes_partition() {
        let mut rng = rand::thread_rng();
        let planner = planner();
        for _ in 0..200 {
            let accounts: Vec<AccountCapacity> = (0..rng.gen_range(1..5))
                .map(|i| AccountCapacity::new(format!("acct-{i}"), rng.gen_range(0..4 * GB)))
                .collect();
            let size = rng.gen_range(1..3 * GB);
            match planner.plan(size, BALANCED, &accounts) {
                Ok(plan) => assert_partitions(&plan, &accounts, planner.policy()),
                Err(PlanError::InsufficientCapacity { required, .. }) => assert!(required > 0),
                Err(PlanError::NoLinkedAccounts) => {}
                Err(e) => panic!("unexpected planning error: {e}"),
            }
        }
    }

    #[test]
    fn test_insufficient_capacity() {
        let accounts = vec![
            AccountCapacity::new("a", 25 * MB),
            AccountCapacity::new("b", 25 * MB),
        ];
        let result = planner().plan(100 * MB, BALANCED, &accounts);
        assert!(matches!(result, Err(PlanError::InsufficientCapacity { required, .. }) if required == 100 * MB));
    }

    #[test]
    fn test_safety_margin_applies() {
        let accounts = vec![AccountCapacity::new("a", 100 * MB)];
        // 2% margin leaves 98MB usable
        assert!(planner().plan(99 * MB, BALANCED, &accounts).is_err());
        assert!(planner().plan(98 * MB, BALANCED, &accounts).is_ok());
    }

    #[test]
    fn test_no_accounts() {
        assert_eq!(
            planner().plan(MB, BALANCED, &[]),
            Err(PlanError::NoLinkedAccounts)
        );
        let full = vec![AccountCapacity::new("a", 0), AccountCapacity::new("b", 0)];
        assert_eq!(
            planner().plan(MB, BALANCED, &full),
            Err(PlanError::NoLinkedAccounts)
        );
    }

    #[test]
    fn test_empty_file_and_unknown_strategy() {
        let accounts = vec![AccountCapacity::new("a", GB)];
        assert_eq!(planner().plan(0, BALANCED, &accounts), Err(PlanError::EmptyFile));
        assert!(matches!(
            planner().plan(MB, "striped", &accounts),
            Err(PlanError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn test_chunk_size_bounds() {
        let planner = planner();
        assert_eq!(planner.chunk_size_for(10 * GB, 2), 64 * MB);
        assert_eq!(planner.chunk_size_for(3 * MB, 2), MB);
        assert_eq!(planner.chunk_size_for(1000, 3), 1000);
        assert_eq!(planner.chunk_size_for(32 * MB, 2), 4 * MB);
    }

    #[test]
    fn test_small_file_single_chunk() {
        let accounts = vec![AccountCapacity::new("a", GB), AccountCapacity::new("b", GB)];
        let plan = planner().plan(4096, BALANCED, &accounts).unwrap();
        assert_eq!(plan.chunk_count(), 1);
        assert_eq!(plan.chunks[0].size, 4096);
        assert_eq!(plan.chunk_at_offset(0).map(|c| c.index), Some(0));
        assert!(plan.chunk_at_offset(1).is_none());
    }
}
