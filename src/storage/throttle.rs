//! Bounded, per-account serialized access to remote accounts

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::AccountId;
use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Gate every remote operation passes through.
///
/// Operations on the same account run one at a time; operations on different
/// accounts run in parallel up to `max_parallel` overall. An optional per-account
/// quota caps operations per second.
pub struct AccountThrottle {
    permits: Arc<Semaphore>,
    lanes: DashMap<AccountId, Arc<Mutex<()>>>,
    limiters: DashMap<AccountId, Arc<DirectLimiter>>,
    ops_per_second: Option<NonZeroU32>,
    max_parallel: usize,
}

/// Held for the duration of one remote operation
pub struct AccountPass {
    _lane: OwnedMutexGuard<()>,
    _permit: OwnedSemaphorePermit,
}

impl AccountThrottle {
    /// `ops_per_second == 0` disables rate limiting
    pub fn new(max_parallel: usize, ops_per_second: u32) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_parallel)),
            lanes: DashMap::new(),
            limiters: DashMap::new(),
            ops_per_second: NonZeroU32::new(ops_per_second),
            max_parallel,
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn is_rate_limited(&self) -> bool {
        self.ops_per_second.is_some()
    }

    /// Wait for this account's lane, a global slot, and the rate limiter
    pub async fn acquire(&self, account: &str) -> StorageResult<AccountPass> {
        let lane = self
            .lanes
            .entry(account.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let lane = lane.lock_owned().await;

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StorageError::PoolClosed)?;

        if let Some(quota) = self.ops_per_second {
            let limiter = self
                .limiters
                .entry(account.to_string())
                .or_insert_with(|| Arc::new(RateLimiter::direct(Quota::per_second(quota))))
                .clone();
            limiter.until_ready().await;
        }

        Ok(AccountPass {
            _lane: lane,
            _permit: permit,
        })
    }
}

impl Default for AccountThrottle {
    fn default() -> Self {
        Self::new(num_cpus::get() * 2, 0)
    }
}
