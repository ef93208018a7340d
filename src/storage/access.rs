use crate::metadata::DriveManifest;
use crate::metrics::recorder;
use crate::storage::adapter::StorageAdapter;
use crate::storage::error::StorageResult;
use crate::storage::retry::RetryPolicy;
use crate::storage::throttle::AccountThrottle;
use crate::storage::types::RemoteHandle;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;

/// Adapter wrapped with the account throttle and the retry policy.
///
/// Every remote call made by the sessions goes through here. The throttle
/// pass is held across retries of one operation.
#[derive(Clone)]
pub struct StorageAccess {
    adapter: Arc<dyn StorageAdapter>,
    throttle: Arc<AccountThrottle>,
    retry: RetryPolicy,
}

impl StorageAccess {
    pub fn new(
        adapter: Arc<dyn StorageAdapter>,
        throttle: Arc<AccountThrottle>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            adapter,
            throttle,
            retry,
        }
    }

    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    pub fn throttle(&self) -> &Arc<AccountThrottle> {
        &self.throttle
    }

    pub async fn capacity(&self, account: &str) -> StorageResult<u64> {
        let _pass = self.throttle.acquire(account).await?;
        self.retry
            .run("capacity", || self.adapter.capacity(account))
            .await
    }

    pub async fn write_chunk(
        &self,
        account: &str,
        name: &str,
        data: Bytes,
    ) -> StorageResult<RemoteHandle> {
        let started = Instant::now();
        let size = data.len() as u64;
        let _pass = self.throttle.acquire(account).await?;
        let handle = self
            .retry
            .run("write_chunk", || self.adapter.write_chunk(account, name, data.clone()))
            .await?;
        recorder::record_chunk_written(account, size, started.elapsed());
        Ok(handle)
    }

    pub async fn read_chunk(&self, account: &str, handle: &str) -> StorageResult<Bytes> {
        let _pass = self.throttle.acquire(account).await?;
        let data = self
            .retry
            .run("read_chunk", || self.adapter.read_chunk(account, handle))
            .await?;
        recorder::record_chunk_read(account, data.len() as u64);
        Ok(data)
    }

    pub async fn delete_chunk(&self, account: &str, handle: &str) -> StorageResult<()> {
        let _pass = self.throttle.acquire(account).await?;
        self.retry
            .run("delete_chunk", || self.adapter.delete_chunk(account, handle))
            .await
    }

    pub async fn write_manifest(
        &self,
        account: &str,
        manifest: &DriveManifest,
    ) -> StorageResult<()> {
        let _pass = self.throttle.acquire(account).await?;
        self.retry
            .run("write_manifest", || self.adapter.write_manifest(account, manifest))
            .await
    }

    pub async fn read_manifest(&self, account: &str) -> StorageResult<Option<DriveManifest>> {
        let _pass = self.throttle.acquire(account).await?;
        self.retry
            .run("read_manifest", || self.adapter.read_manifest(account))
            .await
    }
}
