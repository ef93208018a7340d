use crate::metadata::DriveManifest;
use crate::storage::error::StorageResult;
use crate::storage::types::RemoteHandle;
use async_trait::async_trait;
use bytes::Bytes;

/// Byte-level access to linked storage accounts.
///
/// Implementations must keep "account unreachable/unauthorized" distinct from
/// "capacity exceeded" so the caller can tell a dead account from a full one.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Free bytes currently reported by the account
    async fn capacity(&self, account: &str) -> StorageResult<u64>;

    /// Store `data` under the human-readable `name`, returning the remote handle
    async fn write_chunk(&self, account: &str, name: &str, data: Bytes)
        -> StorageResult<RemoteHandle>;

    async fn read_chunk(&self, account: &str, handle: &str) -> StorageResult<Bytes>;

    async fn delete_chunk(&self, account: &str, handle: &str) -> StorageResult<()>;

    /// Replace the account's manifest
    async fn write_manifest(&self, account: &str, manifest: &DriveManifest) -> StorageResult<()>;

    async fn read_manifest(&self, account: &str) -> StorageResult<Option<DriveManifest>>;
}
