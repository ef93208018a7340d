//! Directory-backed storage accounts
//!
//! Each account is a directory under a common root with a configured quota:
//!
//! ```text
//! <root>/<account>/objects/<handle>
//! <root>/<account>/drivesplit.manifest
//! ```
//!
//! Objects are written to a temporary name and renamed into place, so a
//! crashed write never leaves a partial chunk under its final handle.

use crate::metadata::DriveManifest;
use crate::storage::adapter::StorageAdapter;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{AccountId, RemoteHandle, MANIFEST_NAME};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub struct LocalDirStorage {
    root: PathBuf,
    quotas: RwLock<HashMap<AccountId, u64>>,
}

impl LocalDirStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            quotas: RwLock::new(HashMap::new()),
        }
    }

    /// Register an account directory with a quota, creating it if needed
    pub async fn add_account(&self, account: &str, quota: u64) -> StorageResult<()> {
        validate_component(account)
            .ok_or_else(|| StorageError::UnknownAccount(account.to_string()))?;
        fs::create_dir_all(self.root.join(account).join("objects")).await?;
        self.quotas.write().insert(account.to_string(), quota);
        Ok(())
    }

    pub fn accounts(&self) -> Vec<AccountId> {
        let mut ids: Vec<AccountId> = self.quotas.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn quota(&self, account: &str) -> StorageResult<u64> {
        self.quotas
            .read()
            .get(account)
            .copied()
            .ok_or_else(|| StorageError::UnknownAccount(account.to_string()))
    }

    fn objects_dir(&self, account: &str) -> PathBuf {
        self.root.join(account).join("objects")
    }

    fn object_path(&self, account: &str, handle: &str) -> StorageResult<PathBuf> {
        validate_component(handle).ok_or_else(|| StorageError::NotFound {
            account_id: account.to_string(),
            handle: handle.to_string(),
        })?;
        Ok(self.objects_dir(account).join(handle))
    }

    async fn used_bytes(&self, account: &str) -> StorageResult<u64> {
        let mut used = 0u64;
        let mut entries = fs::read_dir(self.objects_dir(account)).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                used += metadata.len();
            }
        }
        Ok(used)
    }
}

fn validate_component(s: &str) -> Option<&str> {
    let ok = !s.is_empty()
        && s != "."
        && s != ".."
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.');
    ok.then_some(s)
}

#[async_trait]
impl StorageAdapter for LocalDirStorage {
    async fn capacity(&self, account: &str) -> StorageResult<u64> {
        let quota = self.quota(account)?;
        Ok(quota.saturating_sub(self.used_bytes(account).await?))
    }

    async fn write_chunk(
        &self,
        account: &str,
        name: &str,
        data: Bytes,
    ) -> StorageResult<RemoteHandle> {
        let available = self.capacity(account).await?;
        let required = data.len() as u64;
        if required > available {
            return Err(StorageError::CapacityExceeded {
                account_id: account.to_string(),
                required,
                available,
            });
        }

        let stem: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
            .collect();
        let handle = format!("{}-{}", uuid::Uuid::new_v4().simple(), stem);
        let final_path = self.object_path(account, &handle)?;
        let temp_path = self.root.join(account).join(format!(".{handle}.tmp"));

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, &final_path).await?;

        Ok(handle)
    }

    async fn read_chunk(&self, account: &str, handle: &str) -> StorageResult<Bytes> {
        self.quota(account)?;
        let path = self.object_path(account, handle)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                account_id: account.to_string(),
                handle: handle.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_chunk(&self, account: &str, handle: &str) -> StorageResult<()> {
        self.quota(account)?;
        let path = self.object_path(account, handle)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound {
                account_id: account.to_string(),
                handle: handle.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_manifest(&self, account: &str, manifest: &DriveManifest) -> StorageResult<()> {
        self.quota(account)?;
        let encoded = manifest.to_json_bytes()?;
        let path = self.root.join(account).join(MANIFEST_NAME);
        let temp_path = self.root.join(account).join(format!(".{MANIFEST_NAME}.tmp"));
        fs::write(&temp_path, encoded).await?;
        fs::rename(&temp_path, &path).await?;
        Ok(())
    }

    async fn read_manifest(&self, account: &str) -> StorageResult<Option<DriveManifest>> {
        self.quota(account)?;
        let path = self.root.join(account).join(MANIFEST_NAME);
        match fs::read(&path).await {
            Ok(raw) => Ok(Some(DriveManifest::from_json_bytes(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
