//! In-memory storage accounts
//!
//! Holds every account in process memory with a byte quota. Accounts can be
//! switched offline, revoked, or have stored objects corrupted, which makes
//! this the adapter used for simulations and tests.

use crate::metadata::DriveManifest;
use crate::storage::adapter::StorageAdapter;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{AccountId, RemoteHandle};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccountState {
    Online,
    Unreachable,
    Revoked,
}

#[derive(Debug)]
struct MemoryAccount {
    quota: u64,
    used: u64,
    state: AccountState,
    fail_manifest_writes: bool,
    objects: HashMap<RemoteHandle, (String, Bytes)>,
    manifest: Option<Bytes>,
}

impl MemoryAccount {
    fn new(quota: u64) -> Self {
        Self {
            quota,
            used: 0,
            state: AccountState::Online,
            fail_manifest_writes: false,
            objects: HashMap::new(),
            manifest: None,
        }
    }

    fn check_access(&self, account: &str) -> StorageResult<()> {
        match self.state {
            AccountState::Online => Ok(()),
            AccountState::Unreachable => Err(StorageError::Unreachable(account.to_string())),
            AccountState::Revoked => Err(StorageError::Revoked(account.to_string())),
        }
    }
}

pub struct MemoryStorage {
    accounts: RwLock<HashMap<AccountId, MemoryAccount>>,
    next_handle: AtomicU64,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Register an account with `quota` bytes of space
    pub fn add_account(&self, account: impl Into<AccountId>, quota: u64) {
        self.accounts
            .write()
            .insert(account.into(), MemoryAccount::new(quota));
    }

    pub fn set_quota(&self, account: &str, quota: u64) {
        if let Some(acct) = self.accounts.write().get_mut(account) {
            acct.quota = quota;
        }
    }

    pub fn set_unreachable(&self, account: &str, unreachable: bool) {
        if let Some(acct) = self.accounts.write().get_mut(account) {
            acct.state = if unreachable {
                AccountState::Unreachable
            } else {
                AccountState::Online
            };
        }
    }

    pub fn revoke(&self, account: &str) {
        if let Some(acct) = self.accounts.write().get_mut(account) {
            acct.state = AccountState::Revoked;
        }
    }

    pub fn fail_manifest_writes(&self, account: &str, fail: bool) {
        if let Some(acct) = self.accounts.write().get_mut(account) {
            acct.fail_manifest_writes = fail;
        }
    }

    /// Flip one byte of a stored object. Returns false if the object is absent.
    pub fn corrupt_object(&self, account: &str, handle: &str) -> bool {
        let mut accounts = self.accounts.write();
        let Some(acct) = accounts.get_mut(account) else {
            return false;
        };
        let Some((_, data)) = acct.objects.get_mut(handle) else {
            return false;
        };
        let mut bytes = data.to_vec();
        if let Some(first) = bytes.first_mut() {
            *first ^= 0xff;
        }
        *data = Bytes::from(bytes);
        true
    }

    pub fn object_count(&self, account: &str) -> usize {
        self.accounts
            .read()
            .get(account)
            .map(|a| a.objects.len())
            .unwrap_or(0)
    }

    /// Remote names of every object on the account, sorted
    pub fn object_names(&self, account: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .accounts
            .read()
            .get(account)
            .map(|a| a.objects.values().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn used_bytes(&self, account: &str) -> u64 {
        self.accounts.read().get(account).map(|a| a.used).unwrap_or(0)
    }

    /// Decoded manifest currently held by the account, bypassing access checks
    pub fn stored_manifest(&self, account: &str) -> Option<DriveManifest> {
        let raw = self.accounts.read().get(account)?.manifest.clone()?;
        DriveManifest::from_json_bytes(&raw).ok()
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn capacity(&self, account: &str) -> StorageResult<u64> {
        let accounts = self.accounts.read();
        let acct = accounts
            .get(account)
            .ok_or_else(|| StorageError::UnknownAccount(account.to_string()))?;
        acct.check_access(account)?;
        Ok(acct.quota.saturating_sub(acct.used))
    }

    async fn write_chunk(
        &self,
        account: &str,
        name: &str,
        data: Bytes,
    ) -> StorageResult<RemoteHandle> {
        let mut accounts = self.accounts.write();
        let acct = accounts
            .get_mut(account)
            .ok_or_else(|| StorageError::UnknownAccount(account.to_string()))?;
        acct.check_access(account)?;

        let size = data.len() as u64;
        let available = acct.quota.saturating_sub(acct.used);
        if size > available {
            return Err(StorageError::CapacityExceeded {
                account_id: account.to_string(),
                required: size,
                available,
            });
        }

        let handle = format!("mem-{:010}", self.next_handle.fetch_add(1, Ordering::Relaxed));
        acct.used += size;
        acct.objects.insert(handle.clone(), (name.to_string(), data));
        Ok(handle)
    }

    async fn read_chunk(&self, account: &str, handle: &str) -> StorageResult<Bytes> {
        let accounts = self.accounts.read();
        let acct = accounts
            .get(account)
            .ok_or_else(|| StorageError::UnknownAccount(account.to_string()))?;
        acct.check_access(account)?;
        acct.objects
            .get(handle)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| StorageError::NotFound {
                account_id: account.to_string(),
                handle: handle.to_string(),
            })
    }

    async fn delete_chunk(&self, account: &str, handle: &str) -> StorageResult<()> {
        let mut accounts = self.accounts.write();
        let acct = accounts
            .get_mut(account)
            .ok_or_else(|| StorageError::UnknownAccount(account.to_string()))?;
        acct.check_access(account)?;
        match acct.objects.remove(handle) {
            Some((_, data)) => {
                acct.used = acct.used.saturating_sub(data.len() as u64);
                Ok(())
            }
            None => Err(StorageError::NotFound {
                account_id: account.to_string(),
                handle: handle.to_string(),
            }),
        }
    }

    async fn write_manifest(&self, account: &str, manifest: &DriveManifest) -> StorageResult<()> {
        let encoded = manifest.to_json_bytes()?;
        let mut accounts = self.accounts.write();
        let acct = accounts
            .get_mut(account)
            .ok_or_else(|| StorageError::UnknownAccount(account.to_string()))?;
        acct.check_access(account)?;
        if acct.fail_manifest_writes {
            return Err(StorageError::Unreachable(account.to_string()));
        }
        acct.manifest = Some(Bytes::from(encoded));
        Ok(())
    }

    async fn read_manifest(&self, account: &str) -> StorageResult<Option<DriveManifest>> {
        let raw = {
            let accounts = self.accounts.read();
            let acct = accounts
                .get(account)
                .ok_or_else(|| StorageError::UnknownAccount(account.to_string()))?;
            acct.check_access(account)?;
            acct.manifest.clone()
        };
        match raw {
            Some(raw) => Ok(Some(DriveManifest::from_json_bytes(&raw)?)),
            None => Ok(None),
        }
    }
}
