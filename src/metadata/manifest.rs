use crate::ident::FileId;
use crate::metadata::error::MetadataResult;
use crate::metadata::store::MetadataStore;
use crate::metadata::types::{DriveManifest, FileStatus, ManifestFile, StoredFile};
use crate::metrics::recorder;
use crate::storage::{AccountId, StorageAccess};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Accounts whose remote manifest copy was or was not refreshed
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestOutcome {
    pub written: Vec<AccountId>,
    pub failed: Vec<AccountId>,
}

impl ManifestOutcome {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Dual writer for per-account manifests.
///
/// The central copy is merged under the store's document lock and must
/// succeed. The copy on the account itself is best-effort: failures are
/// logged and counted, and a later write or [`ManifestWriter::rebuild_all`]
/// reconciles it.
pub struct ManifestWriter {
    store: Arc<MetadataStore>,
    storage: StorageAccess,
    push_locks: DashMap<AccountId, Arc<Mutex<()>>>,
}

impl ManifestWriter {
    pub fn new(store: Arc<MetadataStore>, storage: StorageAccess) -> Self {
        Self {
            store,
            storage,
            push_locks: DashMap::new(),
        }
    }

    /// Merge `file`'s chunks into the manifest of every account that holds one
    pub async fn publish(&self, file: &StoredFile) -> MetadataResult<ManifestOutcome> {
        let mut outcome = ManifestOutcome::default();
        for account in file.accounts() {
            let entry = ManifestFile::for_account(file, &account);
            self.store
                .update_manifest(&account, |manifest| manifest.merge_file(entry))
                .await?;
            self.push(&account, &mut outcome).await?;
        }
        Ok(outcome)
    }

    /// Drop `file_id` from the given accounts' manifests
    pub async fn retract(
        &self,
        file_id: &FileId,
        accounts: impl IntoIterator<Item = AccountId>,
    ) -> MetadataResult<ManifestOutcome> {
        let mut outcome = ManifestOutcome::default();
        for account in accounts {
            self.store
                .update_manifest(&account, |manifest| {
                    manifest.remove_file(file_id);
                })
                .await?;
            self.push(&account, &mut outcome).await?;
        }
        Ok(outcome)
    }

    /// Rewrite every manifest of `owner`'s linked accounts from central metadata
    pub async fn rebuild_all(&self, owner: &str) -> MetadataResult<ManifestOutcome> {
        let files: Vec<StoredFile> = self
            .store
            .list_files(owner)
            .await?
            .into_iter()
            .filter(|f| f.status == FileStatus::Active)
            .collect();

        let mut outcome = ManifestOutcome::default();
        for account in self.store.linked_accounts(owner).await? {
            let entries: Vec<ManifestFile> = files
                .iter()
                .map(|f| ManifestFile::for_account(f, &account.account_id))
                .filter(|entry| !entry.chunks.is_empty())
                .collect();

            self.store
                .update_manifest(&account.account_id, |manifest| {
                    manifest.files = entries;
                    manifest.updated_at = chrono::Utc::now();
                })
                .await?;
            self.push(&account.account_id, &mut outcome).await?;
        }

        tracing::info!(
            owner,
            written = outcome.written.len(),
            failed = outcome.failed.len(),
            "Rebuilt drive manifests"
        );
        Ok(outcome)
    }

    /// Write the latest central copy to the account.
    ///
    /// Pushes for one account are serialized and always send the newest
    /// central copy, so a slow earlier push can never overwrite a later one.
    async fn push(&self, account: &str, outcome: &mut ManifestOutcome) -> MetadataResult<()> {
        let lock = self
            .push_locks
            .entry(account.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let manifest = match self.store.get_manifest(account).await? {
            Some(manifest) => manifest,
            None => DriveManifest::new(account.to_string()),
        };

        match self.storage.write_manifest(account, &manifest).await {
            Ok(()) => outcome.written.push(account.to_string()),
            Err(e) => {
                tracing::warn!(
                    account_id = account,
                    error = %e,
                    "Manifest write failed, central record remains authoritative"
                );
                recorder::record_manifest_write_failure(account);
                outcome.failed.push(account.to_string());
            }
        }
        Ok(())
    }
}
