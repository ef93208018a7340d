use crate::config::VaultConfig;
use crate::download::{Artifact, DownloadSnapshot, ReconstructionEngine};
use crate::error::{VaultError, VaultResult};
use crate::ident::FileId;
use crate::integrity::{IntegrityReport, IntegrityVerifier, RemoteVerification};
use crate::keyfile::KeyFile;
use crate::metadata::{
    FileStatus, FileSummary, LinkedAccount, ManifestOutcome, ManifestRecovery, ManifestWriter,
    MetadataStore, StoredFile,
};
use crate::planner::{ChunkPlan, ChunkPlanner};
use crate::storage::{AccountThrottle, StorageAccess, StorageAdapter};
use crate::upload::{
    ChunkReceipt, FinalizeAck, InitiatedUpload, UploadManager, UploadRequest, UploadSnapshot,
};
use crate::vault::sweeper::Sweeper;
use crate::vault::types::{AccountSpace, DeletedFile, RecoveredFile, SweepReport};
use bytes::Bytes;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Entry point for every operation, scoped by owner.
///
/// Owns the planner, the upload and download machinery, the manifest writer
/// and the verifier, all sharing one throttled view of the storage accounts.
/// Dropping the vault stops its reaper.
pub struct Vault {
    config: VaultConfig,
    store: Arc<MetadataStore>,
    storage: StorageAccess,
    planner: Arc<ChunkPlanner>,
    manifests: Arc<ManifestWriter>,
    recovery: ManifestRecovery,
    uploads: Arc<UploadManager>,
    downloads: ReconstructionEngine,
    verifier: IntegrityVerifier,
    sweeper: Sweeper,
    reaper: JoinHandle<()>,
}

impl Vault {
    pub fn new(
        config: VaultConfig,
        store: Arc<MetadataStore>,
        adapter: Arc<dyn StorageAdapter>,
    ) -> VaultResult<Self> {
        config.validate()?;

        let throttle = Arc::new(AccountThrottle::new(
            config.max_parallel_transfers,
            config.account_ops_per_second,
        ));
        let storage = StorageAccess::new(adapter, throttle, config.retry.clone());
        let planner = Arc::new(ChunkPlanner::new(config.chunk_policy.clone())?);
        planner.strategies().get(&config.default_strategy)?;

        let manifests = Arc::new(ManifestWriter::new(store.clone(), storage.clone()));
        let recovery = ManifestRecovery::new(store.clone(), storage.clone());
        let uploads = Arc::new(UploadManager::new(
            store.clone(),
            storage.clone(),
            planner.clone(),
            manifests.clone(),
            config.default_strategy.clone(),
            config.processing_workers,
        ));
        let downloads = ReconstructionEngine::new(
            store.clone(),
            storage.clone(),
            config.work_dir.clone(),
            config.artifact_ttl(),
            config.max_parallel_transfers,
        );
        let verifier = IntegrityVerifier::new(
            store.clone(),
            storage.clone(),
            config.max_parallel_transfers,
        );

        let sweeper = Sweeper::new(
            uploads.clone(),
            downloads.clone(),
            config.upload_idle_timeout(),
            config.download_stall_timeout(),
            config.session_retention(),
        );
        let reaper = sweeper.clone().spawn(config.reaper_interval());

        tracing::info!(
            strategy = %config.default_strategy,
            max_parallel_transfers = config.max_parallel_transfers,
            processing_workers = config.processing_workers,
            work_dir = %config.work_dir.display(),
            "Vault ready"
        );

        Ok(Self {
            config,
            store,
            storage,
            planner,
            manifests,
            recovery,
            uploads,
            downloads,
            verifier,
            sweeper,
            reaper,
        })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn strategies(&self) -> Vec<String> {
        self.planner.strategies().names()
    }

    // ============== Linked accounts ==============

    /// Link a storage account to `owner`. The adapter must be able to reach it.
    pub async fn link_account(
        &self,
        owner: &str,
        account_id: &str,
        label: &str,
    ) -> VaultResult<LinkedAccount> {
        if account_id.trim().is_empty() {
            return Err(VaultError::InvalidRequest("account_id must not be empty".into()));
        }
        let free = self.storage.capacity(account_id).await?;
        let account = self
            .store
            .link_account(LinkedAccount::new(account_id, owner, label))
            .await?;
        tracing::info!(owner, account_id, free_bytes = free, "Account linked");
        Ok(account)
    }

    pub async fn revoke_account(&self, owner: &str, account_id: &str) -> VaultResult<LinkedAccount> {
        let account = self.store.revoke_account(owner, account_id).await?;
        tracing::info!(owner, account_id, "Account revoked");
        Ok(account)
    }

    pub async fn list_accounts(&self, owner: &str) -> VaultResult<Vec<LinkedAccount>> {
        Ok(self.store.list_accounts(owner).await?)
    }

    /// Free space of each linked account, using the readings planning sees
    pub async fn account_space(&self, owner: &str) -> VaultResult<Vec<AccountSpace>> {
        let capacities = self.uploads.capacities(owner).await?;
        let space = self
            .store
            .linked_accounts(owner)
            .await?
            .into_iter()
            .map(|account| {
                let reading = capacities.iter().find(|c| c.account_id == account.account_id);
                AccountSpace {
                    reachable: reading.is_some(),
                    free_bytes: reading.map(|c| c.free_bytes).unwrap_or(0),
                    account_id: account.account_id,
                    label: account.label,
                }
            })
            .collect();
        Ok(space)
    }

    // ============== Uploads ==============

    pub async fn preview_plan(
        &self,
        owner: &str,
        size: u64,
        strategy: Option<&str>,
    ) -> VaultResult<ChunkPlan> {
        self.uploads.preview(owner, size, strategy).await
    }

    pub async fn initiate_upload(
        &self,
        owner: &str,
        request: UploadRequest,
    ) -> VaultResult<InitiatedUpload> {
        self.uploads.initiate(owner, request).await
    }

    pub async fn receive_chunk(
        &self,
        owner: &str,
        session_id: &str,
        offset: u64,
        data: Bytes,
    ) -> VaultResult<ChunkReceipt> {
        self.uploads
            .receive_chunk(owner, session_id, offset, data)
            .await
    }

    pub async fn finalize_upload(&self, owner: &str, session_id: &str) -> VaultResult<FinalizeAck> {
        self.uploads.finalize(owner, session_id).await
    }

    pub async fn upload_status(&self, owner: &str, session_id: &str) -> VaultResult<UploadSnapshot> {
        self.uploads.status(owner, session_id).await
    }

    // ============== Files ==============

    async fn owned_file(&self, owner: &str, file_id: &FileId) -> VaultResult<StoredFile> {
        match self.store.get_file(file_id).await? {
            Some(file) if file.owner == owner && file.status != FileStatus::Deleted => Ok(file),
            _ => Err(VaultError::FileNotFound(file_id.to_string())),
        }
    }

    pub async fn list_files(&self, owner: &str) -> VaultResult<Vec<FileSummary>> {
        let mut files: Vec<FileSummary> = self
            .store
            .list_files(owner)
            .await?
            .iter()
            .map(StoredFile::summary)
            .collect();
        files.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        Ok(files)
    }

    /// Mark a file deleted, then clean up its remote objects and manifests.
    ///
    /// Remote cleanup is best-effort; objects that cannot be removed are
    /// reported as orphaned.
    pub async fn delete_file(&self, owner: &str, file_id: &FileId) -> VaultResult<DeletedFile> {
        let file = self.owned_file(owner, file_id).await?;

        let uploading = self
            .store
            .list_upload_sessions()
            .await?
            .into_iter()
            .any(|s| &s.file_id == file_id && !s.status.is_terminal());
        if uploading {
            return Err(VaultError::InvalidRequest(format!(
                "file {file_id} still has an upload in progress"
            )));
        }

        self.store
            .update_file(file_id, |f| {
                if f.status == FileStatus::Deleted {
                    return Err(VaultError::FileNotFound(f.file_id.to_string()));
                }
                f.status = FileStatus::Deleted;
                Ok(())
            })
            .await?;

        let mut removed_chunks = 0;
        let mut orphaned_chunks = 0;
        for chunk in &file.chunks {
            match self
                .storage
                .delete_chunk(&chunk.account_id, &chunk.remote_handle)
                .await
            {
                Ok(()) => removed_chunks += 1,
                Err(e) => {
                    tracing::warn!(
                        file_id = %file_id,
                        chunk_index = chunk.chunk_index,
                        account_id = %chunk.account_id,
                        error = %e,
                        "Could not delete chunk object"
                    );
                    orphaned_chunks += 1;
                }
            }
        }

        let manifests = self.manifests.retract(file_id, file.accounts()).await?;
        tracing::info!(
            file_id = %file_id,
            removed_chunks,
            orphaned_chunks,
            "File deleted"
        );

        Ok(DeletedFile {
            file_id: file_id.clone(),
            removed_chunks,
            orphaned_chunks,
            manifests,
        })
    }

    /// Encode the key file of an active file
    pub async fn export_key_file(
        &self,
        owner: &str,
        file_id: &FileId,
        with_hints: bool,
    ) -> VaultResult<Vec<u8>> {
        let file = self.owned_file(owner, file_id).await?;
        if file.status != FileStatus::Active {
            return Err(VaultError::FileNotFound(file_id.to_string()));
        }
        Ok(KeyFile::from_stored(&file, with_hints).encode()?)
    }

    pub async fn check_integrity(&self, owner: &str, file_id: &FileId) -> VaultResult<IntegrityReport> {
        self.verifier.check_file(owner, file_id).await
    }

    pub async fn verify_remote(
        &self,
        owner: &str,
        file_id: &FileId,
    ) -> VaultResult<RemoteVerification> {
        self.verifier.verify_remote(owner, file_id).await
    }

    /// Rebuild the record a key file points to from the drive manifests,
    /// falling back on the chunk hints of a version 2 key file.
    ///
    /// An existing central record is left untouched and reported as is.
    pub async fn recover_file(&self, owner: &str, key_file: &[u8]) -> VaultResult<RecoveredFile> {
        let key = KeyFile::decode(key_file)?;

        if let Some(existing) = self.store.get_file(&key.file_id).await? {
            if existing.owner != owner || existing.status == FileStatus::Deleted {
                return Err(VaultError::FileNotFound(key.file_id.to_string()));
            }
            return Ok(RecoveredFile {
                missing_ranges: existing.missing_ranges(),
                file: existing.summary(),
                restored: false,
            });
        }

        let file = self
            .recovery
            .recover_from_key(owner, &key)
            .await?
            .ok_or_else(|| VaultError::FileNotFound(key.file_id.to_string()))?;
        if file.original_size != key.original_size || file.original_filename != key.original_filename {
            return Err(VaultError::KeyFileMismatch(
                "drive manifests describe a different file".into(),
            ));
        }

        self.store.insert_file(&file).await?;
        tracing::info!(
            file_id = %file.file_id,
            status = file.status.as_str(),
            "File record restored"
        );
        Ok(RecoveredFile {
            missing_ranges: file.missing_ranges(),
            file: file.summary(),
            restored: true,
        })
    }

    pub async fn rebuild_manifests(&self, owner: &str) -> VaultResult<ManifestOutcome> {
        Ok(self.manifests.rebuild_all(owner).await?)
    }

    // ============== Downloads ==============

    pub async fn start_download(&self, owner: &str, key_file: &[u8]) -> VaultResult<DownloadSnapshot> {
        self.downloads.initiate(owner, key_file).await
    }

    pub async fn download_status(
        &self,
        owner: &str,
        session_id: &str,
    ) -> VaultResult<DownloadSnapshot> {
        self.downloads.status(owner, session_id).await
    }

    pub async fn retrieve_artifact(&self, owner: &str, session_id: &str) -> VaultResult<Artifact> {
        self.downloads.retrieve(owner, session_id).await
    }

    // ============== Maintenance ==============

    /// One reaper pass, on demand
    pub async fn sweep_expired(&self) -> SweepReport {
        self.sweeper.sweep().await
    }
}

impl Drop for Vault {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}
