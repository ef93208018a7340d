use crate::ident::FileId;
use crate::keyfile::KeyFile;
use crate::metadata::error::MetadataResult;
use crate::metadata::store::MetadataStore;
use crate::metadata::types::{DriveManifest, FileStatus, StoredChunk, StoredFile};
use crate::obfuscation::ObfuscationSecret;
use crate::storage::StorageAccess;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Rebuilds file records from the manifests held on linked accounts, or from
/// the chunk hints of a version 2 key file
pub struct ManifestRecovery {
    store: Arc<MetadataStore>,
    storage: StorageAccess,
}

impl ManifestRecovery {
    pub fn new(store: Arc<MetadataStore>, storage: StorageAccess) -> Self {
        Self { store, storage }
    }

    /// Reassemble the record of `file_id` from every manifest of `owner`'s
    /// linked accounts that mentions it.
    ///
    /// The result is `active` only if the recovered chunks cover the whole
    /// file. Nothing is persisted here.
    pub async fn recover(
        &self,
        owner: &str,
        file_id: &FileId,
        secret: &ObfuscationSecret,
    ) -> MetadataResult<Option<StoredFile>> {
        let mut recovered: Option<StoredFile> = None;

        for account in self.store.linked_accounts(owner).await? {
            let Some(manifest) = self.read_manifest(&account.account_id).await? else {
                continue;
            };
            let Some(entry) = manifest.file(file_id) else {
                continue;
            };

            let record = recovered.get_or_insert_with(|| {
                let mut file = StoredFile::skeleton(
                    file_id.clone(),
                    owner,
                    entry.original_filename.clone(),
                    entry.original_size,
                    entry.chunk_size,
                    secret.clone(),
                );
                file.created_at = entry.uploaded_at;
                file
            });

            for chunk in &entry.chunks {
                record.upsert_chunk(StoredChunk {
                    chunk_index: chunk.chunk_index,
                    account_id: account.account_id.clone(),
                    remote_handle: chunk.remote_handle.clone(),
                    remote_name: chunk.remote_name.clone(),
                    size: chunk.size,
                    checksum: chunk.checksum,
                    start_offset: chunk.start_offset,
                    end_offset: chunk.end_offset,
                });
            }
        }

        if let Some(file) = recovered.as_mut() {
            settle(file);
            tracing::info!(
                file_id = %file.file_id,
                chunks = file.chunks.len(),
                status = file.status.as_str(),
                "Recovered file record from drive manifests"
            );
        }

        Ok(recovered)
    }

    /// Recover the record `key` points to.
    ///
    /// Manifests come first. Chunk hints fill whatever the manifests leave
    /// uncovered, limited to accounts `owner` still has linked, so a version 2
    /// key file restores a file even when every manifest is gone.
    pub async fn recover_from_key(&self, owner: &str, key: &KeyFile) -> MetadataResult<Option<StoredFile>> {
        let mut recovered = self.recover(owner, &key.file_id, &key.secret).await?;

        let Some(hints) = key.chunk_hints.as_deref() else {
            return Ok(recovered);
        };
        if recovered.as_ref().is_some_and(|file| file.missing_ranges().is_empty()) {
            return Ok(recovered);
        }

        let linked: BTreeSet<String> = self
            .store
            .linked_accounts(owner)
            .await?
            .into_iter()
            .map(|account| account.account_id)
            .collect();
        let usable: Vec<_> = hints
            .iter()
            .filter(|hint| linked.contains(&hint.account_id))
            .collect();
        if usable.is_empty() {
            return Ok(recovered);
        }

        let record = recovered.get_or_insert_with(|| {
            let chunk_size = hints.iter().map(|hint| hint.size).max().unwrap_or_default();
            StoredFile::skeleton(
                key.file_id.clone(),
                owner,
                key.original_filename.clone(),
                key.original_size,
                chunk_size,
                key.secret.clone(),
            )
        });
        let mut filled = 0;
        for hint in usable {
            if record.chunk(hint.chunk_index).is_none() {
                record.upsert_chunk(hint.to_stored(&key.file_id));
                filled += 1;
            }
        }
        settle(record);
        tracing::info!(
            file_id = %record.file_id,
            from_hints = filled,
            status = record.status.as_str(),
            "Recovered file record from key file hints"
        );

        Ok(recovered)
    }

    /// Remote copy first, central copy if the account cannot be read
    async fn read_manifest(&self, account_id: &str) -> MetadataResult<Option<DriveManifest>> {
        match self.storage.read_manifest(account_id).await {
            Ok(manifest) => Ok(manifest),
            Err(e) => {
                tracing::warn!(
                    account_id,
                    error = %e,
                    "Could not read manifest from account, using central copy"
                );
                self.store.get_manifest(account_id).await
            }
        }
    }
}

/// Active only when the recovered chunks cover the whole file
fn settle(file: &mut StoredFile) {
    file.processed_size = file.stored_bytes();
    file.status = if file.missing_ranges().is_empty() {
        FileStatus::Active
    } else {
        FileStatus::Incomplete
    };
}
