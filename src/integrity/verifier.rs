use crate::error::{VaultError, VaultResult};
use crate::ident::FileId;
use crate::integrity::types::{IntegrityReport, RemoteVerification};
use crate::metadata::{coverage_gaps, Checksum, FileStatus, MetadataStore, StoredChunk, StoredFile};
use crate::storage::{AccountId, StorageAccess};
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

/// BLAKE3 digest of a byte slice
pub fn checksum(data: &[u8]) -> Checksum {
    Checksum::of(data)
}

/// BLAKE3 digest of a file, read in blocks
pub async fn file_checksum(path: &Path) -> std::io::Result<Checksum> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(Checksum::from_bytes(*hasher.finalize().as_bytes()))
}

pub struct IntegrityVerifier {
    store: Arc<MetadataStore>,
    storage: StorageAccess,
    parallelism: usize,
}

impl IntegrityVerifier {
    pub fn new(store: Arc<MetadataStore>, storage: StorageAccess, parallelism: usize) -> Self {
        Self {
            store,
            storage,
            parallelism: parallelism.max(1),
        }
    }

    async fn owned_file(&self, owner: &str, file_id: &FileId) -> VaultResult<StoredFile> {
        match self.store.get_file(file_id).await? {
            Some(file) if file.owner == owner && file.status != FileStatus::Deleted => Ok(file),
            _ => Err(VaultError::FileNotFound(file_id.to_string())),
        }
    }

    /// Check chunk coverage from metadata alone.
    ///
    /// Chunks living on accounts the owner no longer has linked count as
    /// missing. Only an active file with full coverage is complete.
    pub async fn check_file(&self, owner: &str, file_id: &FileId) -> VaultResult<IntegrityReport> {
        let file = self.owned_file(owner, file_id).await?;
        let linked: BTreeSet<AccountId> = self
            .store
            .linked_accounts(owner)
            .await?
            .into_iter()
            .map(|a| a.account_id)
            .collect();

        let unavailable_accounts: Vec<AccountId> = file
            .accounts()
            .into_iter()
            .filter(|account| !linked.contains(account))
            .collect();

        let available: Vec<_> = file
            .chunks
            .iter()
            .filter(|chunk| linked.contains(&chunk.account_id))
            .collect();
        let missing_ranges = coverage_gaps(file.original_size, available.iter().map(|c| c.range()));

        let report = IntegrityReport {
            file_id: file.file_id.clone(),
            status: file.status,
            is_complete: file.status == FileStatus::Active && missing_ranges.is_empty(),
            expected_chunks: file.expected_chunks(),
            present_chunks: available.len() as u64,
            missing_ranges,
            unavailable_accounts,
        };

        if !report.is_complete {
            tracing::info!(
                file_id = %file.file_id,
                status = report.status.as_str(),
                missing = report.missing_ranges.len(),
                unavailable_accounts = ?report.unavailable_accounts,
                "File is incomplete"
            );
        }
        Ok(report)
    }

    /// Fetch every chunk and compare it with its recorded checksum
    pub async fn verify_remote(&self, owner: &str, file_id: &FileId) -> VaultResult<RemoteVerification> {
        let file = self.owned_file(owner, file_id).await?;
        let verdicts: Vec<(u32, Option<bool>)> = stream::iter(file.chunks.iter().cloned())
            .map(|chunk| self.verify_chunk(&file.file_id, chunk))
            .buffer_unordered(self.parallelism)
            .collect()
            .await;

        let mut result = RemoteVerification {
            file_id: file.file_id.clone(),
            verified_chunks: Vec::new(),
            corrupted_chunks: Vec::new(),
            unreadable_chunks: Vec::new(),
        };
        for (index, verdict) in verdicts {
            match verdict {
                Some(true) => result.verified_chunks.push(index),
                Some(false) => {
                    crate::metrics::recorder::record_checksum_failure();
                    result.corrupted_chunks.push(index);
                }
                None => result.unreadable_chunks.push(index),
            }
        }
        result.verified_chunks.sort_unstable();
        result.corrupted_chunks.sort_unstable();
        result.unreadable_chunks.sort_unstable();
        Ok(result)
    }

    /// `Some(intact)` for a readable chunk, `None` when the account refused
    async fn verify_chunk(&self, file_id: &FileId, chunk: StoredChunk) -> (u32, Option<bool>) {
        match self
            .storage
            .read_chunk(&chunk.account_id, &chunk.remote_handle)
            .await
        {
            Ok(data) => {
                let intact = data.len() as u64 == chunk.size && checksum(&data) == chunk.checksum;
                (chunk.chunk_index, Some(intact))
            }
            Err(e) => {
                tracing::warn!(
                    file_id = %file_id,
                    chunk_index = chunk.chunk_index,
                    account_id = %chunk.account_id,
                    error = %e,
                    "Chunk unreadable during verification"
                );
                (chunk.chunk_index, None)
            }
        }
    }
}
