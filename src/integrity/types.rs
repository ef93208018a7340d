use crate::ident::FileId;
use crate::metadata::{ByteRange, FileStatus};
use crate::storage::AccountId;
use serde::{Deserialize, Serialize};

/// Metadata-only completeness check of a stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub file_id: FileId,
    pub status: FileStatus,
    /// Active and fully covered by chunks on linked accounts
    pub is_complete: bool,
    pub expected_chunks: u64,
    /// Chunks on record whose account is still linked
    pub present_chunks: u64,
    /// Sorted, merged
    pub missing_ranges: Vec<ByteRange>,
    pub unavailable_accounts: Vec<AccountId>,
}

/// Result of fetching and checksumming every chunk of a file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteVerification {
    pub file_id: FileId,
    pub verified_chunks: Vec<u32>,
    pub corrupted_chunks: Vec<u32>,
    pub unreadable_chunks: Vec<u32>,
}

impl RemoteVerification {
    pub fn is_intact(&self) -> bool {
        self.corrupted_chunks.is_empty() && self.unreadable_chunks.is_empty()
    }
}
