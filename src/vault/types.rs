use crate::ident::FileId;
use crate::metadata::{ByteRange, FileSummary, ManifestOutcome};
use crate::storage::AccountId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletedFile {
    pub file_id: FileId,
    pub removed_chunks: usize,
    /// Chunks whose remote object could not be removed
    pub orphaned_chunks: usize,
    pub manifests: ManifestOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveredFile {
    pub file: FileSummary,
    /// True when the central record was missing and has been rewritten
    pub restored: bool,
    pub missing_ranges: Vec<ByteRange>,
}

/// Free space of one linked account as seen right now
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSpace {
    pub account_id: AccountId,
    pub label: String,
    /// False when the account could not be read; such accounts are left out of planning
    pub reachable: bool,
    pub free_bytes: u64,
}

/// Work done by one reaper pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub uploads_expired: usize,
    pub uploads_removed: usize,
    pub downloads_expired: usize,
    pub artifacts_purged: usize,
    pub downloads_removed: usize,
    /// Steps that errored; the others still ran
    pub failed_steps: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}
