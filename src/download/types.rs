use crate::error::VaultResult;
use crate::download::state::{DownloadEvent, DownloadStatus};
use crate::ident::FileId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Timeout reason recorded on stalled reconstructions
pub const DOWNLOAD_TIMEOUT_REASON: &str = "download session timed out";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSession {
    pub session_id: String,
    pub owner: String,
    pub file_id: FileId,
    pub original_filename: String,
    pub status: DownloadStatus,
    pub fetched_bytes: u64,
    pub total_bytes: u64,
    pub error_message: Option<String>,
    /// Machine-readable code of the failure, e.g. `CHUNK_CORRUPTED`
    pub error_code: Option<String>,
    pub work_dir: PathBuf,
    pub artifact_path: Option<PathBuf>,
    pub artifact_purged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl DownloadSession {
    pub fn open(
        session_id: String,
        owner: impl Into<String>,
        file_id: FileId,
        original_filename: impl Into<String>,
        total_bytes: u64,
        work_dir: PathBuf,
        expires_at: DateTime<Utc>,
    ) -> VaultResult<Self> {
        let now = Utc::now();
        let mut session = Self {
            session_id,
            owner: owner.into(),
            file_id,
            original_filename: original_filename.into(),
            status: DownloadStatus::Initiated,
            fetched_bytes: 0,
            total_bytes,
            error_message: None,
            error_code: None,
            work_dir,
            artifact_path: None,
            artifact_purged: false,
            created_at: now,
            updated_at: now,
            completed_at: None,
            expires_at,
        };
        session.apply(DownloadEvent::Start)?;
        Ok(session)
    }

    pub fn apply(&mut self, event: DownloadEvent) -> VaultResult<()> {
        let next = self.status.transition(&event)?;
        let now = Utc::now();
        match event {
            DownloadEvent::Fail(reason) => {
                self.error_message = Some(reason);
                self.completed_at = Some(now);
            }
            DownloadEvent::Expire => {
                self.error_message = Some(DOWNLOAD_TIMEOUT_REASON.to_string());
                self.error_code = Some("SESSION_TIMEOUT".to_string());
                self.completed_at = Some(now);
            }
            DownloadEvent::AssemblyDone => {
                self.fetched_bytes = self.total_bytes;
                self.completed_at = Some(now);
            }
            _ => {}
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Fetched bytes over total bytes, as a percentage
    pub fn progress(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.fetched_bytes as f64 / self.total_bytes as f64 * 100.0
    }

    pub fn artifact_available(&self, now: DateTime<Utc>) -> bool {
        self.status == DownloadStatus::Complete
            && !self.artifact_purged
            && self.artifact_path.is_some()
            && now < self.expires_at
    }

    pub fn snapshot(&self) -> DownloadSnapshot {
        DownloadSnapshot {
            session_id: self.session_id.clone(),
            file_id: self.file_id.clone(),
            original_filename: self.original_filename.clone(),
            status: self.status,
            progress: self.progress(),
            fetched_bytes: self.fetched_bytes,
            total_bytes: self.total_bytes,
            error: self.error_message.clone(),
            error_code: self.error_code.clone(),
            artifact_available: self.artifact_available(Utc::now()),
            created_at: self.created_at,
            completed_at: self.completed_at,
            expires_at: self.expires_at,
        }
    }
}

/// Read-only view of a download session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadSnapshot {
    pub session_id: String,
    pub file_id: FileId,
    pub original_filename: String,
    pub status: DownloadStatus,
    pub progress: f64,
    pub fetched_bytes: u64,
    pub total_bytes: u64,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub artifact_available: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

/// A reconstructed file ready to be streamed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub session_id: String,
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
}
