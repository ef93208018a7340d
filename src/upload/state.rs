use crate::error::{VaultError, VaultResult};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Initiated,
    Uploading,
    Processing,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    Open,
    ChunkStored,
    Finalize,
    ProcessingDone,
    Fail(String),
    Expire,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Initiated => "initiated",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Processing => "processing",
            UploadStatus::Complete => "complete",
            UploadStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Complete | UploadStatus::Failed)
    }

    /// Next status for `event`, or `InvalidTransition`
    pub fn transition(self, event: &UploadEvent) -> VaultResult<UploadStatus> {
        use UploadEvent as E;
        use UploadStatus as S;

        let next = match (self, event) {
            (S::Initiated, E::Open) => S::Uploading,
            (S::Uploading, E::ChunkStored) => S::Uploading,
            (S::Uploading, E::Finalize) => S::Processing,
            (S::Processing, E::ProcessingDone) => S::Complete,
            (S::Uploading | S::Processing, E::Fail(_)) => S::Failed,
            (S::Uploading, E::Expire) => S::Failed,
            _ => {
                return Err(VaultError::InvalidTransition(format!(
                    "Cannot handle {event:?} in upload state {self}"
                )));
            }
        };
        Ok(next)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
