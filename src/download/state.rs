use crate::error::{VaultError, VaultResult};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Initiated,
    Downloading,
    Decrypting,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    Start,
    ChunkFetched,
    FetchDone,
    AssemblyDone,
    Fail(String),
    Expire,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Initiated => "initiated",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Decrypting => "decrypting",
            DownloadStatus::Complete => "complete",
            DownloadStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Complete | DownloadStatus::Failed)
    }

    pub fn transition(self, event: &DownloadEvent) -> VaultResult<DownloadStatus> {
        use DownloadEvent as E;
        use DownloadStatus as S;

        let next = match (self, event) {
            (S::Initiated, E::Start) => S::Downloading,
            (S::Downloading, E::ChunkFetched) => S::Downloading,
            (S::Downloading, E::FetchDone) => S::Decrypting,
            (S::Decrypting, E::AssemblyDone) => S::Complete,
            (S::Downloading | S::Decrypting, E::Fail(_)) => S::Failed,
            (S::Downloading | S::Decrypting, E::Expire) => S::Failed,
            _ => {
                return Err(VaultError::InvalidTransition(format!(
                    "Cannot handle {event:?} in download state {self}"
                )));
            }
        };
        Ok(next)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
