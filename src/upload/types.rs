use crate::error::VaultResult;
use crate::ident::FileId;
use crate::metadata::Checksum;
use crate::planner::ChunkPlan;
use crate::storage::{AccountId, RemoteHandle};
use crate::upload::state::{UploadEvent, UploadStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Timeout reason recorded on expired uploads
pub const UPLOAD_TIMEOUT_REASON: &str = "upload session timed out";

/// Body of an upload initiation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRequest {
    pub filename: String,
    pub size: u64,
    #[serde(default)]
    pub strategy: Option<String>,
    /// Plan obtained from an earlier preview, committed to as-is
    #[serde(default)]
    pub plan: Option<ChunkPlan>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedChunk {
    pub account_id: AccountId,
    pub remote_handle: RemoteHandle,
    pub size: u64,
    pub checksum: Checksum,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub session_id: String,
    pub owner: String,
    pub file_id: FileId,
    pub original_filename: String,
    pub declared_size: u64,
    pub strategy: String,
    pub plan: ChunkPlan,
    /// Keyed by chunk index
    pub received: BTreeMap<u32, ReceivedChunk>,
    pub received_bytes: u64,
    pub status: UploadStatus,
    pub processing_progress: u8,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    /// New session, already opened for chunks
    pub fn open(
        owner: impl Into<String>,
        file_id: FileId,
        original_filename: impl Into<String>,
        plan: ChunkPlan,
    ) -> VaultResult<Self> {
        let now = Utc::now();
        let mut session = Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            owner: owner.into(),
            file_id,
            original_filename: original_filename.into(),
            declared_size: plan.file_size,
            strategy: plan.strategy.clone(),
            plan,
            received: BTreeMap::new(),
            received_bytes: 0,
            status: UploadStatus::Initiated,
            processing_progress: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        session.apply(UploadEvent::Open)?;
        Ok(session)
    }

    /// Drive the state machine, recording side data the event carries
    pub fn apply(&mut self, event: UploadEvent) -> VaultResult<()> {
        let next = self.status.transition(&event)?;
        let now = Utc::now();
        match event {
            UploadEvent::Fail(reason) => {
                self.error_message = Some(reason);
                self.completed_at = Some(now);
            }
            UploadEvent::Expire => {
                self.error_message = Some(UPLOAD_TIMEOUT_REASON.to_string());
                self.completed_at = Some(now);
            }
            UploadEvent::ProcessingDone => {
                self.processing_progress = 100;
                self.completed_at = Some(now);
            }
            _ => {}
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Record a stored chunk. Bytes of a chunk index are counted once, however
    /// often it is re-submitted. Returns the receipt it replaced.
    pub fn record_chunk(&mut self, chunk_index: u32, chunk: ReceivedChunk) -> VaultResult<Option<ReceivedChunk>> {
        self.apply(UploadEvent::ChunkStored)?;
        let size = chunk.size;
        let previous = self.received.insert(chunk_index, chunk);
        match &previous {
            Some(old) => {
                self.received_bytes = self.received_bytes - old.size + size;
            }
            None => self.received_bytes += size,
        }
        Ok(previous)
    }

    /// Planned chunk indexes not yet received
    pub fn missing_chunks(&self) -> Vec<u32> {
        self.plan
            .chunks
            .iter()
            .map(|c| c.index)
            .filter(|i| !self.received.contains_key(i))
            .collect()
    }

    /// Received bytes over declared size, as a percentage
    pub fn progress(&self) -> f64 {
        if self.declared_size == 0 {
            return 0.0;
        }
        self.received_bytes as f64 / self.declared_size as f64 * 100.0
    }

    pub fn snapshot(&self) -> UploadSnapshot {
        UploadSnapshot {
            session_id: self.session_id.clone(),
            file_id: self.file_id.clone(),
            status: self.status,
            progress: self.progress(),
            received_bytes: self.received_bytes,
            declared_size: self.declared_size,
            chunks_received: self.received.len(),
            chunks_total: self.plan.chunk_count(),
            processing_progress: self.processing_progress,
            error: self.error_message.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiatedUpload {
    pub session_id: String,
    pub file_id: FileId,
    pub plan: ChunkPlan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkReceipt {
    pub session_id: String,
    pub chunk_index: u32,
    pub received_bytes: u64,
    pub declared_size: u64,
    pub progress: f64,
    pub chunks_received: usize,
    pub chunks_total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalizeAck {
    pub session_id: String,
    pub file_id: FileId,
    pub status: UploadStatus,
    /// False when an earlier finalize already started processing
    pub processing_started: bool,
}

/// Read-only view of an upload session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSnapshot {
    pub session_id: String,
    pub file_id: FileId,
    pub status: UploadStatus,
    pub progress: f64,
    pub received_bytes: u64,
    pub declared_size: u64,
    pub chunks_received: usize,
    pub chunks_total: usize,
    pub processing_progress: u8,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
