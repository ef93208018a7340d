use crate::config::ConfigError;
use crate::ident::IdentError;
use crate::keyfile::KeyFileError;
use crate::metadata::MetadataError;
use crate::planner::PlanError;
use crate::storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Key file error: {0}")]
    KeyFile(#[from] KeyFileError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    InvalidFileId(#[from] IdentError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {session_id} is {status} and no longer accepts this operation")]
    SessionClosed { session_id: String, status: String },

    #[error("Chunk at offset {offset} is {actual} bytes, planned {expected}")]
    ChunkSizeMismatch {
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error("No planned chunk starts at offset {0}")]
    UnknownChunkOffset(u64),

    #[error("Upload incomplete: {} planned chunks missing", missing.len())]
    IncompleteUpload { missing: Vec<u32> },

    #[error("Chunk {chunk_index} failed checksum verification")]
    ChunkCorrupted { chunk_index: u32 },

    #[error("Reconstruction inconsistent: {0}")]
    ReconstructionInconsistent(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Artifact not ready: session {session_id} is {status}")]
    ArtifactNotReady { session_id: String, status: String },

    #[error("Artifact expired for session {0}")]
    ArtifactExpired(String),

    #[error("Key file does not match stored file: {0}")]
    KeyFileMismatch(String),

    #[error("Previewed plan no longer matches current account capacity")]
    PlanOutdated,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl VaultError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::Plan(PlanError::InsufficientCapacity { .. }) => "INSUFFICIENT_CAPACITY",
            VaultError::Plan(PlanError::NoLinkedAccounts) => "NO_LINKED_ACCOUNTS",
            VaultError::Plan(PlanError::EmptyFile) => "EMPTY_FILE",
            VaultError::Plan(PlanError::UnknownStrategy(_)) => "UNKNOWN_STRATEGY",
            VaultError::Plan(PlanError::InvalidPolicy(_)) => "INVALID_POLICY",
            VaultError::Storage(StorageError::CapacityExceeded { .. }) => "CAPACITY_EXCEEDED",
            VaultError::Storage(StorageError::Unauthorized(_)) => "ACCOUNT_UNAUTHORIZED",
            VaultError::Storage(StorageError::Revoked(_)) => "ACCOUNT_REVOKED",
            VaultError::Storage(StorageError::Unreachable(_)) => "ACCOUNT_UNREACHABLE",
            VaultError::Storage(_) => "STORAGE_ERROR",
            VaultError::Metadata(MetadataError::NotFound { .. }) => "NOT_FOUND",
            VaultError::Metadata(MetadataError::AlreadyExists { .. }) => "ALREADY_EXISTS",
            VaultError::Metadata(_) => "METADATA_ERROR",
            VaultError::KeyFile(KeyFileError::UnsupportedKeyFileVersion(_)) => {
                "UNSUPPORTED_KEY_FILE_VERSION"
            }
            VaultError::KeyFile(KeyFileError::CorruptKeyFile(_)) => "CORRUPT_KEY_FILE",
            VaultError::KeyFile(KeyFileError::EncodingFailed(_)) => "KEY_FILE_ENCODING_FAILED",
            VaultError::Config(_) => "CONFIG_ERROR",
            VaultError::InvalidFileId(_) => "INVALID_FILE_ID",
            VaultError::InvalidRequest(_) => "INVALID_REQUEST",
            VaultError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            VaultError::SessionClosed { .. } => "SESSION_CLOSED",
            VaultError::ChunkSizeMismatch { .. } => "CHUNK_SIZE_MISMATCH",
            VaultError::UnknownChunkOffset(_) => "UNKNOWN_CHUNK_OFFSET",
            VaultError::IncompleteUpload { .. } => "INCOMPLETE_UPLOAD",
            VaultError::ChunkCorrupted { .. } => "CHUNK_CORRUPTED",
            VaultError::ReconstructionInconsistent(_) => "RECONSTRUCTION_INCONSISTENT",
            VaultError::FileNotFound(_) => "FILE_NOT_FOUND",
            VaultError::InvalidTransition(_) => "INVALID_TRANSITION",
            VaultError::ArtifactNotReady { .. } => "ARTIFACT_NOT_READY",
            VaultError::ArtifactExpired(_) => "ARTIFACT_EXPIRED",
            VaultError::KeyFileMismatch(_) => "KEY_FILE_MISMATCH",
            VaultError::PlanOutdated => "PLAN_OUTDATED",
            VaultError::IoError(_) => "IO_ERROR",
        }
    }
}

pub type VaultResult<T> = Result<T, VaultError>;
