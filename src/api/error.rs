use crate::error::VaultError;
use crate::keyfile::KeyFileError;
use crate::metadata::MetadataError;
use crate::planner::PlanError;
use crate::storage::StorageError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Missing caller identity: {0}")]
    Unauthenticated(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

fn vault_status(err: &VaultError) -> StatusCode {
    match err {
        VaultError::Plan(PlanError::InsufficientCapacity { .. }) => StatusCode::INSUFFICIENT_STORAGE,
        VaultError::Plan(PlanError::NoLinkedAccounts) => StatusCode::CONFLICT,
        VaultError::Plan(_) => StatusCode::BAD_REQUEST,
        VaultError::Storage(StorageError::CapacityExceeded { .. }) => StatusCode::INSUFFICIENT_STORAGE,
        VaultError::Storage(StorageError::UnknownAccount(_)) => StatusCode::NOT_FOUND,
        VaultError::Storage(_) => StatusCode::BAD_GATEWAY,
        VaultError::Metadata(MetadataError::NotFound { .. }) => StatusCode::NOT_FOUND,
        VaultError::Metadata(MetadataError::AlreadyExists { .. }) => StatusCode::CONFLICT,
        VaultError::Metadata(_) => StatusCode::INTERNAL_SERVER_ERROR,
        VaultError::KeyFile(KeyFileError::EncodingFailed(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        VaultError::KeyFile(_) => StatusCode::BAD_REQUEST,
        VaultError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        VaultError::InvalidFileId(_)
        | VaultError::InvalidRequest(_)
        | VaultError::ChunkSizeMismatch { .. }
        | VaultError::UnknownChunkOffset(_)
        | VaultError::KeyFileMismatch(_) => StatusCode::BAD_REQUEST,
        VaultError::SessionNotFound(_) | VaultError::FileNotFound(_) => StatusCode::NOT_FOUND,
        VaultError::SessionClosed { .. }
        | VaultError::IncompleteUpload { .. }
        | VaultError::InvalidTransition(_)
        | VaultError::ArtifactNotReady { .. }
        | VaultError::PlanOutdated => StatusCode::CONFLICT,
        VaultError::ArtifactExpired(_) => StatusCode::GONE,
        VaultError::ChunkCorrupted { .. }
        | VaultError::ReconstructionInconsistent(_)
        | VaultError::IoError(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Vault(e) => (vault_status(e), e.code()),
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
            ApiError::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, "MISSING_USER"),
            ApiError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, code, "Request failed");
        }

        let mut body = json!({
            "error": self.to_string(),
            "code": code,
        });
        if let ApiError::Vault(VaultError::IncompleteUpload { missing }) = &self {
            body["missing"] = json!(missing);
        }

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
