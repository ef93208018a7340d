use crate::api::error::{ApiError, ApiResult};
use crate::api::types::*;
use crate::download::DownloadSnapshot;
use crate::ident::FileId;
use crate::metadata::{FileSummary, LinkedAccount, ManifestOutcome};
use crate::planner::ChunkPlan;
use crate::upload::{ChunkReceipt, FinalizeAck, InitiatedUpload, UploadRequest, UploadSnapshot};
use crate::vault::{AccountSpace, DeletedFile, RecoveredFile, Vault};
use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

/// Header carrying the caller's identity
pub const USER_HEADER: &str = "x-user-id";

const STREAM_BLOCK: usize = 64 * 1024;
/// Request body ceiling for routes that carry key files
const KEY_FILE_LIMIT: usize = 16 * 1024 * 1024;

/// Caller identity taken from `X-User-Id`
pub struct Owner(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_HEADER)
            .ok_or_else(|| ApiError::Unauthenticated(format!("{USER_HEADER} header is required")))?;
        let owner = value
            .to_str()
            .map_err(|_| ApiError::Unauthenticated(format!("{USER_HEADER} is not valid text")))?
            .trim();
        if owner.is_empty() {
            return Err(ApiError::Unauthenticated(format!("{USER_HEADER} is empty")));
        }
        Ok(Owner(owner.to_string()))
    }
}

pub struct RestApi {
    vault: Arc<Vault>,
}

impl RestApi {
    pub fn new(vault: Arc<Vault>) -> Self {
        Self { vault }
    }

    pub fn router(&self) -> Router {
        // room for the largest planned chunk
        let chunk_limit = usize::try_from(self.vault.config().chunk_policy.max_chunk_size)
            .unwrap_or(usize::MAX)
            .saturating_add(64 * 1024);

        Router::new()
            .route("/health", get(health_check))
            .route("/api/v1/accounts", get(list_accounts).post(link_account))
            .route("/api/v1/accounts/space", get(account_space))
            .route("/api/v1/accounts/:id", axum::routing::delete(revoke_account))
            .route("/api/v1/plan", post(preview_plan))
            .route("/api/v1/uploads", post(initiate_upload))
            .route(
                "/api/v1/uploads/:id/chunks",
                put(receive_chunk).layer(DefaultBodyLimit::max(chunk_limit)),
            )
            .route("/api/v1/uploads/:id/finalize", post(finalize_upload))
            .route("/api/v1/uploads/:id", get(upload_status))
            .route("/api/v1/files", get(list_files))
            .route("/api/v1/files/recover", post(recover_file))
            .route("/api/v1/files/:id", axum::routing::delete(delete_file))
            .route("/api/v1/files/:id/integrity", get(check_integrity))
            .route("/api/v1/files/:id/keyfile", get(export_key_file))
            .route("/api/v1/manifests/rebuild", post(rebuild_manifests))
            .route("/api/v1/downloads", post(start_download))
            .route("/api/v1/downloads/:id", get(download_status))
            .route("/api/v1/downloads/:id/content", get(download_content))
            .layer(DefaultBodyLimit::max(KEY_FILE_LIMIT))
            .with_state(self.vault.clone())
    }
}

fn parse_file_id(raw: &str) -> ApiResult<FileId> {
    FileId::parse(raw).map_err(|e| ApiError::Vault(e.into()))
}

/// `attachment` disposition, falling back to no filename when it cannot be
/// expressed as a header
fn attachment(filename: &str) -> HeaderValue {
    let safe: String = filename
        .chars()
        .map(|c| if c == '"' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    HeaderValue::from_str(&format!("attachment; filename=\"{safe}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn list_accounts(
    State(vault): State<Arc<Vault>>,
    Owner(owner): Owner,
) -> ApiResult<Json<Vec<LinkedAccount>>> {
    Ok(Json(vault.list_accounts(&owner).await?))
}

async fn link_account(
    State(vault): State<Arc<Vault>>,
    Owner(owner): Owner,
    Json(req): Json<LinkAccountRequest>,
) -> ApiResult<(StatusCode, Json<LinkedAccount>)> {
    let label = req.label.unwrap_or_else(|| req.account_id.clone());
    let account = vault.link_account(&owner, &req.account_id, &label).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn account_space(
    State(vault): State<Arc<Vault>>,
    Owner(owner): Owner,
) -> ApiResult<Json<Vec<AccountSpace>>> {
    Ok(Json(vault.account_space(&owner).await?))
}

async fn revoke_account(
    State(vault): State<Arc<Vault>>,
    Owner(owner): Owner,
    Path(account_id): Path<String>,
) -> ApiResult<Json<LinkedAccount>> {
    Ok(Json(vault.revoke_account(&owner, &account_id).await?))
}

async fn preview_plan(
    State(vault): State<Arc<Vault>>,
    Owner(owner): Owner,
    Json(req): Json<PlanRequest>,
) -> ApiResult<Json<ChunkPlan>> {
    let plan = vault
        .preview_plan(&owner, req.size, req.strategy.as_deref())
        .await?;
    Ok(Json(plan))
}

async fn initiate_upload(
    State(vault): State<Arc<Vault>>,
    Owner(owner): Owner,
    Json(req): Json<UploadRequest>,
) -> ApiResult<(StatusCode, Json<InitiatedUpload>)> {
    let started = vault.initiate_upload(&owner, req).await?;
    Ok((StatusCode::CREATED, Json(started)))
}

async fn receive_chunk(
    State(vault): State<Arc<Vault>>,
    Owner(owner): Owner,
    Path(session_id): Path<String>,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> ApiResult<Json<ChunkReceipt>> {
    let receipt = vault
        .receive_chunk(&owner, &session_id, query.offset, body)
        .await?;
    Ok(Json(receipt))
}

async fn finalize_upload(
    State(vault): State<Arc<Vault>>,
    Owner(owner): Owner,
    Path(session_id): Path<String>,
) -> ApiResult<(StatusCode, Json<FinalizeAck>)> {
    let ack = vault.finalize_upload(&owner, &session_id).await?;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

async fn upload_status(
    State(vault): State<Arc<Vault>>,
    Owner(owner): Owner,
    Path(session_id): Path<String>,
) -> ApiResult<Json<UploadSnapshot>> {
    Ok(Json(vault.upload_status(&owner, &session_id).await?))
}

async fn list_files(
    State(vault): State<Arc<Vault>>,
    Owner(owner): Owner,
) -> ApiResult<Json<Vec<FileSummary>>> {
    Ok(Json(vault.list_files(&owner).await?))
}

async fn delete_file(
    State(vault): State<Arc<Vault>>,
    Owner(owner): Owner,
    Path(file_id): Path<String>,
) -> ApiResult<Json<DeletedFile>> {
    let file_id = parse_file_id(&file_id)?;
    Ok(Json(vault.delete_file(&owner, &file_id).await?))
}

async fn check_integrity(
    State(vault): State<Arc<Vault>>,
    Owner(owner): Owner,
    Path(file_id): Path<String>,
    Query(query): Query<IntegrityQuery>,
) -> ApiResult<Json<IntegrityResponse>> {
    let file_id = parse_file_id(&file_id)?;
    let report = vault.check_integrity(&owner, &file_id).await?;
    let remote = if query.deep {
        Some(vault.verify_remote(&owner, &file_id).await?)
    } else {
        None
    };
    Ok(Json(IntegrityResponse { report, remote }))
}

async fn export_key_file(
    State(vault): State<Arc<Vault>>,
    Owner(owner): Owner,
    Path(file_id): Path<String>,
    Query(query): Query<KeyFileQuery>,
) -> ApiResult<Response> {
    let file_id = parse_file_id(&file_id)?;
    let encoded = vault.export_key_file(&owner, &file_id, query.hints).await?;
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (header::CONTENT_DISPOSITION, attachment(&format!("{file_id}.dskey"))),
        ],
        encoded,
    )
        .into_response())
}

async fn recover_file(
    State(vault): State<Arc<Vault>>,
    Owner(owner): Owner,
    body: Bytes,
) -> ApiResult<Json<RecoveredFile>> {
    Ok(Json(vault.recover_file(&owner, &body).await?))
}

async fn rebuild_manifests(
    State(vault): State<Arc<Vault>>,
    Owner(owner): Owner,
) -> ApiResult<Json<ManifestOutcome>> {
    Ok(Json(vault.rebuild_manifests(&owner).await?))
}

async fn start_download(
    State(vault): State<Arc<Vault>>,
    Owner(owner): Owner,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<DownloadSnapshot>)> {
    if body.is_empty() {
        return Err(ApiError::InvalidRequest("request body must be a key file".into()));
    }
    let snapshot = vault.start_download(&owner, &body).await?;
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

async fn download_status(
    State(vault): State<Arc<Vault>>,
    Owner(owner): Owner,
    Path(session_id): Path<String>,
) -> ApiResult<Json<DownloadSnapshot>> {
    Ok(Json(vault.download_status(&owner, &session_id).await?))
}

async fn download_content(
    State(vault): State<Arc<Vault>>,
    Owner(owner): Owner,
    Path(session_id): Path<String>,
) -> ApiResult<Response> {
    let artifact = vault.retrieve_artifact(&owner, &session_id).await?;
    let file = tokio::fs::File::open(&artifact.path)
        .await
        .map_err(|e| ApiError::InternalError(format!("Failed to open artifact: {e}")))?;

    let stream = futures::stream::try_unfold(file, |mut file| async move {
        let mut block = vec![0u8; STREAM_BLOCK];
        let n = file.read(&mut block).await?;
        if n == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        block.truncate(n);
        Ok(Some((Bytes::from(block), file)))
    });

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (header::CONTENT_LENGTH, HeaderValue::from(artifact.size)),
            (header::CONTENT_DISPOSITION, attachment(&artifact.filename)),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}
