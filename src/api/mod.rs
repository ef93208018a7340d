//! HTTP API
//!
//! Every route except `/health` and `/metrics` is scoped to the caller named
//! in the `X-User-Id` header.

mod error;
mod rest;
mod types;

pub use error::{ApiError, ApiResult};
pub use rest::{Owner, RestApi, USER_HEADER};
pub use types::*;

use crate::metrics::metrics_route;
use crate::vault::Vault;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the complete API router
pub fn create_api_server(vault: Arc<Vault>) -> Router {
    let rest_api = RestApi::new(vault);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(rest_api.router())
        .route("/metrics", metrics_route())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VaultConfig;
    use crate::metadata::MetadataStore;
    use crate::planner::ChunkPolicy;
    use crate::storage::{MemoryStorage, RetryPolicy};
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const KB: u64 = 1024;

    async fn app(work: &TempDir, quota: u64) -> Router {
        let memory = Arc::new(MemoryStorage::new());
        memory.add_account("drive-a", quota);
        memory.add_account("drive-b", quota);
        let config = VaultConfig {
            chunk_policy: ChunkPolicy {
                min_chunk_size: 4 * KB,
                max_chunk_size: 16 * KB,
                ..Default::default()
            },
            work_dir: work.path().to_path_buf(),
            retry: RetryPolicy::none(),
            ..Default::default()
        };
        let store = Arc::new(MetadataStore::new_in_memory().await.unwrap());
        let vault = Vault::new(config, store, memory).unwrap();
        create_api_server(Arc::new(vault))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    async fn send_json(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(USER_HEADER, "alice");
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let (status, bytes) = send(app, request).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn link_both(app: &Router) {
        for account in ["drive-a", "drive-b"] {
            let (status, _) = send_json(
                app,
                Method::POST,
                "/api/v1/accounts",
                Some(json!({ "account_id": account })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }
    }

    async fn wait_for(app: &Router, uri: &str) -> Value {
        for _ in 0..300 {
            let (_, body) = send_json(app, Method::GET, uri, None).await;
            if matches!(body["status"].as_str(), Some("complete") | Some("failed")) {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{uri} never reached a terminal status");
    }

    #[tokio::test]
    async fn test_health_needs_no_user() {
        let work = TempDir::new().unwrap();
        let app = app(&work, 1024 * KB).await;
        let (status, body) = send(
            &app,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_user_header() {
        let work = TempDir::new().unwrap();
        let app = app(&work, 1024 * KB).await;
        let (status, body) = send(
            &app,
            Request::builder().uri("/api/v1/files").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["code"], "MISSING_USER");
    }

    #[tokio::test]
    async fn test_plan_errors_map_to_status() {
        let work = TempDir::new().unwrap();
        let app = app(&work, 64 * KB).await;

        let (status, body) =
            send_json(&app, Method::POST, "/api/v1/plan", Some(json!({ "size": 10 * KB }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "NO_LINKED_ACCOUNTS");

        link_both(&app).await;
        let (status, body) =
            send_json(&app, Method::POST, "/api/v1/plan", Some(json!({ "size": 1024 * KB }))).await;
        assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE);
        assert_eq!(body["code"], "INSUFFICIENT_CAPACITY");

        let (status, body) =
            send_json(&app, Method::POST, "/api/v1/plan", Some(json!({ "size": 0 }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "EMPTY_FILE");
    }

    #[tokio::test]
    async fn test_upload_and_download_round_trip() {
        let work = TempDir::new().unwrap();
        let app = app(&work, 1024 * KB).await;
        link_both(&app).await;

        let data: Vec<u8> = (0..50 * KB).map(|i| (i % 251) as u8).collect();
        let (status, started) = send_json(
            &app,
            Method::POST,
            "/api/v1/uploads",
            Some(json!({ "filename": "scan.pdf", "size": data.len() })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let session_id = started["session_id"].as_str().unwrap().to_string();
        let file_id = started["file_id"].as_str().unwrap().to_string();

        // finalize before all chunks arrive lists what is missing
        let (status, body) = send_json(
            &app,
            Method::POST,
            &format!("/api/v1/uploads/{session_id}/finalize"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "INCOMPLETE_UPLOAD");
        assert!(!body["missing"].as_array().unwrap().is_empty());

        for chunk in started["plan"]["chunks"].as_array().unwrap() {
            let start = chunk["start_offset"].as_u64().unwrap() as usize;
            let end = chunk["end_offset"].as_u64().unwrap() as usize;
            let request = Request::builder()
                .method(Method::PUT)
                .uri(format!("/api/v1/uploads/{session_id}/chunks?offset={start}"))
                .header(USER_HEADER, "alice")
                .body(Body::from(data[start..end].to_vec()))
                .unwrap();
            let (status, _) = send(&app, request).await;
            assert_eq!(status, StatusCode::OK);
        }

        let (status, _) = send_json(
            &app,
            Method::POST,
            &format!("/api/v1/uploads/{session_id}/finalize"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let upload = wait_for(&app, &format!("/api/v1/uploads/{session_id}")).await;
        assert_eq!(upload["status"], "complete");

        let (status, files) = send_json(&app, Method::GET, "/api/v1/files", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(files.as_array().unwrap().len(), 1);
        assert!(!files.to_string().contains("secret"));

        let (status, report) = send_json(
            &app,
            Method::GET,
            &format!("/api/v1/files/{file_id}/integrity?deep=true"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["is_complete"], true);
        assert!(report["remote"]["corrupted_chunks"].as_array().unwrap().is_empty());

        let (status, key_file) = send(
            &app,
            Request::builder()
                .uri(format!("/api/v1/files/{file_id}/keyfile"))
                .header(USER_HEADER, "alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, download) = send(
            &app,
            Request::builder()
                .method(Method::POST)
                .uri("/api/v1/downloads")
                .header(USER_HEADER, "alice")
                .body(Body::from(key_file))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let download: Value = serde_json::from_slice(&download).unwrap();
        let download_id = download["session_id"].as_str().unwrap().to_string();

        let finished = wait_for(&app, &format!("/api/v1/downloads/{download_id}")).await;
        assert_eq!(finished["status"], "complete");

        let (status, content) = send(
            &app,
            Request::builder()
                .uri(format!("/api/v1/downloads/{download_id}/content"))
                .header(USER_HEADER, "alice")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content, data);

        // another user cannot see the session
        let (status, _) = send(
            &app,
            Request::builder()
                .uri(format!("/api/v1/downloads/{download_id}"))
                .header(USER_HEADER, "mallory")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_account_space_lists_free_bytes() {
        let work = TempDir::new().unwrap();
        let app = app(&work, 256 * KB).await;

        let (status, body) = send_json(&app, Method::GET, "/api/v1/accounts/space", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());

        link_both(&app).await;
        let (status, body) = send_json(&app, Method::GET, "/api/v1/accounts/space", None).await;
        assert_eq!(status, StatusCode::OK);
        let accounts = body.as_array().unwrap();
        assert_eq!(accounts.len(), 2);
        for account in accounts {
            assert_eq!(account["reachable"], true);
            assert_eq!(account["free_bytes"], 256 * KB);
        }

        // the revoke route still matches account ids
        let (status, _) =
            send_json(&app, Method::DELETE, "/api/v1/accounts/drive-b", None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = send_json(&app, Method::GET, "/api/v1/accounts/space", None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_garbage_key_file_rejected() {
        let work = TempDir::new().unwrap();
        let app = app(&work, 1024 * KB).await;
        let (status, body) = send(
            &app,
            Request::builder()
                .method(Method::POST)
                .uri("/api/v1/downloads")
                .header(USER_HEADER, "alice")
                .body(Body::from("not a key file"))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["code"], "CORRUPT_KEY_FILE");
    }

    #[tokio::test]
    async fn test_invalid_file_id() {
        let work = TempDir::new().unwrap();
        let app = app(&work, 1024 * KB).await;
        let (status, body) =
            send_json(&app, Method::GET, "/api/v1/files/short/integrity", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "INVALID_FILE_ID");
    }
}
