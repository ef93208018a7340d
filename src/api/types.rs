use crate::integrity::{IntegrityReport, RemoteVerification};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkAccountRequest {
    pub account_id: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub size: u64,
    #[serde(default)]
    pub strategy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkQuery {
    pub offset: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityQuery {
    /// Also fetch and checksum every chunk
    #[serde(default)]
    pub deep: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyFileQuery {
    #[serde(default)]
    pub hints: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityResponse {
    #[serde(flatten)]
    pub report: IntegrityReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteVerification>,
}
