//! Upload sessions
//!
//! An upload is opened against a fresh chunk plan, receives chunks in any
//! order, and is finalized into a background processing job that writes the
//! drive manifests and activates the stored file. Callers poll for the
//! outcome.

pub mod manager;
pub mod state;
pub mod types;

pub use manager::UploadManager;
pub use state::{UploadEvent, UploadStatus};
pub use types::{
    ChunkReceipt, FinalizeAck, InitiatedUpload, ReceivedChunk, UploadRequest, UploadSession,
    UploadSnapshot,
};
