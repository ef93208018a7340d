//! Reconstruction of stored files
//!
//! A download session is opened from a key file. A background job fetches
//! every chunk, verifies it, and reassembles the original bytes into a
//! private work directory. The artifact stays retrievable until the session
//! expires.

pub mod engine;
pub mod state;
pub mod types;

pub use engine::ReconstructionEngine;
pub use state::{DownloadEvent, DownloadStatus};
pub use types::{Artifact, DownloadSession, DownloadSnapshot};
