//! Authoritative file records and per-account manifests
//!
//! The central [`MetadataStore`] must accept every write for a session to make
//! progress. The [`DriveManifest`] copies written onto each linked account are
//! best-effort and exist so files can be recovered without the central store.

pub mod error;
pub mod manifest;
pub mod recovery;
pub mod store;
pub mod types;

pub use error::{MetadataError, MetadataResult};
pub use manifest::{ManifestOutcome, ManifestWriter};
pub use recovery::ManifestRecovery;
pub use store::MetadataStore;
pub use types::{
    coverage_gaps, AccountStatus, ByteRange, Checksum, DriveManifest, FileStatus, FileSummary, LinkedAccount,
    ManifestChunk, ManifestFile, StoredChunk, StoredFile,
};
