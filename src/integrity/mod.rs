pub mod types;
pub mod verifier;

pub use types::{IntegrityReport, RemoteVerification};
pub use verifier::{checksum, file_checksum, IntegrityVerifier};
