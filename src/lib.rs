//! drivesplit
//!
//! Splits files into obfuscated chunks spread across several cloud storage
//! accounts, keeps an authoritative record of where every byte lives, and
//! reassembles files from a portable key file.

pub mod api;
pub mod config;
pub mod download;
pub mod error;
pub mod ident;
pub mod integrity;
pub mod keyfile;
pub mod metadata;
pub mod metrics;
pub mod obfuscation;
pub mod planner;
pub mod storage;
pub mod upload;
pub mod vault;

pub use config::VaultConfig;
pub use error::{VaultError, VaultResult};
pub use ident::FileId;
pub use vault::Vault;
