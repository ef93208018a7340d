//! Storage-account adapters
//!
//! The core never touches a remote account directly: every byte goes through a
//! [`StorageAdapter`], serialized per account and bounded globally by the
//! [`AccountThrottle`].

pub mod access;
pub mod adapter;
pub mod error;
pub mod local;
pub mod memory;
pub mod retry;
pub mod throttle;
pub mod types;

pub use access::StorageAccess;
pub use adapter::StorageAdapter;
pub use error::{StorageError, StorageResult};
pub use local::LocalDirStorage;
pub use memory::MemoryStorage;
pub use retry::RetryPolicy;
pub use throttle::{AccountPass, AccountThrottle};
pub use types::{chunk_object_name, AccountId, RemoteHandle, MANIFEST_NAME};
