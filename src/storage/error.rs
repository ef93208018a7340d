use crate::storage::types::AccountId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Account unreachable: {0}")]
    Unreachable(AccountId),

    #[error("Account unauthorized: {0}")]
    Unauthorized(AccountId),

    #[error("Account access revoked: {0}")]
    Revoked(AccountId),

    #[error("Capacity exceeded on {account_id}: need {required} bytes, {available} free")]
    CapacityExceeded {
        account_id: AccountId,
        required: u64,
        available: u64,
    },

    #[error("Object not found on {account_id}: {handle}")]
    NotFound { account_id: AccountId, handle: String },

    #[error("Unknown account: {0}")]
    UnknownAccount(AccountId),

    #[error("Manifest encoding error: {0}")]
    Manifest(String),

    #[error("Transfer pool closed")]
    PoolClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unreachable(_))
    }

    pub fn is_capacity(&self) -> bool {
        matches!(self, StorageError::CapacityExceeded { .. })
    }

    /// The account can no longer be used at all
    pub fn is_access_denied(&self) -> bool {
        matches!(
            self,
            StorageError::Unauthorized(_) | StorageError::Revoked(_)
        )
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Manifest(err.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
