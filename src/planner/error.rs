use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("File is empty")]
    EmptyFile,

    #[error("No linked storage accounts")]
    NoLinkedAccounts,

    #[error("Insufficient capacity: need {required} bytes, {available} available")]
    InsufficientCapacity { required: u64, available: u64 },

    #[error("Unknown allocation strategy: {0}")]
    UnknownStrategy(String),

    #[error("Invalid chunk policy: {0}")]
    InvalidPolicy(String),
}

pub type PlanResult<T> = Result<T, PlanError>;
