use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyFileError {
    #[error("Corrupt key file: {0}")]
    CorruptKeyFile(String),

    #[error("Unsupported key file version: {0}")]
    UnsupportedKeyFileVersion(u16),

    #[error("Key file encoding failed: {0}")]
    EncodingFailed(String),
}

pub type KeyFileResult<T> = Result<T, KeyFileError>;
