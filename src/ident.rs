//! Short, time-ordered file identifiers.
//!
//! A [`FileId`] is 12 base62 characters encoding 71 bits: the upper 32 bits are
//! the creation time in Unix seconds, the lower 39 bits are random. The encoding
//! is fixed-width over an ASCII-ordered alphabet, so ids sort by creation time.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Length of every file id, in characters
pub const FILE_ID_LEN: usize = 12;

const RANDOM_BITS: u32 = 39;
const RANDOM_MASK: u128 = (1 << RANDOM_BITS) - 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentError {
    #[error("Invalid file id: {0:?}")]
    InvalidFileId(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileId(String);

impl FileId {
    /// Generate a new id stamped with the current time
    pub fn generate() -> Self {
        let secs = chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;
        let random = rand::thread_rng().gen::<u64>() as u128 & RANDOM_MASK;
        Self::from_parts(secs, random)
    }

    fn from_parts(secs: u32, random: u128) -> Self {
        let mut value = ((secs as u128) << RANDOM_BITS) | (random & RANDOM_MASK);
        let mut out = [b'0'; FILE_ID_LEN];
        for slot in out.iter_mut().rev() {
            *slot = ALPHABET[(value % 62) as usize];
            value /= 62;
        }
        Self(out.iter().map(|&b| b as char).collect())
    }

    /// Parse and validate an id
    pub fn parse(s: &str) -> Result<Self, IdentError> {
        if s.len() != FILE_ID_LEN || !s.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(IdentError::InvalidFileId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Creation time embedded in the id, in Unix seconds
    pub fn timestamp(&self) -> i64 {
        let value = self.0.bytes().fold(0u128, |acc, b| acc * 62 + digit(b) as u128);
        (value >> RANDOM_BITS) as i64
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn digit(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'A'..=b'Z' => b - b'A' + 10,
        b'a'..=b'z' => b - b'a' + 36,
        _ => 0,
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for FileId {
    type Err = IdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FileId {
    type Error = IdentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FileId> for String {
    fn from(id: FileId) -> Self {
        id.0
    }
}

impl AsRef<str> for FileId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generated_id_shape() {
        let id = FileId::generate();
        assert_eq!(id.as_str().len(), FILE_ID_LEN);
        assert!(id.as_str().bytes().all(|b| b.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_timestamp_roundtrip() {
        let id = FileId::from_parts(1_700_000_000, 12345);
        assert_eq!(id.timestamp(), 1_700_000_000);

        let now = chrono::Utc::now().timestamp();
        let fresh = FileId::generate();
        assert!((fresh.timestamp() - now).abs() <= 1);
    }

    #[test]
    fn test_ids_sort_by_time() {
        let earlier = FileId::from_parts(1_700_000_000, RANDOM_MASK);
        let later = FileId::from_parts(1_700_000_001, 0);
        assert!(earlier < later);
        assert!(earlier.as_str() < later.as_str());
    }

    #[test]
    fn test_no_collisions_in_burst() {
        let ids: HashSet<FileId> = (0..5000).map(|_| FileId::generate()).collect();
        assert_eq!(ids.len(), 5000);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(FileId::parse("short").is_err());
        assert!(FileId::parse("abcdefghijk!").is_err());
        assert!(FileId::parse("abcdefghijklm").is_err());
        assert!(FileId::parse("abcdefghijkl").is_ok());
    }

    #[test]
    fn test_serde_validates() {
        let id = FileId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: FileId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        let bad: Result<FileId, _> = serde_json::from_str("\"nope\"");
        assert!(bad.is_err());
    }
}
