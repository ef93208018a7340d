use crate::ident::FileId;
use crate::metadata::{Checksum, StoredChunk, StoredFile};
use crate::obfuscation::ObfuscationSecret;
use crate::storage::{chunk_object_name, AccountId, RemoteHandle};
use serde::{Deserialize, Serialize};

/// Location summary of one chunk, carried by version 2 key files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHint {
    pub chunk_index: u32,
    pub account_id: AccountId,
    pub remote_handle: RemoteHandle,
    pub size: u64,
    pub checksum: Checksum,
    pub start_offset: u64,
    pub end_offset: u64,
}

impl From<&StoredChunk> for ChunkHint {
    fn from(chunk: &StoredChunk) -> Self {
        Self {
            chunk_index: chunk.chunk_index,
            account_id: chunk.account_id.clone(),
            remote_handle: chunk.remote_handle.clone(),
            size: chunk.size,
            checksum: chunk.checksum,
            start_offset: chunk.start_offset,
            end_offset: chunk.end_offset,
        }
    }
}

impl ChunkHint {
    /// Record entry for this chunk. Remote names are derived, never carried.
    pub fn to_stored(&self, file_id: &FileId) -> StoredChunk {
        StoredChunk {
            chunk_index: self.chunk_index,
            account_id: self.account_id.clone(),
            remote_handle: self.remote_handle.clone(),
            remote_name: chunk_object_name(file_id, self.chunk_index),
            size: self.size,
            checksum: self.checksum,
            start_offset: self.start_offset,
            end_offset: self.end_offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFile {
    pub version: u16,
    pub file_id: FileId,
    pub original_filename: String,
    pub original_size: u64,
    pub secret: ObfuscationSecret,
    /// Present only in version 2
    pub chunk_hints: Option<Vec<ChunkHint>>,
}

impl KeyFile {
    /// Key file for `file`; with hints it is emitted as version 2, else version 1
    pub fn from_stored(file: &StoredFile, with_hints: bool) -> Self {
        let chunk_hints = with_hints.then(|| file.chunks.iter().map(ChunkHint::from).collect());
        Self {
            version: if with_hints { 2 } else { 1 },
            file_id: file.file_id.clone(),
            original_filename: file.original_filename.clone(),
            original_size: file.original_size,
            secret: file.secret.clone(),
            chunk_hints,
        }
    }
}
