//! Binary layout:
//!
//! ```text
//! +-------+---------+----------+----------------+-----------------+
//! | DSKF  | version | body len | bincode body   | BLAKE3 trailer  |
//! | 4B    | u16 LE  | u32 LE   | body len bytes | 32B             |
//! +-------+---------+----------+----------------+-----------------+
//! ```
//!
//! The trailer hashes everything before it.

use crate::ident::FileId;
use crate::keyfile::error::{KeyFileError, KeyFileResult};
use crate::keyfile::types::{ChunkHint, KeyFile};
use crate::metadata::Checksum;
use crate::obfuscation::ObfuscationSecret;
use bincode::Options;
use serde::{Deserialize, Serialize};

pub const KEY_FILE_MAGIC: &[u8; 4] = b"DSKF";
pub const LATEST_VERSION: u16 = 2;

const HEADER_LEN: usize = 4 + 2 + 4;
const TRAILER_LEN: usize = 32;
const MAX_BODY_LEN: u64 = 16 * 1024 * 1024;

#[derive(Serialize, Deserialize)]
struct BodyV1 {
    file_id: String,
    original_filename: String,
    original_size: u64,
    secret: [u8; 32],
}

#[derive(Serialize, Deserialize)]
struct HintRecord {
    chunk_index: u32,
    account_id: String,
    remote_handle: String,
    size: u64,
    checksum: [u8; 32],
    start_offset: u64,
    end_offset: u64,
}

#[derive(Serialize, Deserialize)]
struct BodyV2 {
    file_id: String,
    original_filename: String,
    original_size: u64,
    secret: [u8; 32],
    chunk_hints: Vec<HintRecord>,
}

fn body_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_BODY_LEN)
        .reject_trailing_bytes()
}

fn corrupt(reason: impl Into<String>) -> KeyFileError {
    KeyFileError::CorruptKeyFile(reason.into())
}

impl KeyFile {
    /// Encode as version 2 if hints are present, version 1 otherwise
    pub fn encode(&self) -> KeyFileResult<Vec<u8>> {
        let (version, body) = match &self.chunk_hints {
            Some(hints) => {
                let body = BodyV2 {
                    file_id: self.file_id.to_string(),
                    original_filename: self.original_filename.clone(),
                    original_size: self.original_size,
                    secret: *self.secret.as_bytes(),
                    chunk_hints: hints
                        .iter()
                        .map(|h| HintRecord {
                            chunk_index: h.chunk_index,
                            account_id: h.account_id.clone(),
                            remote_handle: h.remote_handle.clone(),
                            size: h.size,
                            checksum: *h.checksum.as_bytes(),
                            start_offset: h.start_offset,
                            end_offset: h.end_offset,
                        })
                        .collect(),
                };
                (2u16, body_options().serialize(&body))
            }
            None => {
                let body = BodyV1 {
                    file_id: self.file_id.to_string(),
                    original_filename: self.original_filename.clone(),
                    original_size: self.original_size,
                    secret: *self.secret.as_bytes(),
                };
                (1u16, body_options().serialize(&body))
            }
        };
        let body = body.map_err(|e| KeyFileError::EncodingFailed(e.to_string()))?;
        let body_len =
            u32::try_from(body.len()).map_err(|_| KeyFileError::EncodingFailed("body too large".into()))?;

        let mut out = Vec::with_capacity(HEADER_LEN + body.len() + TRAILER_LEN);
        out.extend_from_slice(KEY_FILE_MAGIC);
        out.extend_from_slice(&version.to_le_bytes());
        out.extend_from_slice(&body_len.to_le_bytes());
        out.extend_from_slice(&body);
        let trailer = blake3::hash(&out);
        out.extend_from_slice(trailer.as_bytes());
        Ok(out)
    }

    pub fn decode(raw: &[u8]) -> KeyFileResult<KeyFile> {
        if raw.len() < HEADER_LEN + TRAILER_LEN {
            return Err(corrupt(format!("{} bytes is too short", raw.len())));
        }
        if &raw[..4] != KEY_FILE_MAGIC {
            return Err(corrupt("bad magic"));
        }

        let version = u16::from_le_bytes([raw[4], raw[5]]);
        if version == 0 || version > LATEST_VERSION {
            return Err(KeyFileError::UnsupportedKeyFileVersion(version));
        }

        let body_len = u32::from_le_bytes([raw[6], raw[7], raw[8], raw[9]]) as usize;
        if HEADER_LEN + body_len + TRAILER_LEN != raw.len() {
            return Err(corrupt("length mismatch"));
        }

        let (signed, trailer) = raw.split_at(raw.len() - TRAILER_LEN);
        if blake3::hash(signed).as_bytes() != trailer {
            return Err(corrupt("checksum mismatch"));
        }
        let body = &signed[HEADER_LEN..];

        let key = match version {
            1 => {
                let body: BodyV1 = body_options()
                    .deserialize(body)
                    .map_err(|e| corrupt(format!("invalid body: {e}")))?;
                KeyFile {
                    version,
                    file_id: parse_id(&body.file_id)?,
                    original_filename: body.original_filename,
                    original_size: body.original_size,
                    secret: ObfuscationSecret::from_bytes(body.secret),
                    chunk_hints: None,
                }
            }
            _ => {
                let body: BodyV2 = body_options()
                    .deserialize(body)
                    .map_err(|e| corrupt(format!("invalid body: {e}")))?;
                KeyFile {
                    version,
                    file_id: parse_id(&body.file_id)?,
                    original_filename: body.original_filename,
                    original_size: body.original_size,
                    secret: ObfuscationSecret::from_bytes(body.secret),
                    chunk_hints: Some(
                        body.chunk_hints
                            .into_iter()
                            .map(|h| ChunkHint {
                                chunk_index: h.chunk_index,
                                account_id: h.account_id,
                                remote_handle: h.remote_handle,
                                size: h.size,
                                checksum: Checksum::from_bytes(h.checksum),
                                start_offset: h.start_offset,
                                end_offset: h.end_offset,
                            })
                            .collect(),
                    ),
                }
            }
        };
        Ok(key)
    }
}

fn parse_id(raw: &str) -> KeyFileResult<FileId> {
    FileId::parse(raw).map_err(|e| corrupt(e.to_string()))
}
