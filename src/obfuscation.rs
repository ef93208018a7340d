//! Per-file obfuscation of chunk bytes
//!
//! Chunk bytes are XORed with a keystream taken from a BLAKE3 keyed XOF. The
//! keystream is addressed by absolute file offset, so every chunk can be
//! transformed on its own and the transform is its own inverse.

use crate::ident::FileId;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

const DOMAIN: &[u8] = b"drivesplit obfuscation v1";
const KEYSTREAM_BLOCK: usize = 8192;

/// 32-byte secret, one per stored file
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscationSecret([u8; 32]);

impl ObfuscationSecret {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ObfuscationSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ObfuscationSecret(<redacted>)")
    }
}

/// Transform `data`, which starts at `offset` within the original file.
///
/// Applying the transform twice with the same arguments restores the input.
pub fn apply(secret: &ObfuscationSecret, file_id: &FileId, offset: u64, data: &mut [u8]) {
    let mut hasher = blake3::Hasher::new_keyed(secret.as_bytes());
    hasher.update(DOMAIN);
    hasher.update(file_id.as_str().as_bytes());
    let mut reader = hasher.finalize_xof();
    reader.set_position(offset);

    let mut keystream = [0u8; KEYSTREAM_BLOCK];
    for block in data.chunks_mut(KEYSTREAM_BLOCK) {
        let ks = &mut keystream[..block.len()];
        reader.fill(ks);
        for (byte, key) in block.iter_mut().zip(ks.iter()) {
            *byte ^= key;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_apply_is_involution() {
        let secret = ObfuscationSecret::generate();
        let file_id = FileId::generate();
        let original = sample(20_000);

        let mut data = original.clone();
        apply(&secret, &file_id, 0, &mut data);
        assert_ne!(data, original);

        apply(&secret, &file_id, 0, &mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn test_offset_addressable() {
        let secret = ObfuscationSecret::generate();
        let file_id = FileId::generate();
        let original = sample(30_000);

        let mut whole = original.clone();
        apply(&secret, &file_id, 0, &mut whole);

        let mut head = original[..12_345].to_vec();
        let mut tail = original[12_345..].to_vec();
        apply(&secret, &file_id, 0, &mut head);
        apply(&secret, &file_id, 12_345, &mut tail);

        head.extend_from_slice(&tail);
        assert_eq!(head, whole);
    }

    #[test]
    fn test_secret_changes_output() {
        let file_id = FileId::generate();
        let mut a = sample(1024);
        let mut b = sample(1024);
        apply(&ObfuscationSecret::from_bytes([1u8; 32]), &file_id, 0, &mut a);
        apply(&ObfuscationSecret::from_bytes([2u8; 32]), &file_id, 0, &mut b);
        assert_ne!(a, b);
    }

    #[test]
    fn test_debug_is_redacted() {
        let secret = ObfuscationSecret::from_bytes([7u8; 32]);
        let rendered = format!("{secret:?}");
        assert!(rendered.contains("redacted"));
        assert!(!rendered.contains('7'));
    }
}
