use crate::ident::FileId;
use crate::obfuscation::ObfuscationSecret;
use crate::storage::{AccountId, RemoteHandle};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeSet;
use std::fmt;

/// BLAKE3 digest of a chunk as written to its account
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Checksum([u8; 32]);

impl Checksum {
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex).ok().map(|h| Self(*h.as_bytes()))
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({})", self.to_hex())
    }
}

impl Serialize for Checksum {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Checksum {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Checksum::from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid checksum: {hex}")))
    }
}

/// Half-open byte range `[start, end)` of an original file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Sub-ranges of `[0, total)` not covered by any of `covered`, merged and sorted
pub fn coverage_gaps(total: u64, covered: impl IntoIterator<Item = ByteRange>) -> Vec<ByteRange> {
    let mut ranges: Vec<ByteRange> = covered.into_iter().filter(|r| !r.is_empty()).collect();
    ranges.sort_by_key(|r| r.start);

    let mut gaps = Vec::new();
    let mut cursor = 0u64;
    for range in ranges {
        if range.start > cursor {
            gaps.push(ByteRange::new(cursor, range.start.min(total)));
        }
        cursor = cursor.max(range.end);
        if cursor >= total {
            break;
        }
    }
    if cursor < total {
        gaps.push(ByteRange::new(cursor, total));
    }
    gaps.retain(|g| !g.is_empty());
    gaps
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Active,
    Incomplete,
    Deleted,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Active => "active",
            FileStatus::Incomplete => "incomplete",
            FileStatus::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub chunk_index: u32,
    pub account_id: AccountId,
    pub remote_handle: RemoteHandle,
    pub remote_name: String,
    pub size: u64,
    pub checksum: Checksum,
    pub start_offset: u64,
    pub end_offset: u64,
}

impl StoredChunk {
    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.start_offset, self.end_offset)
    }
}

/// Authoritative record of one ingested file.
///
/// Holds the obfuscation secret, so it is never handed out directly; API
/// responses use [`FileSummary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredFile {
    pub file_id: FileId,
    pub owner: String,
    pub original_filename: String,
    pub original_size: u64,
    pub processed_size: u64,
    pub chunk_size: u64,
    /// Ordered by `chunk_index`
    pub chunks: Vec<StoredChunk>,
    pub secret: ObfuscationSecret,
    pub created_at: DateTime<Utc>,
    pub status: FileStatus,
}

impl StoredFile {
    pub fn skeleton(
        file_id: FileId,
        owner: impl Into<String>,
        original_filename: impl Into<String>,
        original_size: u64,
        chunk_size: u64,
        secret: ObfuscationSecret,
    ) -> Self {
        Self {
            file_id,
            owner: owner.into(),
            original_filename: original_filename.into(),
            original_size,
            processed_size: 0,
            chunk_size,
            chunks: Vec::new(),
            secret,
            created_at: Utc::now(),
            status: FileStatus::Incomplete,
        }
    }

    pub fn chunk(&self, chunk_index: u32) -> Option<&StoredChunk> {
        self.chunks
            .binary_search_by_key(&chunk_index, |c| c.chunk_index)
            .ok()
            .map(|i| &self.chunks[i])
    }

    /// Insert or replace the chunk with the same index, returning the replaced one
    pub fn upsert_chunk(&mut self, chunk: StoredChunk) -> Option<StoredChunk> {
        match self
            .chunks
            .binary_search_by_key(&chunk.chunk_index, |c| c.chunk_index)
        {
            Ok(i) => Some(std::mem::replace(&mut self.chunks[i], chunk)),
            Err(i) => {
                self.chunks.insert(i, chunk);
                None
            }
        }
    }

    pub fn remove_chunk(&mut self, chunk_index: u32) -> Option<StoredChunk> {
        self.chunks
            .binary_search_by_key(&chunk_index, |c| c.chunk_index)
            .ok()
            .map(|i| self.chunks.remove(i))
    }

    /// Bytes held across all linked accounts
    pub fn stored_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }

    pub fn accounts(&self) -> BTreeSet<AccountId> {
        self.chunks.iter().map(|c| c.account_id.clone()).collect()
    }

    pub fn chunks_on<'a>(&'a self, account_id: &'a str) -> impl Iterator<Item = &'a StoredChunk> {
        self.chunks.iter().filter(move |c| c.account_id == account_id)
    }

    /// Chunk count implied by the recorded size and chunk size
    pub fn expected_chunks(&self) -> u64 {
        if self.chunk_size == 0 {
            return 0;
        }
        self.original_size.div_ceil(self.chunk_size)
    }

    /// Ranges of the original file no recorded chunk covers
    pub fn missing_ranges(&self) -> Vec<ByteRange> {
        coverage_gaps(self.original_size, self.chunks.iter().map(StoredChunk::range))
    }

    pub fn summary(&self) -> FileSummary {
        FileSummary {
            file_id: self.file_id.clone(),
            original_filename: self.original_filename.clone(),
            original_size: self.original_size,
            processed_size: self.processed_size,
            chunk_count: self.chunks.len(),
            accounts: self.accounts().into_iter().collect(),
            status: self.status,
            created_at: self.created_at,
        }
    }
}

/// Listing view of a [`StoredFile`], without the secret or chunk handles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSummary {
    pub file_id: FileId,
    pub original_filename: String,
    pub original_size: u64,
    pub processed_size: u64,
    pub chunk_count: usize,
    pub accounts: Vec<AccountId>,
    pub status: FileStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestChunk {
    pub chunk_index: u32,
    pub remote_name: String,
    pub remote_handle: RemoteHandle,
    pub size: u64,
    pub checksum: Checksum,
    pub start_offset: u64,
    pub end_offset: u64,
}

impl From<&StoredChunk> for ManifestChunk {
    fn from(chunk: &StoredChunk) -> Self {
        Self {
            chunk_index: chunk.chunk_index,
            remote_name: chunk.remote_name.clone(),
            remote_handle: chunk.remote_handle.clone(),
            size: chunk.size,
            checksum: chunk.checksum,
            start_offset: chunk.start_offset,
            end_offset: chunk.end_offset,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub file_id: FileId,
    pub original_filename: String,
    pub original_size: u64,
    pub chunk_size: u64,
    pub uploaded_at: DateTime<Utc>,
    pub chunks: Vec<ManifestChunk>,
}

impl ManifestFile {
    /// Entry for the chunks of `file` held by `account_id`
    pub fn for_account(file: &StoredFile, account_id: &str) -> Self {
        Self {
            file_id: file.file_id.clone(),
            original_filename: file.original_filename.clone(),
            original_size: file.original_size,
            chunk_size: file.chunk_size,
            uploaded_at: file.created_at,
            chunks: file.chunks_on(account_id).map(ManifestChunk::from).collect(),
        }
    }
}

/// Index of the chunks one linked account holds, written onto the account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveManifest {
    pub account_id: AccountId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub files: Vec<ManifestFile>,
}

impl DriveManifest {
    pub fn new(account_id: AccountId) -> Self {
        let now = Utc::now();
        Self {
            account_id,
            created_at: now,
            updated_at: now,
            files: Vec::new(),
        }
    }

    pub fn file(&self, file_id: &FileId) -> Option<&ManifestFile> {
        self.files.iter().find(|f| &f.file_id == file_id)
    }

    /// Add or replace the entry for `entry.file_id`, leaving other files untouched
    pub fn merge_file(&mut self, entry: ManifestFile) {
        match self.files.iter_mut().find(|f| f.file_id == entry.file_id) {
            Some(existing) => *existing = entry,
            None => self.files.push(entry),
        }
        self.updated_at = Utc::now();
    }

    pub fn remove_file(&mut self, file_id: &FileId) -> bool {
        let before = self.files.len();
        self.files.retain(|f| &f.file_id != file_id);
        let removed = self.files.len() != before;
        if removed {
            self.updated_at = Utc::now();
        }
        removed
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json_bytes(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Linked,
    Revoked,
}

/// A storage account the user authorized through the external linking flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkedAccount {
    pub account_id: AccountId,
    pub owner: String,
    pub label: String,
    pub linked_at: DateTime<Utc>,
    pub status: AccountStatus,
}

impl LinkedAccount {
    pub fn new(
        account_id: impl Into<AccountId>,
        owner: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            owner: owner.into(),
            label: label.into(),
            linked_at: Utc::now(),
            status: AccountStatus::Linked,
        }
    }

    pub fn is_linked(&self) -> bool {
        self.status == AccountStatus::Linked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(index: u32, account: &str, start: u64, end: u64) -> StoredChunk {
        StoredChunk {
            chunk_index: index,
            account_id: account.to_string(),
            remote_handle: format!("h{index}"),
            remote_name: format!("f.{index:04}.chunk"),
            size: end - start,
            checksum: Checksum::of(&[index as u8]),
            start_offset: start,
            end_offset: end,
        }
    }

    fn file() -> StoredFile {
        StoredFile::skeleton(
            FileId::generate(),
            "alice",
            "notes.txt",
            300,
            100,
            ObfuscationSecret::generate(),
        )
    }

    #[test]
    fn test_checksum_hex_serde() {
        let checksum = Checksum::of(b"chunk bytes");
        let json = serde_json::to_string(&checksum).unwrap();
        assert_eq!(json, format!("\"{}\"", checksum.to_hex()));
        let back: Checksum = serde_json::from_str(&json).unwrap();
        assert_eq!(back, checksum);
        assert!(serde_json::from_str::<Checksum>("\"zz\"").is_err());
    }

    #[test]
    fn test_coverage_gaps() {
        let gaps = coverage_gaps(
            300,
            vec![ByteRange::new(200, 300), ByteRange::new(0, 100)],
        );
        assert_eq!(gaps, vec![ByteRange::new(100, 200)]);

        assert_eq!(coverage_gaps(10, vec![]), vec![ByteRange::new(0, 10)]);
        assert!(coverage_gaps(10, vec![ByteRange::new(0, 6), ByteRange::new(4, 10)]).is_empty());
    }

    #[test]
    fn test_upsert_keeps_order_and_replaces() {
        let mut file = file();
        assert!(file.upsert_chunk(chunk(2, "b", 200, 300)).is_none());
        assert!(file.upsert_chunk(chunk(0, "a", 0, 100)).is_none());
        assert!(file.upsert_chunk(chunk(1, "b", 100, 200)).is_none());

        let indexes: Vec<u32> = file.chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert!(file.missing_ranges().is_empty());

        let mut replacement = chunk(1, "a", 100, 200);
        replacement.remote_handle = "new".into();
        let old = file.upsert_chunk(replacement).unwrap();
        assert_eq!(old.remote_handle, "h1");
        assert_eq!(file.chunk(1).unwrap().remote_handle, "new");
        assert_eq!(file.stored_bytes(), 300);
    }

    #[test]
    fn test_missing_ranges_after_removal() {
        let mut file = file();
        file.upsert_chunk(chunk(0, "a", 0, 100));
        file.upsert_chunk(chunk(1, "b", 100, 200));
        file.upsert_chunk(chunk(2, "a", 200, 300));
        file.remove_chunk(1);

        assert_eq!(file.missing_ranges(), vec![ByteRange::new(100, 200)]);
        assert_eq!(file.expected_chunks(), 3);
    }

    #[test]
    fn test_summary_has_no_secret() {
        let mut file = file();
        file.upsert_chunk(chunk(0, "a", 0, 100));
        let json = serde_json::to_string(&file.summary()).unwrap();
        assert!(!json.contains("secret"));
        assert!(json.contains("notes.txt"));
    }

    #[test]
    fn test_manifest_merge_preserves_other_files() {
        let mut first = file();
        first.upsert_chunk(chunk(0, "a", 0, 100));
        let mut second = file();
        second.upsert_chunk(chunk(0, "a", 0, 100));

        let mut manifest = DriveManifest::new("a".into());
        manifest.merge_file(ManifestFile::for_account(&first, "a"));
        manifest.merge_file(ManifestFile::for_account(&second, "a"));
        assert_eq!(manifest.files.len(), 2);

        first.upsert_chunk(chunk(2, "a", 200, 300));
        manifest.merge_file(ManifestFile::for_account(&first, "a"));
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.file(&first.file_id).unwrap().chunks.len(), 2);
        assert_eq!(manifest.file(&second.file_id).unwrap().chunks.len(), 1);

        assert!(manifest.remove_file(&second.file_id));
        assert!(!manifest.remove_file(&second.file_id));

        let decoded = DriveManifest::from_json_bytes(&manifest.to_json_bytes().unwrap()).unwrap();
        assert_eq!(decoded, manifest);
    }
}
