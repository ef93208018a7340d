use crate::ident::FileId;

/// Opaque identifier of a linked storage account
pub type AccountId = String;

/// Account-side identifier of a stored object
pub type RemoteHandle = String;

/// Well-known object name of the per-account manifest
pub const MANIFEST_NAME: &str = "drivesplit.manifest";

/// Human-readable remote name of a chunk object
pub fn chunk_object_name(file_id: &FileId, chunk_index: u32) -> String {
    format!("{file_id}.{chunk_index:04}.chunk")
}
