use crate::download::state::{DownloadEvent, DownloadStatus};
use crate::download::types::{Artifact, DownloadSession, DownloadSnapshot};
use crate::error::{VaultError, VaultResult};
use crate::keyfile::{ChunkHint, KeyFile};
use crate::metadata::store::cutoff;
use crate::metadata::{Checksum, FileStatus, MetadataStore, StoredChunk, StoredFile};
use crate::metrics::{recorder, SessionTimer};
use crate::obfuscation::{self, ObfuscationSecret};
use crate::storage::StorageAccess;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const PARTS_DIR: &str = "parts";

struct ReconstructionJob {
    session_id: String,
    file: StoredFile,
    /// Taken from the key file, checked against the record
    secret: ObfuscationSecret,
    work_dir: PathBuf,
}

/// Rebuilds original files from their chunks.
///
/// Each reconstruction runs as its own task. The task re-reads its session
/// between chunks and stops once the session is no longer in the state it
/// expects, which is how expiry cancels a running job.
#[derive(Clone)]
pub struct ReconstructionEngine {
    store: Arc<MetadataStore>,
    storage: StorageAccess,
    work_root: PathBuf,
    artifact_ttl: Duration,
    fetch_parallelism: usize,
}

impl ReconstructionEngine {
    pub fn new(
        store: Arc<MetadataStore>,
        storage: StorageAccess,
        work_root: impl Into<PathBuf>,
        artifact_ttl: Duration,
        fetch_parallelism: usize,
    ) -> Self {
        Self {
            store,
            storage,
            work_root: work_root.into(),
            artifact_ttl,
            fetch_parallelism: fetch_parallelism.max(1),
        }
    }

    /// Decode `key_file` and start reconstructing the file it points to
    pub async fn initiate(&self, owner: &str, key_file: &[u8]) -> VaultResult<DownloadSnapshot> {
        let key = KeyFile::decode(key_file)?;
        self.initiate_with_key(owner, key).await
    }

    pub async fn initiate_with_key(&self, owner: &str, key: KeyFile) -> VaultResult<DownloadSnapshot> {
        let file = self.authoritative_record(owner, &key).await?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let work_dir = self.work_root.join(format!("download-{session_id}"));
        create_private_dir(&work_dir.join(PARTS_DIR)).await?;

        let session = DownloadSession::open(
            session_id.clone(),
            owner,
            file.file_id.clone(),
            file.original_filename.clone(),
            file.original_size,
            work_dir.clone(),
            expiry(self.artifact_ttl),
        )?;
        if let Err(e) = self.store.insert_download_session(&session).await {
            discard_dir(&work_dir).await;
            return Err(e.into());
        }

        recorder::record_download_started();
        tracing::info!(
            session_id = %session_id,
            file_id = %file.file_id,
            size = file.original_size,
            chunks = file.chunks.len(),
            "Download initiated"
        );

        let job = ReconstructionJob {
            session_id,
            file,
            secret: key.secret,
            work_dir,
        };
        let engine = self.clone();
        tokio::spawn(async move {
            engine.run(job).await;
        });

        Ok(session.snapshot())
    }

    /// The stored record a key file refers to. Hints never override it.
    async fn authoritative_record(&self, owner: &str, key: &KeyFile) -> VaultResult<StoredFile> {
        let file = match self.store.get_file(&key.file_id).await? {
            Some(file) if file.owner == owner && file.status == FileStatus::Active => file,
            _ => return Err(VaultError::FileNotFound(key.file_id.to_string())),
        };

        if file.original_size != key.original_size {
            return Err(VaultError::KeyFileMismatch(format!(
                "size {} differs from stored size {}",
                key.original_size, file.original_size
            )));
        }
        if file.original_filename != key.original_filename {
            return Err(VaultError::KeyFileMismatch(format!(
                "filename {:?} differs from stored filename",
                key.original_filename
            )));
        }
        if file.secret != key.secret {
            return Err(VaultError::KeyFileMismatch("secret does not match".into()));
        }

        if let Some(hints) = &key.chunk_hints {
            let current: Vec<ChunkHint> = file.chunks.iter().map(ChunkHint::from).collect();
            if hints != &current {
                tracing::debug!(file_id = %file.file_id, "Key file chunk hints are stale");
            }
        }
        Ok(file)
    }

    async fn run(&self, job: ReconstructionJob) {
        let timer = SessionTimer::download();
        match self.reconstruct(&job).await {
            Ok(artifact) => {
                tracing::info!(
                    session_id = %job.session_id,
                    file_id = %job.file.file_id,
                    artifact = %artifact.display(),
                    "Download complete"
                );
                timer.complete();
            }
            Err(e) => {
                tracing::error!(
                    session_id = %job.session_id,
                    file_id = %job.file.file_id,
                    error = %e,
                    "Reconstruction failed"
                );
                timer.fail(e.code());
                discard_dir(&job.work_dir).await;
                let reason = e.to_string();
                let code = e.code();
                let marked: VaultResult<DownloadSession> = self
                    .store
                    .update_download_session(&job.session_id, |s| {
                        if s.status.is_terminal() {
                            return Ok(());
                        }
                        s.apply(DownloadEvent::Fail(reason))?;
                        s.error_code = Some(code.to_string());
                        Ok(())
                    })
                    .await;
                if let Err(e) = marked {
                    tracing::warn!(session_id = %job.session_id, error = %e, "Could not mark download failed");
                }
            }
        }
    }

    async fn reconstruct(&self, job: &ReconstructionJob) -> VaultResult<PathBuf> {
        let parts_dir = job.work_dir.join(PARTS_DIR);
        self.ensure_status(&job.session_id, DownloadStatus::Downloading)
            .await?;

        // Fetches only touch the accounts and the work dir. Session reads and
        // writes stay in this loop so a parked fetch never holds a connection.
        let mut fetches = stream::iter(job.file.chunks.iter().cloned())
            .map(|chunk| self.fetch_chunk(&job.session_id, &parts_dir, chunk))
            .buffer_unordered(self.fetch_parallelism);

        let mut parts = Vec::with_capacity(job.file.chunks.len());
        while let Some(fetched) = fetches.next().await {
            let (chunk, part) = fetched?;
            let size = chunk.size;
            // also stops the job once expiry has moved the session on
            self.store
                .update_download_session(&job.session_id, |s| {
                    expect_status(s, DownloadStatus::Downloading)?;
                    s.apply(DownloadEvent::ChunkFetched)?;
                    s.fetched_bytes += size;
                    Ok::<_, VaultError>(())
                })
                .await?;
            parts.push((chunk, part));
        }
        drop(fetches);

        self.store
            .update_download_session(&job.session_id, |s| {
                expect_status(s, DownloadStatus::Downloading)?;
                s.apply(DownloadEvent::FetchDone)
            })
            .await?;

        let artifact = self.assemble(job, parts).await?;
        discard_dir(&parts_dir).await;

        self.store
            .update_download_session(&job.session_id, |s| {
                expect_status(s, DownloadStatus::Decrypting)?;
                s.apply(DownloadEvent::AssemblyDone)?;
                // the retrieval window opens once the artifact exists
                s.expires_at = expiry(self.artifact_ttl);
                s.artifact_path = Some(artifact.clone());
                Ok::<_, VaultError>(())
            })
            .await?;
        Ok(artifact)
    }

    async fn fetch_chunk(
        &self,
        session_id: &str,
        parts_dir: &Path,
        chunk: StoredChunk,
    ) -> VaultResult<(StoredChunk, PathBuf)> {
        let data = self
            .storage
            .read_chunk(&chunk.account_id, &chunk.remote_handle)
            .await?;
        if data.len() as u64 != chunk.size || Checksum::of(&data) != chunk.checksum {
            recorder::record_checksum_failure();
            tracing::warn!(
                session_id,
                chunk_index = chunk.chunk_index,
                account_id = %chunk.account_id,
                "Chunk failed checksum verification"
            );
            return Err(VaultError::ChunkCorrupted {
                chunk_index: chunk.chunk_index,
            });
        }

        let part = parts_dir.join(format!("{:08}.part", chunk.chunk_index));
        fs::write(&part, &data).await?;
        tracing::debug!(
            session_id,
            chunk_index = chunk.chunk_index,
            account_id = %chunk.account_id,
            size = chunk.size,
            "Chunk fetched"
        );
        Ok((chunk, part))
    }

    /// Order the fetched parts and write the restored bytes to the artifact
    async fn assemble(
        &self,
        job: &ReconstructionJob,
        mut parts: Vec<(StoredChunk, PathBuf)>,
    ) -> VaultResult<PathBuf> {
        parts.sort_by_key(|(chunk, _)| chunk.start_offset);

        let mut expected = 0u64;
        for (chunk, _) in &parts {
            if chunk.start_offset > expected {
                return Err(VaultError::ReconstructionInconsistent(format!(
                    "gap between bytes {expected} and {}",
                    chunk.start_offset
                )));
            }
            if chunk.start_offset < expected {
                return Err(VaultError::ReconstructionInconsistent(format!(
                    "chunk {} overlaps the previous chunk at byte {}",
                    chunk.chunk_index, chunk.start_offset
                )));
            }
            if chunk.end_offset.checked_sub(chunk.start_offset) != Some(chunk.size) {
                return Err(VaultError::ReconstructionInconsistent(format!(
                    "chunk {} range does not match its size",
                    chunk.chunk_index
                )));
            }
            expected = chunk.end_offset;
        }
        if expected != job.file.original_size {
            return Err(VaultError::ReconstructionInconsistent(format!(
                "chunks cover {expected} of {} bytes",
                job.file.original_size
            )));
        }

        let artifact = job.work_dir.join(artifact_name(&job.file.original_filename));
        let mut out = fs::File::create(&artifact).await?;
        for (chunk, part) in parts {
            self.ensure_status(&job.session_id, DownloadStatus::Decrypting)
                .await?;
            let mut data = fs::read(&part).await?;
            obfuscation::apply(&job.secret, &job.file.file_id, chunk.start_offset, &mut data);
            out.write_all(&data).await?;
            fs::remove_file(&part).await?;
        }
        out.flush().await?;
        out.sync_all().await?;
        Ok(artifact)
    }

    async fn ensure_status(&self, session_id: &str, expected: DownloadStatus) -> VaultResult<()> {
        let session = self
            .store
            .get_download_session(session_id)
            .await?
            .ok_or_else(|| VaultError::SessionNotFound(session_id.to_string()))?;
        expect_status(&session, expected)
    }

    async fn owned_session(&self, owner: &str, session_id: &str) -> VaultResult<DownloadSession> {
        match self.store.get_download_session(session_id).await? {
            Some(session) if session.owner == owner => Ok(session),
            _ => Err(VaultError::SessionNotFound(session_id.to_string())),
        }
    }

    pub async fn status(&self, owner: &str, session_id: &str) -> VaultResult<DownloadSnapshot> {
        Ok(self.owned_session(owner, session_id).await?.snapshot())
    }

    /// Locate the finished artifact. Repeatable until the session expires.
    pub async fn retrieve(&self, owner: &str, session_id: &str) -> VaultResult<Artifact> {
        let session = self.owned_session(owner, session_id).await?;
        if session.status != DownloadStatus::Complete {
            return Err(VaultError::ArtifactNotReady {
                session_id: session.session_id,
                status: session.status.to_string(),
            });
        }

        let path = match &session.artifact_path {
            Some(path) if session.artifact_available(Utc::now()) => path.clone(),
            _ => {
                if !session.artifact_purged {
                    self.purge_artifact(&session.session_id).await?;
                }
                return Err(VaultError::ArtifactExpired(session.session_id));
            }
        };

        let size = fs::metadata(&path).await?.len();
        Ok(Artifact {
            session_id: session.session_id,
            filename: session.original_filename,
            path,
            size,
        })
    }

    /// Fail reconstructions that have not advanced within `stall`. Returns how many.
    pub async fn expire_stalled(&self, stall: Duration) -> VaultResult<usize> {
        let stale_before = cutoff(stall);
        let mut expired = 0;

        for session in self.store.list_download_sessions().await? {
            if session.status.is_terminal() || session.updated_at >= stale_before {
                continue;
            }
            let result: VaultResult<DownloadSession> = self
                .store
                .update_download_session(&session.session_id, |s| {
                    if s.status.is_terminal() || s.updated_at >= stale_before {
                        return Err(VaultError::InvalidTransition("session advanced".into()));
                    }
                    s.apply(DownloadEvent::Expire)
                })
                .await;
            if result.is_ok() {
                tracing::info!(session_id = %session.session_id, "Download session timed out");
                discard_dir(&session.work_dir).await;
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Remove artifacts of completed sessions past `expires_at`. Returns how many.
    pub async fn purge_expired(&self) -> VaultResult<usize> {
        let now = Utc::now();
        let mut purged = 0;
        for session in self.store.list_download_sessions().await? {
            if session.status == DownloadStatus::Complete
                && !session.artifact_purged
                && session.expires_at <= now
            {
                self.purge_artifact(&session.session_id).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    /// Delete terminal sessions without a live artifact older than `retention`
    pub async fn purge_finished(&self, retention: Duration) -> VaultResult<usize> {
        let stale_before = cutoff(retention);
        let mut removed = 0;
        for session in self.store.list_download_sessions().await? {
            let settled = session.status == DownloadStatus::Failed
                || (session.status == DownloadStatus::Complete && session.artifact_purged);
            if !settled || session.updated_at >= stale_before {
                continue;
            }
            if self
                .store
                .delete_download_session(&session.session_id)
                .await?
            {
                discard_dir(&session.work_dir).await;
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn purge_artifact(&self, session_id: &str) -> VaultResult<()> {
        let session = self
            .store
            .update_download_session(session_id, |s| {
                s.artifact_purged = true;
                s.artifact_path = None;
                s.updated_at = Utc::now();
                Ok::<_, VaultError>(())
            })
            .await?;
        discard_dir(&session.work_dir).await;
        tracing::info!(session_id, "Download artifact purged");
        Ok(())
    }
}

fn expect_status(session: &DownloadSession, expected: DownloadStatus) -> VaultResult<()> {
    if session.status != expected {
        return Err(VaultError::SessionClosed {
            session_id: session.session_id.clone(),
            status: session.status.to_string(),
        });
    }
    Ok(())
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Final path component of `filename`, safe to create inside the work dir
fn artifact_name(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    match base {
        "" | "." | ".." => "artifact".to_string(),
        name if name == PARTS_DIR => format!("{name}.out"),
        name => name.to_string(),
    }
}

async fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Some(parent) = dir.parent() {
            fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).await?;
        }
        fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).await?;
    }
    Ok(())
}

async fn discard_dir(dir: &Path) {
    match fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "Could not remove work directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::types::DOWNLOAD_TIMEOUT_REASON;
    use crate::metadata::LinkedAccount;
    use crate::storage::{AccountThrottle, MemoryStorage, RetryPolicy, StorageAdapter};
    use bytes::Bytes;
    use tempfile::TempDir;

    struct Harness {
        _work: TempDir,
        store: Arc<MetadataStore>,
        memory: Arc<MemoryStorage>,
        engine: ReconstructionEngine,
    }

    async fn harness(ttl: Duration) -> Harness {
        harness_with(ttl, AccountThrottle::new(4, 0)).await
    }

    async fn harness_with(ttl: Duration, throttle: AccountThrottle) -> Harness {
        let work = TempDir::new().unwrap();
        let store = Arc::new(MetadataStore::new_in_memory().await.unwrap());
        let memory = Arc::new(MemoryStorage::new());
        for account in ["a", "b"] {
            memory.add_account(account, 1 << 20);
            store
                .link_account(LinkedAccount::new(account, "alice", account))
                .await
                .unwrap();
        }
        let access = StorageAccess::new(
            memory.clone(),
            Arc::new(throttle),
            RetryPolicy::none(),
        );
        let engine = ReconstructionEngine::new(store.clone(), access, work.path(), ttl, 4);
        Harness {
            _work: work,
            store,
            memory,
            engine,
        }
    }

    fn payload(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i * 7 % 256) as u8).collect()
    }

    /// Store `data` as an active file split into `chunk` sized pieces
    async fn stored_file(h: &Harness, data: &[u8], chunk: usize) -> StoredFile {
        let mut file = StoredFile::skeleton(
            crate::ident::FileId::generate(),
            "alice",
            "report.pdf",
            data.len() as u64,
            chunk as u64,
            ObfuscationSecret::generate(),
        );
        for (index, piece) in data.chunks(chunk).enumerate() {
            let start = (index * chunk) as u64;
            let account = if index % 2 == 0 { "a" } else { "b" };
            let mut bytes = piece.to_vec();
            obfuscation::apply(&file.secret, &file.file_id, start, &mut bytes);
            let checksum = Checksum::of(&bytes);
            let remote_name = crate::storage::chunk_object_name(&file.file_id, index as u32);
            let handle = h
                .memory
                .write_chunk(account, &remote_name, Bytes::from(bytes))
                .await
                .unwrap();
            file.upsert_chunk(StoredChunk {
                chunk_index: index as u32,
                account_id: account.to_string(),
                remote_handle: handle,
                remote_name,
                size: piece.len() as u64,
                checksum,
                start_offset: start,
                end_offset: start + piece.len() as u64,
            });
        }
        file.status = FileStatus::Active;
        file.processed_size = data.len() as u64;
        h.store.insert_file(&file).await.unwrap();
        file
    }

    async fn wait_terminal(h: &Harness, session_id: &str) -> DownloadSnapshot {
        for _ in 0..200 {
            let snapshot = h.engine.status("alice", session_id).await.unwrap();
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("download did not finish");
    }

    #[tokio::test]
    async fn test_reconstructs_original_bytes() {
        let h = harness(Duration::from_secs(3600)).await;
        let data = payload(10_000);
        let file = stored_file(&h, &data, 3000).await;
        let key = KeyFile::from_stored(&file, false).encode().unwrap();

        let started = h.engine.initiate("alice", &key).await.unwrap();
        let done = wait_terminal(&h, &started.session_id).await;
        assert_eq!(done.status, DownloadStatus::Complete);
        assert_eq!(done.progress, 100.0);
        assert!(done.artifact_available);

        let artifact = h.engine.retrieve("alice", &started.session_id).await.unwrap();
        assert_eq!(artifact.filename, "report.pdf");
        assert_eq!(artifact.size, 10_000);
        assert_eq!(std::fs::read(&artifact.path).unwrap(), data);

        // retrieval is repeatable inside the window
        assert!(h.engine.retrieve("alice", &started.session_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_corrupted_chunk_fails_without_artifact() {
        let h = harness(Duration::from_secs(3600)).await;
        let file = stored_file(&h, &payload(9000), 3000).await;
        let victim = &file.chunks[1];
        assert!(h.memory.corrupt_object(&victim.account_id, &victim.remote_handle));

        let key = KeyFile::from_stored(&file, true).encode().unwrap();
        let started = h.engine.initiate("alice", &key).await.unwrap();
        let done = wait_terminal(&h, &started.session_id).await;

        assert_eq!(done.status, DownloadStatus::Failed);
        assert_eq!(done.error_code.as_deref(), Some("CHUNK_CORRUPTED"));
        assert!(!done.artifact_available);
        assert!(matches!(
            h.engine.retrieve("alice", &started.session_id).await,
            Err(VaultError::ArtifactNotReady { .. })
        ));
        let session = h
            .store
            .get_download_session(&started.session_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!session.work_dir.exists());
    }

    #[tokio::test]
    async fn test_key_file_checks() {
        let h = harness(Duration::from_secs(3600)).await;
        let file = stored_file(&h, &payload(4000), 4000).await;

        let mut wrong_size = KeyFile::from_stored(&file, false);
        wrong_size.original_size += 1;
        assert!(matches!(
            h.engine.initiate_with_key("alice", wrong_size).await,
            Err(VaultError::KeyFileMismatch(_))
        ));

        let key = KeyFile::from_stored(&file, false);
        assert!(matches!(
            h.engine.initiate_with_key("mallory", key.clone()).await,
            Err(VaultError::FileNotFound(_))
        ));

        h.store
            .update_file(&file.file_id, |f| {
                f.status = FileStatus::Deleted;
                Ok::<_, VaultError>(())
            })
            .await
            .unwrap();
        assert!(matches!(
            h.engine.initiate_with_key("alice", key).await,
            Err(VaultError::FileNotFound(_))
        ));

        assert!(matches!(
            h.engine.initiate("alice", b"not a key file").await,
            Err(VaultError::KeyFile(_))
        ));
    }

    #[tokio::test]
    async fn test_artifact_expires() {
        let h = harness(Duration::from_millis(50)).await;
        let file = stored_file(&h, &payload(2000), 1000).await;
        let key = KeyFile::from_stored(&file, false).encode().unwrap();

        let started = h.engine.initiate("alice", &key).await.unwrap();
        wait_terminal(&h, &started.session_id).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(h.engine.purge_expired().await.unwrap(), 1);
        assert!(matches!(
            h.engine.retrieve("alice", &started.session_id).await,
            Err(VaultError::ArtifactExpired(_))
        ));
        assert_eq!(h.engine.purge_finished(Duration::ZERO).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_inconsistent_record_is_rejected() {
        let h = harness(Duration::from_secs(3600)).await;
        let data = payload(6000);
        let file = stored_file(&h, &data, 2000).await;
        // drop the middle chunk from the record behind the engine's back
        h.store.remove_chunk(&file.file_id, 1).await.unwrap();

        let key = KeyFile::from_stored(&file, false).encode().unwrap();
        let started = h.engine.initiate("alice", &key).await.unwrap();
        let done = wait_terminal(&h, &started.session_id).await;
        assert_eq!(done.status, DownloadStatus::Failed);
        assert_eq!(done.error_code.as_deref(), Some("RECONSTRUCTION_INCONSISTENT"));
    }

    #[tokio::test]
    async fn test_parallel_fetches_share_a_single_connection() {
        // the in-memory store runs on one pooled connection
        let h = harness(Duration::from_secs(3600)).await;
        let data = payload(12_000);
        let file = stored_file(&h, &data, 1000).await;
        assert_eq!(file.chunks.len(), 12);
        let key = KeyFile::from_stored(&file, false).encode().unwrap();

        let started = h.engine.initiate("alice", &key).await.unwrap();
        let done = wait_terminal(&h, &started.session_id).await;
        assert_eq!(done.status, DownloadStatus::Complete, "{:?}", done.error);
        assert_eq!(done.fetched_bytes, 12_000);

        let artifact = h.engine.retrieve("alice", &started.session_id).await.unwrap();
        assert_eq!(std::fs::read(&artifact.path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_retrieval_window_starts_at_completion() {
        // two ops per second per account keeps the job running past the ttl
        let ttl = Duration::from_millis(300);
        let h = harness_with(ttl, AccountThrottle::new(4, 2)).await;
        let data = payload(8000);
        let file = stored_file(&h, &data, 1000).await;
        let key = KeyFile::from_stored(&file, false).encode().unwrap();

        let started = h.engine.initiate("alice", &key).await.unwrap();
        let done = wait_terminal(&h, &started.session_id).await;
        assert_eq!(done.status, DownloadStatus::Complete);
        assert!(done.artifact_available);

        let completed_at = done.completed_at.unwrap();
        assert!(completed_at > started.expires_at);
        assert!(done.expires_at >= completed_at + chrono::Duration::milliseconds(300));

        let artifact = h.engine.retrieve("alice", &started.session_id).await.unwrap();
        assert_eq!(std::fs::read(&artifact.path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_stalled_download_times_out() {
        let h = harness(Duration::from_secs(3600)).await;
        let file = stored_file(&h, &payload(3000), 1000).await;
        let session = DownloadSession::open(
            "stalled".to_string(),
            "alice",
            file.file_id.clone(),
            file.original_filename.clone(),
            file.original_size,
            h._work.path().join("download-stalled"),
            expiry(Duration::from_secs(3600)),
        )
        .unwrap();
        create_private_dir(&session.work_dir.join(PARTS_DIR)).await.unwrap();
        std::fs::write(session.work_dir.join(PARTS_DIR).join("00000000.part"), b"x").unwrap();
        h.store.insert_download_session(&session).await.unwrap();

        // a fresh session is left alone
        assert_eq!(h.engine.expire_stalled(Duration::from_secs(60)).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.engine.expire_stalled(Duration::from_millis(10)).await.unwrap(), 1);

        let snapshot = h.engine.status("alice", "stalled").await.unwrap();
        assert_eq!(snapshot.status, DownloadStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some(DOWNLOAD_TIMEOUT_REASON));
        assert_eq!(snapshot.error_code.as_deref(), Some("SESSION_TIMEOUT"));
        assert!(!session.work_dir.exists());

        // terminal sessions are not expired twice
        assert_eq!(h.engine.expire_stalled(Duration::ZERO).await.unwrap(), 0);
    }

    #[test]
    fn test_artifact_name() {
        assert_eq!(artifact_name("report.pdf"), "report.pdf");
        assert_eq!(artifact_name("../../etc/passwd"), "passwd");
        assert_eq!(artifact_name("dir\\x.txt"), "x.txt");
        assert_eq!(artifact_name(".."), "artifact");
        assert_eq!(artifact_name(PARTS_DIR), "parts.out");
    }
}
