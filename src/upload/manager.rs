use crate::error::{VaultError, VaultResult};
use crate::ident::FileId;
use crate::metadata::store::cutoff;
use crate::metadata::{
    Checksum, FileStatus, ManifestWriter, MetadataError, MetadataStore, StoredChunk, StoredFile,
};
use crate::metrics::{recorder, SessionTimer};
use crate::obfuscation::{self, ObfuscationSecret};
use crate::planner::{AccountCapacity, ChunkPlan, ChunkPlanner};
use crate::storage::{chunk_object_name, StorageAccess, StorageError};
use crate::upload::state::{UploadEvent, UploadStatus};
use crate::upload::types::{
    ChunkReceipt, FinalizeAck, InitiatedUpload, ReceivedChunk, UploadRequest, UploadSession,
    UploadSnapshot,
};
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};

/// Attempts at drawing an unused file id before giving up
const FILE_ID_ATTEMPTS: usize = 8;

#[derive(Debug, Clone)]
struct ProcessingJob {
    session_id: String,
    file_id: FileId,
}

/// Runs finalized uploads to completion
struct Processor {
    store: Arc<MetadataStore>,
    manifests: Arc<ManifestWriter>,
}

impl Processor {
    async fn run(&self, job: ProcessingJob) {
        let timer = SessionTimer::upload();
        match self.process(&job).await {
            Ok(()) => {
                tracing::info!(session_id = %job.session_id, file_id = %job.file_id, "Upload complete");
                timer.complete();
            }
            Err(e) => {
                tracing::error!(
                    session_id = %job.session_id,
                    file_id = %job.file_id,
                    error = %e,
                    "Upload processing failed"
                );
                timer.fail(e.code());
                let reason = e.to_string();
                let marked: VaultResult<UploadSession> = self
                    .store
                    .update_upload_session(&job.session_id, |s| s.apply(UploadEvent::Fail(reason)))
                    .await;
                if let Err(e) = marked {
                    tracing::warn!(session_id = %job.session_id, error = %e, "Could not mark upload failed");
                }
            }
        }
    }

    async fn process(&self, job: &ProcessingJob) -> VaultResult<()> {
        let session = self
            .store
            .get_upload_session(&job.session_id)
            .await?
            .ok_or_else(|| VaultError::SessionNotFound(job.session_id.clone()))?;
        let file = self
            .store
            .get_file(&job.file_id)
            .await?
            .ok_or_else(|| VaultError::FileNotFound(job.file_id.to_string()))?;

        // every planned chunk must be on record exactly as planned
        let missing: Vec<u32> = session
            .plan
            .chunks
            .iter()
            .filter(|planned| {
                !file.chunk(planned.index).is_some_and(|stored| {
                    stored.account_id == planned.account_id
                        && stored.start_offset == planned.start_offset
                        && stored.end_offset == planned.end_offset
                })
            })
            .map(|planned| planned.index)
            .collect();
        if !missing.is_empty() {
            return Err(VaultError::IncompleteUpload { missing });
        }
        self.set_progress(&job.session_id, 20).await?;

        let outcome = self.manifests.publish(&file).await?;
        if !outcome.is_clean() {
            tracing::warn!(
                session_id = %job.session_id,
                failed_accounts = ?outcome.failed,
                "Some drive manifests could not be written"
            );
        }
        self.set_progress(&job.session_id, 80).await?;

        self.store
            .update_file(&job.file_id, |f| {
                f.status = FileStatus::Active;
                f.processed_size = f.stored_bytes();
                Ok::<_, VaultError>(())
            })
            .await?;

        self.store
            .update_upload_session(&job.session_id, |s| s.apply(UploadEvent::ProcessingDone))
            .await?;
        Ok(())
    }

    async fn set_progress(&self, session_id: &str, progress: u8) -> VaultResult<()> {
        self.store
            .update_upload_session(session_id, |s| {
                if s.status != UploadStatus::Processing {
                    return Err(VaultError::InvalidTransition(format!(
                        "upload {} left processing",
                        s.session_id
                    )));
                }
                s.processing_progress = progress;
                s.updated_at = Utc::now();
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// Owns the upload lifecycle.
///
/// Chunk receipts for one session share its gate; finalize takes it
/// exclusively, so no receipt can land between the completeness check and the
/// switch to `processing`. Receipts for the same chunk are serialized.
pub struct UploadManager {
    store: Arc<MetadataStore>,
    storage: StorageAccess,
    planner: Arc<ChunkPlanner>,
    default_strategy: String,
    jobs: mpsc::UnboundedSender<ProcessingJob>,
    gates: DashMap<String, Arc<RwLock<()>>>,
    chunk_locks: DashMap<(String, u32), Arc<Mutex<()>>>,
}

impl UploadManager {
    /// Create the manager and spawn its processing worker.
    ///
    /// At most `processing_workers` finalized uploads are processed at once.
    pub fn new(
        store: Arc<MetadataStore>,
        storage: StorageAccess,
        planner: Arc<ChunkPlanner>,
        manifests: Arc<ManifestWriter>,
        default_strategy: impl Into<String>,
        processing_workers: usize,
    ) -> Self {
        let (jobs, mut job_rx) = mpsc::unbounded_channel::<ProcessingJob>();
        let processor = Arc::new(Processor {
            store: store.clone(),
            manifests,
        });
        let slots = Arc::new(Semaphore::new(processing_workers.max(1)));

        tokio::spawn(async move {
            while let Some(job) = job_rx.recv().await {
                let Ok(permit) = slots.clone().acquire_owned().await else {
                    break;
                };
                let processor = processor.clone();
                tokio::spawn(async move {
                    processor.run(job).await;
                    drop(permit);
                });
            }
        });

        Self {
            store,
            storage,
            planner,
            default_strategy: default_strategy.into(),
            jobs,
            gates: DashMap::new(),
            chunk_locks: DashMap::new(),
        }
    }

    fn gate(&self, session_id: &str) -> Arc<RwLock<()>> {
        self.gates
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Gate of an existing session. Unknown ids never get an entry.
    async fn session_gate(&self, session_id: &str) -> VaultResult<Arc<RwLock<()>>> {
        if let Some(gate) = self.gates.get(session_id) {
            return Ok(gate.clone());
        }
        if self.store.get_upload_session(session_id).await?.is_none() {
            return Err(VaultError::SessionNotFound(session_id.to_string()));
        }
        Ok(self.gate(session_id))
    }

    fn chunk_lock(&self, session_id: &str, chunk_index: u32) -> Arc<Mutex<()>> {
        self.chunk_locks
            .entry((session_id.to_string(), chunk_index))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Fresh free-space readings for the owner's linked accounts.
    ///
    /// Accounts that cannot be reached or are no longer authorized are left out
    /// of planning.
    pub async fn capacities(&self, owner: &str) -> VaultResult<Vec<AccountCapacity>> {
        let mut capacities = Vec::new();
        for account in self.store.linked_accounts(owner).await? {
            match self.storage.capacity(&account.account_id).await {
                Ok(free) => capacities.push(AccountCapacity::new(account.account_id, free)),
                Err(e) => {
                    tracing::warn!(
                        account_id = %account.account_id,
                        error = %e,
                        "Skipping account during planning"
                    );
                }
            }
        }
        Ok(capacities)
    }

    /// Plan preview; commits nothing
    pub async fn preview(&self, owner: &str, size: u64, strategy: Option<&str>) -> VaultResult<ChunkPlan> {
        let strategy = strategy.unwrap_or(&self.default_strategy);
        let capacities = self.capacities(owner).await?;
        Ok(self.planner.plan(size, strategy, &capacities)?)
    }

    /// Open an upload session. Nothing is created if planning fails.
    pub async fn initiate(&self, owner: &str, request: UploadRequest) -> VaultResult<InitiatedUpload> {
        if request.filename.trim().is_empty() {
            return Err(VaultError::InvalidRequest("filename must not be empty".into()));
        }

        let plan = self
            .preview(owner, request.size, request.strategy.as_deref())
            .await?;
        if let Some(previewed) = &request.plan {
            if previewed != &plan {
                return Err(VaultError::PlanOutdated);
            }
        }

        let secret = ObfuscationSecret::generate();
        let mut allocated = None;
        for _ in 0..FILE_ID_ATTEMPTS {
            let file = StoredFile::skeleton(
                FileId::generate(),
                owner,
                request.filename.clone(),
                plan.file_size,
                plan.chunk_size,
                secret.clone(),
            );
            match self.store.insert_file(&file).await {
                Ok(()) => {
                    allocated = Some(file.file_id);
                    break;
                }
                Err(MetadataError::AlreadyExists { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let file_id = allocated.ok_or_else(|| {
            VaultError::InvalidRequest("could not allocate an unused file id".into())
        })?;

        let session = UploadSession::open(owner, file_id.clone(), request.filename, plan.clone())?;
        if let Err(e) = self.store.insert_upload_session(&session).await {
            // keep initiation all-or-nothing
            let _ = self.store.delete_file_record(&file_id).await;
            return Err(e.into());
        }

        recorder::record_upload_started();
        tracing::info!(
            session_id = %session.session_id,
            file_id = %file_id,
            size = plan.file_size,
            chunks = plan.chunk_count(),
            strategy = %plan.strategy,
            "Upload initiated"
        );

        Ok(InitiatedUpload {
            session_id: session.session_id,
            file_id,
            plan,
        })
    }

    async fn owned_session(&self, owner: &str, session_id: &str) -> VaultResult<UploadSession> {
        match self.store.get_upload_session(session_id).await? {
            Some(session) if session.owner == owner => Ok(session),
            _ => Err(VaultError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Store one planned chunk.
    ///
    /// The payload is obfuscated at its file offset and written to the planned
    /// account. A re-submission replaces the earlier object.
    pub async fn receive_chunk(
        &self,
        owner: &str,
        session_id: &str,
        offset: u64,
        data: Bytes,
    ) -> VaultResult<ChunkReceipt> {
        let gate = self.session_gate(session_id).await?;
        let _shared = gate.read().await;

        let session = self.owned_session(owner, session_id).await?;
        if session.status != UploadStatus::Uploading {
            return Err(VaultError::SessionClosed {
                session_id: session_id.to_string(),
                status: session.status.to_string(),
            });
        }
        let planned = session
            .plan
            .chunk_at_offset(offset)
            .cloned()
            .ok_or(VaultError::UnknownChunkOffset(offset))?;
        if data.len() as u64 != planned.size {
            return Err(VaultError::ChunkSizeMismatch {
                offset,
                expected: planned.size,
                actual: data.len() as u64,
            });
        }

        let lock = self.chunk_lock(session_id, planned.index);
        let _chunk = lock.lock().await;

        let file = self
            .store
            .get_file(&session.file_id)
            .await?
            .ok_or_else(|| VaultError::FileNotFound(session.file_id.to_string()))?;

        // capacity is re-read at write time; a replaced object frees its space
        let reclaimable = file
            .chunk(planned.index)
            .filter(|c| c.account_id == planned.account_id)
            .map(|c| c.size)
            .unwrap_or(0);
        let available = self.storage.capacity(&planned.account_id).await? + reclaimable;
        if available < planned.size {
            return Err(StorageError::CapacityExceeded {
                account_id: planned.account_id.clone(),
                required: planned.size,
                available,
            }
            .into());
        }

        let mut payload = data.to_vec();
        obfuscation::apply(&file.secret, &file.file_id, offset, &mut payload);
        let checksum = Checksum::of(&payload);
        let remote_name = chunk_object_name(&file.file_id, planned.index);
        let handle = self
            .storage
            .write_chunk(&planned.account_id, &remote_name, Bytes::from(payload))
            .await?;

        let replaced = self
            .store
            .upsert_chunk(
                &file.file_id,
                StoredChunk {
                    chunk_index: planned.index,
                    account_id: planned.account_id.clone(),
                    remote_handle: handle.clone(),
                    remote_name,
                    size: planned.size,
                    checksum,
                    start_offset: planned.start_offset,
                    end_offset: planned.end_offset,
                },
            )
            .await?;

        let updated = self
            .store
            .update_upload_session(session_id, |s| {
                s.record_chunk(
                    planned.index,
                    ReceivedChunk {
                        account_id: planned.account_id.clone(),
                        remote_handle: handle.clone(),
                        size: planned.size,
                        checksum,
                        received_at: Utc::now(),
                    },
                )
                .map(|_| ())
            })
            .await?;

        if let Some(old) = replaced.filter(|old| old.remote_handle != handle) {
            if let Err(e) = self
                .storage
                .delete_chunk(&old.account_id, &old.remote_handle)
                .await
            {
                tracing::warn!(
                    account_id = %old.account_id,
                    chunk_index = old.chunk_index,
                    error = %e,
                    "Could not delete replaced chunk object"
                );
            }
        }

        tracing::debug!(
            session_id,
            file_id = %file.file_id,
            chunk_index = planned.index,
            account_id = %planned.account_id,
            size = planned.size,
            "Chunk stored"
        );

        Ok(ChunkReceipt {
            session_id: session_id.to_string(),
            chunk_index: planned.index,
            received_bytes: updated.received_bytes,
            declared_size: updated.declared_size,
            progress: updated.progress(),
            chunks_received: updated.received.len(),
            chunks_total: updated.plan.chunk_count(),
        })
    }

    /// Check completeness and hand the session to the processing worker.
    ///
    /// Returns as soon as the job is queued; callers poll [`Self::status`].
    pub async fn finalize(&self, owner: &str, session_id: &str) -> VaultResult<FinalizeAck> {
        let gate = self.session_gate(session_id).await?;
        let _exclusive = gate.write().await;

        let session = self.owned_session(owner, session_id).await?;
        match session.status {
            UploadStatus::Processing | UploadStatus::Complete => {
                return Ok(FinalizeAck {
                    session_id: session.session_id,
                    file_id: session.file_id,
                    status: session.status,
                    processing_started: false,
                });
            }
            UploadStatus::Uploading => {}
            status => {
                return Err(VaultError::SessionClosed {
                    session_id: session_id.to_string(),
                    status: status.to_string(),
                });
            }
        }

        let missing = session.missing_chunks();
        if !missing.is_empty() {
            return Err(VaultError::IncompleteUpload { missing });
        }

        let session = self
            .store
            .update_upload_session(session_id, |s| {
                if s.status != UploadStatus::Uploading {
                    return Err(VaultError::SessionClosed {
                        session_id: s.session_id.clone(),
                        status: s.status.to_string(),
                    });
                }
                s.apply(UploadEvent::Finalize)
            })
            .await?;

        let job = ProcessingJob {
            session_id: session.session_id.clone(),
            file_id: session.file_id.clone(),
        };
        if self.jobs.send(job).is_err() {
            let reason = "processing worker unavailable".to_string();
            self.store
                .update_upload_session(session_id, |s| s.apply(UploadEvent::Fail(reason.clone())))
                .await?;
            return Err(VaultError::InvalidTransition(reason));
        }

        tracing::info!(session_id, file_id = %session.file_id, "Upload finalized, processing");
        Ok(FinalizeAck {
            session_id: session.session_id,
            file_id: session.file_id,
            status: UploadStatus::Processing,
            processing_started: true,
        })
    }

    pub async fn status(&self, owner: &str, session_id: &str) -> VaultResult<UploadSnapshot> {
        Ok(self.owned_session(owner, session_id).await?.snapshot())
    }

    /// Fail uploads that have not advanced within `idle`. Returns how many.
    pub async fn expire_idle(&self, idle: Duration) -> VaultResult<usize> {
        let stale_before = cutoff(idle);
        let mut expired = 0;

        for session in self.store.list_upload_sessions().await? {
            if session.status != UploadStatus::Uploading || session.updated_at >= stale_before {
                continue;
            }
            let gate = self.gate(&session.session_id);
            let _exclusive = gate.write().await;

            let result: VaultResult<UploadSession> = self
                .store
                .update_upload_session(&session.session_id, |s| {
                    if s.status != UploadStatus::Uploading || s.updated_at >= stale_before {
                        return Err(VaultError::InvalidTransition("session advanced".into()));
                    }
                    s.apply(UploadEvent::Expire)
                })
                .await;
            if result.is_ok() {
                tracing::info!(session_id = %session.session_id, "Upload session timed out");
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Delete terminal sessions older than `retention`. Returns how many.
    pub async fn purge_finished(&self, retention: Duration) -> VaultResult<usize> {
        let stale_before = cutoff(retention);
        let mut purged = 0;

        for session in self.store.list_upload_sessions().await? {
            if !session.status.is_terminal() || session.updated_at >= stale_before {
                continue;
            }
            if self.store.delete_upload_session(&session.session_id).await? {
                self.gates.remove(&session.session_id);
                self.chunk_locks
                    .retain(|(id, _), _| id != &session.session_id);
                purged += 1;
            }
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::LinkedAccount;
    use crate::planner::{ChunkPolicy, BALANCED};
    use crate::storage::{AccountThrottle, MemoryStorage, RetryPolicy, StorageAdapter};

    const KB: u64 = 1024;

    struct Harness {
        store: Arc<MetadataStore>,
        memory: Arc<MemoryStorage>,
        uploads: UploadManager,
    }

    async fn harness(quotas: &[(&str, u64)]) -> Harness {
        let store = Arc::new(MetadataStore::new_in_memory().await.unwrap());
        let memory = Arc::new(MemoryStorage::new());
        for (account, quota) in quotas {
            memory.add_account(*account, *quota);
            store
                .link_account(LinkedAccount::new(*account, "alice", *account))
                .await
                .unwrap();
        }
        let access = StorageAccess::new(
            memory.clone(),
            Arc::new(AccountThrottle::new(4, 0)),
            RetryPolicy::none(),
        );
        let policy = ChunkPolicy {
            min_chunk_size: 4 * KB,
            max_chunk_size: 16 * KB,
            ..Default::default()
        };
        let planner = Arc::new(ChunkPlanner::new(policy).unwrap());
        let manifests = Arc::new(ManifestWriter::new(store.clone(), access.clone()));
        let uploads = UploadManager::new(store.clone(), access, planner, manifests, BALANCED, 2);
        Harness {
            store,
            memory,
            uploads,
        }
    }

    fn request(size: u64) -> UploadRequest {
        UploadRequest {
            filename: "data.bin".into(),
            size,
            strategy: None,
            plan: None,
        }
    }

    fn payload(size: u64) -> Vec<u8> {
        (0..size).map(|i| (i % 251) as u8).collect()
    }

    async fn send_all(h: &Harness, session_id: &str, plan: &ChunkPlan, data: &[u8]) {
        for chunk in &plan.chunks {
            let bytes = Bytes::copy_from_slice(
                &data[chunk.start_offset as usize..chunk.end_offset as usize],
            );
            h.uploads
                .receive_chunk("alice", session_id, chunk.start_offset, bytes)
                .await
                .unwrap();
        }
    }

    async fn wait_terminal(h: &Harness, session_id: &str) -> UploadSnapshot {
        for _ in 0..200 {
            let snapshot = h.uploads.status("alice", session_id).await.unwrap();
            if snapshot.status.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("upload did not finish");
    }

    #[tokio::test]
    async fn test_upload_lifecycle() {
        let h = harness(&[("a", 1024 * KB), ("b", 1024 * KB)]).await;
        let data = payload(50 * KB);
        let started = h.uploads.initiate("alice", request(50 * KB)).await.unwrap();
        assert!(started.plan.chunk_count() > 1);

        send_all(&h, &started.session_id, &started.plan, &data).await;
        let ack = h.uploads.finalize("alice", &started.session_id).await.unwrap();
        assert!(ack.processing_started);

        let done = wait_terminal(&h, &started.session_id).await;
        assert_eq!(done.status, UploadStatus::Complete);
        assert_eq!(done.processing_progress, 100);
        assert_eq!(done.received_bytes, 50 * KB);

        let file = h.store.get_file(&started.file_id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Active);
        assert_eq!(file.processed_size, 50 * KB);
        assert!(file.missing_ranges().is_empty());

        // stored bytes are obfuscated, not the plaintext
        let first = &file.chunks[0];
        let stored = h
            .memory
            .read_chunk(&first.account_id, &first.remote_handle)
            .await
            .unwrap();
        assert_ne!(&stored[..], &data[..first.size as usize]);
        assert_eq!(Checksum::of(&stored), first.checksum);

        assert!(h.memory.stored_manifest("a").unwrap().file(&file.file_id).is_some());
        assert!(h.memory.stored_manifest("b").unwrap().file(&file.file_id).is_some());
    }

    #[tokio::test]
    async fn test_concurrent_finalize_starts_processing_once() {
        let h = harness(&[("a", 1024 * KB), ("b", 1024 * KB)]).await;
        let data = payload(40 * KB);
        let started = h.uploads.initiate("alice", request(40 * KB)).await.unwrap();
        send_all(&h, &started.session_id, &started.plan, &data).await;

        let (first, second, third) = tokio::join!(
            h.uploads.finalize("alice", &started.session_id),
            h.uploads.finalize("alice", &started.session_id),
            h.uploads.finalize("alice", &started.session_id),
        );
        let acks = [first.unwrap(), second.unwrap(), third.unwrap()];
        assert_eq!(acks.iter().filter(|ack| ack.processing_started).count(), 1);

        let done = wait_terminal(&h, &started.session_id).await;
        assert_eq!(done.status, UploadStatus::Complete);
    }

    #[tokio::test]
    async fn test_manifest_failure_does_not_fail_upload() {
        let h = harness(&[("a", 1024 * KB), ("b", 1024 * KB)]).await;
        h.memory.fail_manifest_writes("a", true);
        let data = payload(50 * KB);
        let started = h.uploads.initiate("alice", request(50 * KB)).await.unwrap();
        send_all(&h, &started.session_id, &started.plan, &data).await;
        h.uploads.finalize("alice", &started.session_id).await.unwrap();

        let done = wait_terminal(&h, &started.session_id).await;
        assert_eq!(done.status, UploadStatus::Complete);
        let file = h.store.get_file(&started.file_id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Active);
        assert!(file.accounts().contains("a"));

        assert!(h.memory.stored_manifest("a").is_none());
        assert!(h.memory.stored_manifest("b").unwrap().file(&file.file_id).is_some());
        // the central copy still has the entry for later rebuilds
        assert!(h.store.get_manifest("a").await.unwrap().unwrap().file(&file.file_id).is_some());
    }

    #[tokio::test]
    async fn test_processing_failure_leaves_file_incomplete() {
        let h = harness(&[("a", 1024 * KB)]).await;
        let data = payload(20 * KB);
        let started = h.uploads.initiate("alice", request(20 * KB)).await.unwrap();
        send_all(&h, &started.session_id, &started.plan, &data).await;
        // the record loses a chunk the session saw arrive
        h.store.remove_chunk(&started.file_id, 0).await.unwrap();

        let ack = h.uploads.finalize("alice", &started.session_id).await.unwrap();
        assert!(ack.processing_started);
        let done = wait_terminal(&h, &started.session_id).await;
        assert_eq!(done.status, UploadStatus::Failed);
        assert!(done.error.is_some());

        let file = h.store.get_file(&started.file_id).await.unwrap().unwrap();
        assert_eq!(file.status, FileStatus::Incomplete);
        assert!(h.store.list_files("alice").await.unwrap().iter().all(|f| f.status != FileStatus::Active));
    }

    #[tokio::test]
    async fn test_unknown_session_leaves_no_gate() {
        let h = harness(&[("a", 1024 * KB)]).await;
        for i in 0..16 {
            let session_id = format!("made-up-{i}");
            assert!(matches!(
                h.uploads
                    .receive_chunk("alice", &session_id, 0, Bytes::from_static(b"x"))
                    .await,
                Err(VaultError::SessionNotFound(_))
            ));
            assert!(matches!(
                h.uploads.finalize("alice", &session_id).await,
                Err(VaultError::SessionNotFound(_))
            ));
        }
        assert!(h.uploads.gates.is_empty());

        // a real session gets exactly one
        let started = h.uploads.initiate("alice", request(8 * KB)).await.unwrap();
        let _ = h.uploads.finalize("alice", &started.session_id).await;
        assert_eq!(h.uploads.gates.len(), 1);
    }

    #[tokio::test]
    async fn test_insufficient_capacity_creates_nothing() {
        let h = harness(&[("a", 25 * KB), ("b", 25 * KB)]).await;
        let result = h.uploads.initiate("alice", request(100 * KB)).await;
        assert!(matches!(
            result,
            Err(VaultError::Plan(crate::planner::PlanError::InsufficientCapacity { .. }))
        ));
        assert!(h.store.list_files("alice").await.unwrap().is_empty());
        assert!(h.store.list_upload_sessions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_early_finalize_keeps_uploading() {
        let h = harness(&[("a", 1024 * KB)]).await;
        let data = payload(20 * KB);
        let started = h.uploads.initiate("alice", request(20 * KB)).await.unwrap();
        let first = &started.plan.chunks[0];
        h.uploads
            .receive_chunk(
                "alice",
                &started.session_id,
                0,
                Bytes::copy_from_slice(&data[..first.size as usize]),
            )
            .await
            .unwrap();

        let err = h.uploads.finalize("alice", &started.session_id).await.unwrap_err();
        assert!(matches!(err, VaultError::IncompleteUpload { ref missing } if !missing.is_empty()));
        let snapshot = h.uploads.status("alice", &started.session_id).await.unwrap();
        assert_eq!(snapshot.status, UploadStatus::Uploading);
    }

    #[tokio::test]
    async fn test_resubmission_is_idempotent() {
        let h = harness(&[("a", 1024 * KB)]).await;
        let data = payload(20 * KB);
        let started = h.uploads.initiate("alice", request(20 * KB)).await.unwrap();
        let first = started.plan.chunks[0].clone();
        let bytes = Bytes::copy_from_slice(&data[..first.size as usize]);

        let once = h
            .uploads
            .receive_chunk("alice", &started.session_id, 0, bytes.clone())
            .await
            .unwrap();
        let twice = h
            .uploads
            .receive_chunk("alice", &started.session_id, 0, bytes)
            .await
            .unwrap();
        assert_eq!(once.received_bytes, twice.received_bytes);
        assert_eq!(twice.chunks_received, 1);
        // the replaced object is gone
        assert_eq!(h.memory.object_count("a"), 1);
        assert_eq!(h.memory.used_bytes("a"), first.size);
    }

    #[tokio::test]
    async fn test_chunk_validation() {
        let h = harness(&[("a", 1024 * KB)]).await;
        let started = h.uploads.initiate("alice", request(20 * KB)).await.unwrap();
        let first = &started.plan.chunks[0];

        assert!(matches!(
            h.uploads
                .receive_chunk("alice", &started.session_id, 7, Bytes::from_static(b"x"))
                .await,
            Err(VaultError::UnknownChunkOffset(7))
        ));
        assert!(matches!(
            h.uploads
                .receive_chunk("alice", &started.session_id, 0, Bytes::from(vec![0u8; 3]))
                .await,
            Err(VaultError::ChunkSizeMismatch { expected, actual: 3, .. }) if expected == first.size
        ));
        assert!(matches!(
            h.uploads
                .receive_chunk("mallory", &started.session_id, 0, Bytes::from(vec![0u8; 3]))
                .await,
            Err(VaultError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_chunk_after_finalize_is_rejected() {
        let h = harness(&[("a", 1024 * KB)]).await;
        let data = payload(8 * KB);
        let started = h.uploads.initiate("alice", request(8 * KB)).await.unwrap();
        send_all(&h, &started.session_id, &started.plan, &data).await;
        h.uploads.finalize("alice", &started.session_id).await.unwrap();

        let again = h.uploads.finalize("alice", &started.session_id).await.unwrap();
        assert!(!again.processing_started);

        let first = &started.plan.chunks[0];
        let result = h
            .uploads
            .receive_chunk(
                "alice",
                &started.session_id,
                0,
                Bytes::copy_from_slice(&data[..first.size as usize]),
            )
            .await;
        assert!(matches!(result, Err(VaultError::SessionClosed { .. })));
    }

    #[tokio::test]
    async fn test_capacity_revalidated_at_write() {
        let h = harness(&[("a", 1024 * KB)]).await;
        let data = payload(20 * KB);
        let started = h.uploads.initiate("alice", request(20 * KB)).await.unwrap();
        h.memory.set_quota("a", KB);

        let first = &started.plan.chunks[0];
        let result = h
            .uploads
            .receive_chunk(
                "alice",
                &started.session_id,
                0,
                Bytes::copy_from_slice(&data[..first.size as usize]),
            )
            .await;
        assert!(matches!(
            result,
            Err(VaultError::Storage(StorageError::CapacityExceeded { .. }))
        ));
        let snapshot = h.uploads.status("alice", &started.session_id).await.unwrap();
        assert_eq!(snapshot.received_bytes, 0);
    }

    #[tokio::test]
    async fn test_previewed_plan_must_match() {
        let h = harness(&[("a", 1024 * KB), ("b", 1024 * KB)]).await;
        let preview = h.uploads.preview("alice", 40 * KB, None).await.unwrap();

        let mut accepted = request(40 * KB);
        accepted.plan = Some(preview.clone());
        assert!(h.uploads.initiate("alice", accepted).await.is_ok());

        h.memory.set_quota("b", 10 * KB);
        let mut stale = request(40 * KB);
        stale.plan = Some(preview);
        assert!(matches!(
            h.uploads.initiate("alice", stale).await,
            Err(VaultError::PlanOutdated)
        ));
    }

    #[tokio::test]
    async fn test_idle_sessions_expire() {
        let h = harness(&[("a", 1024 * KB)]).await;
        let started = h.uploads.initiate("alice", request(8 * KB)).await.unwrap();

        assert_eq!(h.uploads.expire_idle(Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.uploads.expire_idle(Duration::from_millis(5)).await.unwrap(), 1);

        let snapshot = h.uploads.status("alice", &started.session_id).await.unwrap();
        assert_eq!(snapshot.status, UploadStatus::Failed);
        assert_eq!(snapshot.error.as_deref(), Some("upload session timed out"));

        assert_eq!(h.uploads.purge_finished(Duration::ZERO).await.unwrap(), 1);
        assert!(matches!(
            h.uploads.status("alice", &started.session_id).await,
            Err(VaultError::SessionNotFound(_))
        ));
    }
}
