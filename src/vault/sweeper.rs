use crate::download::ReconstructionEngine;
use crate::error::VaultResult;
use crate::upload::UploadManager;
use crate::vault::types::SweepReport;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Expires idle sessions and purges finished ones
#[derive(Clone)]
pub struct Sweeper {
    uploads: Arc<UploadManager>,
    downloads: ReconstructionEngine,
    upload_idle_timeout: Duration,
    download_stall_timeout: Duration,
    session_retention: Duration,
}

impl Sweeper {
    pub fn new(
        uploads: Arc<UploadManager>,
        downloads: ReconstructionEngine,
        upload_idle_timeout: Duration,
        download_stall_timeout: Duration,
        session_retention: Duration,
    ) -> Self {
        Self {
            uploads,
            downloads,
            upload_idle_timeout,
            download_stall_timeout,
            session_retention,
        }
    }

    /// One pass over every session. A failing step is logged and skipped.
    pub async fn sweep(&self) -> SweepReport {
        let mut failed = 0;
        let uploads_expired = step(
            &mut failed,
            "expire idle uploads",
            self.uploads.expire_idle(self.upload_idle_timeout).await,
        );
        let uploads_removed = step(
            &mut failed,
            "purge finished uploads",
            self.uploads.purge_finished(self.session_retention).await,
        );
        let downloads_expired = step(
            &mut failed,
            "expire stalled downloads",
            self.downloads.expire_stalled(self.download_stall_timeout).await,
        );
        let artifacts_purged = step(
            &mut failed,
            "purge expired artifacts",
            self.downloads.purge_expired().await,
        );
        let downloads_removed = step(
            &mut failed,
            "purge finished downloads",
            self.downloads.purge_finished(self.session_retention).await,
        );
        let report = SweepReport {
            uploads_expired,
            uploads_removed,
            downloads_expired,
            artifacts_purged,
            downloads_removed,
            failed_steps: failed,
        };

        if !report.is_empty() {
            tracing::info!(?report, "Reaper pass");
        }
        report
    }

    /// Run [`Self::sweep`] every `interval` until the handle is aborted
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}

fn step(failed: &mut usize, name: &str, result: VaultResult<usize>) -> usize {
    match result {
        Ok(count) => count,
        Err(e) => {
            tracing::warn!(step = name, error = %e, "Reaper step failed");
            *failed += 1;
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::{DownloadSession, DownloadStatus};
    use crate::ident::FileId;
    use crate::metadata::{ManifestWriter, MetadataStore};
    use crate::planner::{ChunkPlanner, ChunkPolicy, BALANCED};
    use crate::storage::{AccountThrottle, MemoryStorage, RetryPolicy, StorageAccess};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_failed_step_does_not_stop_pass() {
        let work = TempDir::new().unwrap();
        let store = Arc::new(MetadataStore::new_in_memory().await.unwrap());
        let access = StorageAccess::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(AccountThrottle::new(2, 0)),
            RetryPolicy::none(),
        );
        let planner = Arc::new(ChunkPlanner::new(ChunkPolicy::default()).unwrap());
        let manifests = Arc::new(ManifestWriter::new(store.clone(), access.clone()));
        let uploads = Arc::new(UploadManager::new(
            store.clone(),
            access.clone(),
            planner,
            manifests,
            BALANCED,
            1,
        ));
        let downloads = ReconstructionEngine::new(
            store.clone(),
            access,
            work.path(),
            Duration::from_secs(3600),
            2,
        );

        let stalled = DownloadSession::open(
            "stalled".to_string(),
            "alice",
            FileId::generate(),
            "video.mkv",
            100,
            work.path().join("download-stalled"),
            chrono::Utc::now(),
        )
        .unwrap();
        store.insert_download_session(&stalled).await.unwrap();

        // upload session listing now errors
        sqlx::query("DROP TABLE upload_sessions")
            .execute(store.pool())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let sweeper = Sweeper::new(
            uploads,
            downloads,
            Duration::ZERO,
            Duration::ZERO,
            Duration::from_secs(3600),
        );
        let report = sweeper.sweep().await;
        assert_eq!(report.failed_steps, 2);
        assert_eq!(report.uploads_expired, 0);
        assert_eq!(report.downloads_expired, 1);

        let session = store.get_download_session("stalled").await.unwrap().unwrap();
        assert_eq!(session.status, DownloadStatus::Failed);
    }
}
