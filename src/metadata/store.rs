//! SQLite-backed document store
//!
//! Every record is kept as a JSON document in its own table, next to a few
//! indexed columns (owner, status, timestamps) used for listing. Updates are
//! read-modify-write under a per-document async lock, and the update closure
//! may veto the write by returning an error.

use crate::download::DownloadSession;
use crate::ident::FileId;
use crate::metadata::error::{MetadataError, MetadataResult};
use crate::metadata::types::{DriveManifest, FileStatus, LinkedAccount, StoredChunk, StoredFile};
use crate::upload::UploadSession;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

const TABLES: [&str; 5] = [
    StoredFile::TABLE,
    UploadSession::TABLE,
    DownloadSession::TABLE,
    DriveManifest::TABLE,
    LinkedAccount::TABLE,
];

/// A record kept as one JSON row
trait Document: Serialize + DeserializeOwned + Send + Sync {
    const TABLE: &'static str;
    const KIND: &'static str;

    fn doc_id(&self) -> String;
    fn owner(&self) -> Option<&str>;
    fn status_tag(&self) -> &'static str;
}

impl Document for StoredFile {
    const TABLE: &'static str = "stored_files";
    const KIND: &'static str = "File";

    fn doc_id(&self) -> String {
        self.file_id.to_string()
    }
    fn owner(&self) -> Option<&str> {
        Some(&self.owner)
    }
    fn status_tag(&self) -> &'static str {
        self.status.as_str()
    }
}

impl Document for UploadSession {
    const TABLE: &'static str = "upload_sessions";
    const KIND: &'static str = "Upload session";

    fn doc_id(&self) -> String {
        self.session_id.clone()
    }
    fn owner(&self) -> Option<&str> {
        Some(&self.owner)
    }
    fn status_tag(&self) -> &'static str {
        self.status.as_str()
    }
}

impl Document for DownloadSession {
    const TABLE: &'static str = "download_sessions";
    const KIND: &'static str = "Download session";

    fn doc_id(&self) -> String {
        self.session_id.clone()
    }
    fn owner(&self) -> Option<&str> {
        Some(&self.owner)
    }
    fn status_tag(&self) -> &'static str {
        self.status.as_str()
    }
}

impl Document for DriveManifest {
    const TABLE: &'static str = "drive_manifests";
    const KIND: &'static str = "Manifest";

    fn doc_id(&self) -> String {
        self.account_id.clone()
    }
    fn owner(&self) -> Option<&str> {
        None
    }
    fn status_tag(&self) -> &'static str {
        "current"
    }
}

impl Document for LinkedAccount {
    const TABLE: &'static str = "linked_accounts";
    const KIND: &'static str = "Account";

    fn doc_id(&self) -> String {
        self.account_id.clone()
    }
    fn owner(&self) -> Option<&str> {
        Some(&self.owner)
    }
    fn status_tag(&self) -> &'static str {
        if self.is_linked() {
            "linked"
        } else {
            "revoked"
        }
    }
}

/// Instant `window` ago; records last touched before it are stale
pub fn cutoff(window: std::time::Duration) -> chrono::DateTime<chrono::Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| chrono::Utc::now().checked_sub_signed(window))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC)
}

pub struct MetadataStore {
    pool: SqlitePool,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MetadataStore {
    /// Open (creating if missing) the database at `url`
    pub async fn new(url: &str) -> MetadataResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::with_pool(pool).await
    }

    /// In-memory database (for testing).
    ///
    /// Pinned to a single connection that never idles out, since every sqlite
    /// memory connection is its own database.
    pub async fn new_in_memory() -> MetadataResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn with_pool(pool: SqlitePool) -> MetadataResult<Self> {
        for table in TABLES {
            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    id TEXT PRIMARY KEY,
                    owner TEXT,
                    status TEXT NOT NULL,
                    body TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                )
                "#
            ))
            .execute(&pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_owner ON {table}(owner)"
            ))
            .execute(&pool)
            .await?;
        }

        Ok(Self {
            pool,
            locks: DashMap::new(),
        })
    }

    fn lock_for(&self, table: &str, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(format!("{table}/{id}"))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_doc<D: Document>(&self, id: &str) -> MetadataResult<Option<D>> {
        let row = sqlx::query(&format!("SELECT body FROM {} WHERE id = ?", D::TABLE))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_str(&row.try_get::<String, _>("body")?)?)),
            None => Ok(None),
        }
    }

    async fn store_doc<D: Document>(&self, doc: &D) -> MetadataResult<()> {
        let body = serde_json::to_string(doc)?;
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {} (id, owner, status, body, updated_at) VALUES (?, ?, ?, ?, ?)",
            D::TABLE
        ))
        .bind(doc.doc_id())
        .bind(doc.owner())
        .bind(doc.status_tag())
        .bind(body)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_doc<D: Document>(&self, doc: &D) -> MetadataResult<()> {
        let id = doc.doc_id();
        let lock = self.lock_for(D::TABLE, &id);
        let _guard = lock.lock().await;

        if self.load_doc::<D>(&id).await?.is_some() {
            return Err(MetadataError::AlreadyExists { kind: D::KIND, id });
        }
        self.store_doc(doc).await
    }

    async fn save_doc<D: Document>(&self, doc: &D) -> MetadataResult<()> {
        let lock = self.lock_for(D::TABLE, &doc.doc_id());
        let _guard = lock.lock().await;
        self.store_doc(doc).await
    }

    async fn update_doc<D, F, E>(&self, id: &str, f: F) -> Result<D, E>
    where
        D: Document,
        F: FnOnce(&mut D) -> Result<(), E>,
        E: From<MetadataError>,
    {
        let lock = self.lock_for(D::TABLE, id);
        let _guard = lock.lock().await;

        let mut doc = self
            .load_doc::<D>(id)
            .await?
            .ok_or_else(|| MetadataError::NotFound {
                kind: D::KIND,
                id: id.to_string(),
            })?;
        f(&mut doc)?;
        self.store_doc(&doc).await?;
        Ok(doc)
    }

    async fn delete_doc<D: Document>(&self, id: &str) -> MetadataResult<bool> {
        let lock = self.lock_for(D::TABLE, id);
        let guard = lock.lock().await;

        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = ?", D::TABLE))
            .bind(id)
            .execute(&self.pool)
            .await?;

        drop(guard);
        self.locks.remove(&format!("{}/{id}", D::TABLE));
        Ok(result.rows_affected() > 0)
    }

    async fn list_docs<D: Document>(&self, owner: Option<&str>) -> MetadataResult<Vec<D>> {
        let rows = match owner {
            Some(owner) => {
                sqlx::query(&format!(
                    "SELECT body FROM {} WHERE owner = ? ORDER BY id",
                    D::TABLE
                ))
                .bind(owner)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!("SELECT body FROM {} ORDER BY id", D::TABLE))
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            docs.push(serde_json::from_str(&row.try_get::<String, _>("body")?)?);
        }
        Ok(docs)
    }

    // ============== Stored files ==============

    /// Insert a new file record; fails if the id is taken
    pub async fn insert_file(&self, file: &StoredFile) -> MetadataResult<()> {
        self.insert_doc(file).await
    }

    pub async fn get_file(&self, file_id: &FileId) -> MetadataResult<Option<StoredFile>> {
        self.load_doc(file_id.as_str()).await
    }

    pub async fn file_exists(&self, file_id: &FileId) -> MetadataResult<bool> {
        Ok(self.get_file(file_id).await?.is_some())
    }

    pub async fn save_file(&self, file: &StoredFile) -> MetadataResult<()> {
        self.save_doc(file).await
    }

    pub async fn update_file<F, E>(&self, file_id: &FileId, f: F) -> Result<StoredFile, E>
    where
        F: FnOnce(&mut StoredFile) -> Result<(), E>,
        E: From<MetadataError>,
    {
        self.update_doc(file_id.as_str(), f).await
    }

    /// Insert or replace one chunk record, returning the chunk it replaced
    pub async fn upsert_chunk(
        &self,
        file_id: &FileId,
        chunk: StoredChunk,
    ) -> MetadataResult<Option<StoredChunk>> {
        let mut replaced = None;
        self.update_file(file_id, |file| {
            replaced = file.upsert_chunk(chunk);
            Ok::<_, MetadataError>(())
        })
        .await?;
        Ok(replaced)
    }

    pub async fn remove_chunk(
        &self,
        file_id: &FileId,
        chunk_index: u32,
    ) -> MetadataResult<Option<StoredChunk>> {
        let mut removed = None;
        self.update_file(file_id, |file| {
            removed = file.remove_chunk(chunk_index);
            Ok::<_, MetadataError>(())
        })
        .await?;
        Ok(removed)
    }

    /// Files owned by `owner`, excluding deleted ones
    pub async fn list_files(&self, owner: &str) -> MetadataResult<Vec<StoredFile>> {
        let files: Vec<StoredFile> = self.list_docs(Some(owner)).await?;
        Ok(files
            .into_iter()
            .filter(|f| f.status != FileStatus::Deleted)
            .collect())
    }

    pub async fn delete_file_record(&self, file_id: &FileId) -> MetadataResult<bool> {
        self.delete_doc::<StoredFile>(file_id.as_str()).await
    }

    // ============== Upload sessions ==============

    pub async fn insert_upload_session(&self, session: &UploadSession) -> MetadataResult<()> {
        self.insert_doc(session).await
    }

    pub async fn get_upload_session(&self, session_id: &str) -> MetadataResult<Option<UploadSession>> {
        self.load_doc(session_id).await
    }

    pub async fn update_upload_session<F, E>(&self, session_id: &str, f: F) -> Result<UploadSession, E>
    where
        F: FnOnce(&mut UploadSession) -> Result<(), E>,
        E: From<MetadataError>,
    {
        self.update_doc(session_id, f).await
    }

    pub async fn list_upload_sessions(&self) -> MetadataResult<Vec<UploadSession>> {
        self.list_docs(None).await
    }

    pub async fn delete_upload_session(&self, session_id: &str) -> MetadataResult<bool> {
        self.delete_doc::<UploadSession>(session_id).await
    }

    // ============== Download sessions ==============

    pub async fn insert_download_session(&self, session: &DownloadSession) -> MetadataResult<()> {
        self.insert_doc(session).await
    }

    pub async fn get_download_session(
        &self,
        session_id: &str,
    ) -> MetadataResult<Option<DownloadSession>> {
        self.load_doc(session_id).await
    }

    pub async fn update_download_session<F, E>(
        &self,
        session_id: &str,
        f: F,
    ) -> Result<DownloadSession, E>
    where
        F: FnOnce(&mut DownloadSession) -> Result<(), E>,
        E: From<MetadataError>,
    {
        self.update_doc(session_id, f).await
    }

    pub async fn list_download_sessions(&self) -> MetadataResult<Vec<DownloadSession>> {
        self.list_docs(None).await
    }

    pub async fn delete_download_session(&self, session_id: &str) -> MetadataResult<bool> {
        self.delete_doc::<DownloadSession>(session_id).await
    }

    // ============== Drive manifests ==============

    pub async fn get_manifest(&self, account_id: &str) -> MetadataResult<Option<DriveManifest>> {
        self.load_doc(account_id).await
    }

    /// Apply `f` to the account's manifest, creating an empty one if none exists
    pub async fn update_manifest<F>(&self, account_id: &str, f: F) -> MetadataResult<DriveManifest>
    where
        F: FnOnce(&mut DriveManifest),
    {
        let lock = self.lock_for(DriveManifest::TABLE, account_id);
        let _guard = lock.lock().await;

        let mut manifest = self
            .load_doc::<DriveManifest>(account_id)
            .await?
            .unwrap_or_else(|| DriveManifest::new(account_id.to_string()));
        f(&mut manifest);
        self.store_doc(&manifest).await?;
        Ok(manifest)
    }

    // ============== Linked accounts ==============

    /// Record an account authorized by the external linking flow.
    ///
    /// Re-linking a revoked account by the same owner restores it.
    pub async fn link_account(&self, account: LinkedAccount) -> MetadataResult<LinkedAccount> {
        let lock = self.lock_for(LinkedAccount::TABLE, &account.account_id);
        let _guard = lock.lock().await;

        if let Some(existing) = self.load_doc::<LinkedAccount>(&account.account_id).await? {
            if existing.owner != account.owner || existing.is_linked() {
                return Err(MetadataError::AlreadyExists {
                    kind: LinkedAccount::KIND,
                    id: account.account_id,
                });
            }
        }
        self.store_doc(&account).await?;
        Ok(account)
    }

    pub async fn get_account(&self, account_id: &str) -> MetadataResult<Option<LinkedAccount>> {
        self.load_doc(account_id).await
    }

    /// Every account the owner ever linked, revoked ones included
    pub async fn list_accounts(&self, owner: &str) -> MetadataResult<Vec<LinkedAccount>> {
        self.list_docs(Some(owner)).await
    }

    /// Accounts currently usable as chunk targets
    pub async fn linked_accounts(&self, owner: &str) -> MetadataResult<Vec<LinkedAccount>> {
        Ok(self
            .list_accounts(owner)
            .await?
            .into_iter()
            .filter(LinkedAccount::is_linked)
            .collect())
    }

    pub async fn revoke_account(&self, owner: &str, account_id: &str) -> MetadataResult<LinkedAccount> {
        self.update_doc(account_id, |account: &mut LinkedAccount| {
            if account.owner != owner {
                return Err(MetadataError::NotFound {
                    kind: LinkedAccount::KIND,
                    id: account_id.to_string(),
                });
            }
            account.status = crate::metadata::types::AccountStatus::Revoked;
            Ok(())
        })
        .await
    }
}
