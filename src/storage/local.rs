//! Local filesystem storage implementation.
//!
//! Backs the change store and the artifact store with plain files for
//! development and single-host deployments. Production deployments should
//! use the S3 backends.
//!
//! ## Guarantees
//!
//! - **Atomic writes**: every file is written to a unique temp file and
//!   renamed into place, so readers never observe a partial document.
//! - **Serialized upserts**: read-modify-write on records runs under one
//!   in-process lock per store.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::{ChangelogRecord, Identity, RecordPatch, RegistryKind, apply_patch};
use crate::storage::{
    ArtifactStore, ChangeStore, Lease, ScanFilter, ScanOrder, Upserted, paths, select_records,
};

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Rooted file access shared by the local backends.
#[derive(Debug, Clone)]
struct LocalFiles {
    root_dir: PathBuf,
}

impl LocalFiles {
    fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    /// Get the full path for a relative key.
    fn path(&self, key: &str) -> PathBuf {
        self.root_dir.join(key)
    }

    /// Ensure parent directory exists.
    async fn ensure_dir(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn write_bytes(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path(key);
        self.ensure_dir(&path).await?;

        let seq = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = path.with_file_name(format!(".{file_name}.{}.{seq}.tmp", std::process::id()));

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Write JSON data.
    async fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_bytes(key, &bytes).await
    }

    /// Read bytes, returning None if file doesn't exist.
    async fn read_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    /// Read JSON data.
    async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read_bytes(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    /// Relative keys of the `.json` files directly under `dir`.
    async fn list_json(&self, dir: &str) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(self.path(dir)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::Io(e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(".json") && !name.starts_with('.') {
                keys.push(format!("{dir}/{name}"));
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Change store backed by one JSON file per record.
#[derive(Debug)]
pub struct LocalChangeStore {
    files: LocalFiles,
    write_lock: Mutex<()>,
}

impl LocalChangeStore {
    /// Create a new store rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            files: LocalFiles::new(root_dir),
            write_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl ChangeStore for LocalChangeStore {
    async fn get(&self, identity: &Identity) -> Result<Option<ChangelogRecord>> {
        self.files.read_json(&paths::record(identity)).await
    }

    async fn upsert(
        &self,
        identity: &Identity,
        patch: &RecordPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Upserted>> {
        let _guard = self.write_lock.lock().await;
        let key = paths::record(identity);
        let existing: Option<ChangelogRecord> = self.files.read_json(&key).await?;

        let Some((record, outcome)) = apply_patch(identity, existing.as_ref(), patch, now) else {
            return Ok(None);
        };
        if existing.as_ref() != Some(&record) {
            self.files.write_json(&key, &record).await?;
        }
        Ok(Some(Upserted { record, outcome }))
    }

    async fn scan(
        &self,
        filter: &ScanFilter,
        order: ScanOrder,
        limit: Option<usize>,
    ) -> Result<Vec<ChangelogRecord>> {
        let registries: Vec<RegistryKind> = match filter.registry {
            Some(registry) => vec![registry],
            None => RegistryKind::ALL.to_vec(),
        };

        let mut records = Vec::new();
        for registry in registries {
            for key in self.files.list_json(&paths::records_dir(registry)).await? {
                match self.files.read_json::<ChangelogRecord>(&key).await {
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => {}
                    Err(e) => log::warn!("Skipping unreadable record {}: {}", key, e),
                }
            }
        }
        Ok(select_records(records, filter, order, limit))
    }

    async fn load_cursor(&self, registry: RegistryKind) -> Result<Option<String>> {
        self.files.read_json(&paths::cursor(registry)).await
    }

    async fn save_cursor(&self, registry: RegistryKind, cursor: &str) -> Result<()> {
        self.files.write_json(&paths::cursor(registry), cursor).await
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let key = paths::lease(name);
        let existing: Option<Lease> = self.files.read_json(&key).await?;
        if !Lease::available_to(existing.as_ref(), holder, now) {
            return Ok(false);
        }
        self.files
            .write_json(&key, &Lease::new(holder, ttl, now))
            .await?;
        Ok(true)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = paths::lease(name);
        let existing: Option<Lease> = self.files.read_json(&key).await?;
        if existing.is_some_and(|l| l.holder == holder) {
            self.files.remove(&key).await?;
        }
        Ok(())
    }
}

/// Artifact store backed by a local directory (e.g. served by a static origin).
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    files: LocalFiles,
}

impl LocalArtifactStore {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            files: LocalFiles::new(root_dir),
        }
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, path: &str, content: Vec<u8>, _content_type: &str) -> Result<()> {
        self.files.write_bytes(path, &content).await
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.files.read_bytes(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CrawlResult, CrawlStatus, UpsertOutcome};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn crawled(version: &str) -> RecordPatch {
        RecordPatch::CrawlSucceeded {
            result: CrawlResult {
                version: version.into(),
                changelog: Some(format!("notes for {version}")),
                content_digest: Some(version.into()),
                source_url: None,
            },
            next_eligible_at: t(3_600),
        }
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let tmp = TempDir::new().unwrap();
        let files = LocalFiles::new(tmp.path());

        files.write_bytes("nested/test.txt", b"hello").await.unwrap();
        let data = files.read_bytes("nested/test.txt").await.unwrap();
        assert_eq!(data, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_read_nonexistent() {
        let tmp = TempDir::new().unwrap();
        let files = LocalFiles::new(tmp.path());

        let data = files.read_bytes("nope.txt").await.unwrap();
        assert!(data.is_none());
        assert!(files.list_json("records/npm").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let identity: Identity = "npm:@scope/pkg".parse().unwrap();

        {
            let store = LocalChangeStore::new(tmp.path());
            store.upsert(&identity, &crawled("2.0.0"), t(10)).await.unwrap();
            store.save_cursor(RegistryKind::Npm, "1234").await.unwrap();
        }

        let reopened = LocalChangeStore::new(tmp.path());
        let record = reopened.get(&identity).await.unwrap().unwrap();
        assert_eq!(record.status, CrawlStatus::Crawled);
        assert_eq!(record.last_known_version.as_deref(), Some("2.0.0"));
        assert_eq!(
            reopened.load_cursor(RegistryKind::Npm).await.unwrap().as_deref(),
            Some("1234")
        );
    }

    #[tokio::test]
    async fn test_stale_upsert_keeps_newer_content() {
        let tmp = TempDir::new().unwrap();
        let store = LocalChangeStore::new(tmp.path());
        let identity: Identity = "rubygems:rails".parse().unwrap();

        store.upsert(&identity, &crawled("7.1.0"), t(10)).await.unwrap();
        let stale = store
            .upsert(&identity, &crawled("7.0.8"), t(20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stale.outcome, UpsertOutcome::Stale);

        let record = store.get(&identity).await.unwrap().unwrap();
        assert_eq!(record.changelog.as_deref(), Some("notes for 7.1.0"));
    }

    #[tokio::test]
    async fn test_scan_across_registries() {
        let tmp = TempDir::new().unwrap();
        let store = LocalChangeStore::new(tmp.path());
        for id in ["npm:a", "pypi:b", "rubygems:c"] {
            let identity: Identity = id.parse().unwrap();
            store
                .upsert(&identity, &RecordPatch::Discover { next_eligible_at: t(0) }, t(0))
                .await
                .unwrap();
        }

        let all = store.scan(&ScanFilter::all(), ScanOrder::Identity, None).await.unwrap();
        assert_eq!(all.len(), 3);

        let pypi = store
            .scan(&ScanFilter::all().in_registry(RegistryKind::Pypi), ScanOrder::Identity, None)
            .await
            .unwrap();
        assert_eq!(pypi.len(), 1);
        assert_eq!(pypi[0].identity.to_string(), "pypi:b");
    }

    #[tokio::test]
    async fn test_leases_persist() {
        let tmp = TempDir::new().unwrap();
        let store = LocalChangeStore::new(tmp.path());
        let ttl = Duration::seconds(30);

        assert!(store.try_acquire_lease("views/search", "a", ttl, t(0)).await.unwrap());
        let other = LocalChangeStore::new(tmp.path());
        assert!(!other.try_acquire_lease("views/search", "b", ttl, t(5)).await.unwrap());
        assert!(other.try_acquire_lease("views/search", "b", ttl, t(31)).await.unwrap());
    }

    #[tokio::test]
    async fn test_artifact_put_overwrites() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(tmp.path());

        store.put("index.html", b"<p>one</p>".to_vec(), "text/html").await.unwrap();
        store.put("index.html", b"<p>two</p>".to_vec(), "text/html").await.unwrap();
        assert_eq!(
            store.get("index.html").await.unwrap(),
            Some(b"<p>two</p>".to_vec())
        );
        assert!(!tmp.path().join("index.html.tmp").exists());
    }
}
