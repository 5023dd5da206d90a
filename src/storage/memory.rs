//! In-memory storage backends.
//!
//! Used for single-process runs and tests. Every operation takes the lock
//! for its whole read-modify-write, so upserts are atomic per store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::{ChangelogRecord, Identity, RecordPatch, RegistryKind, apply_patch};
use crate::storage::{
    ArtifactStore, ChangeStore, Lease, ScanFilter, ScanOrder, Upserted, select_records,
};

/// Change store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryChangeStore {
    records: Mutex<BTreeMap<Identity, ChangelogRecord>>,
    cursors: Mutex<HashMap<RegistryKind, String>>,
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryChangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or replace a record directly.
    pub async fn insert(&self, record: ChangelogRecord) {
        self.records
            .lock()
            .await
            .insert(record.identity.clone(), record);
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl ChangeStore for MemoryChangeStore {
    async fn get(&self, identity: &Identity) -> Result<Option<ChangelogRecord>> {
        Ok(self.records.lock().await.get(identity).cloned())
    }

    async fn upsert(
        &self,
        identity: &Identity,
        patch: &RecordPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Upserted>> {
        let mut records = self.records.lock().await;
        let Some((record, outcome)) = apply_patch(identity, records.get(identity), patch, now)
        else {
            return Ok(None);
        };
        records.insert(identity.clone(), record.clone());
        Ok(Some(Upserted { record, outcome }))
    }

    async fn scan(
        &self,
        filter: &ScanFilter,
        order: ScanOrder,
        limit: Option<usize>,
    ) -> Result<Vec<ChangelogRecord>> {
        let records = self.records.lock().await;
        Ok(select_records(records.values().cloned(), filter, order, limit))
    }

    async fn load_cursor(&self, registry: RegistryKind) -> Result<Option<String>> {
        Ok(self.cursors.lock().await.get(&registry).cloned())
    }

    async fn save_cursor(&self, registry: RegistryKind, cursor: &str) -> Result<()> {
        self.cursors
            .lock()
            .await
            .insert(registry, cursor.to_string());
        Ok(())
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        if !Lease::available_to(leases.get(name), holder, now) {
            return Ok(false);
        }
        leases.insert(name.to_string(), Lease::new(holder, ttl, now));
        Ok(true)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if leases.get(name).is_some_and(|l| l.holder == holder) {
            leases.remove(name);
        }
        Ok(())
    }
}

/// A stored artifact with its content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub content: Vec<u8>,
    pub content_type: String,
}

/// Artifact store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    objects: Mutex<BTreeMap<String, StoredArtifact>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored path, sorted.
    pub async fn paths(&self) -> Vec<String> {
        self.objects.lock().await.keys().cloned().collect()
    }

    pub async fn get_artifact(&self, path: &str) -> Option<StoredArtifact> {
        self.objects.lock().await.get(path).cloned()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, path: &str, content: Vec<u8>, content_type: &str) -> Result<()> {
        self.objects.lock().await.insert(
            path.to_string(),
            StoredArtifact {
                content,
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .objects
            .lock()
            .await
            .get(path)
            .map(|a| a.content.clone()))
    }
}
