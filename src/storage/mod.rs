//! Storage abstractions for the change store and published artifacts.
//!
//! Two kinds of state live here:
//! - the **change store**: one durable record per tracked identity, plus
//!   watcher cursors and tick leases
//! - **artifact stores**: publicly readable documents (changelog JSON,
//!   HTML fragments, feeds, search index, homepage)
//!
//! ## Layout
//!
//! ```text
//! {root}/
//! ├── records/{registry}/{name}.json   # ChangelogRecord
//! ├── cursors/{registry}.json          # change-feed cursor
//! └── leases/{name}.json               # single-flight tick leases
//!
//! {artifacts}/
//! ├── changelogs/{registry}/{name}.json
//! ├── fragments/{registry}/{name}.html
//! ├── feeds/{registry}.json
//! ├── search/index.json
//! └── index.html
//! ```

pub mod local;
pub mod memory;
#[cfg(feature = "s3")]
pub mod s3;

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::Result;
use crate::models::{
    ChangelogRecord, CrawlStatus, Identity, RecordPatch, RegistryKind, UpsertOutcome,
};

// Re-export for convenience
pub use local::{LocalArtifactStore, LocalChangeStore};
pub use memory::{MemoryArtifactStore, MemoryChangeStore};

/// Result of a successful upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct Upserted {
    /// Record as stored after the write
    pub record: ChangelogRecord,
    pub outcome: UpsertOutcome,
}

/// Record selection for [`ChangeStore::scan`].
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    pub registry: Option<RegistryKind>,
    pub status: Option<CrawlStatus>,
    /// Only records eligible at this instant
    pub due_at: Option<DateTime<Utc>>,
    /// Only records with at least one successful crawl
    pub published_only: bool,
}

impl ScanFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn due(now: DateTime<Utc>) -> Self {
        Self {
            due_at: Some(now),
            ..Self::default()
        }
    }

    pub fn published() -> Self {
        Self {
            published_only: true,
            ..Self::default()
        }
    }

    pub fn in_registry(mut self, registry: RegistryKind) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_status(mut self, status: CrawlStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, record: &ChangelogRecord) -> bool {
        if let Some(registry) = self.registry {
            if record.identity.registry() != registry {
                return false;
            }
        }
        if let Some(status) = self.status {
            if record.status != status {
                return false;
            }
        }
        if let Some(now) = self.due_at {
            if !record.is_due(now) {
                return false;
            }
        }
        !self.published_only || record.is_published()
    }
}

/// Ordering for [`ChangeStore::scan`]. Ties always break by identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanOrder {
    #[default]
    Identity,
    /// Oldest eligibility first
    NextEligibleAsc,
    /// Most recently crawled first; never-crawled last
    LastCrawledDesc,
}

impl ScanOrder {
    pub fn compare(&self, a: &ChangelogRecord, b: &ChangelogRecord) -> Ordering {
        let primary = match self {
            ScanOrder::Identity => Ordering::Equal,
            ScanOrder::NextEligibleAsc => a.next_eligible_at.cmp(&b.next_eligible_at),
            ScanOrder::LastCrawledDesc => b.last_crawled_at.cmp(&a.last_crawled_at),
        };
        primary.then_with(|| a.identity.cmp(&b.identity))
    }
}

/// Filter, order and truncate records in memory.
///
/// Shared by backends that cannot push the query down.
pub fn select_records(
    records: impl IntoIterator<Item = ChangelogRecord>,
    filter: &ScanFilter,
    order: ScanOrder,
    limit: Option<usize>,
) -> Vec<ChangelogRecord> {
    let mut selected: Vec<ChangelogRecord> =
        records.into_iter().filter(|r| filter.matches(r)).collect();
    selected.sort_by(|a, b| order.compare(a, b));
    if let Some(limit) = limit {
        selected.truncate(limit);
    }
    selected
}

/// Short-lived single-flight lease on a periodic task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(holder: &str, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            holder: holder.to_string(),
            expires_at: now + ttl,
        }
    }

    /// Whether `holder` may take over this lease at `now`.
    pub fn available_to(existing: Option<&Lease>, holder: &str, now: DateTime<Utc>) -> bool {
        existing.is_none_or(|lease| lease.holder == holder || lease.expires_at <= now)
    }
}

/// Durable, idempotently updatable record of every tracked package.
#[async_trait]
pub trait ChangeStore: Send + Sync {
    /// Fetch the current record for an identity.
    async fn get(&self, identity: &Identity) -> Result<Option<ChangelogRecord>>;

    /// Merge a patch into the stored record.
    ///
    /// Content only moves forward by version: the patch's version is the
    /// expected minimum over what is stored. Returns `None` when the patch
    /// does not apply to an absent record.
    async fn upsert(
        &self,
        identity: &Identity,
        patch: &RecordPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Upserted>>;

    /// Select records by filter, ordered, at most `limit`.
    async fn scan(
        &self,
        filter: &ScanFilter,
        order: ScanOrder,
        limit: Option<usize>,
    ) -> Result<Vec<ChangelogRecord>>;

    /// Last acknowledged change-feed position for a registry.
    async fn load_cursor(&self, registry: RegistryKind) -> Result<Option<String>>;

    async fn save_cursor(&self, registry: RegistryKind, cursor: &str) -> Result<()>;

    /// Take or renew the named lease. Returns false if someone else holds it.
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn release_lease(&self, name: &str, holder: &str) -> Result<()>;
}

/// Publicly readable document store with idempotent overwrites.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Replace the document at `path`. Readers see the old or new content,
    /// never a partial write.
    async fn put(&self, path: &str, content: Vec<u8>, content_type: &str) -> Result<()>;

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>>;
}

/// Serialize `value` as JSON and publish it.
pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn ArtifactStore,
    path: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    store.put(path, bytes, "application/json").await
}

/// Read and deserialize a JSON artifact.
pub async fn get_json<T: DeserializeOwned>(store: &dyn ArtifactStore, path: &str) -> Result<Option<T>> {
    match store.get(path).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Filesystem- and URL-safe form of a package name.
pub fn encode_name(name: &str) -> String {
    url::form_urlencoded::byte_serialize(name.as_bytes()).collect()
}

/// Inverse of [`encode_name`].
pub fn decode_name(encoded: &str) -> String {
    url::form_urlencoded::parse(format!("n={encoded}").as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| encoded.to_string())
}

/// Artifact and record paths.
pub mod paths {
    use super::encode_name;
    use crate::models::{Identity, RegistryKind};

    pub const SEARCH_INDEX: &str = "search/index.json";
    pub const HOMEPAGE: &str = "index.html";

    pub fn record(identity: &Identity) -> String {
        format!(
            "records/{}/{}.json",
            identity.registry(),
            encode_name(identity.name())
        )
    }

    pub fn records_dir(registry: RegistryKind) -> String {
        format!("records/{registry}")
    }

    pub fn cursor(registry: RegistryKind) -> String {
        format!("cursors/{registry}.json")
    }

    pub fn lease(name: &str) -> String {
        format!("leases/{}.json", encode_name(name))
    }

    pub fn changelog(identity: &Identity) -> String {
        format!(
            "changelogs/{}/{}.json",
            identity.registry(),
            encode_name(identity.name())
        )
    }

    pub fn fragment(identity: &Identity) -> String {
        format!(
            "fragments/{}/{}.html",
            identity.registry(),
            encode_name(identity.name())
        )
    }

    pub fn feed(registry: RegistryKind) -> String {
        format!("feeds/{registry}.json")
    }
}
