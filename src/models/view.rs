//! Read-optimized projections of the change store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ChangelogRecord, Identity, RegistryKind};

/// One entry of a registry's recently crawled feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub identity: Identity,
    pub version: Option<String>,
    pub crawled_at: DateTime<Utc>,
}

impl FeedItem {
    /// Feed item for a published record.
    pub fn from_record(record: &ChangelogRecord) -> Option<Self> {
        Some(Self {
            identity: record.identity.clone(),
            version: record.last_known_version.clone(),
            crawled_at: record.last_crawled_at?,
        })
    }
}

/// Most-recent-first list of crawled packages for one registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRecord {
    pub registry: RegistryKind,
    pub items: Vec<FeedItem>,
    pub refreshed_at: DateTime<Utc>,
}

/// Typeahead entry mapping a name prefix to a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchIndexEntry {
    pub fragment: String,
    /// Higher ranks first
    pub score: i64,
    pub target: Identity,
    pub expires_at: DateTime<Utc>,
}

impl SearchIndexEntry {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Serialized search index: fragment -> entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchIndex {
    pub generated_at: Option<DateTime<Utc>>,
    pub fragments: BTreeMap<String, Vec<SearchIndexEntry>>,
}

impl SearchIndex {
    /// Normalize a query or package name into index form.
    pub fn normalize(text: &str) -> String {
        text.trim().to_lowercase()
    }

    /// Insert or overwrite the entry for `(fragment, target)`.
    pub fn upsert(&mut self, entry: SearchIndexEntry) {
        let entries = self.fragments.entry(entry.fragment.clone()).or_default();
        match entries.iter_mut().find(|e| e.target == entry.target) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }

    /// Sort every fragment's entries and keep at most `cap` live ones.
    pub fn compact(&mut self, now: DateTime<Utc>, cap: usize) {
        self.fragments.retain(|_, entries| {
            entries.retain(|e| e.is_live(now));
            sort_entries(entries);
            entries.truncate(cap);
            !entries.is_empty()
        });
    }

    /// Live entries for `prefix`, best first.
    ///
    /// Expired entries are skipped even if the builder has not purged them.
    pub fn query(&self, prefix: &str, now: DateTime<Utc>, limit: usize) -> Vec<&SearchIndexEntry> {
        let key = Self::normalize(prefix);
        let Some(entries) = self.fragments.get(&key) else {
            return Vec::new();
        };
        let mut live: Vec<&SearchIndexEntry> = entries.iter().filter(|e| e.is_live(now)).collect();
        live.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.target.cmp(&b.target)));
        live.truncate(limit);
        live
    }

    pub fn entry_count(&self) -> usize {
        self.fragments.values().map(Vec::len).sum()
    }
}

fn sort_entries(entries: &mut [SearchIndexEntry]) {
    entries.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.target.cmp(&b.target)));
}
