//! Prefix search index builder.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use unicode_segmentation::UnicodeSegmentation;

use super::{ViewReport, with_lease};
use crate::error::Result;
use crate::models::{SearchIndex, SearchIndexEntry, ViewsConfig};
use crate::storage::{ArtifactStore, ChangeStore, ScanFilter, ScanOrder, get_json, paths, put_json};

pub const SEARCH_LEASE: &str = "views/search";

/// Grapheme prefixes of the normalized name, shortest first.
///
/// `"lodash"` yields `"l"`, `"lo"`, ... `"lodash"` with `min_len` 1.
pub fn fragments(name: &str, min_len: usize) -> Vec<String> {
    let normalized = SearchIndex::normalize(name);
    let ends: Vec<usize> = normalized
        .grapheme_indices(true)
        .map(|(start, g)| start + g.len())
        .collect();
    ends.iter()
        .enumerate()
        .filter(|(i, _)| i + 1 >= min_len.max(1))
        .map(|(_, &end)| normalized[..end].to_string())
        .collect()
}

/// Recency-weighted score: crawl time plus a bonus for how much of the
/// name the fragment covers.
pub fn score(crawled_at: DateTime<Utc>, fragment_len: usize, name_len: usize, coverage_bonus_secs: i64) -> i64 {
    let coverage = if name_len == 0 {
        0
    } else {
        coverage_bonus_secs.saturating_mul(fragment_len as i64) / name_len as i64
    };
    crawled_at.timestamp().saturating_add(coverage)
}

pub struct SearchIndexBuilder {
    store: Arc<dyn ChangeStore>,
    artifacts: Arc<dyn ArtifactStore>,
    config: ViewsConfig,
    holder: String,
}

impl SearchIndexBuilder {
    pub fn new(
        store: Arc<dyn ChangeStore>,
        artifacts: Arc<dyn ArtifactStore>,
        config: ViewsConfig,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            store,
            artifacts,
            config,
            holder: holder.into(),
        }
    }

    pub async fn build(&self, now: DateTime<Utc>) -> Result<ViewReport> {
        with_lease(
            self.store.as_ref(),
            SEARCH_LEASE,
            &self.holder,
            self.config.lease_secs,
            now,
            || self.rebuild(now),
        )
        .await
    }

    async fn rebuild(&self, now: DateTime<Utc>) -> Result<ViewReport> {
        let mut index: SearchIndex = get_json(self.artifacts.as_ref(), paths::SEARCH_INDEX)
            .await?
            .unwrap_or_default();
        let records = self
            .store
            .scan(&ScanFilter::published(), ScanOrder::Identity, None)
            .await?;
        let expires_at = now + Duration::seconds(self.config.search_ttl_secs as i64);

        for record in &records {
            let Some(crawled_at) = record.last_crawled_at else {
                continue;
            };
            let name_len = SearchIndex::normalize(record.identity.name()).graphemes(true).count();
            for fragment in fragments(record.identity.name(), self.config.min_fragment_len) {
                let len = fragment.graphemes(true).count();
                index.upsert(SearchIndexEntry {
                    score: score(crawled_at, len, name_len, self.config.coverage_bonus_secs),
                    fragment,
                    target: record.identity.clone(),
                    expires_at,
                });
            }
        }

        index.compact(now, self.config.max_entries_per_fragment);
        index.generated_at = Some(now);
        put_json(self.artifacts.as_ref(), paths::SEARCH_INDEX, &index).await?;

        log::info!(
            "Search index: {} records, {} fragments, {} entries",
            records.len(),
            index.fragments.len(),
            index.entry_count()
        );
        Ok(ViewReport {
            skipped: false,
            records: records.len(),
            written: index.entry_count(),
        })
    }
}

/// Load the published index and answer a prefix query.
pub async fn query(
    artifacts: &dyn ArtifactStore,
    prefix: &str,
    now: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<SearchIndexEntry>> {
    let index: SearchIndex = get_json(artifacts, paths::SEARCH_INDEX).await?.unwrap_or_default();
    Ok(index.query(prefix, now, limit).into_iter().cloned().collect())
}
