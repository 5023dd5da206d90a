//! Recently crawled feed builder.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{ViewReport, with_lease};
use crate::error::Result;
use crate::models::{FeedItem, FeedRecord, RegistryKind, ViewsConfig};
use crate::storage::{ArtifactStore, ChangeStore, ScanFilter, ScanOrder, paths, put_json};

pub const FEED_LEASE: &str = "views/feeds";

pub struct FeedBuilder {
    store: Arc<dyn ChangeStore>,
    artifacts: Arc<dyn ArtifactStore>,
    config: ViewsConfig,
    holder: String,
}

impl FeedBuilder {
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

    /// Recompute every registry's feed.
    pub async fn build(&self, now: DateTime<Utc>) -> Result<ViewReport> {
        with_lease(
            self.store.as_ref(),
            FEED_LEASE,
            &self.holder,
            self.config.lease_secs,
            now,
            || async {
                let mut report = ViewReport::default();
                for registry in RegistryKind::ALL {
                    let feed = self.feed_for(registry, now).await?;
                    report.records += feed.items.len();
                    report.written += 1;
                    put_json(self.artifacts.as_ref(), &paths::feed(registry), &feed).await?;
                }
                log::info!("Feeds: {} items across {} registries", report.records, report.written);
                Ok(report)
            },
        )
        .await
    }

    /// Most recently crawled published records of one registry.
    pub async fn feed_for(&self, registry: RegistryKind, now: DateTime<Utc>) -> Result<FeedRecord> {
        let records = self
            .store
            .scan(
                &ScanFilter::published().in_registry(registry),
                ScanOrder::LastCrawledDesc,
                Some(self.config.feed_max_len),
            )
            .await?;
        Ok(FeedRecord {
            registry,
            items: records.iter().filter_map(FeedItem::from_record).collect(),
            refreshed_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CrawlResult, Identity, RecordPatch};
    use crate::storage::{MemoryArtifactStore, MemoryChangeStore, get_json};
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    async fn crawl(store: &MemoryChangeStore, id: &str, at: i64) {
        let identity: Identity = id.parse().unwrap();
        let patch = RecordPatch::CrawlSucceeded {
            result: CrawlResult {
                version: "1.0.0".into(),
                changelog: None,
                content_digest: None,
                source_url: None,
            },
            next_eligible_at: t(at),
        };
        store.upsert(&identity, &patch, t(at)).await.unwrap();
    }

    #[tokio::test]
    async fn test_feed_most_recent_first_and_bounded() {
        let store = Arc::new(MemoryChangeStore::new());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        crawl(&store, "pypi:old", 10).await;
        crawl(&store, "pypi:newest", 30).await;
        crawl(&store, "pypi:middle", 20).await;
        crawl(&store, "npm:elsewhere", 40).await;

        let config = ViewsConfig {
            feed_max_len: 2,
            ..ViewsConfig::default()
        };
        let builder = FeedBuilder::new(store, artifacts.clone(), config, "test");
        let report = builder.build(t(50)).await.unwrap();
        assert_eq!(report.written, 3);

        let feed: FeedRecord = get_json(artifacts.as_ref(), &paths::feed(RegistryKind::Pypi))
            .await
            .unwrap()
            .unwrap();
        let names: Vec<String> = feed.items.iter().map(|i| i.identity.to_string()).collect();
        assert_eq!(names, vec!["pypi:newest", "pypi:middle"]);
        assert_eq!(feed.refreshed_at, t(50));

        let empty: FeedRecord = get_json(artifacts.as_ref(), &paths::feed(RegistryKind::Rubygems))
            .await
            .unwrap()
            .unwrap();
        assert!(empty.items.is_empty());
    }
}
