// src/services/crawler.rs

//! Crawl worker.
//!
//! Fetches one dispatched identity from its registry and merges the result
//! into the change store. Duplicate and out-of-order deliveries are safe:
//! the store only moves content forward by version.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::bus::Subscription;
use crate::error::Result;
use crate::models::{
    ChangelogRecord, CrawlResult, CrawlerConfig, DispatchMessage, Identity, RecordPatch,
    UpsertOutcome,
};
use crate::registry::RegistrySet;
use crate::services::live::{LiveChannel, LiveEvent};
use crate::storage::{ArtifactStore, ChangeStore, paths, put_json};
use crate::utils::changelog::{content_digest, normalize};
use crate::utils::escape_html;
use crate::utils::retry::{Backoff, retry_transient};

/// Public changelog document written on every successful crawl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangelogDocument {
    pub identity: Identity,
    pub registry: String,
    pub name: String,
    pub version: Option<String>,
    pub changelog: Option<String>,
    pub source_url: Option<String>,
    pub content_digest: Option<String>,
    pub crawled_at: Option<DateTime<Utc>>,
}

impl ChangelogDocument {
    pub fn from_record(record: &ChangelogRecord) -> Self {
        Self {
            identity: record.identity.clone(),
            registry: record.identity.registry().to_string(),
            name: record.identity.name().to_string(),
            version: record.last_known_version.clone(),
            changelog: record.changelog.clone(),
            source_url: record.source_url.clone(),
            content_digest: record.content_digest.clone(),
            crawled_at: record.last_crawled_at,
        }
    }
}

/// Render the per-identity HTML fragment.
pub fn render_fragment(record: &ChangelogRecord) -> String {
    let mut html = format!(
        "<article class=\"changelog\" data-identity=\"{}\">\n  <h2>{} <span class=\"version\">{}</span></h2>\n",
        escape_html(&record.identity.to_string()),
        escape_html(record.identity.name()),
        escape_html(record.last_known_version.as_deref().unwrap_or("")),
    );
    match record.changelog.as_deref() {
        Some(text) => html.push_str(&format!("  <pre>{}</pre>\n", escape_html(text))),
        None => html.push_str("  <p class=\"empty\">No changelog published.</p>\n"),
    }
    if let Some(url) = record.source_url.as_deref() {
        html.push_str(&format!(
            "  <a class=\"source\" href=\"{}\" rel=\"nofollow\">Source</a>\n",
            escape_html(url)
        ));
    }
    html.push_str("</article>\n");
    html
}

/// What handling one message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlReport {
    Crawled {
        version: String,
        outcome: UpsertOutcome,
        attempts: u32,
    },
    Failed {
        error: String,
        transient: bool,
        attempts: u32,
    },
}

/// Counters over a worker's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: usize,
    pub crawled: usize,
    pub changed: usize,
    pub failed: usize,
    /// Deliveries nacked because the store or artifacts could not be written
    pub errors: usize,
}

impl WorkerStats {
    pub fn record(&mut self, report: &CrawlReport) {
        self.processed += 1;
        match report {
            CrawlReport::Crawled { outcome, .. } => {
                self.crawled += 1;
                if outcome.content_changed() {
                    self.changed += 1;
                }
            }
            CrawlReport::Failed { .. } => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: WorkerStats) {
        self.processed += other.processed;
        self.crawled += other.crawled;
        self.changed += other.changed;
        self.failed += other.failed;
        self.errors += other.errors;
    }
}

/// Crawls dispatched identities.
pub struct CrawlWorker {
    config: CrawlerConfig,
    backoff: Backoff,
    registries: RegistrySet,
    store: Arc<dyn ChangeStore>,
    artifacts: Arc<dyn ArtifactStore>,
    live: Arc<dyn LiveChannel>,
}

impl CrawlWorker {
    pub fn new(
        config: CrawlerConfig,
        registries: RegistrySet,
        store: Arc<dyn ChangeStore>,
        artifacts: Arc<dyn ArtifactStore>,
        live: Arc<dyn LiveChannel>,
    ) -> Self {
        Self {
            backoff: Backoff::from_config(&config),
            config,
            registries,
            store,
            artifacts,
            live,
        }
    }

    pub async fn handle(&self, message: &DispatchMessage) -> Result<CrawlReport> {
        self.handle_at(message, Utc::now()).await
    }

    /// Crawl one identity as of `now`.
    ///
    /// Fetch failures are recorded on the record and reported, not returned:
    /// only store and artifact errors surface as `Err`.
    pub async fn handle_at(&self, message: &DispatchMessage, now: DateTime<Utc>) -> Result<CrawlReport> {
        let identity = &message.identity;
        let registry = self.registries.get(identity.registry())?;
        debug!("Crawling {}", message);

        let (fetched, attempts) = retry_transient(self.backoff, |_| {
            registry.fetch_package_detail(identity.name())
        })
        .await;

        let detail = match fetched {
            Ok(detail) => detail,
            Err(err) => {
                let transient = err.is_transient();
                warn!("Crawl of {} failed after {} attempts: {}", identity, attempts, err);
                let patch = RecordPatch::CrawlFailed {
                    error: err.to_string(),
                    next_eligible_at: now + self.config.failure_backoff(),
                };
                self.store.upsert(identity, &patch, now).await?;
                return Ok(CrawlReport::Failed {
                    error: err.to_string(),
                    transient,
                    attempts,
                });
            }
        };

        let changelog = detail
            .changelog
            .as_deref()
            .and_then(|text| normalize(text, self.config.max_changelog_bytes));
        let result = CrawlResult {
            content_digest: Some(content_digest(&detail.version, changelog.as_deref())),
            version: detail.version,
            changelog,
            source_url: detail.source_url,
        };
        let patch = RecordPatch::CrawlSucceeded {
            next_eligible_at: now + self.config.recrawl_backoff(),
            result,
        };
        let Some(upserted) = self.store.upsert(identity, &patch, now).await? else {
            return Ok(CrawlReport::Failed {
                error: "record could not be created".to_string(),
                transient: false,
                attempts,
            });
        };

        self.publish_artifacts(&upserted.record).await?;
        if upserted.outcome.content_changed() {
            info!(
                "Stored {} {}",
                identity,
                upserted.record.last_known_version.as_deref().unwrap_or("")
            );
            self.live
                .publish(LiveEvent::Crawled {
                    identity: identity.clone(),
                    version: upserted.record.last_known_version.clone().unwrap_or_default(),
                    crawled_at: now,
                })
                .await?;
        } else {
            debug!("{} unchanged ({:?})", identity, upserted.outcome);
        }

        Ok(CrawlReport::Crawled {
            version: patch.version().unwrap_or_default().to_string(),
            outcome: upserted.outcome,
            attempts,
        })
    }

    /// Write the stored record's changelog document and HTML fragment.
    async fn publish_artifacts(&self, record: &ChangelogRecord) -> Result<()> {
        let identity = &record.identity;
        put_json(
            self.artifacts.as_ref(),
            &paths::changelog(identity),
            &ChangelogDocument::from_record(record),
        )
        .await?;
        self.artifacts
            .put(
                &paths::fragment(identity),
                render_fragment(record).into_bytes(),
                "text/html; charset=utf-8",
            )
            .await
    }

    /// Consume deliveries until the subscription ends.
    pub async fn run(&self, mut subscription: Box<dyn Subscription>) -> WorkerStats {
        let mut stats = WorkerStats::default();
        while let Some(delivery) = subscription.next().await {
            match self.handle(&delivery.message).await {
                Ok(report) => {
                    stats.record(&report);
                    if let Err(e) = subscription.ack(&delivery).await {
                        warn!("Failed to ack {}: {}", delivery.message, e);
                    }
                }
                Err(err) => {
                    stats.errors += 1;
                    warn!("Handling {} failed: {}", delivery.message, err);
                    if let Err(e) = subscription.nack(delivery, &err.to_string()).await {
                        warn!("Failed to nack: {}", e);
                    }
                }
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CrawlStatus, RegistryKind};
    use crate::registry::testing::{FakeRegistry, Scripted};
    use crate::services::live::BroadcastChannel;
    use crate::storage::{MemoryArtifactStore, MemoryChangeStore, get_json};
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    struct Harness {
        registry: Arc<FakeRegistry>,
        store: Arc<MemoryChangeStore>,
        artifacts: Arc<MemoryArtifactStore>,
        live: BroadcastChannel,
        worker: CrawlWorker,
    }

    fn harness() -> Harness {
        let registry = Arc::new(FakeRegistry::new(RegistryKind::Npm));
        let store = Arc::new(MemoryChangeStore::new());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let live = BroadcastChannel::new(16);
        let config = CrawlerConfig {
            max_attempts: 3,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 2,
            ..CrawlerConfig::default()
        };
        let worker = CrawlWorker::new(
            config,
            RegistrySet::new().with(registry.clone()),
            store.clone(),
            artifacts.clone(),
            Arc::new(live.clone()),
        );
        Harness {
            registry,
            store,
            artifacts,
            live,
            worker,
        }
    }

    fn msg(name: &str) -> DispatchMessage {
        DispatchMessage::discovered(Identity::new(RegistryKind::Npm, name).unwrap())
    }

    #[tokio::test]
    async fn test_success_stores_and_publishes() {
        let h = harness();
        let mut events = h.live.subscribe();
        h.registry.release("pkg-a", "1.0.0", "  - first release <b>  ");

        let report = h.worker.handle_at(&msg("pkg-a"), t(0)).await.unwrap();
        assert!(matches!(report, CrawlReport::Crawled { outcome: UpsertOutcome::Inserted, .. }));

        let identity = msg("pkg-a").identity;
        let record = h.store.get(&identity).await.unwrap().unwrap();
        assert_eq!(record.status, CrawlStatus::Crawled);
        assert_eq!(record.changelog.as_deref(), Some("- first release <b>"));
        assert_eq!(record.next_eligible_at, t(0) + Duration::hours(6));

        let doc: ChangelogDocument = get_json(h.artifacts.as_ref(), &paths::changelog(&identity))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.version.as_deref(), Some("1.0.0"));

        let fragment = h.artifacts.get_artifact(&paths::fragment(&identity)).await.unwrap();
        assert_eq!(fragment.content_type, "text/html; charset=utf-8");
        let html = String::from_utf8(fragment.content).unwrap();
        assert!(html.contains("&lt;b&gt;"));
        assert!(!html.contains("<b>"));

        assert!(matches!(events.try_recv().unwrap(), LiveEvent::Crawled { .. }));
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let h = harness();
        let mut events = h.live.subscribe();
        h.registry.release("pkg-a", "1.0.0", "notes");

        h.worker.handle_at(&msg("pkg-a"), t(0)).await.unwrap();
        let first = h.store.get(&msg("pkg-a").identity).await.unwrap().unwrap();
        let again = h.worker.handle_at(&msg("pkg-a"), t(0)).await.unwrap();
        assert!(matches!(again, CrawlReport::Crawled { outcome: UpsertOutcome::Touched, .. }));
        let second = h.store.get(&msg("pkg-a").identity).await.unwrap().unwrap();

        assert_eq!(first, second);
        assert!(events.try_recv().is_ok());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transient_retries_then_succeeds() {
        let h = harness();
        h.registry.script(
            "pkg-a",
            vec![
                Scripted::Transient,
                Scripted::Found(crate::registry::PackageDetail {
                    name: "pkg-a".into(),
                    version: "1.0.0".into(),
                    changelog: None,
                    source_url: None,
                }),
            ],
        );

        let report = h.worker.handle_at(&msg("pkg-a"), t(0)).await.unwrap();
        assert!(matches!(report, CrawlReport::Crawled { attempts: 2, .. }));
        assert_eq!(h.registry.detail_calls(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_transient_marks_failed() {
        let h = harness();
        h.registry.script("pkg-a", vec![Scripted::Transient]);

        let report = h.worker.handle_at(&msg("pkg-a"), t(0)).await.unwrap();
        assert!(matches!(report, CrawlReport::Failed { transient: true, attempts: 3, .. }));

        let record = h.store.get(&msg("pkg-a").identity).await.unwrap().unwrap();
        assert_eq!(record.status, CrawlStatus::Failed);
        assert_eq!(record.failure_count, 1);
        assert_eq!(record.next_eligible_at, t(0) + Duration::hours(1));
        assert!(!record.is_published());
    }

    #[tokio::test]
    async fn test_permanent_failure_keeps_last_good_content() {
        let h = harness();
        h.registry.release("pkg-a", "1.0.0", "good notes");
        h.worker.handle_at(&msg("pkg-a"), t(0)).await.unwrap();

        h.registry.script("pkg-a", vec![Scripted::Permanent]);
        let report = h.worker.handle_at(&msg("pkg-a"), t(100)).await.unwrap();
        assert!(matches!(report, CrawlReport::Failed { transient: false, attempts: 1, .. }));

        let record = h.store.get(&msg("pkg-a").identity).await.unwrap().unwrap();
        assert_eq!(record.status, CrawlStatus::Failed);
        assert_eq!(record.changelog.as_deref(), Some("good notes"));
        assert!(record.is_published());
    }

    #[test]
    fn test_worker_stats() {
        let mut stats = WorkerStats::default();
        stats.record(&CrawlReport::Crawled {
            version: "1".into(),
            outcome: UpsertOutcome::Updated,
            attempts: 1,
        });
        stats.record(&CrawlReport::Failed {
            error: "x".into(),
            transient: true,
            attempts: 3,
        });
        assert_eq!((stats.processed, stats.crawled, stats.changed, stats.failed), (2, 1, 1, 1));
    }
}
