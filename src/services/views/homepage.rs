//! Static homepage regenerator.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::{ViewReport, with_lease};
use crate::error::Result;
use crate::models::{ChangelogRecord, FeedRecord, RegistryKind, ViewsConfig};
use crate::storage::{ArtifactStore, ChangeStore, ScanFilter, ScanOrder, encode_name, get_json, paths};
use crate::utils::changelog::truncate_utf8;
use crate::utils::escape_html;

pub const HOMEPAGE_LEASE: &str = "views/homepage";

const EXCERPT_BYTES: usize = 280;

/// Link to a stored fragment. The key is already percent-encoded, so its
/// `%` signs are escaped again to survive the origin's path decoding.
fn fragment_href(identity: &crate::models::Identity) -> String {
    format!(
        "/fragments/{}/{}.html",
        identity.registry(),
        encode_name(identity.name()).replace('%', "%25")
    )
}

/// Render the homepage from feeds and a sample of recent records.
pub fn render_homepage(
    title: &str,
    feeds: &[FeedRecord],
    sample: &[ChangelogRecord],
    now: DateTime<Utc>,
) -> String {
    let title = escape_html(title);
    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n");
    html.push_str(&format!("<title>{title}</title>\n"));
    html.push_str("<link rel=\"stylesheet\" href=\"/assets/site.css\">\n</head>\n<body>\n");
    html.push_str(&format!("<header><h1>{title}</h1>"));
    html.push_str("<form action=\"/search\" method=\"get\"><input name=\"q\" placeholder=\"Search packages\"></form></header>\n");

    html.push_str("<main>\n<section class=\"latest\">\n<h2>Latest changelogs</h2>\n");
    if sample.is_empty() {
        html.push_str("<p class=\"empty\">Nothing crawled yet.</p>\n");
    }
    for record in sample {
        let excerpt = record
            .changelog
            .as_deref()
            .map(|text| truncate_utf8(text, EXCERPT_BYTES))
            .unwrap_or("");
        html.push_str(&format!(
            "<article><h3><a href=\"{}\">{}</a> <span class=\"version\">{}</span></h3><pre>{}</pre></article>\n",
            escape_html(&fragment_href(&record.identity)),
            escape_html(&record.identity.to_string()),
            escape_html(record.last_known_version.as_deref().unwrap_or("")),
            escape_html(excerpt),
        ));
    }
    html.push_str("</section>\n");

    for feed in feeds {
        html.push_str(&format!(
            "<section class=\"feed\" data-registry=\"{0}\">\n<h2>Recently crawled on {0}</h2>\n<ol>\n",
            feed.registry
        ));
        for item in &feed.items {
            html.push_str(&format!(
                "<li><a href=\"{}\">{}</a> {} <time datetime=\"{}\">{}</time></li>\n",
                escape_html(&fragment_href(&item.identity)),
                escape_html(item.identity.name()),
                escape_html(item.version.as_deref().unwrap_or("")),
                item.crawled_at.to_rfc3339(),
                item.crawled_at.format("%Y-%m-%d %H:%M UTC"),
            ));
        }
        html.push_str("</ol>\n</section>\n");
    }

    html.push_str(&format!(
        "</main>\n<footer>Generated {}</footer>\n</body>\n</html>\n",
        now.to_rfc3339()
    ));
    html
}

pub struct HomepageBuilder {
    store: Arc<dyn ChangeStore>,
    artifacts: Arc<dyn ArtifactStore>,
    config: ViewsConfig,
    holder: String,
}

impl HomepageBuilder {
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

    /// Regenerate `index.html` in one write.
    pub async fn build(&self, now: DateTime<Utc>) -> Result<ViewReport> {
        with_lease(
            self.store.as_ref(),
            HOMEPAGE_LEASE,
            &self.holder,
            self.config.lease_secs,
            now,
            || async {
                let mut feeds = Vec::new();
                for registry in RegistryKind::ALL {
                    if let Some(feed) =
                        get_json::<FeedRecord>(self.artifacts.as_ref(), &paths::feed(registry)).await?
                    {
                        feeds.push(feed);
                    }
                }
                let sample = self
                    .store
                    .scan(
                        &ScanFilter::published(),
                        ScanOrder::LastCrawledDesc,
                        Some(self.config.homepage_sample_size),
                    )
                    .await?;

                let html = render_homepage(&self.config.site_title, &feeds, &sample, now);
                self.artifacts
                    .put(paths::HOMEPAGE, html.into_bytes(), "text/html; charset=utf-8")
                    .await?;

                log::info!("Homepage: {} feeds, {} sampled records", feeds.len(), sample.len());
                Ok(ViewReport {
                    skipped: false,
                    records: sample.len(),
                    written: 1,
                })
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CrawlResult, FeedItem, Identity, RecordPatch};
    use crate::storage::{MemoryArtifactStore, MemoryChangeStore, put_json};
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_fragment_href_decodes_to_the_stored_key() {
        let identity: Identity = "npm:@types/node".parse().unwrap();
        let href = fragment_href(&identity);
        assert_eq!(href, "/fragments/npm/%2540types%252Fnode.html");

        let decoded = href.replace("%25", "%");
        assert_eq!(decoded, format!("/{}", paths::fragment(&identity)));
    }

    #[test]
    fn test_render_escapes_content() {
        let mut record = ChangelogRecord::pending("npm:<evil>".parse().unwrap(), t(0), t(0));
        record.last_known_version = Some("1.0.0".into());
        record.changelog = Some("<script>alert(1)</script>".into());
        record.last_crawled_at = Some(t(0));

        let html = render_homepage("Changelogs & more", &[], &[record], t(10));
        assert!(html.contains("<title>Changelogs &amp; more</title>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("/fragments/npm/%3Cevil%3E.html"));
    }

    #[tokio::test]
    async fn test_build_reads_feeds_and_samples() {
        let store = Arc::new(MemoryChangeStore::new());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let identity: Identity = "rubygems:rails".parse().unwrap();
        let patch = RecordPatch::CrawlSucceeded {
            result: CrawlResult {
                version: "7.1.3".into(),
                changelog: Some("* faster boot".into()),
                content_digest: None,
                source_url: None,
            },
            next_eligible_at: t(0),
        };
        store.upsert(&identity, &patch, t(0)).await.unwrap();
        let feed = FeedRecord {
            registry: RegistryKind::Rubygems,
            items: vec![FeedItem {
                identity: identity.clone(),
                version: Some("7.1.3".into()),
                crawled_at: t(0),
            }],
            refreshed_at: t(5),
        };
        put_json(artifacts.as_ref(), &paths::feed(RegistryKind::Rubygems), &feed)
            .await
            .unwrap();

        let builder = HomepageBuilder::new(store, artifacts.clone(), ViewsConfig::default(), "test");
        let report = builder.build(t(10)).await.unwrap();
        assert_eq!(report.records, 1);

        let page = artifacts.get_artifact(paths::HOMEPAGE).await.unwrap();
        assert_eq!(page.content_type, "text/html; charset=utf-8");
        let html = String::from_utf8(page.content).unwrap();
        assert!(html.contains("Recently crawled on rubygems"));
        assert!(html.contains("* faster boot"));
        assert!(html.ends_with("</html>\n"));
    }
}
