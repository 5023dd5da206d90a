//! RubyGems.org: `just_updated` activity listing plus gem metadata.

use async_trait::async_trait;
use serde::Deserialize;

use super::{ChangeBatch, ChangeEvent, PackageDetail, Registry, first_present};
use crate::error::Result;
use crate::models::{RegistryKind, RubygemsConfig};
use crate::utils::changelog::extract_section;
use crate::utils::http::{decode_json, fetch_text};
use crate::utils::join_url;

#[derive(Debug, Deserialize)]
struct GemSummary {
    name: String,
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GemInfo {
    name: String,
    version: String,
    info: Option<String>,
    changelog_uri: Option<String>,
    source_code_uri: Option<String>,
    homepage_uri: Option<String>,
}

/// RubyGems client.
pub struct RubygemsRegistry {
    client: reqwest::Client,
    config: RubygemsConfig,
}

impl RubygemsRegistry {
    pub fn new(client: reqwest::Client, config: RubygemsConfig) -> Self {
        Self { client, config }
    }
}

/// Parse `/api/v1/activity/just_updated.json`.
pub fn parse_just_updated(body: &str) -> Result<ChangeBatch> {
    let gems: Vec<GemSummary> = decode_json(RegistryKind::Rubygems, "just_updated", body)?;
    Ok(ChangeBatch {
        changes: gems
            .into_iter()
            .map(|gem| ChangeEvent::new(gem.name, gem.version))
            .collect(),
        next_cursor: None,
    })
}

/// Parse `/api/v1/gems/{name}.json`.
pub fn parse_gem(name: &str, body: &str) -> Result<PackageDetail> {
    let gem: GemInfo = decode_json(RegistryKind::Rubygems, name, body)?;
    Ok(PackageDetail {
        name: gem.name,
        version: gem.version,
        changelog: gem.info.as_deref().and_then(extract_section),
        source_url: first_present([
            gem.changelog_uri.as_deref(),
            gem.source_code_uri.as_deref(),
            gem.homepage_uri.as_deref(),
        ]),
    })
}

#[async_trait]
impl Registry for RubygemsRegistry {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Rubygems
    }

    async fn fetch_recent_changes(&self, _cursor: Option<&str>) -> Result<ChangeBatch> {
        let url = join_url(&self.config.base_url, "api/v1/activity/just_updated.json");
        let body = fetch_text(&self.client, RegistryKind::Rubygems, &url).await?;
        parse_just_updated(&body)
    }

    async fn fetch_package_detail(&self, name: &str) -> Result<PackageDetail> {
        let url = join_url(&self.config.base_url, &format!("api/v1/gems/{name}.json"));
        let body = fetch_text(&self.client, RegistryKind::Rubygems, &url).await?;
        parse_gem(name, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_just_updated() {
        let body = r#"[
            {"name": "rails", "version": "7.1.3", "downloads": 1},
            {"name": "rack", "version": "3.0.9"}
        ]"#;
        let batch = parse_just_updated(body).unwrap();
        assert_eq!(batch.changes.len(), 2);
        assert_eq!(batch.changes[0], ChangeEvent::new("rails", Some("7.1.3".into())));
    }

    #[test]
    fn test_parse_gem_source_fallbacks() {
        let body = r#"{
            "name": "rack",
            "version": "3.0.9",
            "info": "Rack provides a minimal interface",
            "changelog_uri": null,
            "source_code_uri": "https://github.com/rack/rack",
            "homepage_uri": "https://rack.github.io"
        }"#;
        let detail = parse_gem("rack", body).unwrap();
        assert_eq!(detail.version, "3.0.9");
        assert!(detail.changelog.is_none());
        assert_eq!(detail.source_url.as_deref(), Some("https://github.com/rack/rack"));
    }

    #[test]
    fn test_parse_gem_changelog_uri_wins() {
        let body = r###"{"name": "rails", "version": "7.1.3", "info": "## Changes\n* fast",
            "changelog_uri": "https://github.com/rails/rails/releases/tag/v7.1.3"}"###;
        let detail = parse_gem("rails", body).unwrap();
        assert_eq!(detail.changelog.as_deref(), Some("* fast"));
        assert!(detail.source_url.unwrap().contains("releases"));
    }
}
