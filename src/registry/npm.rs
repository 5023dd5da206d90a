//! npm registry: CouchDB-style `_changes` feed plus package documents.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::{ChangeBatch, ChangeEvent, PackageDetail, Registry, first_present};
use crate::error::{AppError, Result};
use crate::models::{NpmConfig, RegistryKind};
use crate::utils::changelog::extract_section;
use crate::utils::http::{decode_json, send_checked};
use crate::utils::join_url;

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    #[serde(default)]
    results: Vec<ChangeRow>,
    last_seq: Value,
}

#[derive(Debug, Deserialize)]
struct ChangeRow {
    id: String,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct Packument {
    name: Option<String>,
    #[serde(rename = "dist-tags", default)]
    dist_tags: DistTags,
    readme: Option<String>,
    homepage: Option<String>,
    repository: Option<Repository>,
}

#[derive(Debug, Default, Deserialize)]
struct DistTags {
    latest: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Repository {
    Url(String),
    Object { url: Option<String> },
}

impl Repository {
    fn url(&self) -> Option<&str> {
        match self {
            Repository::Url(url) => Some(url),
            Repository::Object { url } => url.as_deref(),
        }
    }
}

/// npm client.
pub struct NpmRegistry {
    client: reqwest::Client,
    config: NpmConfig,
    /// Ordinary request timeout, added to the long-poll window
    request_timeout_secs: u64,
}

impl NpmRegistry {
    pub fn new(client: reqwest::Client, config: NpmConfig, request_timeout_secs: u64) -> Self {
        Self {
            client,
            config,
            request_timeout_secs,
        }
    }

    fn changes_url(&self, cursor: Option<&str>) -> String {
        format!(
            "{}?since={}&limit={}&feed=longpoll&timeout={}",
            self.config.changes_url,
            cursor.unwrap_or("now"),
            self.config.batch_limit,
            self.config.longpoll_timeout_secs * 1000
        )
    }
}

/// Path segment for a package document; scoped names keep `@` but escape `/`.
pub fn package_path(name: &str) -> String {
    name.replace('/', "%2F")
}

/// Render a sequence value (number or string) as an opaque cursor.
fn seq_to_cursor(seq: &Value) -> Option<String> {
    match seq {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Turn `git+https://host/x.git` style repository URLs into browsable ones.
pub fn browsable_repository(url: &str) -> String {
    let url = url.trim();
    let url = url.strip_prefix("git+").unwrap_or(url);
    let url = match url.strip_prefix("git://") {
        Some(rest) => format!("https://{rest}"),
        None => url.to_string(),
    };
    url.strip_suffix(".git").unwrap_or(&url).to_string()
}

/// Parse one `_changes` response.
pub fn parse_changes(body: &str) -> Result<ChangeBatch> {
    let response: ChangesResponse = decode_json(RegistryKind::Npm, "_changes", body)?;
    let changes = response
        .results
        .into_iter()
        .filter(|row| !row.id.starts_with("_design/"))
        .map(|row| ChangeEvent {
            name: row.id,
            version: None,
            deleted: row.deleted,
        })
        .collect();
    Ok(ChangeBatch {
        changes,
        next_cursor: seq_to_cursor(&response.last_seq),
    })
}

/// Parse a package document.
pub fn parse_packument(name: &str, body: &str) -> Result<PackageDetail> {
    let doc: Packument = decode_json(RegistryKind::Npm, name, body)?;
    let version = doc
        .dist_tags
        .latest
        .ok_or_else(|| AppError::permanent(RegistryKind::Npm, format!("{name} has no latest version")))?;
    let repository = doc.repository.as_ref().and_then(Repository::url).map(browsable_repository);

    Ok(PackageDetail {
        name: doc.name.unwrap_or_else(|| name.to_string()),
        version,
        changelog: doc.readme.as_deref().and_then(extract_section),
        source_url: first_present([repository.as_deref(), doc.homepage.as_deref()]),
    })
}

#[async_trait]
impl Registry for NpmRegistry {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Npm
    }

    async fn fetch_recent_changes(&self, cursor: Option<&str>) -> Result<ChangeBatch> {
        let url = self.changes_url(cursor);
        let timeout = Duration::from_secs(self.config.longpoll_timeout_secs + self.request_timeout_secs);
        let response = send_checked(RegistryKind::Npm, self.client.get(&url).timeout(timeout)).await?;
        let body = response
            .text()
            .await
            .map_err(|e| AppError::transient(RegistryKind::Npm, e))?;
        let mut batch = parse_changes(&body)?;
        if batch.next_cursor.is_none() {
            batch.next_cursor = cursor.map(str::to_string);
        }
        Ok(batch)
    }

    async fn fetch_package_detail(&self, name: &str) -> Result<PackageDetail> {
        let url = join_url(&self.config.registry_url, &package_path(name));
        let response = send_checked(RegistryKind::Npm, self.client.get(&url)).await?;
        let body = response
            .text()
            .await
            .map_err(|e| AppError::transient(RegistryKind::Npm, e))?;
        parse_packument(name, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_changes() {
        let body = r#"{
            "results": [
                {"seq": 101, "id": "left-pad", "changes": [{"rev": "3-a"}]},
                {"seq": 102, "id": "_design/app", "changes": []},
                {"seq": 103, "id": "@scope/gone", "deleted": true, "changes": []}
            ],
            "last_seq": 103
        }"#;
        let batch = parse_changes(body).unwrap();
        assert_eq!(batch.next_cursor.as_deref(), Some("103"));
        assert_eq!(batch.changes.len(), 2);
        assert_eq!(batch.changes[0].name, "left-pad");
        assert!(batch.changes[1].deleted);
    }

    #[test]
    fn test_parse_changes_string_seq() {
        let batch = parse_changes(r#"{"results": [], "last_seq": "5-g1AAAA"}"#).unwrap();
        assert!(batch.changes.is_empty());
        assert_eq!(batch.next_cursor.as_deref(), Some("5-g1AAAA"));
    }

    #[test]
    fn test_parse_packument() {
        let body = r##"{
            "name": "widget",
            "dist-tags": {"latest": "2.1.0", "next": "3.0.0-beta.1"},
            "readme": "# widget\n\n## Changelog\n\n- 2.1.0: faster\n\n## License\nMIT",
            "repository": {"type": "git", "url": "git+https://github.com/acme/widget.git"},
            "homepage": "https://widget.dev"
        }"##;
        let detail = parse_packument("widget", body).unwrap();
        assert_eq!(detail.version, "2.1.0");
        assert_eq!(detail.changelog.as_deref(), Some("- 2.1.0: faster"));
        assert_eq!(detail.source_url.as_deref(), Some("https://github.com/acme/widget"));
    }

    #[test]
    fn test_packument_without_latest_is_permanent() {
        let err = parse_packument("unpublished", r#"{"name": "unpublished", "time": {}}"#).unwrap_err();
        assert!(matches!(err, AppError::PermanentFetch { .. }));
    }

    #[test]
    fn test_package_path_and_repository() {
        assert_eq!(package_path("@types/node"), "@types%2Fnode");
        assert_eq!(package_path("lodash"), "lodash");
        assert_eq!(browsable_repository("git://github.com/a/b.git"), "https://github.com/a/b");
        assert_eq!(browsable_repository("https://gitlab.com/a/b"), "https://gitlab.com/a/b");
    }
}
