//! PyPI: recent-updates RSS listing plus the JSON API.

use std::collections::HashMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use super::{ChangeBatch, ChangeEvent, PackageDetail, Registry, first_present};
use crate::error::Result;
use crate::models::{PypiConfig, RegistryKind};
use crate::utils::changelog::extract_section;
use crate::utils::http::{decode_json, fetch_text};
use crate::utils::join_url;

static ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<item>(.*?)</item>").unwrap_or_else(|e| panic!("rss regex: {e}")));

static TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<title>\s*(.*?)\s*</title>").unwrap_or_else(|e| panic!("rss regex: {e}"))
});

/// `project_urls` keys that point at release notes, most specific first.
const CHANGELOG_URL_KEYS: [&str; 5] = ["changelog", "change log", "changes", "release notes", "history"];

#[derive(Debug, Deserialize)]
struct ProjectResponse {
    info: ProjectInfo,
}

#[derive(Debug, Deserialize)]
struct ProjectInfo {
    name: String,
    version: String,
    description: Option<String>,
    home_page: Option<String>,
    #[serde(default)]
    project_urls: Option<HashMap<String, String>>,
}

/// PyPI client.
pub struct PypiRegistry {
    client: reqwest::Client,
    config: PypiConfig,
}

impl PypiRegistry {
    pub fn new(client: reqwest::Client, config: PypiConfig) -> Self {
        Self { client, config }
    }
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Parse the updates feed. Item titles read `"{name} {version}"`.
pub fn parse_updates_feed(xml: &str) -> ChangeBatch {
    let changes = ITEM
        .captures_iter(xml)
        .filter_map(|item| {
            // Items without a title are skipped, never paired with a neighbour's.
            let caps = TITLE.captures(item.get(1)?.as_str())?;
            let title = unescape_xml(caps.get(1)?.as_str());
            let (name, version) = title.trim().rsplit_once(' ')?;
            let (name, version) = (name.trim(), version.trim());
            (!name.is_empty() && !version.is_empty())
                .then(|| ChangeEvent::new(name, Some(version.to_string())))
        })
        .collect();
    ChangeBatch {
        changes,
        next_cursor: None,
    }
}

/// Parse a `/pypi/{name}/json` response.
pub fn parse_project(name: &str, body: &str) -> Result<PackageDetail> {
    let response: ProjectResponse = decode_json(RegistryKind::Pypi, name, body)?;
    let info = response.info;

    let urls: Vec<(String, &str)> = info
        .project_urls
        .iter()
        .flatten()
        .map(|(k, v)| (k.to_lowercase(), v.as_str()))
        .collect();
    let changelog_url = CHANGELOG_URL_KEYS
        .iter()
        .find_map(|key| urls.iter().find(|(k, _)| k == key).map(|(_, v)| *v));
    let homepage = urls.iter().find(|(k, _)| k == "homepage").map(|(_, v)| *v);

    Ok(PackageDetail {
        name: info.name,
        version: info.version,
        changelog: info.description.as_deref().and_then(extract_section),
        source_url: first_present([changelog_url, info.home_page.as_deref(), homepage]),
    })
}

#[async_trait]
impl Registry for PypiRegistry {
    fn kind(&self) -> RegistryKind {
        RegistryKind::Pypi
    }

    async fn fetch_recent_changes(&self, _cursor: Option<&str>) -> Result<ChangeBatch> {
        let url = join_url(&self.config.base_url, "rss/updates.xml");
        let xml = fetch_text(&self.client, RegistryKind::Pypi, &url).await?;
        Ok(parse_updates_feed(&xml))
    }

    async fn fetch_package_detail(&self, name: &str) -> Result<PackageDetail> {
        let url = join_url(&self.config.base_url, &format!("pypi/{name}/json"));
        let body = fetch_text(&self.client, RegistryKind::Pypi, &url).await?;
        parse_project(name, &body)
    }
}
