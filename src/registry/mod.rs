//! Package registry clients.
//!
//! Watchers and crawl workers are written against [`Registry`]; each
//! registry variant only knows how to reach and parse its own endpoints.

pub mod npm;
pub mod pypi;
pub mod rubygems;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{AppError, Result};
use crate::models::{Config, RegistryKind};

pub use npm::NpmRegistry;
pub use pypi::PypiRegistry;
pub use rubygems::RubygemsRegistry;

/// One entry of a registry's change feed or recent-release listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub name: String,
    /// Released version, when the feed carries it
    pub version: Option<String>,
    pub deleted: bool,
}

impl ChangeEvent {
    pub fn new(name: impl Into<String>, version: Option<String>) -> Self {
        Self {
            name: name.into(),
            version,
            deleted: false,
        }
    }
}

/// A page of changes plus the position to resume from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub changes: Vec<ChangeEvent>,
    /// `None` for snapshot listings that have no feed position
    pub next_cursor: Option<String>,
}

/// Current metadata of one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDetail {
    pub name: String,
    pub version: String,
    /// Raw changelog text, before normalization
    pub changelog: Option<String>,
    pub source_url: Option<String>,
}

/// Capability set every registry variant implements.
#[async_trait]
pub trait Registry: Send + Sync {
    fn kind(&self) -> RegistryKind;

    /// Changes after `cursor`, or the current recent-release snapshot.
    async fn fetch_recent_changes(&self, cursor: Option<&str>) -> Result<ChangeBatch>;

    async fn fetch_package_detail(&self, name: &str) -> Result<PackageDetail>;
}

/// Registry clients by kind.
#[derive(Clone, Default)]
pub struct RegistrySet {
    registries: HashMap<RegistryKind, Arc<dyn Registry>>,
}

impl RegistrySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the live clients for every supported registry.
    pub fn from_config(config: &Config, client: reqwest::Client) -> Self {
        Self::new()
            .with(Arc::new(NpmRegistry::new(
                client.clone(),
                config.registries.npm.clone(),
                config.crawler.timeout_secs,
            )))
            .with(Arc::new(PypiRegistry::new(
                client.clone(),
                config.registries.pypi.clone(),
            )))
            .with(Arc::new(RubygemsRegistry::new(
                client,
                config.registries.rubygems.clone(),
            )))
    }

    /// Add or replace the client for its kind.
    pub fn with(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registries.insert(registry.kind(), registry);
        self
    }

    pub fn get(&self, kind: RegistryKind) -> Result<Arc<dyn Registry>> {
        self.registries
            .get(&kind)
            .cloned()
            .ok_or_else(|| AppError::config(format!("no client configured for registry {kind}")))
    }
}

/// First non-empty string among the candidates.
pub(crate) fn first_present<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}
