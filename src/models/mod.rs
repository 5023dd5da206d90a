// src/models/mod.rs

//! Domain models for the changelog pipeline.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod config;
mod dispatch;
mod record;
mod route;
mod view;

// Re-export all public types
pub use config::{
    Config, CrawlerConfig, DispatchConfig, LoggingConfig, NpmConfig, PypiConfig, ReconcileConfig,
    RegistriesConfig, RubygemsConfig, StorageConfig, ViewsConfig,
};
pub use dispatch::{DispatchCause, DispatchMessage};
pub use record::{
    ChangelogRecord, CrawlResult, CrawlStatus, Identity, RecordPatch, RegistryKind, UpsertOutcome,
    apply_patch, version_differs,
};
pub use route::{CookiePolicy, Origin, RouteRule};
pub use view::{FeedItem, FeedRecord, SearchIndex, SearchIndexEntry};
