//! Application configuration structures.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{CookiePolicy, Origin, RouteRule};

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP and crawl worker settings
    #[serde(default)]
    pub crawler: CrawlerConfig,

    /// Per-registry endpoints and cadences
    #[serde(default)]
    pub registries: RegistriesConfig,

    /// Dispatch bus delivery settings
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Reconciliation scheduler settings
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// Derived view builder settings
    #[serde(default)]
    pub views: ViewsConfig,

    /// Local storage layout
    #[serde(default)]
    pub storage: StorageConfig,

    /// Log verbosity
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Edge routing table, first match wins
    #[serde(default = "defaults::routes")]
    pub routes: Vec<RouteRule>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Apply environment overrides used by the Lambda runtime.
    pub fn apply_env_overrides(&mut self) {
        if let Some(timeout) = env_parse::<u64>("CRAWL_TIMEOUT_SECS") {
            self.crawler.timeout_secs = timeout;
        }
        if let Some(max) = env_parse::<usize>("MAX_CONCURRENT") {
            self.crawler.max_concurrent = max;
        }
        if let Some(cap) = env_parse::<usize>("RECONCILE_PER_TICK_CAP") {
            self.reconcile.per_tick_cap = cap;
        }
        if let Ok(root) = std::env::var("STORAGE_ROOT") {
            self.storage.root = root;
        }
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.crawler.user_agent.trim().is_empty() {
            return Err(AppError::validation("crawler.user_agent is empty"));
        }
        if self.crawler.timeout_secs == 0 {
            return Err(AppError::validation("crawler.timeout_secs must be > 0"));
        }
        if self.crawler.max_concurrent == 0 {
            return Err(AppError::validation("crawler.max_concurrent must be > 0"));
        }
        if self.crawler.max_attempts == 0 {
            return Err(AppError::validation("crawler.max_attempts must be > 0"));
        }
        if self.dispatch.max_delivery_attempts == 0 {
            return Err(AppError::validation(
                "dispatch.max_delivery_attempts must be > 0",
            ));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(AppError::validation("dispatch.queue_capacity must be > 0"));
        }
        if self.reconcile.per_tick_cap == 0 {
            return Err(AppError::validation("reconcile.per_tick_cap must be > 0"));
        }
        if self.views.min_fragment_len == 0 {
            return Err(AppError::validation("views.min_fragment_len must be > 0"));
        }
        if self.views.feed_max_len == 0 {
            return Err(AppError::validation("views.feed_max_len must be > 0"));
        }
        if self.routes.is_empty() {
            return Err(AppError::validation("No routes defined"));
        }
        if self.routes.last().is_none_or(|r| r.path_pattern != "*") {
            return Err(AppError::validation(
                "the last route must be the catch-all \"*\"",
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            crawler: CrawlerConfig::default(),
            registries: RegistriesConfig::default(),
            dispatch: DispatchConfig::default(),
            reconcile: ReconcileConfig::default(),
            views: ViewsConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            routes: defaults::routes(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// HTTP client and crawl worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds; a timeout counts as a transient failure
    #[serde(default = "defaults::timeout")]
    pub timeout_secs: u64,

    /// Crawl workers running at once
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// Fetch attempts before a transient failure marks the record Failed
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "defaults::retry_base_delay")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "defaults::retry_max_delay")]
    pub retry_max_delay_ms: u64,

    /// Delay before a crawled record is eligible again
    #[serde(default = "defaults::recrawl_backoff")]
    pub recrawl_backoff_secs: u64,

    /// Delay before a failed record is eligible again
    #[serde(default = "defaults::failure_backoff")]
    pub failure_backoff_secs: u64,

    /// Stored changelog text is cut at this many bytes
    #[serde(default = "defaults::max_changelog_bytes")]
    pub max_changelog_bytes: usize,
}

impl CrawlerConfig {
    pub fn recrawl_backoff(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.recrawl_backoff_secs as i64)
    }

    pub fn failure_backoff(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.failure_backoff_secs as i64)
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::timeout(),
            max_concurrent: defaults::max_concurrent(),
            max_attempts: defaults::max_attempts(),
            retry_base_delay_ms: defaults::retry_base_delay(),
            retry_max_delay_ms: defaults::retry_max_delay(),
            recrawl_backoff_secs: defaults::recrawl_backoff(),
            failure_backoff_secs: defaults::failure_backoff(),
            max_changelog_bytes: defaults::max_changelog_bytes(),
        }
    }
}

/// Registry endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistriesConfig {
    #[serde(default)]
    pub npm: NpmConfig,
    #[serde(default)]
    pub pypi: PypiConfig,
    #[serde(default)]
    pub rubygems: RubygemsConfig,
}

/// npm follower settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NpmConfig {
    #[serde(default = "defaults::npm_changes_url")]
    pub changes_url: String,

    #[serde(default = "defaults::npm_registry_url")]
    pub registry_url: String,

    /// Changes requested per long-poll
    #[serde(default = "defaults::npm_batch_limit")]
    pub batch_limit: usize,

    /// How long the server may hold a long-poll open
    #[serde(default = "defaults::npm_longpoll_timeout")]
    pub longpoll_timeout_secs: u64,

    /// Reconnect backoff ceiling
    #[serde(default = "defaults::npm_reconnect_max")]
    pub reconnect_max_secs: u64,
}

impl Default for NpmConfig {
    fn default() -> Self {
        Self {
            changes_url: defaults::npm_changes_url(),
            registry_url: defaults::npm_registry_url(),
            batch_limit: defaults::npm_batch_limit(),
            longpoll_timeout_secs: defaults::npm_longpoll_timeout(),
            reconnect_max_secs: defaults::npm_reconnect_max(),
        }
    }
}

/// PyPI poller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PypiConfig {
    #[serde(default = "defaults::pypi_base_url")]
    pub base_url: String,

    #[serde(default = "defaults::poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for PypiConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::pypi_base_url(),
            poll_interval_secs: defaults::poll_interval(),
        }
    }
}

/// RubyGems poller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RubygemsConfig {
    #[serde(default = "defaults::rubygems_base_url")]
    pub base_url: String,

    #[serde(default = "defaults::poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for RubygemsConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::rubygems_base_url(),
            poll_interval_secs: defaults::poll_interval(),
        }
    }
}

/// Dispatch bus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "defaults::queue_capacity")]
    pub queue_capacity: usize,

    /// Publish attempts before a DispatchDeliveryError
    #[serde(default = "defaults::publish_attempts")]
    pub publish_attempts: u32,

    #[serde(default = "defaults::publish_timeout")]
    pub publish_timeout_ms: u64,

    /// Deliveries of one message before it is dead-lettered
    #[serde(default = "defaults::max_delivery_attempts")]
    pub max_delivery_attempts: u32,

    #[serde(default = "defaults::redelivery_delay")]
    pub redelivery_delay_ms: u64,

    /// Eligibility delay on newly discovered records, covering lost messages
    #[serde(default = "defaults::pending_grace")]
    pub pending_grace_secs: u64,
}

impl DispatchConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }

    pub fn pending_grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.pending_grace_secs as i64)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::queue_capacity(),
            publish_attempts: defaults::publish_attempts(),
            publish_timeout_ms: defaults::publish_timeout(),
            max_delivery_attempts: defaults::max_delivery_attempts(),
            redelivery_delay_ms: defaults::redelivery_delay(),
            pending_grace_secs: defaults::pending_grace(),
        }
    }
}

/// Reconciliation scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "defaults::reconcile_interval")]
    pub interval_secs: u64,

    /// Records re-dispatched per tick at most
    #[serde(default = "defaults::per_tick_cap")]
    pub per_tick_cap: usize,

    /// Eligibility push after a re-dispatch, so the next tick skips it
    #[serde(default = "defaults::redispatch_grace")]
    pub redispatch_grace_secs: u64,

    #[serde(default = "defaults::lease")]
    pub lease_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: defaults::reconcile_interval(),
            per_tick_cap: defaults::per_tick_cap(),
            redispatch_grace_secs: defaults::redispatch_grace(),
            lease_secs: defaults::lease(),
        }
    }
}

/// Derived view builder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewsConfig {
    #[serde(default = "defaults::search_interval")]
    pub search_interval_secs: u64,

    #[serde(default = "defaults::feed_interval")]
    pub feed_interval_secs: u64,

    #[serde(default = "defaults::homepage_interval")]
    pub homepage_interval_secs: u64,

    /// Shortest indexed prefix, in graphemes
    #[serde(default = "defaults::min_fragment_len")]
    pub min_fragment_len: usize,

    #[serde(default = "defaults::search_ttl")]
    pub search_ttl_secs: u64,

    #[serde(default = "defaults::max_entries_per_fragment")]
    pub max_entries_per_fragment: usize,

    /// Score bonus for a prefix covering the whole name
    #[serde(default = "defaults::coverage_bonus")]
    pub coverage_bonus_secs: i64,

    #[serde(default = "defaults::feed_max_len")]
    pub feed_max_len: usize,

    #[serde(default = "defaults::homepage_sample")]
    pub homepage_sample_size: usize,

    #[serde(default = "defaults::lease")]
    pub lease_secs: u64,

    #[serde(default = "defaults::site_title")]
    pub site_title: String,
}

impl Default for ViewsConfig {
    fn default() -> Self {
        Self {
            search_interval_secs: defaults::search_interval(),
            feed_interval_secs: defaults::feed_interval(),
            homepage_interval_secs: defaults::homepage_interval(),
            min_fragment_len: defaults::min_fragment_len(),
            search_ttl_secs: defaults::search_ttl(),
            max_entries_per_fragment: defaults::max_entries_per_fragment(),
            coverage_bonus_secs: defaults::coverage_bonus(),
            feed_max_len: defaults::feed_max_len(),
            homepage_sample_size: defaults::homepage_sample(),
            lease_secs: defaults::lease(),
            site_title: defaults::site_title(),
        }
    }
}

/// Local storage layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for records, cursors and leases
    #[serde(default = "defaults::storage_root")]
    pub root: String,

    /// Root directory for published artifacts
    #[serde(default = "defaults::artifacts_root")]
    pub artifacts: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: defaults::storage_root(),
            artifacts: defaults::artifacts_root(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "defaults::log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
        }
    }
}

mod defaults {
    use super::{CookiePolicy, Origin, RouteRule};

    // Crawler defaults
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; changelogs/0.1)".into()
    }
    pub fn timeout() -> u64 {
        30
    }
    pub fn max_concurrent() -> usize {
        8
    }
    pub fn max_attempts() -> u32 {
        3
    }
    pub fn retry_base_delay() -> u64 {
        500
    }
    pub fn retry_max_delay() -> u64 {
        10_000
    }
    pub fn recrawl_backoff() -> u64 {
        6 * 60 * 60
    }
    pub fn failure_backoff() -> u64 {
        60 * 60
    }
    pub fn max_changelog_bytes() -> usize {
        256 * 1024
    }

    // Registry defaults
    pub fn npm_changes_url() -> String {
        "https://replicate.npmjs.com/registry/_changes".into()
    }
    pub fn npm_registry_url() -> String {
        "https://registry.npmjs.org".into()
    }
    pub fn npm_batch_limit() -> usize {
        100
    }
    pub fn npm_longpoll_timeout() -> u64 {
        25
    }
    pub fn npm_reconnect_max() -> u64 {
        300
    }
    pub fn pypi_base_url() -> String {
        "https://pypi.org".into()
    }
    pub fn rubygems_base_url() -> String {
        "https://rubygems.org".into()
    }
    pub fn poll_interval() -> u64 {
        60
    }

    // Dispatch defaults
    pub fn queue_capacity() -> usize {
        1024
    }
    pub fn publish_attempts() -> u32 {
        3
    }
    pub fn publish_timeout() -> u64 {
        2_000
    }
    pub fn max_delivery_attempts() -> u32 {
        5
    }
    pub fn redelivery_delay() -> u64 {
        1_000
    }
    pub fn pending_grace() -> u64 {
        15 * 60
    }

    // Reconcile defaults
    pub fn reconcile_interval() -> u64 {
        60
    }
    pub fn per_tick_cap() -> usize {
        50
    }
    pub fn redispatch_grace() -> u64 {
        15 * 60
    }
    pub fn lease() -> u64 {
        30
    }

    // View defaults
    pub fn search_interval() -> u64 {
        5 * 60
    }
    pub fn feed_interval() -> u64 {
        60
    }
    pub fn homepage_interval() -> u64 {
        5 * 60
    }
    pub fn min_fragment_len() -> usize {
        1
    }
    pub fn search_ttl() -> u64 {
        24 * 60 * 60
    }
    pub fn max_entries_per_fragment() -> usize {
        50
    }
    pub fn coverage_bonus() -> i64 {
        24 * 60 * 60
    }
    pub fn feed_max_len() -> usize {
        50
    }
    pub fn homepage_sample() -> usize {
        20
    }
    pub fn site_title() -> String {
        "changelogs".into()
    }

    // Storage defaults
    pub fn storage_root() -> String {
        "storage".into()
    }
    pub fn artifacts_root() -> String {
        "storage/public".into()
    }
    pub fn log_level() -> String {
        "info".into()
    }

    // Routing defaults
    pub fn routes() -> Vec<RouteRule> {
        vec![
            RouteRule::new("/live*", Origin::Live)
                .with_query_string()
                .with_cookies(CookiePolicy::All),
            RouteRule::new("/search*", Origin::Search).with_query_string(),
            RouteRule::new("/api/*", Origin::GeneratedJson).with_query_string(),
            RouteRule::new("*.json", Origin::GeneratedJson),
            RouteRule::new("/assets/*", Origin::StaticAssets),
            RouteRule::new("*.css", Origin::StaticAssets),
            RouteRule::new("*.js", Origin::StaticAssets),
            RouteRule::new("*.png", Origin::StaticAssets),
            RouteRule::new("*.svg", Origin::StaticAssets),
            RouteRule::new("*.ico", Origin::StaticAssets),
            RouteRule::new("*", Origin::GeneratedHtml),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_default_config_ok() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_user_agent() {
        let mut config = Config::default();
        config.crawler.user_agent = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_tick_cap() {
        let mut config = Config::default();
        config.reconcile.per_tick_cap = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = Config::from_toml(
            r#"
            [crawler]
            timeout_secs = 10

            [reconcile]
            per_tick_cap = 7

            [[routes]]
            path_pattern = "/live*"
            origin = "live"
            forward_cookies = { policy = "whitelist", names = ["session"] }

            [[routes]]
            path_pattern = "*"
            origin = "generated_html"
            "#,
        )
        .unwrap();

        assert_eq!(config.crawler.timeout_secs, 10);
        assert_eq!(config.crawler.max_attempts, 3);
        assert_eq!(config.reconcile.per_tick_cap, 7);
        assert_eq!(config.routes.len(), 2);
        assert_eq!(
            config.routes[0].forward_cookies,
            CookiePolicy::Whitelist(vec!["session".into()])
        );
        assert!(!config.routes[1].forward_query_string);
        assert!(config.validate().is_ok());
    }
}
