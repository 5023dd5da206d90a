// src/services/views/mod.rs

//! Derived-view builders.
//!
//! Each builder recomputes its artifact from current change-store state on
//! its own cadence. A short lease per tick keeps overlapping ticks rare;
//! when they do overlap the result is the same, just computed twice.

pub mod feed;
pub mod homepage;
pub mod search;

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::storage::ChangeStore;

pub use feed::FeedBuilder;
pub use homepage::HomepageBuilder;
pub use search::SearchIndexBuilder;

/// Result of one builder tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ViewReport {
    /// Another instance held the lease
    pub skipped: bool,
    /// Records projected
    pub records: usize,
    /// Entries or items written
    pub written: usize,
}

impl ViewReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Run `build` while holding the named lease.
async fn with_lease<F, Fut>(
    store: &dyn ChangeStore,
    name: &str,
    holder: &str,
    lease_secs: u64,
    now: DateTime<Utc>,
    build: F,
) -> Result<ViewReport>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<ViewReport>>,
{
    let ttl = Duration::seconds(lease_secs as i64);
    if !store.try_acquire_lease(name, holder, ttl, now).await? {
        log::debug!("{} tick skipped, lease held elsewhere", name);
        return Ok(ViewReport::skipped());
    }
    let result = build().await;
    store.release_lease(name, holder).await?;
    result
}
