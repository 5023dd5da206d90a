//! Service layer for the changelog pipeline.
//!
//! This module contains the business logic for:
//! - Registry watching (`Watcher`)
//! - Crawling dispatched identities (`CrawlWorker`)
//! - Re-dispatching stale records (`Reconciler`)
//! - Derived views (`SearchIndexBuilder`, `FeedBuilder`, `HomepageBuilder`)
//! - Live broadcast (`LiveChannel`) and edge routing (`EdgeRouter`)

pub mod crawler;
pub mod live;
pub mod reconciler;
pub mod router;
pub mod views;
pub mod watcher;

pub use crawler::{CrawlReport, CrawlWorker, WorkerStats};
pub use live::{BroadcastChannel, LiveChannel, LiveEvent};
pub use reconciler::{ReconcileReport, Reconciler};
pub use router::{EdgeRouter, RouteDecision};
pub use views::{FeedBuilder, HomepageBuilder, SearchIndexBuilder, ViewReport};
pub use watcher::{WatchReport, Watcher};
