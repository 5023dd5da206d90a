//! Pipeline entry points.
//!
//! - `run_poll` / `run_follow_once`: detect changes in one registry
//! - `run_crawl`: crawl a single identity
//! - `run_reconcile`: re-dispatch stale and failed records
//! - `run_build`: rebuild derived views
//! - `run_status`: per-registry record counts
//! - `run_serve`: run everything on its own cadence until shutdown

mod components;
mod pool;
pub mod schedule;
mod serve;
mod tasks;

pub use components::Components;
pub use pool::WorkerPool;
pub use schedule::run_every;
pub use serve::run_serve;
pub use tasks::{
    BuildTarget, RegistryStatus, run_build, run_crawl, run_follow, run_follow_once, run_poll,
    run_reconcile, run_status,
};
