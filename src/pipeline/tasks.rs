// src/pipeline/tasks.rs

//! One-shot pipeline tasks, as run by the CLI and the Lambda handler.
//!
//! Tasks that dispatch work start a worker pool first and drain it before
//! returning, so every message they published is crawled or dead-lettered.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use super::{Components, WorkerPool};
use crate::error::{AppError, Result};
use crate::models::{CrawlStatus, DispatchMessage, Identity, RegistryKind};
use crate::services::{CrawlReport, ReconcileReport, ViewReport, WatchReport, WorkerStats};
use crate::storage::{ChangeStore, ScanFilter, ScanOrder};

/// Which derived views to rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildTarget {
    Search,
    Feeds,
    Homepage,
    All,
}

impl BuildTarget {
    /// Concrete targets in build order. Feeds come before the homepage
    /// because the homepage reads them.
    pub fn expand(self) -> Vec<BuildTarget> {
        match self {
            BuildTarget::All => vec![BuildTarget::Search, BuildTarget::Feeds, BuildTarget::Homepage],
            target => vec![target],
        }
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildTarget::Search => "search",
            BuildTarget::Feeds => "feeds",
            BuildTarget::Homepage => "homepage",
            BuildTarget::All => "all",
        })
    }
}

impl FromStr for BuildTarget {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "search" => Ok(BuildTarget::Search),
            "feeds" | "feed" => Ok(BuildTarget::Feeds),
            "homepage" | "home" => Ok(BuildTarget::Homepage),
            "all" => Ok(BuildTarget::All),
            other => Err(AppError::validation(format!("unknown build target '{other}'"))),
        }
    }
}

/// Poll a recent-release listing once and crawl what it dispatched.
pub async fn run_poll(components: &Components, kind: RegistryKind) -> Result<(WatchReport, WorkerStats)> {
    let watcher = components.watcher(kind)?;
    let pool = WorkerPool::start(components, components.config.crawler.max_concurrent).await?;
    let report = watcher.poll_once(Utc::now()).await;
    let stats = pool.drain().await;
    Ok((report?, stats))
}

/// Read one batch of the npm change feed and crawl what it dispatched.
pub async fn run_follow_once(components: &Components) -> Result<(WatchReport, WorkerStats)> {
    let watcher = components.watcher(RegistryKind::Npm)?;
    let pool = WorkerPool::start(components, components.config.crawler.max_concurrent).await?;
    let report = watcher.follow_once(Utc::now()).await;
    let stats = pool.drain().await;
    Ok((report?, stats))
}

/// Follow the npm change feed until `shutdown` resolves.
pub async fn run_follow<S>(components: &Components, shutdown: S) -> Result<WorkerStats>
where
    S: Future<Output = ()>,
{
    let watcher = components.watcher(RegistryKind::Npm)?;
    let pool = WorkerPool::start(components, components.config.crawler.max_concurrent).await?;
    let (stop_tx, stop_rx) = watch::channel(false);
    let reconnect_max = Duration::from_secs(components.config.registries.npm.reconnect_max_secs);

    let follow = watcher.follow(reconnect_max, stop_rx);
    tokio::pin!(follow);
    tokio::select! {
        _ = &mut follow => {}
        _ = shutdown => {
            stop_tx.send_replace(true);
            follow.await;
        }
    }
    Ok(pool.drain().await)
}

/// Crawl one identity directly, bypassing the bus.
pub async fn run_crawl(components: &Components, identity: Identity) -> Result<CrawlReport> {
    components
        .worker()
        .handle(&DispatchMessage::recrawl(identity))
        .await
}

/// Run one reconciliation tick and crawl what it re-dispatched.
pub async fn run_reconcile(components: &Components) -> Result<(ReconcileReport, WorkerStats)> {
    let reconciler = components.reconciler();
    let pool = WorkerPool::start(components, components.config.crawler.max_concurrent).await?;
    let report = reconciler.tick(Utc::now()).await;
    let stats = pool.drain().await;
    Ok((report?, stats))
}

/// Rebuild derived views.
pub async fn run_build(components: &Components, target: BuildTarget) -> Result<Vec<(BuildTarget, ViewReport)>> {
    let mut reports = Vec::new();
    for target in target.expand() {
        let now = Utc::now();
        let report = match target {
            BuildTarget::Search => components.search_builder().build(now).await?,
            BuildTarget::Feeds => components.feed_builder().build(now).await?,
            BuildTarget::Homepage => components.homepage_builder().build(now).await?,
            BuildTarget::All => continue,
        };
        reports.push((target, report));
    }
    Ok(reports)
}

/// Record counts and cursor of one registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStatus {
    pub registry: RegistryKind,
    pub total: usize,
    pub pending: usize,
    pub crawled: usize,
    pub failed: usize,
    /// Eligible for recrawl right now
    pub due: usize,
    pub cursor: Option<String>,
}

/// Summarize the change store per registry.
pub async fn run_status(store: &dyn ChangeStore) -> Result<Vec<RegistryStatus>> {
    let now = Utc::now();
    let mut statuses = Vec::new();
    for kind in RegistryKind::ALL {
        let records = store
            .scan(&ScanFilter::all().in_registry(kind), ScanOrder::Identity, None)
            .await?;
        let mut status = RegistryStatus {
            registry: kind,
            total: records.len(),
            pending: 0,
            crawled: 0,
            failed: 0,
            due: 0,
            cursor: store.load_cursor(kind).await?,
        };
        for record in &records {
            match record.status {
                CrawlStatus::Pending => status.pending += 1,
                CrawlStatus::Crawled => status.crawled += 1,
                CrawlStatus::Failed => status.failed += 1,
            }
            if record.is_due(now) {
                status.due += 1;
            }
        }
        statuses.push(status);
    }
    Ok(statuses)
}
