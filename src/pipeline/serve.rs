// src/pipeline/serve.rs

//! Long-running in-process runtime.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinSet;

use super::{Components, WorkerPool, run_every};
use crate::error::Result;
use crate::models::RegistryKind;
use crate::services::WorkerStats;

/// Run every component until `shutdown` resolves: the npm follower, the
/// PyPI and RubyGems pollers, the crawl worker pool, the reconciler and
/// the three view builders.
pub async fn run_serve<S>(components: &Components, shutdown: S) -> Result<WorkerStats>
where
    S: Future<Output = ()>,
{
    let config = Arc::clone(&components.config);
    let (stop_tx, stop_rx) = watch::channel(false);
    let pool = WorkerPool::start(components, config.crawler.max_concurrent).await?;
    let mut tasks = JoinSet::new();

    let follower = components.watcher(RegistryKind::Npm)?;
    let reconnect_max = Duration::from_secs(config.registries.npm.reconnect_max_secs);
    let rx = stop_rx.clone();
    tasks.spawn(async move { follower.follow(reconnect_max, rx).await });

    for (kind, interval_secs) in [
        (RegistryKind::Pypi, config.registries.pypi.poll_interval_secs),
        (RegistryKind::Rubygems, config.registries.rubygems.poll_interval_secs),
    ] {
        let watcher = Arc::new(components.watcher(kind)?);
        let rx = stop_rx.clone();
        tasks.spawn(async move {
            run_every(format!("poll {kind}"), Duration::from_secs(interval_secs), rx, move || {
                let watcher = Arc::clone(&watcher);
                async move { watcher.poll_once(Utc::now()).await }
            })
            .await;
        });
    }

    let reconciler = Arc::new(components.reconciler());
    let rx = stop_rx.clone();
    let interval = Duration::from_secs(config.reconcile.interval_secs);
    tasks.spawn(async move {
        run_every("reconcile", interval, rx, move || {
            let reconciler = Arc::clone(&reconciler);
            async move { reconciler.tick(Utc::now()).await }
        })
        .await;
    });

    let search = Arc::new(components.search_builder());
    let rx = stop_rx.clone();
    let interval = Duration::from_secs(config.views.search_interval_secs);
    tasks.spawn(async move {
        run_every("search index", interval, rx, move || {
            let search = Arc::clone(&search);
            async move { search.build(Utc::now()).await }
        })
        .await;
    });

    let feeds = Arc::new(components.feed_builder());
    let rx = stop_rx.clone();
    let interval = Duration::from_secs(config.views.feed_interval_secs);
    tasks.spawn(async move {
        run_every("feeds", interval, rx, move || {
            let feeds = Arc::clone(&feeds);
            async move { feeds.build(Utc::now()).await }
        })
        .await;
    });

    let homepage = Arc::new(components.homepage_builder());
    let interval = Duration::from_secs(config.views.homepage_interval_secs);
    tasks.spawn(async move {
        run_every("homepage", interval, stop_rx, move || {
            let homepage = Arc::clone(&homepage);
            async move { homepage.build(Utc::now()).await }
        })
        .await;
    });

    log::info!(
        "Serving: npm follower, 2 pollers, {} crawl workers, reconciler, 3 view builders",
        pool.size()
    );
    shutdown.await;
    log::info!("Shutting down, waiting for in-flight work");

    stop_tx.send_replace(true);
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            log::error!("Task ended abnormally: {}", e);
        }
    }
    Ok(pool.drain().await)
}
