// src/services/watcher.rs

//! Registry watchers.
//!
//! A watcher turns a registry's change listing into dispatch messages:
//! - **polling** (`poll_once`): fetch the recent-release snapshot and
//!   dispatch every identity whose version differs from the store
//! - **following** (`follow_once` / `follow`): read the change feed from
//!   the persisted cursor and only advance the cursor after the whole
//!   batch was handled
//!
//! Overlapping runs may dispatch the same identity twice; crawl workers
//! absorb duplicates.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::bus::DispatchBus;
use crate::error::{AppError, Result};
use crate::models::{DispatchMessage, Identity, RecordPatch, RegistryKind, version_differs};
use crate::registry::{ChangeBatch, Registry};
use crate::storage::ChangeStore;

/// Result of handling one change listing.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WatchReport {
    /// Distinct identities in the listing
    pub seen: usize,
    pub dispatched: usize,
    /// Already current in the store
    pub skipped: usize,
    /// New Pending records
    pub discovered: usize,
    /// Cursor after this batch, for feed followers
    pub cursor: Option<String>,
}

/// Watches one registry.
pub struct Watcher {
    registry: Arc<dyn Registry>,
    store: Arc<dyn ChangeStore>,
    bus: Arc<dyn DispatchBus>,
    /// How long a fresh Pending record waits before reconciliation re-dispatches it
    pending_grace: chrono::Duration,
}

impl Watcher {
    pub fn new(
        registry: Arc<dyn Registry>,
        store: Arc<dyn ChangeStore>,
        bus: Arc<dyn DispatchBus>,
        pending_grace: chrono::Duration,
    ) -> Self {
        Self {
            registry,
            store,
            bus,
            pending_grace,
        }
    }

    pub fn kind(&self) -> RegistryKind {
        self.registry.kind()
    }

    /// Fetch the recent-release listing once and dispatch what changed.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<WatchReport> {
        let batch = self.registry.fetch_recent_changes(None).await?;
        let report = self.process_batch(&batch, now).await?;
        info!(
            "[{}] poll: {} seen, {} dispatched, {} current",
            self.kind(),
            report.seen,
            report.dispatched,
            report.skipped
        );
        Ok(report)
    }

    /// Read one page of the change feed from the stored cursor.
    ///
    /// The cursor is persisted only when every change in the page was
    /// recorded and dispatched; on error the same page is read again.
    pub async fn follow_once(&self, now: DateTime<Utc>) -> Result<WatchReport> {
        let kind = self.kind();
        let cursor = self.store.load_cursor(kind).await?;
        let batch = self.registry.fetch_recent_changes(cursor.as_deref()).await?;
        let mut report = self.process_batch(&batch, now).await?;

        if let Some(next) = batch.next_cursor.as_deref() {
            if cursor.as_deref() != Some(next) {
                self.store.save_cursor(kind, next).await?;
                debug!("[{}] cursor advanced to {}", kind, next);
            }
        }
        report.cursor = batch.next_cursor.or(cursor);

        if report.seen > 0 {
            info!(
                "[{}] follow: {} seen, {} dispatched, cursor {}",
                kind,
                report.seen,
                report.dispatched,
                report.cursor.as_deref().unwrap_or("-")
            );
        }
        Ok(report)
    }

    /// Follow the change feed until shutdown, reconnecting with capped
    /// exponential backoff after failures.
    pub async fn follow(&self, reconnect_max: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let result = tokio::select! {
                result = self.follow_once(Utc::now()) => result,
                _ = shutdown.changed() => break,
            };

            match result {
                Ok(_) => failures = 0,
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let delay = reconnect_delay(failures, reconnect_max);
                    warn!(
                        "[{}] change feed failed ({} in a row), reconnecting in {:?}: {}",
                        self.kind(),
                        failures,
                        delay,
                        err
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => break,
                    }
                }
            }
        }
        info!("[{}] follower stopped", self.kind());
    }

    async fn process_batch(&self, batch: &ChangeBatch, now: DateTime<Utc>) -> Result<WatchReport> {
        let kind = self.kind();

        // Latest entry per identity within the batch.
        let mut latest: BTreeMap<Identity, Option<String>> = BTreeMap::new();
        for change in &batch.changes {
            if change.deleted {
                debug!("[{}] ignoring deleted {}", kind, change.name);
                continue;
            }
            match Identity::new(kind, &change.name) {
                Ok(identity) => {
                    latest.insert(identity, change.version.clone());
                }
                Err(err) => warn!("[{}] skipping {:?}: {}", kind, change.name, err),
            }
        }

        let mut report = WatchReport {
            seen: latest.len(),
            ..WatchReport::default()
        };
        let mut delivery_error: Option<AppError> = None;

        for (identity, version) in latest {
            let existing = self.store.get(&identity).await?;
            if let Some(record) = &existing {
                if !version_differs(record, version.as_deref()) {
                    report.skipped += 1;
                    continue;
                }
            }

            let patch = RecordPatch::Discover {
                next_eligible_at: now + self.pending_grace,
            };
            if let Some(upserted) = self.store.upsert(&identity, &patch, now).await? {
                if upserted.outcome.content_changed() {
                    report.discovered += 1;
                }
            }

            match self.bus.publish(DispatchMessage::discovered(identity)).await {
                Ok(()) => report.dispatched += 1,
                Err(err) => {
                    error!("[{}] dispatch failed: {}", kind, err);
                    delivery_error.get_or_insert(err);
                }
            }
        }

        match delivery_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

/// `2^(failures-1)` seconds, capped.
fn reconnect_delay(failures: u32, max: Duration) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    Duration::from_secs(1u64 << exp).min(max)
}
