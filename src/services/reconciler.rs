// src/services/reconciler.rs

//! Reconciliation scheduler.
//!
//! Each tick re-dispatches records whose next eligibility has passed,
//! oldest first and at most `per_tick_cap` of them, then pushes their
//! eligibility out by a grace period so the next tick does not send them
//! again while the crawl is in flight.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info};

use crate::bus::DispatchBus;
use crate::error::Result;
use crate::models::{DispatchMessage, RecordPatch, ReconcileConfig};
use crate::storage::{ChangeStore, ScanFilter, ScanOrder};

/// Lease name shared by every reconciler instance.
pub const RECONCILE_LEASE: &str = "reconcile";

/// Result of one reconciliation tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Another instance held the tick lease
    pub skipped: bool,
    pub due: usize,
    pub dispatched: usize,
    pub failed: usize,
}

pub struct Reconciler {
    store: Arc<dyn ChangeStore>,
    bus: Arc<dyn DispatchBus>,
    config: ReconcileConfig,
    holder: String,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ChangeStore>,
        bus: Arc<dyn DispatchBus>,
        config: ReconcileConfig,
        holder: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            holder: holder.into(),
        }
    }

    /// Run one tick as of `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let lease_ttl = Duration::seconds(self.config.lease_secs as i64);
        if !self
            .store
            .try_acquire_lease(RECONCILE_LEASE, &self.holder, lease_ttl, now)
            .await?
        {
            debug!("Reconcile tick skipped, lease held elsewhere");
            return Ok(ReconcileReport {
                skipped: true,
                ..ReconcileReport::default()
            });
        }

        let result = self.redispatch_due(now).await;
        self.store.release_lease(RECONCILE_LEASE, &self.holder).await?;
        result
    }

    async fn redispatch_due(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let due = self
            .store
            .scan(
                &ScanFilter::due(now),
                ScanOrder::NextEligibleAsc,
                Some(self.config.per_tick_cap),
            )
            .await?;

        let mut report = ReconcileReport {
            due: due.len(),
            ..ReconcileReport::default()
        };
        let grace = Duration::seconds(self.config.redispatch_grace_secs as i64);

        for record in due {
            let identity = record.identity;
            match self.bus.publish(DispatchMessage::recrawl(identity.clone())).await {
                Ok(()) => {
                    report.dispatched += 1;
                    let patch = RecordPatch::Reschedule {
                        next_eligible_at: now + grace,
                    };
                    self.store.upsert(&identity, &patch, now).await?;
                }
                Err(err) => {
                    // Left due, so the next tick tries again.
                    report.failed += 1;
                    error!("Re-dispatch of {} failed: {}", identity, err);
                }
            }
        }

        if report.due > 0 {
            info!(
                "Reconcile: {} due, {} re-dispatched, {} failed",
                report.due, report.dispatched, report.failed
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBus, Subscription};
    use crate::models::{ChangelogRecord, CrawlStatus, DispatchCause, DispatchConfig, Identity};
    use crate::storage::MemoryChangeStore;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn failed(name: &str, next: i64) -> ChangelogRecord {
        let mut record = ChangelogRecord::pending(name.parse().unwrap(), t(0), t(next));
        record.status = CrawlStatus::Failed;
        record
    }

    fn config(cap: usize) -> ReconcileConfig {
        ReconcileConfig {
            per_tick_cap: cap,
            redispatch_grace_secs: 600,
            ..ReconcileConfig::default()
        }
    }

    async fn drain(sub: &mut Box<dyn Subscription>, bus: &MemoryBus) -> Vec<Identity> {
        let mut out = Vec::new();
        while bus.outstanding() > 0 {
            let delivery = sub.next().await.unwrap();
            assert_eq!(delivery.message.cause, DispatchCause::RecrawlDue);
            out.push(delivery.message.identity.clone());
            sub.ack(&delivery).await.unwrap();
        }
        out
    }

    #[tokio::test]
    async fn test_failed_record_redispatched_only_when_due() {
        let store = Arc::new(MemoryChangeStore::new());
        let bus = MemoryBus::new(DispatchConfig::default());
        let mut sub = bus.subscribe().await.unwrap();
        store.insert(failed("npm:broken", 100)).await;
        let reconciler = Reconciler::new(store.clone(), Arc::new(bus.clone()), config(10), "test");

        let early = reconciler.tick(t(99)).await.unwrap();
        assert_eq!(early.dispatched, 0);
        assert_eq!(bus.outstanding(), 0);

        let due = reconciler.tick(t(100)).await.unwrap();
        assert_eq!(due.dispatched, 1);
        assert_eq!(drain(&mut sub, &bus).await, vec!["npm:broken".parse::<Identity>().unwrap()]);

        // Rescheduled by the grace period, so not sent again right away.
        let record = store.get(&"npm:broken".parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(record.next_eligible_at, t(700));
        assert_eq!(reconciler.tick(t(101)).await.unwrap().dispatched, 0);
    }

    #[tokio::test]
    async fn test_cap_takes_oldest_first() {
        let store = Arc::new(MemoryChangeStore::new());
        let bus = MemoryBus::new(DispatchConfig::default());
        let mut sub = bus.subscribe().await.unwrap();
        for (name, next) in [("npm:c", 30), ("npm:a", 10), ("npm:b", 20), ("npm:d", 40)] {
            store.insert(failed(name, next)).await;
        }
        let reconciler = Reconciler::new(store.clone(), Arc::new(bus.clone()), config(2), "test");

        let report = reconciler.tick(t(1_000)).await.unwrap();
        assert_eq!((report.due, report.dispatched), (2, 2));
        let sent: Vec<String> = drain(&mut sub, &bus).await.iter().map(|i| i.to_string()).collect();
        let mut sorted = sent.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["npm:a", "npm:b"]);
    }

    #[tokio::test]
    async fn test_lease_held_elsewhere_skips_tick() {
        let store = Arc::new(MemoryChangeStore::new());
        let bus = MemoryBus::new(DispatchConfig::default());
        store.insert(failed("npm:x", 0)).await;
        store
            .try_acquire_lease(RECONCILE_LEASE, "other", Duration::seconds(30), t(0))
            .await
            .unwrap();

        let reconciler = Reconciler::new(store.clone(), Arc::new(bus.clone()), config(10), "me");
        assert!(reconciler.tick(t(5)).await.unwrap().skipped);
        assert_eq!(bus.outstanding(), 0);
    }
}
