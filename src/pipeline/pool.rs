// src/pipeline/pool.rs

//! Crawl worker pool on the in-process bus.

use std::sync::Arc;

use tokio::task::JoinHandle;

use super::Components;
use crate::bus::{DispatchBus, MemoryBus};
use crate::error::Result;
use crate::services::WorkerStats;

/// `size` crawl workers sharing one subscription queue.
pub struct WorkerPool {
    bus: MemoryBus,
    handles: Vec<JoinHandle<WorkerStats>>,
}

impl WorkerPool {
    pub async fn start(components: &Components, size: usize) -> Result<Self> {
        let worker = Arc::new(components.worker());
        let mut handles = Vec::with_capacity(size.max(1));
        for _ in 0..size.max(1) {
            let subscription = components.bus.subscribe().await?;
            let worker = Arc::clone(&worker);
            handles.push(tokio::spawn(async move { worker.run(subscription).await }));
        }
        log::debug!("Started {} crawl workers", handles.len());
        Ok(Self {
            bus: components.bus.clone(),
            handles,
        })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait until every dispatched message is settled, then stop the
    /// workers and total their stats. The bus accepts nothing afterwards.
    pub async fn drain(self) -> WorkerStats {
        self.bus.wait_idle().await;
        self.bus.close();

        let mut total = WorkerStats::default();
        for handle in self.handles {
            match handle.await {
                Ok(stats) => total.merge(stats),
                Err(e) => log::error!("Crawl worker panicked: {}", e),
            }
        }

        let dead = self.bus.dead_letters().await;
        if !dead.is_empty() {
            log::error!("{} messages were dead-lettered", dead.len());
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Config, DispatchMessage, Identity, RegistryKind};
    use crate::registry::RegistrySet;
    use crate::registry::testing::FakeRegistry;
    use crate::services::BroadcastChannel;
    use crate::storage::{MemoryArtifactStore, MemoryChangeStore};

    #[tokio::test]
    async fn test_drain_waits_for_every_message() {
        let registry = Arc::new(FakeRegistry::new(RegistryKind::Npm));
        for name in ["a", "b", "c"] {
            registry.release(name, "1.0.0", "notes");
        }
        let store = Arc::new(MemoryChangeStore::new());
        let components = Components::new(
            Config::default(),
            store.clone(),
            Arc::new(MemoryArtifactStore::new()),
            RegistrySet::new().with(registry),
            Arc::new(BroadcastChannel::default()),
        );

        let pool = WorkerPool::start(&components, 2).await.unwrap();
        assert_eq!(pool.size(), 2);
        for name in ["a", "b", "c", "missing"] {
            let identity = Identity::new(RegistryKind::Npm, name).unwrap();
            components.bus.publish(DispatchMessage::discovered(identity)).await.unwrap();
        }

        let stats = pool.drain().await;
        assert_eq!(stats.processed, 4);
        assert_eq!(stats.crawled, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(components.bus.outstanding(), 0);
    }
}
