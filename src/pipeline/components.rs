// src/pipeline/components.rs

//! Wiring of stores, bus, registries and services.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use crate::bus::{DispatchBus, MemoryBus};
use crate::error::Result;
use crate::models::{Config, RegistryKind};
use crate::registry::RegistrySet;
use crate::services::{
    BroadcastChannel, CrawlWorker, FeedBuilder, HomepageBuilder, LiveChannel, Reconciler,
    SearchIndexBuilder, Watcher,
};
use crate::storage::{ArtifactStore, ChangeStore, LocalArtifactStore, LocalChangeStore};
use crate::utils::http;

/// Everything one process needs to run any pipeline task.
#[derive(Clone)]
pub struct Components {
    pub config: Arc<Config>,
    pub store: Arc<dyn ChangeStore>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub bus: MemoryBus,
    pub registries: RegistrySet,
    pub live: Arc<dyn LiveChannel>,
    /// Lease holder name, unique per `Components` instance
    pub holder: String,
}

impl Components {
    pub fn new(
        config: Config,
        store: Arc<dyn ChangeStore>,
        artifacts: Arc<dyn ArtifactStore>,
        registries: RegistrySet,
        live: Arc<dyn LiveChannel>,
    ) -> Self {
        Self {
            bus: MemoryBus::new(config.dispatch.clone()),
            config: Arc::new(config),
            store,
            artifacts,
            registries,
            live,
            holder: default_holder(),
        }
    }

    /// Filesystem-backed components talking to the real registries.
    pub fn local(config: Config) -> Result<Self> {
        let client = http::create_async_client(&config.crawler)?;
        let registries = RegistrySet::from_config(&config, client);
        let store = Arc::new(LocalChangeStore::new(&config.storage.root));
        let artifacts = Arc::new(LocalArtifactStore::new(&config.storage.artifacts));
        Ok(Self::new(
            config,
            store,
            artifacts,
            registries,
            Arc::new(BroadcastChannel::default()),
        ))
    }

    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    fn dispatch_bus(&self) -> Arc<dyn DispatchBus> {
        Arc::new(self.bus.clone())
    }

    pub fn watcher(&self, kind: RegistryKind) -> Result<Watcher> {
        Ok(Watcher::new(
            self.registries.get(kind)?,
            Arc::clone(&self.store),
            self.dispatch_bus(),
            self.config.dispatch.pending_grace(),
        ))
    }

    pub fn worker(&self) -> CrawlWorker {
        CrawlWorker::new(
            self.config.crawler.clone(),
            self.registries.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.artifacts),
            Arc::clone(&self.live),
        )
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::clone(&self.store),
            self.dispatch_bus(),
            self.config.reconcile.clone(),
            self.holder.clone(),
        )
    }

    pub fn search_builder(&self) -> SearchIndexBuilder {
        SearchIndexBuilder::new(
            Arc::clone(&self.store),
            Arc::clone(&self.artifacts),
            self.config.views.clone(),
            self.holder.clone(),
        )
    }

    pub fn feed_builder(&self) -> FeedBuilder {
        FeedBuilder::new(
            Arc::clone(&self.store),
            Arc::clone(&self.artifacts),
            self.config.views.clone(),
            self.holder.clone(),
        )
    }

    pub fn homepage_builder(&self) -> HomepageBuilder {
        HomepageBuilder::new(
            Arc::clone(&self.store),
            Arc::clone(&self.artifacts),
            self.config.views.clone(),
            self.holder.clone(),
        )
    }
}

static HOLDER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Process id alone repeats across containers, so the start time and a
/// per-process sequence number are folded in.
fn default_holder() -> String {
    let started = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seq = HOLDER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("changelogs-{}-{:x}-{}", std::process::id(), started, seq)
}
