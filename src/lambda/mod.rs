// src/lambda/mod.rs

//! AWS Lambda handler for the changelog pipeline.
//!
//! Each invocation runs one scheduled task against S3-backed stores:
//! 1. Loads `config.toml` from the bucket (defaults when absent)
//! 2. Runs the requested watcher, reconciler, crawl or view builder
//! 3. Drains the invocation's dispatch bus with a crawl worker pool

use std::sync::Arc;

use lambda_runtime::{Error as LambdaError, LambdaEvent};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::config::RemoteConfigLoader;
use crate::error::{AppError, Result};
use crate::models::{Identity, RegistryKind};
use crate::pipeline::{self, BuildTarget, Components};
use crate::registry::RegistrySet;
use crate::services::{BroadcastChannel, CrawlReport, WorkerStats};
use crate::storage::s3::{S3ArtifactStore, S3ChangeStore};
use crate::utils::http;

/// Scheduled unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LambdaTask {
    Poll,
    Follow,
    Crawl,
    Reconcile,
    BuildSearch,
    BuildFeeds,
    BuildHomepage,
}

/// Lambda invocation payload.
#[derive(Debug, Deserialize)]
pub struct TaskRequest {
    pub task: LambdaTask,

    /// Registry to poll (`poll` only)
    #[serde(default)]
    pub registry: Option<RegistryKind>,

    /// Package to crawl (`crawl` only)
    #[serde(default)]
    pub identity: Option<Identity>,
}

/// Lambda response payload.
#[derive(Debug, Serialize)]
pub struct TaskResponse {
    /// Whether the task completed
    pub success: bool,

    pub task: LambdaTask,

    /// Messages published to the crawl workers
    pub dispatched: usize,

    /// Identities crawled successfully
    pub crawled: usize,

    /// Error message if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Execution time in milliseconds
    pub execution_time_ms: u64,
}

impl TaskResponse {
    fn new(task: LambdaTask) -> Self {
        Self {
            success: false,
            task,
            dispatched: 0,
            crawled: 0,
            error: None,
            execution_time_ms: 0,
        }
    }

    fn with_crawl(mut self, dispatched: usize, stats: &WorkerStats) -> Self {
        self.dispatched = dispatched;
        self.crawled = stats.crawled;
        self
    }
}

/// Main Lambda handler function.
#[instrument(skip(event))]
pub async fn handler(event: LambdaEvent<TaskRequest>) -> std::result::Result<TaskResponse, LambdaError> {
    let start = std::time::Instant::now();
    let (request, context) = event.into_parts();
    let task = request.task;

    info!(
        "Starting task {:?}: registry={:?}, identity={:?}",
        task, request.registry, request.identity
    );

    let components = match build_components().await {
        // Concurrent environments can share a pid; the request id is unique.
        Ok(components) => components.with_holder(invocation_holder(&context.request_id)),
        Err(e) => {
            error!("Initialization failed: {}", e);
            return Ok(TaskResponse {
                error: Some(e.to_string()),
                execution_time_ms: start.elapsed().as_millis() as u64,
                ..TaskResponse::new(task)
            });
        }
    };

    match run_task(&components, &request).await {
        Ok(mut response) => {
            response.success = true;
            response.execution_time_ms = start.elapsed().as_millis() as u64;
            info!(
                "Task {:?} completed: {} dispatched, {} crawled in {}ms",
                task, response.dispatched, response.crawled, response.execution_time_ms
            );
            Ok(response)
        }
        Err(e) => {
            error!("Task {:?} failed: {}", task, e);
            Ok(TaskResponse {
                error: Some(e.to_string()),
                execution_time_ms: start.elapsed().as_millis() as u64,
                ..TaskResponse::new(task)
            })
        }
    }
}

/// Lease holder for one invocation.
pub fn invocation_holder(request_id: &str) -> String {
    format!("changelogs-lambda-{request_id}")
}

/// S3 stores, bucket configuration and live registry clients.
async fn build_components() -> Result<Components> {
    let config_store = Arc::new(S3ArtifactStore::from_env_at("config").await?);
    let config = RemoteConfigLoader::from_env(config_store).load_config().await?;

    let client = http::create_async_client(&config.crawler)?;
    let registries = RegistrySet::from_config(&config, client);
    let store = Arc::new(S3ChangeStore::from_env().await?);
    let artifacts = Arc::new(S3ArtifactStore::from_env().await?);

    Ok(Components::new(
        config,
        store,
        artifacts,
        registries,
        Arc::new(BroadcastChannel::default()),
    ))
}

/// Run one task.
pub async fn run_task(components: &Components, request: &TaskRequest) -> Result<TaskResponse> {
    let response = TaskResponse::new(request.task);
    match request.task {
        LambdaTask::Poll => {
            let registry = request
                .registry
                .ok_or_else(|| AppError::validation("poll needs a registry"))?;
            let (report, stats) = pipeline::run_poll(components, registry).await?;
            Ok(response.with_crawl(report.dispatched, &stats))
        }
        LambdaTask::Follow => {
            let (report, stats) = pipeline::run_follow_once(components).await?;
            Ok(response.with_crawl(report.dispatched, &stats))
        }
        LambdaTask::Crawl => {
            let identity = request
                .identity
                .clone()
                .ok_or_else(|| AppError::validation("crawl needs an identity"))?;
            let registry = identity.registry();
            match pipeline::run_crawl(components, identity).await? {
                CrawlReport::Crawled { .. } => Ok(TaskResponse { crawled: 1, ..response }),
                CrawlReport::Failed {
                    error,
                    transient: true,
                    ..
                } => Err(AppError::transient(registry, error)),
                CrawlReport::Failed { error, .. } => Err(AppError::permanent(registry, error)),
            }
        }
        LambdaTask::Reconcile => {
            let (report, stats) = pipeline::run_reconcile(components).await?;
            Ok(response.with_crawl(report.dispatched, &stats))
        }
        LambdaTask::BuildSearch => build(components, BuildTarget::Search, response).await,
        LambdaTask::BuildFeeds => build(components, BuildTarget::Feeds, response).await,
        LambdaTask::BuildHomepage => build(components, BuildTarget::Homepage, response).await,
    }
}

async fn build(components: &Components, target: BuildTarget, response: TaskResponse) -> Result<TaskResponse> {
    for (target, report) in pipeline::run_build(components, target).await? {
        info!(
            "Built {}: skipped={}, records={}, written={}",
            target, report.skipped, report.records, report.written
        );
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Config;
    use crate::registry::testing::FakeRegistry;
    use crate::registry::{ChangeBatch, ChangeEvent};
    use crate::storage::{MemoryArtifactStore, MemoryChangeStore};

    fn components(registry: Arc<FakeRegistry>) -> Components {
        Components::new(
            Config::default(),
            Arc::new(MemoryChangeStore::new()),
            Arc::new(MemoryArtifactStore::new()),
            RegistrySet::new().with(registry),
            Arc::new(BroadcastChannel::default()),
        )
    }

    #[test]
    fn test_poll_request() {
        let json = r#"{"task": "poll", "registry": "pypi"}"#;
        let req: TaskRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.task, LambdaTask::Poll);
        assert_eq!(req.registry, Some(RegistryKind::Pypi));
        assert!(req.identity.is_none());
    }

    #[test]
    fn test_crawl_request_normalizes_identity() {
        let json = r#"{"task": "crawl", "identity": "pypi:Zope.Interface"}"#;
        let req: TaskRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.identity.unwrap().to_string(), "pypi:zope-interface");
    }

    #[test]
    fn test_build_task_names() {
        let req: TaskRequest = serde_json::from_str(r#"{"task": "build_homepage"}"#).unwrap();
        assert_eq!(req.task, LambdaTask::BuildHomepage);
        assert!(serde_json::from_str::<TaskRequest>(r#"{"task": "map"}"#).is_err());
    }

    #[tokio::test]
    async fn test_concurrent_invocations_hold_distinct_leases() {
        use crate::services::reconciler::RECONCILE_LEASE;
        use crate::storage::ChangeStore;

        let store = Arc::new(MemoryChangeStore::new());
        let build = |request_id: &str| {
            Components::new(
                Config::default(),
                store.clone(),
                Arc::new(MemoryArtifactStore::new()),
                RegistrySet::new(),
                Arc::new(BroadcastChannel::default()),
            )
            .with_holder(invocation_holder(request_id))
        };
        let first = build("8a1f-0001");
        let second = build("8a1f-0002");
        assert_ne!(first.holder, second.holder);

        let now = chrono::Utc::now();
        let ttl = chrono::Duration::seconds(30);
        assert!(store.try_acquire_lease(RECONCILE_LEASE, &first.holder, ttl, now).await.unwrap());
        assert!(!store.try_acquire_lease(RECONCILE_LEASE, &second.holder, ttl, now).await.unwrap());

        let request = TaskRequest {
            task: LambdaTask::Reconcile,
            registry: None,
            identity: None,
        };
        let response = run_task(&second, &request).await.unwrap();
        assert_eq!(response.dispatched, 0);
    }

    #[test]
    fn test_response_omits_empty_error() {
        let response = TaskResponse::new(LambdaTask::Reconcile);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["task"], "reconcile");
        assert!(json.get("error").is_none());
    }

    #[tokio::test]
    async fn test_poll_task_crawls_what_it_dispatched() {
        let registry = Arc::new(FakeRegistry::new(RegistryKind::Pypi));
        registry.release("requests", "2.32.0", "## 2.32.0\n- fixes");
        registry.push_batch(ChangeBatch {
            changes: vec![ChangeEvent::new("requests", Some("2.32.0".into()))],
            next_cursor: None,
        });

        let request = TaskRequest {
            task: LambdaTask::Poll,
            registry: Some(RegistryKind::Pypi),
            identity: None,
        };
        let response = run_task(&components(registry), &request).await.unwrap();
        assert_eq!((response.dispatched, response.crawled), (1, 1));
    }

    #[tokio::test]
    async fn test_task_missing_argument_is_an_error() {
        let components = components(Arc::new(FakeRegistry::new(RegistryKind::Npm)));
        let request = TaskRequest {
            task: LambdaTask::Crawl,
            registry: None,
            identity: None,
        };
        assert!(run_task(&components, &request).await.is_err());
    }
}
