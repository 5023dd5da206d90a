//! AWS Lambda entry point for the changelog pipeline
//!
//! Deploy with `cargo lambda build --release --features lambda`.
//! Each scheduled rule invokes the function with one task, e.g.
//! `{"task": "poll", "registry": "pypi"}` or `{"task": "build_search"}`.

use changelogs::lambda::handler;
use lambda_runtime::{Error as LambdaError, service_fn};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Main entry point for the AWS Lambda function.
#[tokio::main]
async fn main() -> Result<(), LambdaError> {
    // `log` records from the library are bridged in by the subscriber.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json().without_time())
        .init();

    info!("changelogs Lambda starting...");
    lambda_runtime::run(service_fn(handler)).await
}
