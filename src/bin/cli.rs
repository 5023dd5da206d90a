//! Changelogs CLI
//!
//! Local execution entry point. For AWS Lambda, use `changelogs-lambda`.

use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use changelogs::{
    config,
    error::{AppError, Result},
    models::{Identity, RegistryKind},
    pipeline::{self, BuildTarget, Components},
    services::{CrawlReport, EdgeRouter, WatchReport, WorkerStats, views::search},
    utils::console,
};

/// changelogs - package registry changelog crawler
#[derive(Parser, Debug)]
#[command(
    name = "changelogs",
    version,
    about = "Watches package registries and publishes their changelogs"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run followers, pollers, workers, reconciler and view builders until Ctrl-C
    Serve,

    /// Poll one registry's recent releases and crawl what changed
    Poll {
        /// npm, pypi or rubygems
        registry: RegistryKind,
    },

    /// Follow the npm change feed
    Follow {
        /// Read a single batch and exit
        #[arg(long)]
        once: bool,
    },

    /// Crawl one package now, e.g. `npm:lodash`
    Crawl { identity: Identity },

    /// Re-dispatch records whose recrawl is due
    Reconcile,

    /// Rebuild derived views
    Build {
        /// search, feeds, homepage or all
        #[arg(default_value = "all")]
        target: BuildTarget,
    },

    /// Query the published search index
    Search {
        prefix: String,

        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Show where the edge router sends a request
    Route {
        /// Request path with optional query, e.g. `/search?q=lo`
        target: String,

        /// Cookie to send, as name=value
        #[arg(long = "cookie", value_parser = parse_cookie)]
        cookies: Vec<(String, String)>,
    },

    /// Show change store counts and cursors
    Status,

    /// Validate the configuration file
    Validate,
}

fn parse_cookie(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("cookie '{raw}' must be name=value"))
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn watch_summary(title: &str, report: &WatchReport, stats: &WorkerStats) {
    console::summary(
        title,
        &[
            ("seen", report.seen.to_string()),
            ("dispatched", report.dispatched.to_string()),
            ("already current", report.skipped.to_string()),
            ("newly discovered", report.discovered.to_string()),
            ("cursor", report.cursor.clone().unwrap_or_else(|| "-".into())),
        ],
    );
    crawl_summary(stats);
}

fn crawl_summary(stats: &WorkerStats) {
    console::summary(
        "Crawl",
        &[
            ("processed", stats.processed.to_string()),
            ("crawled", stats.crawled.to_string()),
            ("content changed", stats.changed.to_string()),
            ("failed", stats.failed.to_string()),
            ("errors", stats.errors.to_string()),
        ],
    );
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    log::info!("changelogs starting...");

    let config = config::load_config(&cli.config)?;
    log::info!("Loaded configuration from {}", cli.config.display());

    match cli.command {
        Command::Validate => {
            console::header("Validating configuration");
            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            EdgeRouter::new(config.routes.clone())?;
            console::sub_item(&format!("{} routes, catch-all last", config.routes.len()));
            log::info!("All validations passed!");
        }

        Command::Route { target, cookies } => {
            let router = EdgeRouter::new(config.routes.clone())?;
            let decision = router.route(&target, &cookies);
            console::summary(
                &format!("Route {}", target),
                &[
                    ("rule", format!("#{} {}", decision.rule, router.rules()[decision.rule].path_pattern)),
                    ("origin", format!("{:?}", decision.origin)),
                    ("path", decision.path.clone()),
                    ("query", decision.query.clone().unwrap_or_else(|| "-".into())),
                    (
                        "cookies",
                        decision
                            .cookies
                            .iter()
                            .map(|(name, _)| name.as_str())
                            .collect::<Vec<_>>()
                            .join(", "),
                    ),
                ],
            );
        }

        command => {
            config.validate()?;
            let components = Components::local(config)?;
            run(command, &components).await?;
        }
    }

    log::info!("Done!");

    Ok(())
}

async fn run(command: Command, components: &Components) -> Result<()> {
    match command {
        Command::Serve => {
            console::header("Serving");
            let stats = pipeline::run_serve(components, shutdown_signal()).await?;
            crawl_summary(&stats);
        }

        Command::Poll { registry } => {
            console::header(&format!("Polling {}", registry));
            let (report, stats) = pipeline::run_poll(components, registry).await?;
            watch_summary(&format!("Poll {}", registry), &report, &stats);
        }

        Command::Follow { once: true } => {
            console::header("Following npm (one batch)");
            let (report, stats) = pipeline::run_follow_once(components).await?;
            watch_summary("Follow npm", &report, &stats);
        }

        Command::Follow { once: false } => {
            console::header("Following npm until Ctrl-C");
            let stats = pipeline::run_follow(components, shutdown_signal()).await?;
            crawl_summary(&stats);
        }

        Command::Crawl { identity } => {
            console::header(&format!("Crawling {}", identity));
            match pipeline::run_crawl(components, identity.clone()).await? {
                CrawlReport::Crawled {
                    version,
                    outcome,
                    attempts,
                } => console::summary(
                    &identity.to_string(),
                    &[
                        ("version", version),
                        ("outcome", format!("{:?}", outcome)),
                        ("attempts", attempts.to_string()),
                    ],
                ),
                CrawlReport::Failed {
                    error,
                    transient,
                    attempts,
                } => {
                    console::summary(
                        &identity.to_string(),
                        &[
                            ("error", error.clone()),
                            ("transient", transient.to_string()),
                            ("attempts", attempts.to_string()),
                        ],
                    );
                    return Err(if transient {
                        AppError::transient(identity.registry(), error)
                    } else {
                        AppError::permanent(identity.registry(), error)
                    });
                }
            }
        }

        Command::Reconcile => {
            console::header("Reconciling");
            let (report, stats) = pipeline::run_reconcile(components).await?;
            if report.skipped {
                console::sub_item("Another instance holds the reconcile lease");
            }
            console::summary(
                "Reconcile",
                &[
                    ("due", report.due.to_string()),
                    ("dispatched", report.dispatched.to_string()),
                    ("failed", report.failed.to_string()),
                ],
            );
            crawl_summary(&stats);
        }

        Command::Build { target } => {
            console::header(&format!("Building {}", target));
            let reports = pipeline::run_build(components, target).await?;
            let total = reports.len();
            for (i, (target, report)) in reports.iter().enumerate() {
                let detail = if report.skipped {
                    "skipped, lease held elsewhere".to_string()
                } else {
                    format!("{} records, {} written", report.records, report.written)
                };
                console::step(i + 1, total, &format!("{}: {}", target, detail));
            }
        }

        Command::Search { prefix, limit } => {
            let hits = search::query(components.artifacts.as_ref(), &prefix, Utc::now(), limit).await?;
            console::header(&format!("Search \"{}\": {} hits", prefix, hits.len()));
            for hit in hits {
                console::sub_item(&format!("{} (score {})", hit.target, hit.score));
            }
        }

        Command::Status => {
            console::header("Change store");
            for status in pipeline::run_status(components.store.as_ref()).await? {
                console::summary(
                    status.registry.as_str(),
                    &[
                        ("records", status.total.to_string()),
                        ("pending", status.pending.to_string()),
                        ("crawled", status.crawled.to_string()),
                        ("failed", status.failed.to_string()),
                        ("due now", status.due.to_string()),
                        ("cursor", status.cursor.unwrap_or_else(|| "-".into())),
                    ],
                );
            }
        }

        Command::Validate | Command::Route { .. } => {}
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Could not listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
