//! Hexcrawl main entry point
//!
//! This is the command-line interface for the Hexcrawl crawl orchestrator.

use anyhow::Context;
use clap::Parser;
use hexcrawl::config::{load_config_with_hash, Config, TargetConfig};
use hexcrawl::crawler::{Runner, TargetOutcome};
use hexcrawl::metrics::{self, CrawlMetrics, MetricsState};
use hexcrawl::notify::build_notifier;
use hexcrawl::output::{load_statistics, print_run_summary, print_statistics};
use hexcrawl::store::{JobStore, RunStatus, SqliteJobStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Hexcrawl: a polite, resumable crawl orchestrator
///
/// Hexcrawl crawls the targets of a TOML configuration with per-domain
/// politeness, concurrency limits and circuit breakers. Progress is kept in
/// SQLite so an interrupted crawl picks up where it stopped.
#[derive(Parser, Debug)]
#[command(name = "hexcrawl")]
#[command(version)]
#[command(about = "A polite, resumable crawl orchestrator", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Only run these targets (repeatable); defaults to every target
    #[arg(short, long = "target", value_name = "NAME")]
    targets: Vec<String>,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Resume an interrupted crawl (default behavior)
    #[arg(long, conflicts_with = "fresh")]
    resume: bool,

    /// Start a fresh run, abandoning any unfinished one
    #[arg(long, conflicts_with = "resume")]
    fresh: bool,

    /// Validate config and show what would be crawled without actually crawling
    #[arg(long, conflicts_with_all = ["stats", "requeue_failed", "daemon"])]
    dry_run: bool,

    /// Show statistics from the job store and exit
    #[arg(long, conflicts_with_all = ["dry_run", "requeue_failed"])]
    stats: bool,

    /// Move items parked as failed back to pending and exit
    #[arg(long, conflicts_with_all = ["dry_run", "stats", "daemon"])]
    requeue_failed: bool,

    /// Keep running, starting a crawl cycle every `[schedule] interval-minutes`
    #[arg(long, conflicts_with_all = ["once", "stats"])]
    daemon: bool,

    /// Run a single crawl cycle and exit (default behavior)
    #[arg(long, conflicts_with = "daemon")]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    let targets = select_targets(&config, &cli.targets)?;

    if cli.dry_run {
        handle_dry_run(&config, &targets)?;
        return Ok(());
    }

    let store: Arc<dyn JobStore> = Arc::new(
        SqliteJobStore::open(Path::new(&config.store.database_path)).with_context(|| {
            format!("Failed to open job store {}", config.store.database_path)
        })?,
    );

    if cli.stats {
        handle_stats(store.as_ref(), &targets)?;
    } else if cli.requeue_failed {
        handle_requeue_failed(store.as_ref(), &targets)?;
    } else {
        let daemon = cli.daemon && !cli.once;
        let failed = handle_crawl(&config, &config_hash, &targets, store, cli.fresh, daemon).await?;
        if failed > 0 {
            anyhow::bail!("{} target runs failed", failed);
        }
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("hexcrawl=info,warn"),
            1 => EnvFilter::new("hexcrawl=debug,info"),
            2 => EnvFilter::new("hexcrawl=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Resolves `--target` names against the configuration
fn select_targets<'a>(config: &'a Config, names: &[String]) -> anyhow::Result<Vec<&'a TargetConfig>> {
    if names.is_empty() {
        return Ok(config.targets.iter().collect());
    }
    names
        .iter()
        .map(|name| {
            config
                .target(name)
                .ok_or_else(|| anyhow::anyhow!("Unknown target '{}'", name))
        })
        .collect()
}

/// Handles the --dry-run mode: shows what each target would crawl
fn handle_dry_run(config: &Config, targets: &[&TargetConfig]) -> anyhow::Result<()> {
    println!("=== Hexcrawl Dry Run ===\n");
    println!("Job store: {}", config.store.database_path);
    println!(
        "Notifications: log={}, webhook={}",
        config.notify.log,
        config.notify.webhook_url.as_deref().unwrap_or("none")
    );
    println!(
        "Metrics endpoint: {}",
        config.metrics.bind.as_deref().unwrap_or("off")
    );
    println!("Daemon interval: {} minutes", config.schedule.interval_minutes);

    for target in targets {
        println!("\nTarget '{}' ({} mode)", target.name, target.mode);
        println!("  Base URL: {}", target.base_url);
        println!(
            "  Concurrency: {} global, {} per domain",
            target.concurrency.global, target.concurrency.per_domain
        );
        println!(
            "  Delay: {}ms base, {:.0}% jitter",
            target.rate_limit.base_delay_ms,
            target.rate_limit.jitter_fraction * 100.0
        );
        println!(
            "  Retries: {} (permanent errors -> {:?})",
            target.retry.ceiling, target.retry.permanent_errors
        );
        println!(
            "  Breaker: open after {} failures within {}s, cooldown {}s",
            target.breaker.failure_threshold,
            target.breaker.failure_window_seconds,
            target.breaker.cooldown_seconds
        );
        println!("  Pagination: {:?}, up to {} pages", target.pagination.rule(), target.pagination.max_pages);
        println!("  Allowed domains: {}", target.scope().patterns().join(", "));
        println!("  Start URLs:");
        for url in target.start_urls()? {
            println!("    * {}", url);
        }
    }

    println!("\n✓ Configuration is valid");
    Ok(())
}

/// Handles the --stats mode: shows per-target statistics from the job store
fn handle_stats(store: &dyn JobStore, targets: &[&TargetConfig]) -> anyhow::Result<()> {
    for target in targets {
        let stats = load_statistics(store, &target.name)?;
        print_statistics(&stats);
    }
    Ok(())
}

fn handle_requeue_failed(store: &dyn JobStore, targets: &[&TargetConfig]) -> anyhow::Result<()> {
    for target in targets {
        let moved = store.requeue_failed(&target.name)?;
        println!("Target '{}': {} failed items moved back to pending", target.name, moved);
    }
    Ok(())
}

/// Handles the main crawl operation
///
/// Every selected target runs concurrently. With `daemon` the cycle repeats
/// on the configured schedule until Ctrl-C. Returns the number of target
/// runs that ended in an error.
async fn handle_crawl(
    config: &Config,
    config_hash: &str,
    targets: &[&TargetConfig],
    store: Arc<dyn JobStore>,
    fresh: bool,
    daemon: bool,
) -> anyhow::Result<usize> {
    if fresh {
        tracing::info!("Starting fresh runs (ignoring previous state)");
    } else {
        tracing::info!("Starting crawl (will resume unfinished runs)");
    }

    let notifier = build_notifier(&config.notify)?;
    let crawl_metrics = Arc::new(CrawlMetrics::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = match &config.metrics.bind {
        Some(bind) => {
            let listener = TcpListener::bind(bind)
                .await
                .with_context(|| format!("Failed to bind metrics endpoint {}", bind))?;
            let state = MetricsState {
                metrics: Arc::clone(&crawl_metrics),
                store: Arc::clone(&store),
            };
            Some(tokio::spawn(metrics::serve(listener, state, shutdown_rx.clone())))
        }
        None => None,
    };

    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing in-flight fetches");
            let _ = ctrl_c_tx.send(true);
        }
    });

    let runner = Runner::new(config.clone(), store, notifier, shutdown_rx)
        .with_targets(targets.iter().map(|t| t.name.clone()).collect())
        .with_config_hash(config_hash)
        .with_metrics(crawl_metrics);

    let mut failed = 0;
    if daemon {
        let every = config.schedule.interval();
        tracing::info!("Running every {} minutes until interrupted", config.schedule.interval_minutes);
        runner
            .run_every(every, fresh, None, |cycle, outcomes| {
                println!("\n=== Crawl cycle {} ===", cycle);
                failed += report_outcomes(outcomes);
            })
            .await;
    } else {
        failed = report_outcomes(&runner.run_once(fresh).await);
    }

    let _ = shutdown_tx.send(true);
    if let Some(server) = server {
        match server.await {
            Ok(Err(e)) => tracing::error!("Metrics endpoint failed: {}", e),
            Err(e) => tracing::error!("Metrics endpoint task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }
    Ok(failed)
}

/// Prints each run's summary and returns how many runs failed
fn report_outcomes(outcomes: &[TargetOutcome]) -> usize {
    let mut failed = 0;
    for (name, outcome) in outcomes {
        match outcome {
            Ok(summary) => {
                if summary.status == RunStatus::Blocked {
                    tracing::warn!(
                        "Target '{}' stopped with every domain open; rerun to resume",
                        summary.target
                    );
                }
                print_run_summary(summary);
            }
            Err(e) => {
                tracing::error!("Target '{}' failed: {}", name, e);
                failed += 1;
            }
        }
    }
    failed
}
