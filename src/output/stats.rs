//! Statistics from the job store and end-of-run reporting

use crate::crawler::RunSummary;
use crate::state::{BreakerState, ItemStatus};
use crate::store::{DomainCounts, JobRun, JobStore, StatusCounts, StoreResult};

/// Persisted progress of one target
#[derive(Debug, Clone)]
pub struct TargetStatistics {
    pub target: String,
    pub run: Option<JobRun>,
    pub counts: StatusCounts,
    pub domains: Vec<DomainCounts>,
    /// Domains whose last persisted breaker state is open or half-open
    pub tripped_domains: Vec<String>,
}

/// Loads statistics for a target's latest run
pub fn load_statistics(store: &dyn JobStore, target: &str) -> StoreResult<TargetStatistics> {
    let run = store.active_run(target)?;
    let counts = store.snapshot_counts(target)?;
    let domains = store.domain_counts(target)?;
    let tripped_domains = store
        .load_domain_states(target)?
        .into_iter()
        .filter(|state| state.breaker != BreakerState::Closed)
        .map(|state| state.domain)
        .collect();

    Ok(TargetStatistics {
        target: target.to_string(),
        run,
        counts,
        domains,
        tripped_domains,
    })
}

fn print_counts(counts: &StatusCounts) {
    let total = counts.total();
    for status in ItemStatus::ALL {
        let count = counts.get(status);
        let percentage = if total > 0 {
            (count as f64 / total as f64) * 100.0
        } else {
            0.0
        };
        println!("  {:<10} {:>8} ({:.1}%)", status, count, percentage);
    }
    println!("  {:<10} {:>8}", "total", total);
}

/// Prints statistics to stdout
pub fn print_statistics(stats: &TargetStatistics) {
    println!("=== Target '{}' ===\n", stats.target);

    match &stats.run {
        Some(run) => {
            println!("Latest run: #{} ({})", run.id, run.status.to_db_string());
            println!("  Started:  {}", run.started_at);
            if let Some(finished) = &run.finished_at {
                println!("  Finished: {}", finished);
            }
        }
        None => println!("No runs recorded"),
    }
    println!();

    println!("Items by Status:");
    print_counts(&stats.counts);
    println!();

    if !stats.domains.is_empty() {
        println!("Domains ({}):", stats.domains.len());
        for domain in &stats.domains {
            let marker = if domain.is_dead_heavy() { "  [dead-heavy]" } else { "" };
            println!(
                "  {}: {} done, {} pending, {} dead, {} failed{}",
                domain.domain,
                domain.counts.done,
                domain.counts.pending,
                domain.counts.dead,
                domain.counts.failed,
                marker
            );
        }
        println!();
    }

    if !stats.tripped_domains.is_empty() {
        println!("Breakers not closed ({}):", stats.tripped_domains.len());
        for domain in &stats.tripped_domains {
            println!("  - {}", domain);
        }
        println!();
    }
}

/// Prints the summary of a finished run
pub fn print_run_summary(summary: &RunSummary) {
    println!(
        "=== Run #{} of '{}' ended: {} ===",
        summary.run_id,
        summary.target,
        summary.status.to_db_string()
    );
    println!(
        "Fetched {} pages in {:.1}s",
        summary.pages_fetched,
        summary.elapsed.as_secs_f64()
    );
    print_counts(&summary.counts);

    if summary.storage_warnings > 0 {
        println!("Storage warnings: {}", summary.storage_warnings);
    }
    if !summary.open_domains.is_empty() {
        println!("Domains left open: {}", summary.open_domains.join(", "));
    }
    if !summary.dead_heavy_domains.is_empty() {
        println!(
            "Dead-heavy domains: {}",
            summary.dead_heavy_domains.join(", ")
        );
    }
    println!();
}
