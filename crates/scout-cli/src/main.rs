use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use scout_storage::{SeenLedger, SqliteLedger};
use scout_sync::{report_markdown, RunOptions, ScanConfig, ScanPipeline};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "scout-cli")]
#[command(about = "Internship Scout posting lifecycle engine")]
struct Cli {
    /// Log filter, e.g. `debug` or `scout_sync=debug,info`. Defaults to RUST_LOG, then `info`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Dedup, validate and record one candidate batch.
    Run {
        /// Candidate batch (JSON or YAML). Falls back to SCOUT_CANDIDATES.
        #[arg(long)]
        candidates: Option<PathBuf>,
        /// Re-validate postings already seen but never emailed.
        #[arg(long)]
        force: bool,
        /// Decide everything but leave the ledger untouched.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        max_results: Option<usize>,
    },
    /// Ledger totals.
    Stats {
        #[arg(long, default_value_t = 7, value_parser = clap::value_parser!(i64).range(0..))]
        days: i64,
    },
    /// Postings seen in the last N days.
    Recent {
        #[arg(long, default_value_t = 7, value_parser = clap::value_parser!(i64).range(0..))]
        days: i64,
    },
    /// Summarize recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run scans on SCOUT_SCAN_CRON until interrupted.
    Schedule {
        #[arg(long)]
        candidates: Option<PathBuf>,
    },
}

fn init_tracing(log_level: Option<&str>) -> Result<()> {
    let filter = match log_level {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid --log-level {directives}"))?,
        None => EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

fn days_ago(days: i64) -> Result<DateTime<Utc>> {
    Duration::try_days(days)
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .with_context(|| format!("--days {days} is out of range"))
}

fn candidates_path(arg: Option<PathBuf>, config: &ScanConfig) -> Result<PathBuf> {
    match arg.or_else(|| config.candidates_path.clone()) {
        Some(path) => Ok(path),
        None => bail!("no candidate batch given; pass --candidates or set SCOUT_CANDIDATES"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref())?;
    let config = ScanConfig::from_env();

    let command = cli.command.unwrap_or(Commands::Run {
        candidates: None,
        force: false,
        dry_run: false,
        max_results: None,
    });

    match command {
        Commands::Run {
            candidates,
            force,
            dry_run,
            max_results,
        } => {
            let path = candidates_path(candidates, &config)?;
            let batch = scout_sync::load_candidates(&path).await?;
            let pipeline = ScanPipeline::connect(config).await?;
            let options = RunOptions {
                force,
                dry_run,
                max_results,
            };
            let (outcome, dir) = pipeline.run_and_report(batch, options, Utc::now()).await?;
            let counts = outcome.summary.counts;
            println!(
                "scan complete: run_id={} notified={} rejected={} errored={} suspicious={} reports={}",
                outcome.summary.run_id,
                counts.notified,
                counts.rejected,
                counts.errored,
                counts.suspicious,
                dir.display()
            );
            for posting in &outcome.notify {
                println!(
                    "  {} <{}>",
                    posting.label(),
                    posting.canonical_url.as_deref().unwrap_or(&posting.source_url)
                );
            }
        }
        Commands::Stats { days } => {
            let ledger = SqliteLedger::connect(&config.database_url).await?;
            let stats = ledger.stats(days_ago(days)?).await?;
            println!(
                "total={} emailed={} seen_last_{}d={}",
                stats.total, stats.emailed, days, stats.seen_since
            );
        }
        Commands::Recent { days } => {
            let ledger = SqliteLedger::connect(&config.database_url).await?;
            for record in ledger.recent(days_ago(days)?).await? {
                let emailed = record
                    .emailed_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}\tfirst={}\tlast={}\temailed={}",
                    record.fingerprint,
                    record.first_seen_at.to_rfc3339(),
                    record.last_seen_at.to_rfc3339(),
                    emailed
                );
            }
        }
        Commands::Report { runs } => {
            println!("{}", report_markdown(runs, &config.reports_dir)?);
        }
        Commands::Schedule { candidates } => {
            let path = candidates_path(candidates, &config)?;
            let pipeline = Arc::new(ScanPipeline::connect(config).await?);
            let Some(mut sched) = pipeline.clone().maybe_build_scheduler(path).await? else {
                bail!("scheduler disabled; set SCOUT_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().scan_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn days_ago_rejects_windows_chrono_cannot_represent() {
        assert!(days_ago(7).is_ok());
        assert!(days_ago(i64::MAX).is_err());
    }

    #[test]
    fn negative_days_are_rejected_at_parse_time() {
        assert!(Cli::try_parse_from(["scout-cli", "stats", "--days", "-3"]).is_err());
        assert!(Cli::try_parse_from(["scout-cli", "recent", "--days", "30"]).is_ok());
    }
}
