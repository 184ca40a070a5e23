//! `p3metrics` command line: prints dashboard and audit reports as JSON.
//!
//! Logging goes to stderr (`RUST_LOG`, default `info`); reports go to stdout.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;

use p3metrics_lib::store::Collection;
use p3metrics_lib::types::{PeriodSelector, TimePeriod, YearMonth};
use p3metrics_lib::{compute_dashboard, compute_removed_deals, Config, ErrorReport, MetricsError};

#[derive(Parser)]
#[command(
    name = "p3metrics",
    version,
    about = "P3 proposal meeting and deal attribution metrics"
)]
struct Cli {
    /// Config file (default: ~/.p3metrics/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Per-employee metrics and team summary
    Metrics {
        /// all-time | year-to-date | month-to-date (default: all-time, or
        /// month-to-date when --month is given)
        #[arg(long)]
        period: Option<TimePeriod>,
        /// Target month for month-to-date, YYYY-MM
        #[arg(long)]
        month: Option<YearMonth>,
    },
    /// Deals the previous attribution policy credited that the current one drops
    RemovedDeals {
        /// Case-insensitive regex matched against raw employee names
        #[arg(long, default_value = "rob")]
        employee: String,
        #[arg(long)]
        period: Option<TimePeriod>,
        #[arg(long)]
        month: Option<YearMonth>,
    },
    /// Load a JSON array export into the local SQLite mirror
    Import {
        /// Meetings | Contacts | Companies | Deals
        #[arg(long)]
        collection: Collection,
        #[arg(long)]
        file: PathBuf,
    },
}

fn selector(period: Option<TimePeriod>, month: Option<YearMonth>) -> PeriodSelector {
    let period = period.unwrap_or(if month.is_some() {
        TimePeriod::MonthToDate
    } else {
        TimePeriod::AllTime
    });
    PeriodSelector { period, month }
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let out = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{out}");
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.cmd {
        Cmd::Metrics { period, month } => {
            let store = config.open_store()?;
            let report =
                compute_dashboard(store.as_ref(), selector(period, month), &config, Utc::now())
                    .await?;
            print_json(&report, cli.pretty)
        }
        Cmd::RemovedDeals {
            employee,
            period,
            month,
        } => {
            let store = config.open_store()?;
            let report = compute_removed_deals(
                store.as_ref(),
                selector(period, month),
                &employee,
                &config,
                Utc::now(),
            )
            .await?;
            print_json(&report, cli.pretty)
        }
        Cmd::Import { collection, file } => {
            let store = config.open_mirror()?;
            let summary = store
                .import_file(collection, &file)
                .with_context(|| format!("import {} from {}", collection.table(), file.display()))?;
            print_json(&summary, cli.pretty)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let pretty = cli.pretty;
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(metrics_err) = err.downcast_ref::<MetricsError>() {
                let report = ErrorReport::from(metrics_err);
                if let Err(e) = print_json(&report, pretty) {
                    log::error!("Failed to print error report: {e}");
                }
            }
            log::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
