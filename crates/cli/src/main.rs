//! Operational CLI: drives hourly aggregation and retention cleanup against
//! a live Postgres instance.

mod config;

use std::sync::Arc;

use aggregator::postgres::PgAggregateStore;
use aggregator::{AggregateStore, Aggregator};
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use config::DatabaseConnectionInfo;
use event_store::postgres::PgEventStore;
use event_store::EventStore;
use model::cost::CostConfig;
use reference_store::postgres::PgReferenceStore;
use reference_store::ReferenceStore;
use retention::Cleaner;

#[derive(Parser)]
#[command(name = "tramwatch", about = "Tram delay detection: aggregation and retention CLI")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deletes raw delay events outside the retention window.
    Cleanup {
        /// Actually delete; default is dry-run.
        #[arg(long)]
        execute: bool,
        /// Retention window in days. Defaults to `RETENTION_DAYS` or 7.
        #[arg(long)]
        older_than: Option<i64>,
        /// Deletes every aggregated date regardless of age.
        #[arg(long)]
        reset_all: bool,
        /// Required alongside `--reset-all --execute`.
        #[arg(long)]
        i_know_what_i_am_doing: bool,
    },
    /// Runs the hourly aggregator for a date, or backfills the last N days.
    AggregateDaily {
        /// Specific date (YYYY-MM-DD) to aggregate, every closed hour.
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Backfill the last N days ending yesterday.
        #[arg(long)]
        backfill: Option<i64>,
        /// Report what would run without writing anything.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let connection_info =
        DatabaseConnectionInfo::from_env().expect("expected database connection info in env");
    let pool = connection_info
        .connect()
        .await
        .expect("could not connect to database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("could not run migrations");

    let event_store: Arc<dyn EventStore> = Arc::new(PgEventStore::new(pool.clone()));
    let aggregate_store: Arc<dyn AggregateStore> = Arc::new(PgAggregateStore::new(pool.clone()));
    let reference_store: Arc<dyn ReferenceStore> = Arc::new(PgReferenceStore::new(pool.clone()));

    let cli = Cli::parse();
    let exit_code = match cli.command {
        Command::Cleanup {
            execute,
            older_than,
            reset_all,
            i_know_what_i_am_doing,
        } => run_cleanup(event_store, aggregate_store, execute, older_than, reset_all, i_know_what_i_am_doing).await,
        Command::AggregateDaily { date, backfill, dry_run } => {
            run_aggregate_daily(event_store, aggregate_store, reference_store, date, backfill, dry_run).await
        }
    };

    std::process::exit(exit_code);
}

async fn run_cleanup(
    event_store: Arc<dyn EventStore>,
    aggregate_store: Arc<dyn AggregateStore>,
    execute: bool,
    older_than: Option<i64>,
    reset_all: bool,
    i_know_what_i_am_doing: bool,
) -> i32 {
    if reset_all && execute && !i_know_what_i_am_doing {
        log::error!("--reset-all --execute requires --i-know-what-i-am-doing");
        return 1;
    }

    let cleaner = Cleaner::new(event_store, aggregate_store);
    let now = Utc::now();

    let report = if reset_all {
        log::warn!("reset-all requested: every aggregated date is a candidate, regardless of age");
        cleaner.reset_all(execute).await
    } else {
        let older_than_days = older_than.unwrap_or_else(config::retention_days_from_env);
        cleaner.run(now, older_than_days, execute).await
    };

    let report = match report {
        Ok(report) => report,
        Err(why) => {
            log::error!("cleanup failed: {why}");
            return 1;
        }
    };

    if report.dry_run {
        log::info!(
            "dry-run: {} events would be deleted across {} dates",
            report.deleted_event_count(),
            report.outcomes.len()
        );
    } else {
        log::info!("deleted {} events", report.deleted_event_count());
    }
    for skipped in report.skipped_dates() {
        log::info!("{skipped}: not yet aggregated, skipped");
    }

    0
}

async fn run_aggregate_daily(
    event_store: Arc<dyn EventStore>,
    aggregate_store: Arc<dyn AggregateStore>,
    reference_store: Arc<dyn ReferenceStore>,
    date: Option<NaiveDate>,
    backfill: Option<i64>,
    dry_run: bool,
) -> i32 {
    if date.is_some() && backfill.is_some() {
        log::error!("--date and --backfill are mutually exclusive");
        return 1;
    }

    let dates: Vec<NaiveDate> = if let Some(date) = date {
        vec![date]
    } else if let Some(days) = backfill {
        let yesterday = Utc::now().date_naive() - Duration::days(1);
        (0..days).map(|offset| yesterday - Duration::days(offset)).rev().collect()
    } else {
        log::error!("one of --date or --backfill is required");
        return 1;
    };

    if dry_run {
        log::info!("dry-run: would aggregate every hour of {} date(s): {:?}", dates.len(), dates);
        return 0;
    }

    let cost_config = CostConfig::from_env();
    let aggregator = Aggregator::new(event_store, aggregate_store, reference_store, cost_config);

    for date in dates {
        for hour in 0..24 {
            if let Err(why) = aggregator.run_for_hour(date, hour).await {
                log::error!("aggregation failed for {date} hour {hour}: {why}");
                return 1;
            }
        }
        log::info!("aggregated {date}");
    }

    0
}
