use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use licita_core::{ConfigError, FetchDate};
use licita_storage::ProcurementStore;
use licita_sync::{run_sync_once, SyncConfig};
use licita_web::{generate_report, serve, AppState, ReportConfig};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "licita")]
#[command(about = "Mercado Publico tender and purchase order extractor")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch one day of tenders and purchase orders and store the new ones.
    Sync(SyncArgs),
    /// Create the store and its tables if missing.
    InitDb(StoreArgs),
    /// Render the latest tenders into a static HTML page.
    Report(ReportArgs),
    /// Serve the report page straight from the store.
    Serve(ServeArgs),
}

#[derive(Debug, Default, Args)]
struct StoreArgs {
    /// SQLite store path [env: LICITA_DB_FILE]
    #[arg(long)]
    db: Option<PathBuf>,
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Day to fetch as DDMMYYYY; defaults to yesterday.
    #[arg(long)]
    date: Option<FetchDate>,
    #[command(flatten)]
    store: StoreArgs,
    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ReportArgs {
    #[command(flatten)]
    store: StoreArgs,
    /// Output file [env: LICITA_REPORT_FILE]
    #[arg(long)]
    out: Option<PathBuf>,
    /// Maximum number of tenders [env: LICITA_REPORT_LIMIT]
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[command(flatten)]
    store: StoreArgs,
    /// Listen port [env: LICITA_WEB_PORT]
    #[arg(long)]
    port: Option<u16>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_json = std::env::var("LICITA_LOG_JSON")
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false);

    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn report_config(store: StoreArgs, out: Option<PathBuf>, limit: Option<usize>) -> ReportConfig {
    let mut config = ReportConfig::from_env();
    if let Some(db) = store.db {
        config.database_path = db;
    }
    if let Some(out) = out {
        config.output_path = out;
    }
    if let Some(limit) = limit.filter(|l| *l > 0) {
        config.limit = limit;
    }
    config
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let mut config = SyncConfig::from_env();
            if let Some(db) = args.store.db {
                config.database_path = db;
            }
            let date = args.date.unwrap_or_else(FetchDate::yesterday);
            let summary = run_sync_once(&config, date, |name| std::env::var(name).ok()).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!(
                    "sync complete: run_id={} date={} tenders_new={} purchase_orders_new={} failed={}",
                    summary.run_id,
                    summary.fetch_date,
                    summary.tenders.upsert.inserted,
                    summary.purchase_orders.upsert.inserted,
                    summary.tenders.upsert.failed + summary.purchase_orders.upsert.failed,
                );
            }
        }
        Commands::InitDb(args) => {
            let path = args
                .db
                .unwrap_or_else(|| SyncConfig::from_env().database_path);
            let store = ProcurementStore::new(path);
            store.ensure_schema().await?;
            println!("store ready: {}", store.path().display());
        }
        Commands::Report(args) => {
            let config = report_config(args.store, args.out, args.limit);
            let summary = generate_report(&config).await?;
            println!(
                "report written: path={} rows={}",
                summary.output_path, summary.rows
            );
        }
        Commands::Serve(args) => {
            let config = report_config(args.store, None, None);
            let port = args
                .port
                .or_else(|| {
                    std::env::var("LICITA_WEB_PORT")
                        .ok()
                        .and_then(|v| v.parse().ok())
                })
                .unwrap_or(8000);
            let state = AppState::new(ProcurementStore::new(config.database_path), config.limit);
            serve(state, port).await?;
        }
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => match err.downcast_ref::<ConfigError>() {
            Some(config_err) => {
                error!("configuration error: {config_err}");
                ExitCode::from(2)
            }
            None => {
                error!("unexpected error: {err:#}");
                ExitCode::FAILURE
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn sync_is_the_default_command() {
        let cli = Cli::try_parse_from(["licita"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn sync_parses_date_and_store_path() {
        let cli = Cli::try_parse_from(["licita", "sync", "--date", "01062024", "--db", "/tmp/x.db"]).unwrap();
        let Some(Commands::Sync(args)) = cli.command else {
            panic!("expected sync command");
        };
        assert_eq!(args.date.unwrap().to_string(), "01062024");
        assert_eq!(args.store.db, Some(PathBuf::from("/tmp/x.db")));
    }

    #[test]
    fn invalid_date_is_rejected() {
        assert!(Cli::try_parse_from(["licita", "sync", "--date", "2024-06-01"]).is_err());
    }

    #[test]
    fn report_flags_override_config() {
        let cli = Cli::try_parse_from(["licita", "report", "--out", "site/index.html", "--limit", "100"]).unwrap();
        let Some(Commands::Report(args)) = cli.command else {
            panic!("expected report command");
        };
        let config = report_config(args.store, args.out, args.limit);
        assert_eq!(config.output_path, PathBuf::from("site/index.html"));
        assert_eq!(config.limit, 100);
    }
}
