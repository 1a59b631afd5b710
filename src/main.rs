//! Breakout Sentinel — main entry point.
//!
//! Subcommands:
//! - `run`: start the orchestrator (paper or live, per config)
//! - `export`: dump the current Store state to JSON for operator inspection

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use breakout_sentinel::broker::rest::RestBroker;
use breakout_sentinel::broker::BrokerPort;
use breakout_sentinel::config::{Config, Mode};
use breakout_sentinel::orchestrator::Orchestrator;
use breakout_sentinel::store::SqliteStore;

#[derive(Parser, Debug)]
#[command(name = "breakout-sentinel")]
#[command(about = "Autonomous breakout-entry, trailing-protection trading controller", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the orchestrator loop.
    Run {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "config.json")]
        config: String,

        /// Path to the SQLite database file.
        #[arg(long, default_value = "breakout_sentinel.db")]
        db: String,

        /// Path the JSON state export is written to.
        #[arg(long, default_value = "state_export.json")]
        export: String,

        /// Skip the live-mode confirmation countdown (CI/non-interactive use only).
        #[arg(long)]
        yes: bool,
    },

    /// Dump the current Store state (positions, orders, fills) to JSON and exit.
    Export {
        #[arg(long, default_value = "breakout_sentinel.db")]
        db: String,

        #[arg(long, default_value = "state_export.json")]
        export: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let log_filename = format!("{}_{}.log", command_name, chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
    let log_path = PathBuf::from("logs").join(&log_filename);

    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!("{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn", level);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_appender)
        .with_target(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(false);

    tracing_subscriber::registry().with(env_filter).with(console_layer).with(file_layer).init();

    info!("logging initialized");
    info!(log_file = %log_path.display(), "log file");
    Ok(())
}

/// In live mode, print a countdown banner the operator can interrupt with Ctrl+C before any
/// real money is committed.
async fn confirm_live_mode(skip: bool) -> Result<()> {
    if skip {
        return Ok(());
    }
    println!("=============================================================");
    println!(" LIVE TRADING MODE - real orders will be submitted to the broker.");
    println!(" Press Ctrl+C within the next 10 seconds to abort.");
    println!("=============================================================");
    for remaining in (1..=10).rev() {
        print!("\r  starting in {:>2}s... ", remaining);
        use std::io::Write;
        std::io::stdout().flush().ok();
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
    println!("\r  proceeding.                  ");
    Ok(())
}

fn build_broker(config: &Config) -> Result<Arc<dyn BrokerPort>> {
    let api_key = config.broker_api_key.clone().context("BROKER_API_KEY is not set")?;
    let api_secret = config.broker_api_secret.clone().context("BROKER_API_SECRET is not set")?;
    let live = config.mode == Mode::Live;
    Ok(Arc::new(RestBroker::new(api_key, api_secret, live)))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, db, export, yes } => {
            setup_logging(cli.verbose, "run")?;
            let config = Config::from_file(&config).context("failed to load configuration")?;
            if config.mode == Mode::Live {
                confirm_live_mode(yes).await?;
            }
            let store = SqliteStore::open(&db, &export)?;
            let broker = build_broker(&config)?;
            let orchestrator = Orchestrator::new(config, store, broker);
            orchestrator.run().await?;
        }
        Commands::Export { db, export } => {
            setup_logging(cli.verbose, "export")?;
            let store = SqliteStore::open(&db, &export)?;
            store.export_json()?;
            info!(path = %export, "state exported");
        }
    }

    Ok(())
}
