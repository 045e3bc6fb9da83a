//! The `bitcoin-census` daemon.

use bitcoin_census_crawler::{
    ConfigError, CrawlError, CrawlSettings, CrawlerBuilder, FileSnapshotWriter, MemoryStore,
    RedisStore, StateStore, TcpConnector,
};
use clap::{CommandFactory, Parser, ValueEnum};
use log::{error, info, LevelFilter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    config: PathBuf,

    /// Role of this process.
    #[arg(value_enum)]
    role: Role,

    /// Log level, overrides the configured debug flag.
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    /// Seeds the crawl and rolls epochs over, exactly one per deployment.
    Controller,
    /// Runs crawl workers against the shared store.
    Worker,
}

fn parse_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

fn setup_logging(level: LevelFilter, logfile: Option<&Path>) -> Result<(), fern::InitError> {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] {} {} {} - {}",
                std::process::id(),
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr());
    if let Some(path) = logfile {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }
    dispatch.apply()?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

async fn run_role<S: StateStore>(
    role: Role,
    settings: CrawlSettings,
    store: Arc<S>,
) -> Result<(), CrawlError> {
    let connector = TcpConnector::new(settings.connection_configuration());
    let crawl_dir = settings.crawl_dir.clone();
    let in_process_workers = if settings.uses_shared_store() {
        0
    } else {
        settings.workers
    };
    let crawler = CrawlerBuilder::new(settings).build(store, connector)?;

    match role {
        Role::Controller => {
            let sink = FileSnapshotWriter::new(crawl_dir)?;
            crawler
                .run_controller(sink, in_process_workers, shutdown_signal())
                .await
        }
        Role::Worker => crawler.run_worker_pool(shutdown_signal()).await,
    }
}

async fn run(role: Role, settings: CrawlSettings) -> Result<(), CrawlError> {
    if settings.uses_shared_store() {
        let store = RedisStore::connect(&settings.store_url).await?;
        return run_role(role, settings, Arc::new(store)).await;
    }

    if role == Role::Worker {
        return Err(ConfigError::Invalid {
            option: "store_url",
            reason: "worker processes need a shared store".to_string(),
        }
        .into());
    }
    run_role(role, settings, Arc::new(MemoryStore::new())).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let settings = match CrawlSettings::from_file(&args.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{e}");
            eprintln!("{}", Args::command().render_usage());
            return ExitCode::FAILURE;
        }
    };

    let level = match &args.log_level {
        Some(level) => parse_level(level),
        None if settings.debug => LevelFilter::Debug,
        None => LevelFilter::Info,
    };
    if let Err(e) = setup_logging(level, settings.logfile.as_deref()) {
        eprintln!("Cannot set up logging: {e}");
        return ExitCode::FAILURE;
    }
    if let Some(logfile) = &settings.logfile {
        eprintln!("Log: {}, press CTRL+C to terminate..", logfile.display());
    }
    info!("Role: {:?}", args.role);

    match run(args.role, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
