//! Crawl a single node once and print what it advertised.

use bitcoin_census_crawler::{
    AttemptOutcome, Candidate, CrawlSettings, CrawlerBuilder, MemoryStore, NodeAddress, NodeKey,
    TcpConnector, SEED_SERVICES,
};
use clap::Parser;
use log::LevelFilter;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address of the node, IP or onion.
    #[arg(short, long)]
    address: String,

    /// Port number of the node.
    #[arg(short, long, default_value = "8333")]
    port: u16,

    /// Optional configuration file, defaults otherwise.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Log level.
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] {} - {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log_level)
        .chain(std::io::stderr())
        .apply()?;

    let settings = match &args.config {
        Some(path) => CrawlSettings::from_file(path)?,
        None => CrawlSettings::default(),
    };
    let address: NodeAddress = args.address.parse()?;

    let connector = TcpConnector::new(settings.connection_configuration());
    let crawler = CrawlerBuilder::new(settings)
        .with_bogon_fetcher(None)
        .build(Arc::new(MemoryStore::new()), connector)?;
    crawler.seed(&[]).await?;

    let key = NodeKey::new(address, args.port, SEED_SERVICES);
    let outcome = crawler.worker(0).process(Candidate::new(key)).await?;
    match outcome {
        AttemptOutcome::Reachable { key, discovered } => {
            log::info!("{key} reachable, advertised {discovered:?} peers");
            for candidate in crawler.state().pending_members().await? {
                println!("{}", candidate.key);
            }
        }
        other => log::info!("{other:?}"),
    }

    Ok(())
}
