//! bridge-scan CLI: fetch-txs, resolve-receipts, fetch-prices, status.

use bridge_scan::config::{ApiKeySource, ChainId, ScanConfig};
use bridge_scan::decode::AbiDecoder;
use bridge_scan::price::{default_range, PriceError, PriceFetcher, PriceReport};
use bridge_scan::reconcile::Reconciler;
use bridge_scan::scan::{HttpTransport, Transport};
use bridge_scan::TxCache;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!(error = %e, "no .env loaded");
    }
    let cli = Cli::parse();
    match cli.command {
        Command::FetchTxs(args) => run_fetch_txs(args),
        Command::ResolveReceipts(args) => run_resolve_receipts(args),
        Command::FetchPrices(args) => run_fetch_prices(args),
        Command::Status(args) => run_status(args),
    }
}

#[derive(Parser)]
#[command(name = "bridge-scan")]
#[command(author = "gorusys <goru.connector@outlook.com>")]
#[command(about = "Incremental transaction and price history for the Connext Amarok bridge")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch new bridge transactions and resolve their receipts.
    FetchTxs(FetchTxsArgs),
    /// Fetch receipt logs for cached transactions that lack them.
    ResolveReceipts(DataDirArgs),
    /// Sample historical WETH prices into the price cache.
    FetchPrices(FetchPricesArgs),
    /// Summarise the transaction cache.
    Status(DataDirArgs),
}

#[derive(Parser)]
struct DataDirArgs {
    /// Overrides `data_dir` from the config file.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[derive(Parser)]
struct FetchTxsArgs {
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    skip_receipts: bool,
    /// Only these chains (repeatable).
    #[arg(long = "chain")]
    chains: Vec<String>,
}

#[derive(Parser)]
struct FetchPricesArgs {
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long, default_value_t = 30)]
    workers: usize,
    /// Defaults to the Ethereum deployment block.
    #[arg(long)]
    start_block: Option<u64>,
    /// Exclusive; defaults to the latest block.
    #[arg(long)]
    end_block: Option<u64>,
}

fn load_config(data_dir: Option<PathBuf>) -> Result<ScanConfig, Box<dyn std::error::Error>> {
    let mut config = ScanConfig::load()?;
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    Ok(config)
}

fn reconciler(config: ScanConfig) -> Result<Reconciler, Box<dyn std::error::Error>> {
    let abi_path = config.abi_path.clone();
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
    let mut reconciler = Reconciler::new(config, transport);
    match abi_path {
        Some(path) if path.exists() => {
            let decoder = AbiDecoder::load(&path)?;
            info!(path = %path.display(), functions = decoder.function_count(), "loaded ABI");
            reconciler = reconciler.with_decoder(Arc::new(decoder));
        }
        Some(path) => warn!(path = %path.display(), "ABI not found, inputs stay raw"),
        None => warn!("no ABI configured, inputs stay raw"),
    }
    Ok(reconciler)
}

fn run_fetch_txs(args: FetchTxsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(args.data_dir)?;
    if !args.chains.is_empty() {
        let only: Vec<ChainId> = args.chains.iter().map(ChainId::new).collect();
        config.retain_chains(&only)?;
    }
    let reconciler = reconciler(config)?;
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async { reconciler.sync(args.skip_receipts).await })?;
    info!(
        new = report.reconcile.total_new(),
        persisted = report.reconcile.persisted,
        "fetch complete"
    );
    for failure in &report.reconcile.failures {
        warn!(chain = %failure.chain, error = %failure.error, "chain failed");
    }
    if let Some(resolve) = &report.resolve {
        info!(resolved = resolve.resolved, failed = resolve.failed.len(), "receipts");
    }
    if !report.is_clean() {
        return Err("fetch finished with failures".into());
    }
    Ok(())
}

fn run_resolve_receipts(args: DataDirArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.data_dir)?;
    let reconciler = reconciler(config)?;
    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(async { reconciler.resolve_receipts().await })?;
    if !summary.is_clean() {
        return Err(format!(
            "{} receipts failed, {} workers panicked",
            summary.failed.len(),
            summary.panicked
        )
        .into());
    }
    Ok(())
}

fn run_fetch_prices(args: FetchPricesArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.data_dir)?;
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new()?);
    let fetcher = PriceFetcher::new(&config.data_dir, &config.subgraphs, transport.clone())?;
    let rt = tokio::runtime::Runtime::new()?;
    let report: Result<PriceReport, PriceError> = rt.block_on(async {
        let (start, end) = match (args.start_block, args.end_block) {
            (Some(start), Some(end)) => (start, end),
            (start, end) => {
                let (default_start, default_end) =
                    default_range(&config, &ApiKeySource::Env, transport).await?;
                (start.unwrap_or(default_start), end.unwrap_or(default_end))
            }
        };
        fetcher.fetch(start, end, args.workers).await
    });
    let report = report?;
    info!(
        requested = report.requested,
        written = report.written,
        skipped = report.skipped,
        "prices fetched"
    );
    if !report.is_clean() {
        return Err(format!("{} blocks failed", report.failed.len()).into());
    }
    Ok(())
}

fn run_status(args: DataDirArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.data_dir)?;
    let cache = TxCache::new(&config.data_dir);
    let chains: Vec<ChainId> = config.chain_ids().cloned().collect();
    let snapshot = cache.load(&chains)?;
    println!("{:<14} {:>9} {:>12} {:>11}  newest", "chain", "records", "cursor", "unresolved");
    for chain in &chains {
        let newest = snapshot
            .records(chain)
            .last()
            .and_then(|tx| tx.timestamp_utc())
            .map(|ts| ts.format(&Rfc3339))
            .transpose()?
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<14} {:>9} {:>12} {:>11}  {}",
            chain.as_str(),
            snapshot.records(chain).len(),
            snapshot.cursor(chain),
            snapshot.unresolved_count(chain),
            newest
        );
    }
    println!("total records: {}", snapshot.total());
    Ok(())
}
