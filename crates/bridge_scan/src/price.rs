//! Historical WETH price sampling.
//!
//! For every Ethereum block in a range, the block's timestamp comes from the
//! blocks subgraph and the price from the Uniswap V3 USDC/WETH pool at that
//! block. Rows land in `<data_dir>/amarok_prices/weth.csv`.

use crate::config::{ApiKeySource, ChainId, ConfigError, ScanConfig, SubgraphUrls};
use crate::pool::WorkerPool;
use crate::scan::{KeySchedule, ScanClient, ScanError, Transport};
use crate::subgraph::{EthereumBlocksSubgraph, SubgraphError, UniswapV3Subgraph};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const PRICES_DIR: &str = "amarok_prices";
pub const WETH_CSV: &str = "weth.csv";
const CSV_HEADER: &str = "blocktime,unixtime,price\n";

#[derive(Error, Debug)]
pub enum PriceError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("subgraph: {0}")]
    Subgraph(#[from] SubgraphError),
    #[error("scan: {0}")]
    Scan(#[from] ScanError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRow {
    pub blocktime: u64,
    pub unixtime: u64,
    pub price: String,
}

#[derive(Debug, Default)]
pub struct PriceReport {
    /// Blocks in range not yet cached.
    pub requested: usize,
    pub written: usize,
    /// Blocks the blocks subgraph had no timestamp for.
    pub skipped: usize,
    pub failed: Vec<(u64, PriceError)>,
    pub panicked: usize,
}

impl PriceReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.panicked == 0
    }
}

pub struct PriceFetcher {
    path: PathBuf,
    blocks: Arc<EthereumBlocksSubgraph>,
    uniswap: Arc<UniswapV3Subgraph>,
}

impl PriceFetcher {
    /// Open the price cache under `data_dir`, creating it with a header if missing.
    pub fn new(
        data_dir: impl AsRef<Path>,
        urls: &SubgraphUrls,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, PriceError> {
        let path = data_dir.as_ref().join(PRICES_DIR).join(WETH_CSV);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        if !path.exists() {
            fs::write(&path, CSV_HEADER)?;
        }
        Ok(Self {
            path,
            blocks: Arc::new(EthereumBlocksSubgraph::new(
                urls.ethereum_blocks.clone(),
                transport.clone(),
            )),
            uniswap: Arc::new(UniswapV3Subgraph::new(urls.uniswap_v3.clone(), transport)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_cache(&self) -> Result<Vec<PriceRow>, PriceError> {
        let mut reader = csv::Reader::from_path(&self.path)?;
        let rows = reader.deserialize().collect::<Result<Vec<PriceRow>, _>>()?;
        debug!(rows = rows.len(), path = %self.path.display(), "loaded price cache");
        Ok(rows)
    }

    fn cached_blocks(&self) -> Result<HashSet<u64>, PriceError> {
        Ok(self.load_cache()?.into_iter().map(|r| r.blocktime).collect())
    }

    /// Blocks in `[start, end)` with no cached row, ascending.
    pub fn missing_blocks(&self, start: u64, end: u64) -> Result<Vec<u64>, PriceError> {
        let cached = self.cached_blocks()?;
        Ok((start..end).filter(|b| !cached.contains(b)).collect())
    }

    /// Fetch prices for every uncached block in `[start, end)` on `workers`
    /// concurrent tasks, then sort the cache. Failed blocks are reported and
    /// left for the next run.
    pub async fn fetch(&self, start: u64, end: u64, workers: usize) -> Result<PriceReport, PriceError> {
        let missing = self.missing_blocks(start, end)?;
        info!(start, end, blocks = missing.len(), "fetching prices");
        let mut report = PriceReport {
            requested: missing.len(),
            ..PriceReport::default()
        };

        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        let mut write_error: Option<PriceError> = None;

        let pool = WorkerPool::new(workers);
        let stats = pool
            .run(
                missing,
                |block| {
                    let blocks = self.blocks.clone();
                    let uniswap = self.uniswap.clone();
                    async move { (block, price_at_block(&blocks, &uniswap, block).await) }
                },
                |(block, outcome)| match outcome {
                    Ok(Some(row)) => {
                        let written = writer
                            .serialize(&row)
                            .map_err(PriceError::from)
                            .and_then(|()| writer.flush().map_err(PriceError::from));
                        match written {
                            Ok(()) => report.written += 1,
                            Err(e) => {
                                warn!(block, error = %e, "failed to append price row");
                                if write_error.is_none() {
                                    write_error = Some(e);
                                }
                            }
                        }
                    }
                    Ok(None) => report.skipped += 1,
                    Err(e) => {
                        warn!(block, error = %e, "price fetch failed");
                        report.failed.push((block, e));
                    }
                },
            )
            .await;
        report.panicked = stats.panicked;
        drop(writer);

        if let Some(e) = write_error {
            return Err(e);
        }
        self.sort_cache()?;
        info!(
            written = report.written,
            skipped = report.skipped,
            failed = report.failed.len(),
            "price fetch done"
        );
        Ok(report)
    }

    /// Sort rows by block and drop exact duplicates. Returns the row count.
    pub fn sort_cache(&self) -> Result<usize, PriceError> {
        let mut rows = self.load_cache()?;
        rows.sort_by(|a, b| {
            a.blocktime
                .cmp(&b.blocktime)
                .then_with(|| a.unixtime.cmp(&b.unixtime))
                .then_with(|| a.price.cmp(&b.price))
        });
        rows.dedup();

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp = dir.join(format!(".{WETH_CSV}.tmp"));
        {
            let mut writer = csv::Writer::from_path(&tmp)?;
            if rows.is_empty() {
                writer.write_record(["blocktime", "unixtime", "price"])?;
            }
            for row in &rows {
                writer.serialize(row)?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(rows.len())
    }
}

/// Row for one block, or `None` when the block has no known timestamp.
async fn price_at_block(
    blocks: &EthereumBlocksSubgraph,
    uniswap: &UniswapV3Subgraph,
    block: u64,
) -> Result<Option<PriceRow>, PriceError> {
    let timestamps = blocks.timestamps_for_block(block).await?;
    let Some(&unixtime) = timestamps.first() else {
        warn!(block, "no timestamp for block, skipping");
        return Ok(None);
    };
    if timestamps.len() > 1 {
        warn!(block, count = timestamps.len(), "several timestamps for block, using the first");
    }
    let price = uniswap.weth_price(Some(block)).await?;
    Ok(Some(PriceRow {
        blocktime: block,
        unixtime,
        price,
    }))
}

/// Default sampling range: the Ethereum deployment block up to the
/// explorer's latest block.
pub async fn default_range(
    config: &ScanConfig,
    keys: &ApiKeySource,
    transport: Arc<dyn Transport>,
) -> Result<(u64, u64), PriceError> {
    let ethereum = ChainId::from("ethereum");
    let start = config.chain(&ethereum)?.init_block;
    let client = ScanClient::for_chain(config, &ethereum, keys, KeySchedule::RoundRobin, transport)?;
    let end = client.latest_block_number(&config.txlist_policy).await?;
    Ok((start, end))
}
