//! Fetch cycle: load the cache, fetch what is newer than each chain's cursor,
//! merge and persist, then backfill receipt logs for unresolved records.

use crate::cache::{CacheError, CacheSnapshot, TxCache};
use crate::config::{ApiKeySource, ChainId, ScanConfig};
use crate::decode::InputDecoder;
use crate::pool::WorkerPool;
use crate::scan::{KeySchedule, ScanClient, ScanError, ScanTxn, Transport};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("cache: {0}")]
    Cache(#[from] CacheError),
    #[error("scan: {0}")]
    Scan(#[from] ScanError),
}

/// A chain whose fetch failed during a cycle. Its cache stays as it was.
#[derive(Debug)]
pub struct ChainFailure {
    pub chain: ChainId,
    pub error: ScanError,
}

#[derive(Debug)]
pub struct ReconcileReport {
    pub snapshot: CacheSnapshot,
    /// Records added per chain in this cycle.
    pub new_records: BTreeMap<ChainId, usize>,
    pub failures: Vec<ChainFailure>,
    /// False when nothing changed and nothing was written.
    pub persisted: bool,
}

impl ReconcileReport {
    pub fn total_new(&self) -> usize {
        self.new_records.values().sum()
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct ResolveSummary {
    pub resolved: usize,
    pub skipped: usize,
    pub failed: Vec<(PathBuf, ReconcileError)>,
    pub panicked: usize,
}

impl ResolveSummary {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.panicked == 0
    }
}

#[derive(Debug)]
pub struct SyncReport {
    pub reconcile: ReconcileReport,
    pub resolve: Option<ResolveSummary>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        let resolve_clean = match &self.resolve {
            Some(summary) => summary.is_clean(),
            None => true,
        };
        self.reconcile.is_clean() && resolve_clean
    }
}

/// Shared by every receipt worker; read-only.
struct ResolveContext {
    config: ScanConfig,
    keys: ApiKeySource,
    transport: Arc<dyn Transport>,
}

pub struct Reconciler {
    config: ScanConfig,
    cache: TxCache,
    transport: Arc<dyn Transport>,
    decoder: Option<Arc<dyn InputDecoder>>,
    keys: ApiKeySource,
}

impl Reconciler {
    pub fn new(config: ScanConfig, transport: Arc<dyn Transport>) -> Self {
        let cache = TxCache::new(&config.data_dir);
        Self {
            config,
            cache,
            transport,
            decoder: None,
            keys: ApiKeySource::Env,
        }
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn InputDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn with_api_keys(mut self, keys: ApiKeySource) -> Self {
        self.keys = keys;
        self
    }

    pub fn cache(&self) -> &TxCache {
        &self.cache
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    fn chains(&self) -> Vec<ChainId> {
        self.config.chain_ids().cloned().collect()
    }

    pub fn load_cache(&self) -> Result<CacheSnapshot, ReconcileError> {
        Ok(self.cache.load(&self.chains())?)
    }

    /// One reconciliation cycle over every configured chain.
    ///
    /// Chains are fetched concurrently, each with its own client. A chain that
    /// fails is reported in `failures` and leaves its cache untouched; the
    /// other chains are still merged and persisted.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        let chains = self.chains();
        let mut snapshot = self.cache.load(&chains)?;

        let cursors: Vec<(ChainId, u64)> = chains
            .iter()
            .map(|c| (c.clone(), snapshot.cursor(c)))
            .collect();
        for (chain, cursor) in &cursors {
            info!(chain = %chain, cursor, "latest cached block + 1");
        }

        info!("loading transactions from explorers");
        let results = futures::future::join_all(cursors.into_iter().map(|(chain, cursor)| async move {
            let res = self.fetch_chain(&chain, cursor).await;
            (chain, res)
        }))
        .await;

        let mut fetched = Vec::new();
        let mut failures = Vec::new();
        for (chain, res) in results {
            match res {
                Ok(txs) => {
                    info!(chain = %chain, count = txs.len(), "new transactions");
                    fetched.push((chain, txs));
                }
                Err(e) => {
                    error!(chain = %chain, error = %e, "fetch failed, chain left unchanged");
                    failures.push(ChainFailure { chain, error: e });
                }
            }
        }

        let mut new_records = BTreeMap::new();
        if fetched.iter().all(|(_, txs)| txs.is_empty()) {
            info!("no new transactions, keeping cache as is");
            for (chain, _) in fetched {
                new_records.insert(chain, 0);
            }
            return Ok(ReconcileReport {
                snapshot,
                new_records,
                failures,
                persisted: false,
            });
        }

        info!("updating cache");
        for (chain, txs) in fetched {
            let added = snapshot.merge(&chain, txs);
            self.cache.append(&added)?;
            debug!(chain = %chain, added = added.len(), "persisted");
            new_records.insert(chain, added.len());
        }
        Ok(ReconcileReport {
            snapshot,
            new_records,
            failures,
            persisted: true,
        })
    }

    async fn fetch_chain(&self, chain: &ChainId, cursor: u64) -> Result<Vec<ScanTxn>, ScanError> {
        let mut client = ScanClient::for_chain(
            &self.config,
            chain,
            &self.keys,
            KeySchedule::RoundRobin,
            self.transport.clone(),
        )?;
        if let Some(decoder) = &self.decoder {
            client = client.with_decoder(decoder.clone());
        }
        client
            .contract_transactions(cursor, self.config.page_size, &self.config.txlist_policy)
            .await
    }

    /// Fetch receipts for every cached record without logs, on the worker pool.
    pub async fn resolve_receipts(&self) -> Result<ResolveSummary, ReconcileError> {
        let paths = self.cache.unresolved_paths(&self.chains())?;
        info!(count = paths.len(), workers = self.config.receipt_workers, "resolving receipts");

        let ctx = Arc::new(ResolveContext {
            config: self.config.clone(),
            keys: self.keys.clone(),
            transport: self.transport.clone(),
        });
        let mut summary = ResolveSummary::default();
        let pool = WorkerPool::new(self.config.receipt_workers);
        let stats = pool
            .run(
                paths,
                |path| {
                    let ctx = ctx.clone();
                    async move {
                        let res = resolve_receipt(&ctx, &path).await;
                        (path, res)
                    }
                },
                |(path, res)| match res {
                    Ok(true) => summary.resolved += 1,
                    Ok(false) => summary.skipped += 1,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "receipt not resolved");
                        summary.failed.push((path, e));
                    }
                },
            )
            .await;
        summary.panicked = stats.panicked;
        info!(
            resolved = summary.resolved,
            skipped = summary.skipped,
            failed = summary.failed.len(),
            "receipts done"
        );
        Ok(summary)
    }

    /// Reconcile, then resolve receipts unless `skip_receipts`.
    pub async fn sync(&self, skip_receipts: bool) -> Result<SyncReport, ReconcileError> {
        let reconcile = self.reconcile().await?;
        let resolve = if skip_receipts {
            None
        } else {
            Some(self.resolve_receipts().await?)
        };
        Ok(SyncReport { reconcile, resolve })
    }
}

/// Resolve one record file. Returns `Ok(false)` when it already had logs.
async fn resolve_receipt(ctx: &ResolveContext, path: &Path) -> Result<bool, ReconcileError> {
    let mut tx = TxCache::read_record(path)?;
    if tx.is_resolved() {
        debug!(hash = %tx.hash, "already resolved, skipping");
        return Ok(false);
    }
    debug!(chain = %tx.chain, hash = %tx.hash, "resolving receipt");
    let client = ScanClient::for_chain(
        &ctx.config,
        &tx.chain,
        &ctx.keys,
        KeySchedule::Random,
        ctx.transport.clone(),
    )?;
    let receipt = client
        .get_transaction_receipt(&tx.hash, &ctx.config.receipt_policy)
        .await?;
    tx.logs = Some(receipt_logs(&tx.hash, receipt)?);
    TxCache::write_record_at(path, &tx)?;
    Ok(true)
}

/// Receipts must be objects with a `logs` array; anything else is not retried.
fn receipt_logs(hash: &str, receipt: Value) -> Result<Vec<Value>, ScanError> {
    match receipt {
        Value::Object(mut obj) => match obj.remove("logs") {
            Some(Value::Array(logs)) => Ok(logs),
            other => Err(ScanError::UnexpectedPayload(format!(
                "receipt for {hash} has no logs array: {other:?}"
            ))),
        },
        other => Err(ScanError::UnexpectedPayload(format!(
            "receipt for {hash}: {other}"
        ))),
    }
}
