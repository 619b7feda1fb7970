//! File-per-record transaction cache.
//!
//! Layout: `<data_dir>/amarok_txs/<chain>/<hash>.json`. A record is written to a
//! temporary sibling and renamed into place, so an interrupted save never
//! damages records that were already committed.

use crate::config::ChainId;
use crate::scan::ScanTxn;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const TXS_DIR: &str = "amarok_txs";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("record {path}: {source}")]
    Record {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("refusing to store record with hash {0:?}")]
    InvalidHash(String),
}

/// Records of every chain in memory, each chain sorted by position.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CacheSnapshot {
    chains: BTreeMap<ChainId, Vec<ScanTxn>>,
}

impl CacheSnapshot {
    pub fn empty<'a>(chains: impl IntoIterator<Item = &'a ChainId>) -> Self {
        Self {
            chains: chains.into_iter().map(|c| (c.clone(), Vec::new())).collect(),
        }
    }

    pub fn records(&self, chain: &ChainId) -> &[ScanTxn] {
        self.chains.get(chain).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Lower bound for the next fetch: highest cached block + 1, or 0.
    pub fn cursor(&self, chain: &ChainId) -> u64 {
        self.records(chain)
            .iter()
            .map(|t| t.block_number)
            .max()
            .map_or(0, |b| b + 1)
    }

    pub fn unresolved_count(&self, chain: &ChainId) -> usize {
        self.records(chain).iter().filter(|t| !t.is_resolved()).count()
    }

    pub fn total(&self) -> usize {
        self.chains.values().map(Vec::len).sum()
    }

    /// Append `incoming` to `chain`, skipping hashes already present, then
    /// re-sort. Returns the records that were actually added.
    pub fn merge(&mut self, chain: &ChainId, incoming: Vec<ScanTxn>) -> Vec<ScanTxn> {
        let records = self.chains.entry(chain.clone()).or_default();
        let mut seen: HashSet<String> = records.iter().map(|t| t.hash.clone()).collect();
        let added: Vec<ScanTxn> = incoming
            .into_iter()
            .filter(|t| seen.insert(t.hash.clone()))
            .collect();
        records.extend(added.iter().cloned());
        records.sort_by_key(ScanTxn::position);
        added
    }

    fn insert_loaded(&mut self, chain: ChainId, mut records: Vec<ScanTxn>) {
        records.sort_by_key(ScanTxn::position);
        self.chains.insert(chain, records);
    }
}

pub struct TxCache {
    root: PathBuf,
}

impl TxCache {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            root: data_dir.as_ref().join(TXS_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chain_dir(&self, chain: &ChainId) -> PathBuf {
        self.root.join(chain.as_str())
    }

    pub fn record_path(&self, chain: &ChainId, hash: &str) -> PathBuf {
        self.chain_dir(chain).join(format!("{hash}.json"))
    }

    /// Load every record of `chains`. Chains without a directory load empty.
    pub fn load<'a>(
        &self,
        chains: impl IntoIterator<Item = &'a ChainId>,
    ) -> Result<CacheSnapshot, CacheError> {
        if self.root.exists() {
            info!(root = %self.root.display(), "cache found, loading");
        } else {
            info!(root = %self.root.display(), "cache not found, starting empty");
        }
        let mut snapshot = CacheSnapshot::default();
        for chain in chains {
            let mut records = Vec::new();
            for path in self.record_files(chain)? {
                records.push(Self::read_record(&path)?);
            }
            debug!(chain = %chain, count = records.len(), "loaded chain");
            snapshot.insert_loaded(chain.clone(), records);
        }
        Ok(snapshot)
    }

    /// Paths of records whose receipt logs are still missing, sorted.
    pub fn unresolved_paths<'a>(
        &self,
        chains: impl IntoIterator<Item = &'a ChainId>,
    ) -> Result<Vec<PathBuf>, CacheError> {
        let mut out = Vec::new();
        for chain in chains {
            for path in self.record_files(chain)? {
                if !Self::read_record(&path)?.is_resolved() {
                    out.push(path);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn read_record(path: &Path) -> Result<ScanTxn, CacheError> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|source| CacheError::Record {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write one record to its own file via temp file + rename.
    pub fn write_record(&self, tx: &ScanTxn) -> Result<PathBuf, CacheError> {
        if tx.hash.is_empty() || tx.hash.contains(['/', '\\']) || tx.hash.contains("..") {
            return Err(CacheError::InvalidHash(tx.hash.clone()));
        }
        let path = self.record_path(&tx.chain, &tx.hash);
        Self::write_record_at(&path, tx)?;
        Ok(path)
    }

    pub fn write_record_at(path: &Path, tx: &ScanTxn) -> Result<(), CacheError> {
        let dir = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;
        let json = serde_json::to_string_pretty(tx).map_err(|source| CacheError::Record {
            path: path.to_path_buf(),
            source,
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dir.join(format!(".{file_name}.tmp"));
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Persist newly merged records. Existing files are not touched.
    ///
    /// Records are written in position order. A crash between two records of
    /// the same block leaves that block partly cached, and the next cursor
    /// (max block + 1) will not fetch the rest of it.
    pub fn append(&self, records: &[ScanTxn]) -> Result<usize, CacheError> {
        for tx in records {
            self.write_record(tx)?;
        }
        Ok(records.len())
    }

    fn record_files(&self, chain: &ChainId) -> Result<Vec<PathBuf>, CacheError> {
        let dir = self.chain_dir(chain);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}
