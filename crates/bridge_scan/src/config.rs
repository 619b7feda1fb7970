//! Chain registry, retry policies and API-key loading.
//!
//! Chains are data: every supported chain is one [`ChainDescriptor`] keyed by
//! [`ChainId`]. Adding a chain means adding an entry to the config file.
//!
//! Load from: env `BRIDGE_SCAN_CONFIG_PATH`, or `./config/bridge_scan.json`,
//! or the built-in defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

const CONFIG_PATH_ENV: &str = "BRIDGE_SCAN_CONFIG_PATH";
const DEFAULT_CONFIG_PATH: &str = "./config/bridge_scan.json";

pub const DEFAULT_PAGE_SIZE: u32 = 1000;
pub const DEFAULT_END_BLOCK: u64 = 999_999_999;
const DEFAULT_RECEIPT_WORKERS: usize = 12;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("chain {0} not supported")]
    UnsupportedChain(ChainId),
    #[error("no api keys for {chain}: set {env} (comma-separated)")]
    MissingApiKeys { chain: ChainId, env: String },
    #[error("invalid url for {field}: {source}")]
    InvalidUrl {
        field: String,
        #[source]
        source: url::ParseError,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Partition key: one independent chain whose records and cursor are kept apart.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(String);

impl ChainId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChainId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Everything needed to talk to one chain's explorer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainDescriptor {
    /// Explorer API endpoint, e.g. `https://api.etherscan.io/api`.
    pub base_url: String,
    /// Bridge diamond contract whose transactions are cached.
    pub contract_address: String,
    /// Env var holding comma-separated API keys.
    pub key_env_name: String,
    /// Explorer transaction page prefix, e.g. `https://etherscan.io/tx/`.
    pub scan_url: String,
    /// Block the bridge was deployed at.
    pub init_block: u64,
}

/// Fixed-wait retry policy for explorer requests.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Total attempts = `max_attempt + 1`.
    pub max_attempt: u32,
    /// Sleep between attempts, in seconds.
    pub wait_time: f64,
    /// Per-request timeout, in seconds.
    pub timeout: f64,
}

impl RetryPolicy {
    /// Policy for paginated transaction listing.
    pub fn txlist() -> Self {
        Self {
            max_attempt: 20,
            wait_time: 0.5,
            timeout: 60.0,
        }
    }

    /// Policy for per-transaction receipt lookups.
    pub fn receipt() -> Self {
        Self {
            max_attempt: 10,
            wait_time: 1.0,
            timeout: 10.0,
        }
    }

    pub fn wait(&self) -> Duration {
        secs_to_duration(self.wait_time)
    }

    pub fn timeout(&self) -> Duration {
        secs_to_duration(self.timeout)
    }

    /// Both durations must be finite, non-negative and fit in a `Duration`.
    pub fn validate(&self, field: &str) -> Result<(), ConfigError> {
        for (name, secs) in [("wait_time", self.wait_time), ("timeout", self.timeout)] {
            if Duration::try_from_secs_f64(secs).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "{field}.{name} must be a non-negative number of seconds, got {secs}"
                )));
            }
        }
        Ok(())
    }
}

/// Saturates instead of panicking on out-of-range seconds.
fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::MAX)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::txlist()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubgraphUrls {
    pub uniswap_v3: String,
    pub ethereum_blocks: String,
}

impl Default for SubgraphUrls {
    fn default() -> Self {
        Self {
            uniswap_v3: "https://api.thegraph.com/subgraphs/name/uniswap/uniswap-v3".to_string(),
            ethereum_blocks: "https://api.thegraph.com/subgraphs/name/blocklytics/ethereum-blocks"
                .to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub data_dir: PathBuf,
    pub chains: BTreeMap<ChainId, ChainDescriptor>,
    pub txlist_policy: RetryPolicy,
    pub receipt_policy: RetryPolicy,
    pub page_size: u32,
    pub receipt_workers: usize,
    /// JSON ABI of the diamond contract; inputs stay raw when unset or missing.
    pub abi_path: Option<PathBuf>,
    pub subgraphs: SubgraphUrls,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            chains: default_chains(),
            txlist_policy: RetryPolicy::txlist(),
            receipt_policy: RetryPolicy::receipt(),
            page_size: DEFAULT_PAGE_SIZE,
            receipt_workers: DEFAULT_RECEIPT_WORKERS,
            abi_path: Some(PathBuf::from("./abi/ConnextDiamond.json")),
            subgraphs: SubgraphUrls::default(),
        }
    }
}

impl ScanConfig {
    /// Load config from path. Missing fields take their defaults.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config: env BRIDGE_SCAN_CONFIG_PATH, then ./config/bridge_scan.json, then defaults.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Self::load_from_path(Path::new(&path));
        }
        let candidate = Path::new(DEFAULT_CONFIG_PATH);
        if candidate.exists() {
            return Self::load_from_path(candidate);
        }
        Ok(Self::default())
    }

    pub fn chain(&self, chain: &ChainId) -> Result<&ChainDescriptor, ConfigError> {
        self.chains
            .get(chain)
            .ok_or_else(|| ConfigError::UnsupportedChain(chain.clone()))
    }

    pub fn chain_ids(&self) -> impl Iterator<Item = &ChainId> {
        self.chains.keys()
    }

    /// Restrict the registry to `only`. Unknown ids are rejected.
    pub fn retain_chains(&mut self, only: &[ChainId]) -> Result<(), ConfigError> {
        if let Some(unknown) = only.iter().find(|c| !self.chains.contains_key(*c)) {
            return Err(ConfigError::UnsupportedChain(unknown.clone()));
        }
        self.chains.retain(|id, _| only.contains(id));
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Invalid("page_size must be > 0".to_string()));
        }
        if self.receipt_workers == 0 {
            return Err(ConfigError::Invalid("receipt_workers must be > 0".to_string()));
        }
        self.txlist_policy.validate("txlist_policy")?;
        self.receipt_policy.validate("receipt_policy")?;
        for (id, desc) in &self.chains {
            check_url(&format!("chains.{id}.base_url"), &desc.base_url)?;
            check_url(&format!("chains.{id}.scan_url"), &desc.scan_url)?;
        }
        check_url("subgraphs.uniswap_v3", &self.subgraphs.uniswap_v3)?;
        check_url("subgraphs.ethereum_blocks", &self.subgraphs.ethereum_blocks)?;
        Ok(())
    }
}

fn check_url(field: &str, value: &str) -> Result<(), ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl {
        field: field.to_string(),
        source,
    })?;
    Ok(())
}

/// Where a chain's API keys come from.
#[derive(Clone, Debug, Default)]
pub enum ApiKeySource {
    /// The env var named by the chain descriptor.
    #[default]
    Env,
    /// Fixed keys per chain.
    Static(BTreeMap<ChainId, Vec<String>>),
}

impl ApiKeySource {
    pub fn keys_for(&self, chain: &ChainId, desc: &ChainDescriptor) -> Result<Vec<String>, ConfigError> {
        match self {
            ApiKeySource::Env => api_keys_from_env(chain, desc),
            ApiKeySource::Static(map) => match map.get(chain) {
                Some(keys) if !keys.is_empty() => Ok(keys.clone()),
                _ => Err(ConfigError::MissingApiKeys {
                    chain: chain.clone(),
                    env: desc.key_env_name.clone(),
                }),
            },
        }
    }
}

/// Read the chain's API keys from its env var.
pub fn api_keys_from_env(chain: &ChainId, desc: &ChainDescriptor) -> Result<Vec<String>, ConfigError> {
    let raw = std::env::var(&desc.key_env_name).unwrap_or_default();
    let keys = parse_api_keys(&raw);
    if keys.is_empty() {
        return Err(ConfigError::MissingApiKeys {
            chain: chain.clone(),
            env: desc.key_env_name.clone(),
        });
    }
    Ok(keys)
}

/// Split a comma-separated key list, dropping blanks.
pub fn parse_api_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_chains() -> BTreeMap<ChainId, ChainDescriptor> {
    let entries = [
        (
            "ethereum",
            "https://api.etherscan.io/api",
            "0x8898B472C54c31894e3B9bb83cEA802a5d0e63C6",
            "ETHERSCAN_APIKEYS",
            "https://etherscan.io/tx/",
            16_233_067,
        ),
        (
            "optimism",
            "https://api-optimistic.etherscan.io/api",
            "0x8f7492de823025b4cfaab1d34c58963f2af5deda",
            "OPTIMISTICSCAN_APIKEYS",
            "https://optimistic.etherscan.io/tx/",
            53_024_542,
        ),
        (
            "arbitrum_one",
            "https://api.arbiscan.io/api",
            "0xEE9deC2712cCE65174B561151701Bf54b99C24C8",
            "ARBITRUMSCAN_APIKEYS",
            "https://arbiscan.io/tx/",
            47_824_792,
        ),
        (
            "bnb_chain",
            "https://api.bscscan.com/api",
            "0xCd401c10afa37d641d2F594852DA94C700e4F2CE",
            "BSCSCAN_APIKEYS",
            "https://bscscan.com/tx/",
            24_097_171,
        ),
        (
            "gnosis",
            "https://api.gnosisscan.io/api",
            "0x5bb83e95f63217cda6ae3d181ba580ef377d2109",
            "GNOSISSCAN_APIKEYS",
            "https://gnosisscan.io/tx/",
            25_562_300,
        ),
        (
            "polygon",
            "https://api.polygonscan.com/api",
            "0x11984dc4465481512eb5b777E44061C158CF2259",
            "POLYGONSCAN_APIKEYS",
            "https://polygonscan.com/tx/",
            37_100_615,
        ),
    ];
    entries
        .into_iter()
        .map(|(id, base, contract, env, scan, init)| {
            (
                ChainId::from(id),
                ChainDescriptor {
                    base_url: base.to_string(),
                    contract_address: contract.to_string(),
                    key_env_name: env.to_string(),
                    scan_url: scan.to_string(),
                    init_block: init,
                },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_cover_six_chains() {
        let config = ScanConfig::default();
        assert_eq!(config.chains.len(), 6);
        let eth = config.chain(&ChainId::from("ethereum")).unwrap();
        assert_eq!(eth.init_block, 16_233_067);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_chain_is_unsupported() {
        let config = ScanConfig::default();
        let err = config.chain(&ChainId::from("solana")).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedChain(c) if c.as_str() == "solana"));
    }

    #[test]
    fn retain_chains_filters_registry() {
        let mut config = ScanConfig::default();
        config
            .retain_chains(&[ChainId::from("gnosis"), ChainId::from("polygon")])
            .unwrap();
        let ids: Vec<_> = config.chain_ids().map(ChainId::as_str).collect();
        assert_eq!(ids, vec!["gnosis", "polygon"]);
        assert!(config.retain_chains(&[ChainId::from("nope")]).is_err());
    }

    #[test]
    fn api_keys_split_and_trimmed() {
        assert_eq!(parse_api_keys(" a, b ,,c"), vec!["a", "b", "c"]);
        assert!(parse_api_keys("").is_empty());
    }

    #[test]
    fn missing_keys_is_error() {
        let desc = ChainDescriptor {
            base_url: "https://example.org/api".to_string(),
            contract_address: "0x0".to_string(),
            key_env_name: "BRIDGE_SCAN_TEST_KEYS_THAT_DO_NOT_EXIST".to_string(),
            scan_url: "https://example.org/tx/".to_string(),
            init_block: 0,
        };
        let err = api_keys_from_env(&ChainId::from("x"), &desc).unwrap_err();
        assert!(matches!(err, ConfigError::MissingApiKeys { .. }));
    }

    #[test]
    fn static_keys_per_chain() {
        let config = ScanConfig::default();
        let eth = ChainId::from("ethereum");
        let desc = config.chain(&eth).unwrap();
        let source = ApiKeySource::Static(BTreeMap::from([(eth.clone(), vec!["k1".to_string()])]));
        assert_eq!(source.keys_for(&eth, desc).unwrap(), vec!["k1"]);
        let gnosis = ChainId::from("gnosis");
        let err = source
            .keys_for(&gnosis, config.chain(&gnosis).unwrap())
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingApiKeys { env, .. } if env == "GNOSISSCAN_APIKEYS"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut tmp = NamedTempFile::new().unwrap();
        write!(tmp, r#"{{"data_dir":"elsewhere","page_size":50}}"#).unwrap();
        let config = ScanConfig::load_from_path(tmp.path()).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("elsewhere"));
        assert_eq!(config.page_size, 50);
        assert_eq!(config.chains.len(), 6);
        assert_eq!(config.receipt_policy, RetryPolicy::receipt());
    }

    #[test]
    fn bad_url_rejected() {
        let mut tmp = NamedTempFile::new().unwrap();
        write!(
            tmp,
            r#"{{"subgraphs":{{"uniswap_v3":"not a url","ethereum_blocks":"https://x.org"}}}}"#
        )
        .unwrap();
        let err = ScanConfig::load_from_path(tmp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
    }

    #[test]
    fn bad_policy_rejected() {
        let mut tmp = NamedTempFile::new().unwrap();
        write!(
            tmp,
            r#"{{"txlist_policy":{{"max_attempt":1,"wait_time":0.0,"timeout":1e300}}}}"#
        )
        .unwrap();
        let err = ScanConfig::load_from_path(tmp.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref m) if m.contains("txlist_policy.timeout")));

        let negative = RetryPolicy {
            wait_time: -1.0,
            ..RetryPolicy::receipt()
        };
        assert!(negative.validate("receipt_policy").is_err());
        assert!(RetryPolicy::txlist().validate("txlist_policy").is_ok());
    }

    #[test]
    fn huge_policy_values_saturate() {
        let policy = RetryPolicy {
            max_attempt: 1,
            wait_time: f64::NAN,
            timeout: 1e300,
        };
        assert_eq!(policy.timeout(), Duration::MAX);
        assert_eq!(policy.wait(), Duration::ZERO);
    }
}
