//! bridge_scan: incremental history of Connext Amarok bridge transactions.
//!
//! Pulls the diamond contract's transactions from each chain's block explorer,
//! keeps them in a file-per-record cache, backfills receipt logs, and samples
//! historical WETH prices from subgraphs.

pub mod cache;
pub mod config;
pub mod decode;
pub mod pool;
pub mod price;
pub mod reconcile;
pub mod scan;
pub mod subgraph;

pub use cache::{CacheSnapshot, TxCache};
pub use config::{ApiKeySource, ChainDescriptor, ChainId, RetryPolicy, ScanConfig};
pub use decode::{AbiDecoder, InputDecoder};
pub use pool::WorkerPool;
pub use price::{PriceFetcher, PriceReport, PriceRow};
pub use reconcile::{ReconcileReport, Reconciler, ResolveSummary, SyncReport};
pub use scan::{HttpTransport, ScanClient, ScanError, ScanTxn, Transport};
