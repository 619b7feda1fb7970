//! Block-explorer access: transport, retrying client, transaction records.

pub mod client;
#[cfg(test)]
pub(crate) mod mock;
pub mod transport;
pub mod txn;

pub use client::{ApiKeyRing, KeySchedule, ScanClient, ScanError};
pub use transport::{HttpTransport, Transport, TransportError, TransportResponse};
pub use txn::{RawScanTxn, ScanTxn, TxInput};
