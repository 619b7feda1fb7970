//! Explorer transaction rows and the cached record built from them.

use crate::config::ChainId;
use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Error, Debug)]
pub enum TxnError {
    #[error("field {field}: cannot parse {value:?} as integer")]
    Integer { field: &'static str, value: String },
}

/// One row of `module=account&action=txlist`, exactly as the explorer sends it.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawScanTxn {
    pub block_number: String,
    pub time_stamp: String,
    pub hash: String,
    pub nonce: String,
    #[serde(default)]
    pub block_hash: String,
    pub transaction_index: String,
    pub from: String,
    #[serde(default)]
    pub to: String,
    pub value: String,
    pub gas: String,
    pub gas_price: String,
    #[serde(default)]
    pub is_error: String,
    #[serde(rename = "txreceipt_status", default)]
    pub txreceipt_status: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub contract_address: String,
    #[serde(default)]
    pub cumulative_gas_used: String,
    #[serde(default)]
    pub gas_used: String,
    #[serde(default)]
    pub confirmations: String,
    #[serde(default)]
    pub method_id: String,
    #[serde(default)]
    pub function_name: String,
}

impl RawScanTxn {
    /// Explorer flags reverted transactions with `isError == "1"`.
    pub fn is_failed(&self) -> bool {
        self.is_error.trim() == "1"
    }
}

/// Call input: decoded parameters when the ABI matched, raw hex otherwise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TxInput {
    Decoded(serde_json::Map<String, serde_json::Value>),
    Raw(String),
}

impl TxInput {
    pub fn is_decoded(&self) -> bool {
        matches!(self, TxInput::Decoded(_))
    }
}

/// Cached bridge transaction. `logs == None` means the receipt is not yet resolved.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanTxn {
    pub chain: ChainId,
    pub block_number: u64,
    pub time_stamp: u64,
    pub hash: String,
    pub nonce: u64,
    pub block_hash: String,
    pub transaction_index: u64,
    #[serde(rename = "from_address")]
    pub from_address: String,
    #[serde(rename = "to_address")]
    pub to_address: String,
    #[serde(with = "u256_dec")]
    pub value: U256,
    #[serde(with = "u256_dec")]
    pub gas: U256,
    #[serde(with = "u256_dec")]
    pub gas_price: U256,
    pub is_error: u8,
    #[serde(rename = "txreceipt_status", default)]
    pub txreceipt_status: Option<u8>,
    pub input: TxInput,
    pub contract_address: String,
    #[serde(with = "u256_dec")]
    pub cumulative_gas_used: U256,
    #[serde(with = "u256_dec")]
    pub gas_used: U256,
    #[serde(with = "u256_dec")]
    pub confirmations: U256,
    #[serde(default)]
    pub method_id: String,
    #[serde(default)]
    pub function_name: String,
    #[serde(rename = "tx_url")]
    pub tx_url: String,
    #[serde(default)]
    pub logs: Option<Vec<serde_json::Value>>,
}

impl ScanTxn {
    pub fn from_raw(
        chain: &ChainId,
        scan_url: &str,
        raw: RawScanTxn,
        input: TxInput,
    ) -> Result<Self, TxnError> {
        let tx_url = format!("{}/{}", scan_url.trim_end_matches('/'), raw.hash);
        let txreceipt_status = match raw.txreceipt_status.trim() {
            "" => None,
            s => Some(parse_int::<u8>("txreceipt_status", s)?),
        };
        Ok(Self {
            chain: chain.clone(),
            block_number: parse_int("blockNumber", &raw.block_number)?,
            time_stamp: parse_int("timeStamp", &raw.time_stamp)?,
            nonce: parse_int("nonce", &raw.nonce)?,
            block_hash: raw.block_hash,
            transaction_index: parse_int("transactionIndex", &raw.transaction_index)?,
            from_address: raw.from,
            to_address: raw.to,
            value: parse_u256("value", &raw.value)?,
            gas: parse_u256("gas", &raw.gas)?,
            gas_price: parse_u256("gasPrice", &raw.gas_price)?,
            is_error: if raw.is_error.trim().is_empty() {
                0
            } else {
                parse_int("isError", &raw.is_error)?
            },
            txreceipt_status,
            input,
            contract_address: raw.contract_address,
            cumulative_gas_used: parse_u256("cumulativeGasUsed", &raw.cumulative_gas_used)?,
            gas_used: parse_u256("gasUsed", &raw.gas_used)?,
            confirmations: parse_u256("confirmations", &raw.confirmations)?,
            method_id: raw.method_id,
            function_name: raw.function_name,
            tx_url,
            hash: raw.hash,
            logs: None,
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.logs.is_some()
    }

    /// Function name without its parameter list, e.g. `xcall`.
    pub fn function_short_name(&self) -> &str {
        self.function_name
            .split('(')
            .next()
            .unwrap_or(&self.function_name)
    }

    pub fn timestamp_utc(&self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp(i64::try_from(self.time_stamp).ok()?).ok()
    }

    /// Key that orders records within a chain.
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.transaction_index)
    }
}

fn parse_int<T: FromStr>(field: &'static str, value: &str) -> Result<T, TxnError> {
    value.trim().parse::<T>().map_err(|_| TxnError::Integer {
        field,
        value: value.to_string(),
    })
}

fn parse_u256(field: &'static str, value: &str) -> Result<U256, TxnError> {
    let v = value.trim();
    if v.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str(v).map_err(|_| TxnError::Integer {
        field,
        value: value.to_string(),
    })
}

/// U256 as a decimal string on disk; also reads JSON integers and `0x` hex.
mod u256_dec {
    use alloy_primitives::U256;
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S: Serializer>(v: &U256, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(v)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<U256, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(u64),
            Str(String),
        }
        match Repr::deserialize(d)? {
            Repr::Num(n) => Ok(U256::from(n)),
            Repr::Str(s) => U256::from_str(s.trim()).map_err(de::Error::custom),
        }
    }
}
