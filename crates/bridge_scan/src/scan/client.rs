//! Etherscan-family explorer client with API-key rotation, fixed-wait retries
//! and page-by-page transaction listing.

use crate::config::{
    ApiKeySource, ChainDescriptor, ChainId, ConfigError, RetryPolicy, ScanConfig,
    DEFAULT_END_BLOCK,
};
use crate::decode::InputDecoder;
use crate::scan::transport::{Transport, TransportError};
use crate::scan::txn::{RawScanTxn, ScanTxn, TxInput, TxnError};
use rand::Rng;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Explorer message that accompanies `status == "0"` on an empty listing.
const NO_TRANSACTIONS: &str = "No transactions found";

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("http status {0}")]
    Status(u16),
    #[error("api error: {0}")]
    Api(String),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected payload: {0}")]
    UnexpectedPayload(String),
    #[error("no api keys configured for {0}")]
    NoApiKeys(ChainId),
    #[error("txn: {0}")]
    Txn(#[from] TxnError),
    #[error("config: {0}")]
    Config(#[from] ConfigError),
}

/// How the next API key is picked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeySchedule {
    RoundRobin,
    Random,
}

/// API keys of one client. Rotation state belongs to this instance only.
pub struct ApiKeyRing {
    keys: Vec<String>,
    schedule: KeySchedule,
    next: AtomicUsize,
}

impl ApiKeyRing {
    pub fn new(keys: Vec<String>, schedule: KeySchedule) -> Self {
        Self {
            keys,
            schedule,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Returns `None` only when the ring is empty.
    pub fn next_key(&self) -> Option<&str> {
        if self.keys.is_empty() {
            return None;
        }
        let idx = match self.schedule {
            KeySchedule::RoundRobin => self.next.fetch_add(1, Ordering::Relaxed) % self.keys.len(),
            KeySchedule::Random => rand::thread_rng().gen_range(0..self.keys.len()),
        };
        debug!(idx, total = self.keys.len(), "using api key");
        Some(&self.keys[idx])
    }
}

pub struct ScanClient {
    chain: ChainId,
    api_url: String,
    scan_url: String,
    contract_address: String,
    keys: ApiKeyRing,
    transport: Arc<dyn Transport>,
    decoder: Option<Arc<dyn InputDecoder>>,
    request_count: AtomicU64,
}

impl ScanClient {
    pub fn new(
        chain: ChainId,
        desc: &ChainDescriptor,
        keys: Vec<String>,
        schedule: KeySchedule,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ScanError> {
        if keys.is_empty() {
            return Err(ScanError::NoApiKeys(chain));
        }
        debug!(chain = %chain, keys = keys.len(), "explorer client ready");
        Ok(Self {
            chain,
            api_url: desc.base_url.clone(),
            scan_url: desc.scan_url.clone(),
            contract_address: desc.contract_address.clone(),
            keys: ApiKeyRing::new(keys, schedule),
            transport,
            decoder: None,
            request_count: AtomicU64::new(0),
        })
    }

    /// Build a client for a configured `chain`.
    pub fn for_chain(
        config: &ScanConfig,
        chain: &ChainId,
        keys: &ApiKeySource,
        schedule: KeySchedule,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ScanError> {
        let desc = config.chain(chain)?;
        let keys = keys.keys_for(chain, desc)?;
        Self::new(chain.clone(), desc, keys, schedule, transport)
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn InputDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn chain(&self) -> &ChainId {
        &self.chain
    }

    pub fn contract_address(&self) -> &str {
        &self.contract_address
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// GET `url` with a fresh API key per attempt. Makes at most
    /// `policy.max_attempt + 1` attempts and returns the last error after that.
    pub async fn request_with_retry(
        &self,
        url: &str,
        params: &[(&str, String)],
        policy: &RetryPolicy,
    ) -> Result<Value, ScanError> {
        let mut attempt = 0u32;
        loop {
            let key = self
                .keys
                .next_key()
                .ok_or_else(|| ScanError::NoApiKeys(self.chain.clone()))?;
            let mut query: Vec<(String, String)> = params
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect();
            query.push(("apikey".to_string(), key.to_string()));

            match self.attempt(url, &query, policy.timeout()).await {
                Ok(body) => return Ok(body),
                Err(e) if attempt >= policy.max_attempt => {
                    warn!(chain = %self.chain, attempt, max_attempt = policy.max_attempt, error = %e, "explorer request failed, giving up");
                    return Err(e);
                }
                Err(e) => {
                    warn!(chain = %self.chain, attempt, max_attempt = policy.max_attempt, error = %e, "explorer request failed, retrying");
                    tokio::time::sleep(policy.wait()).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(
        &self,
        url: &str,
        query: &[(String, String)],
        timeout: Duration,
    ) -> Result<Value, ScanError> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        let res = self.transport.get(url, query, timeout).await?;
        if !res.is_ok() {
            return Err(ScanError::Status(res.status));
        }
        let body: Value = serde_json::from_str(&res.body)?;
        check_api_status(&body)?;
        Ok(body)
    }

    /// `eth_getTransactionReceipt` via the explorer proxy. Returns the raw `result`.
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: &str,
        policy: &RetryPolicy,
    ) -> Result<Value, ScanError> {
        let mut body = self
            .request_with_retry(
                &self.api_url,
                &[
                    ("module", "proxy".to_string()),
                    ("action", "eth_getTransactionReceipt".to_string()),
                    ("txhash", tx_hash.to_string()),
                ],
                policy,
            )
            .await?;
        Ok(body.get_mut("result").map(Value::take).unwrap_or(Value::Null))
    }

    /// Latest block number via `eth_blockNumber`.
    pub async fn latest_block_number(&self, policy: &RetryPolicy) -> Result<u64, ScanError> {
        let body = self
            .request_with_retry(
                &self.api_url,
                &[
                    ("module", "proxy".to_string()),
                    ("action", "eth_blockNumber".to_string()),
                ],
                policy,
            )
            .await?;
        let hex_block = body
            .get("result")
            .and_then(Value::as_str)
            .ok_or_else(|| ScanError::UnexpectedPayload(format!("eth_blockNumber: {body}")))?;
        u64::from_str_radix(hex_block.trim_start_matches("0x"), 16)
            .map_err(|_| ScanError::UnexpectedPayload(format!("eth_blockNumber: {hex_block}")))
    }

    /// Unix timestamp of `block` (from the block reward endpoint).
    pub async fn block_timestamp(&self, block: u64, policy: &RetryPolicy) -> Result<u64, ScanError> {
        let body = self
            .request_with_retry(
                &self.api_url,
                &[
                    ("module", "block".to_string()),
                    ("action", "getblockreward".to_string()),
                    ("blockno", block.to_string()),
                ],
                policy,
            )
            .await?;
        let ts = body
            .get("result")
            .and_then(|r| r.get("timeStamp"))
            .and_then(Value::as_str)
            .ok_or_else(|| ScanError::UnexpectedPayload(format!("getblockreward: {body}")))?;
        ts.parse::<u64>()
            .map_err(|_| ScanError::UnexpectedPayload(format!("getblockreward timeStamp: {ts}")))
    }

    /// All successful transactions to `address` from `startblock` on, ascending.
    /// Walks pages until the explorer returns an empty page.
    pub async fn get_transactions_by_address(
        &self,
        address: &str,
        startblock: u64,
        endblock: u64,
        offset: u32,
        policy: &RetryPolicy,
    ) -> Result<Vec<ScanTxn>, ScanError> {
        let mut transactions = Vec::new();
        let mut failed = 0usize;
        let mut page = 1u32;
        loop {
            debug!(chain = %self.chain, page, address, "fetching page");
            let mut body = self
                .request_with_retry(
                    &self.api_url,
                    &[
                        ("module", "account".to_string()),
                        ("action", "txlist".to_string()),
                        ("address", address.to_string()),
                        ("startblock", startblock.to_string()),
                        ("endblock", endblock.to_string()),
                        ("page", page.to_string()),
                        ("offset", offset.to_string()),
                        ("sort", "asc".to_string()),
                    ],
                    policy,
                )
                .await?;
            let rows = match body.get_mut("result").map(Value::take) {
                Some(Value::Array(rows)) => rows,
                Some(other) => {
                    return Err(ScanError::UnexpectedPayload(format!("txlist result: {other}")))
                }
                None => {
                    return Err(ScanError::UnexpectedPayload(
                        "txlist response without result".to_string(),
                    ))
                }
            };
            if rows.is_empty() {
                break;
            }
            for row in rows {
                let raw: RawScanTxn = serde_json::from_value(row)?;
                if raw.is_failed() {
                    failed += 1;
                    continue;
                }
                transactions.push(self.build_txn(raw)?);
            }
            page += 1;
        }
        info!(chain = %self.chain, count = transactions.len(), failed, pages = page - 1, "fetched transactions");
        Ok(transactions)
    }

    /// Transactions of the chain's bridge contract from `startblock` on.
    pub async fn contract_transactions(
        &self,
        startblock: u64,
        offset: u32,
        policy: &RetryPolicy,
    ) -> Result<Vec<ScanTxn>, ScanError> {
        let address = self.contract_address.clone();
        self.get_transactions_by_address(&address, startblock, DEFAULT_END_BLOCK, offset, policy)
            .await
    }

    fn build_txn(&self, raw: RawScanTxn) -> Result<ScanTxn, ScanError> {
        let input = match &self.decoder {
            Some(decoder) => match decoder.decode(&raw.input) {
                Ok(params) => TxInput::Decoded(params),
                Err(e) => {
                    warn!(chain = %self.chain, hash = %raw.hash, error = %e, "failed to decode input");
                    TxInput::Raw(raw.input.clone())
                }
            },
            None => TxInput::Raw(raw.input.clone()),
        };
        Ok(ScanTxn::from_raw(&self.chain, &self.scan_url, raw, input)?)
    }
}

/// `status == "0"` is an application failure unless the listing is merely empty.
fn check_api_status(body: &Value) -> Result<(), ScanError> {
    if body.get("status").and_then(Value::as_str) != Some("0") {
        return Ok(());
    }
    let message = body.get("message").and_then(Value::as_str).unwrap_or("");
    if message == NO_TRANSACTIONS {
        return Ok(());
    }
    let detail = match body.get("result") {
        Some(Value::String(s)) => format!("{message}: {s}"),
        _ => message.to_string(),
    };
    Err(ScanError::Api(detail))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DecodeError;
    use crate::scan::mock::{ok_json, ScriptedTransport};
    use crate::scan::txn::tests::raw_row;
    use serde_json::json;

    fn desc() -> ChainDescriptor {
        ChainDescriptor {
            base_url: "https://api.example.org/api".to_string(),
            contract_address: "0xdiamond".to_string(),
            key_env_name: "UNUSED".to_string(),
            scan_url: "https://example.org/tx/".to_string(),
            init_block: 0,
        }
    }

    fn fast(max_attempt: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempt,
            wait_time: 0.0,
            timeout: 1.0,
        }
    }

    fn client(transport: Arc<ScriptedTransport>, keys: &[&str]) -> ScanClient {
        ScanClient::new(
            ChainId::from("testnet"),
            &desc(),
            keys.iter().map(|k| k.to_string()).collect(),
            KeySchedule::RoundRobin,
            transport,
        )
        .unwrap()
    }

    fn page(rows: Vec<Value>) -> Result<crate::scan::transport::TransportResponse, TransportError> {
        if rows.is_empty() {
            ok_json(json!({"status":"0","message":"No transactions found","result":[]}))
        } else {
            ok_json(json!({"status":"1","message":"OK","result":rows}))
        }
    }

    #[tokio::test]
    async fn gives_up_after_max_attempt_plus_one() {
        let transport = Arc::new(ScriptedTransport::always_timeout());
        let c = client(transport.clone(), &["k"]);
        let err = c
            .request_with_retry("https://x", &[], &fast(3))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Transport(TransportError::Timeout)));
        assert_eq!(transport.call_count(), 4);
        assert_eq!(c.request_count(), 4);
    }

    #[tokio::test]
    async fn zero_retries_means_one_attempt() {
        let transport = Arc::new(ScriptedTransport::always_timeout());
        let c = client(transport.clone(), &["k"]);
        assert!(c.request_with_retry("https://x", &[], &fast(0)).await.is_err());
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn api_error_and_bad_status_are_retried() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ok_json(json!({"status":"0","message":"NOTOK","result":"Max rate limit reached"})),
            Ok(crate::scan::transport::TransportResponse {
                status: 502,
                body: "bad gateway".into(),
            }),
            Ok(crate::scan::transport::TransportResponse {
                status: 200,
                body: "<html>".into(),
            }),
            ok_json(json!({"status":"1","message":"OK","result":"0x10"})),
        ]));
        let c = client(transport.clone(), &["k"]);
        let body = c
            .request_with_retry("https://x", &[], &fast(5))
            .await
            .unwrap();
        assert_eq!(body["result"], "0x10");
        assert_eq!(transport.call_count(), 4);
    }

    #[tokio::test]
    async fn last_api_error_is_returned() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ok_json(json!({"status":"0","message":"NOTOK","result":"Invalid API Key"})),
            ok_json(json!({"status":"0","message":"NOTOK","result":"Invalid API Key"})),
        ]));
        let c = client(transport, &["k"]);
        let err = c
            .request_with_retry("https://x", &[], &fast(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ScanError::Api(m) if m == "NOTOK: Invalid API Key"));
    }

    #[tokio::test]
    async fn empty_listing_is_success() {
        let transport = Arc::new(ScriptedTransport::new(vec![page(vec![])]));
        let c = client(transport.clone(), &["k"]);
        let body = c
            .request_with_retry("https://x", &[], &fast(3))
            .await
            .unwrap();
        assert_eq!(body["result"], json!([]));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn round_robin_rotates_keys() {
        let transport = Arc::new(ScriptedTransport::repeating(ok_json(json!({"result": 1}))));
        let c = client(transport.clone(), &["a", "b", "c"]);
        for _ in 0..4 {
            c.request_with_retry("https://x", &[("module", "m".into())], &fast(0))
                .await
                .unwrap();
        }
        let keys: Vec<String> = transport
            .calls()
            .iter()
            .map(|q| param(q, "apikey").unwrap())
            .collect();
        assert_eq!(keys, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn random_keys_stay_in_ring() {
        let ring = ApiKeyRing::new(vec!["a".into(), "b".into()], KeySchedule::Random);
        for _ in 0..50 {
            let k = ring.next_key().unwrap();
            assert!(k == "a" || k == "b");
        }
        assert!(ApiKeyRing::new(vec![], KeySchedule::Random).next_key().is_none());
    }

    #[test]
    fn empty_key_list_rejected() {
        let err = ScanClient::new(
            ChainId::from("x"),
            &desc(),
            vec![],
            KeySchedule::RoundRobin,
            Arc::new(ScriptedTransport::always_timeout()),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ScanError::NoApiKeys(_)));
    }

    fn param(query: &[(String, String)], name: &str) -> Option<String> {
        query.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
    }

    #[tokio::test]
    async fn pages_until_empty() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            page(vec![raw_row("0x1", 10, "0"), raw_row("0x2", 11, "0")]),
            page(vec![raw_row("0x3", 12, "0"), raw_row("0x4", 13, "0")]),
            page(vec![]),
            page(vec![raw_row("0x5", 14, "0")]),
        ]));
        let c = client(transport.clone(), &["k"]);
        let txs = c
            .get_transactions_by_address("0xdiamond", 10, DEFAULT_END_BLOCK, 2, &fast(0))
            .await
            .unwrap();
        let hashes: Vec<_> = txs.iter().map(|t| t.hash.as_str()).collect();
        assert_eq!(hashes, vec!["0x1", "0x2", "0x3", "0x4"]);
        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        let pages: Vec<_> = calls.iter().map(|q| param(q, "page").unwrap()).collect();
        assert_eq!(pages, vec!["1", "2", "3"]);
        assert_eq!(param(&calls[0], "startblock").unwrap(), "10");
        assert_eq!(param(&calls[0], "sort").unwrap(), "asc");
        assert_eq!(param(&calls[0], "offset").unwrap(), "2");
    }

    #[tokio::test]
    async fn failed_transactions_dropped() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            page(vec![
                raw_row("0xa", 5, "0"),
                raw_row("0xb", 5, "1"),
                raw_row("0xc", 7, "0"),
            ]),
            page(vec![]),
        ]));
        let c = client(transport, &["k"]);
        let txs = c.contract_transactions(0, 1000, &fast(0)).await.unwrap();
        let got: Vec<_> = txs.iter().map(|t| (t.block_number, t.hash.as_str())).collect();
        assert_eq!(got, vec![(5, "0xa"), (7, "0xc")]);
        assert!(txs.iter().all(|t| t.tx_url.starts_with("https://example.org/tx/0x")));
    }

    #[tokio::test]
    async fn non_list_result_is_unexpected() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok_json(
            json!({"status":"1","message":"OK","result":"Query Timeout occured"}),
        )]));
        let c = client(transport, &["k"]);
        let err = c.contract_transactions(0, 1000, &fast(0)).await.unwrap_err();
        assert!(matches!(err, ScanError::UnexpectedPayload(_)));
    }

    struct FailingDecoder;

    impl InputDecoder for FailingDecoder {
        fn decode(&self, input: &str) -> Result<serde_json::Map<String, Value>, DecodeError> {
            Err(DecodeError::NoSelector(input.len() / 2))
        }
    }

    struct EchoDecoder;

    impl InputDecoder for EchoDecoder {
        fn decode(&self, input: &str) -> Result<serde_json::Map<String, Value>, DecodeError> {
            let mut m = serde_json::Map::new();
            m.insert("raw".into(), Value::String(input.to_string()));
            Ok(m)
        }
    }

    #[tokio::test]
    async fn decode_failure_keeps_raw_input() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            page(vec![raw_row("0xa", 5, "0")]),
            page(vec![]),
        ]));
        let c = client(transport, &["k"]).with_decoder(Arc::new(FailingDecoder));
        let txs = c.contract_transactions(0, 1000, &fast(0)).await.unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].input, TxInput::Raw("0xdeadbeef".into()));
    }

    #[tokio::test]
    async fn decoded_input_stored() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            page(vec![raw_row("0xa", 5, "0")]),
            page(vec![]),
        ]));
        let c = client(transport, &["k"]).with_decoder(Arc::new(EchoDecoder));
        let txs = c.contract_transactions(0, 1000, &fast(0)).await.unwrap();
        assert!(txs[0].input.is_decoded());
    }

    #[tokio::test]
    async fn proxy_endpoints() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ok_json(json!({"jsonrpc":"2.0","id":1,"result":{"logs":[{"logIndex":"0x0"}]}})),
            ok_json(json!({"jsonrpc":"2.0","id":83,"result":"0xf73a2b"})),
            ok_json(json!({"status":"1","message":"OK","result":{"blockNumber":"16233067","timeStamp":"1671630011"}})),
        ]));
        let c = client(transport.clone(), &["k"]);
        let receipt = c.get_transaction_receipt("0xabc", &fast(0)).await.unwrap();
        assert_eq!(receipt["logs"].as_array().unwrap().len(), 1);
        assert_eq!(c.latest_block_number(&fast(0)).await.unwrap(), 0xf73a2b);
        assert_eq!(
            c.block_timestamp(16_233_067, &fast(0)).await.unwrap(),
            1_671_630_011
        );
        let calls = transport.calls();
        assert_eq!(param(&calls[0], "txhash").unwrap(), "0xabc");
        assert_eq!(param(&calls[2], "blockno").unwrap(), "16233067");
    }
}
