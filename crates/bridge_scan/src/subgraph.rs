//! GraphQL subgraph clients used for price sampling.

use crate::scan::{Transport, TransportError};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Uniswap V3 USDC/WETH 0.05% pool on Ethereum.
pub const USDC_WETH_POOL: &str = "0x88e6a0c2ddd26feeb64f039a2c41296fcb3f5640";

#[derive(Error, Debug)]
pub enum SubgraphError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("subgraph returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("graphql errors: {0}")]
    Graphql(String),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing {0} in response")]
    Missing(String),
}

/// POSTs queries to one subgraph. No retries: a non-200 answer is a hard failure.
pub struct SubgraphClient {
    url: String,
    transport: Arc<dyn Transport>,
}

impl SubgraphClient {
    pub fn new(url: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            url: url.into(),
            transport,
        }
    }

    /// Run `query` and return its `data` object.
    pub async fn query(&self, query: &str) -> Result<Value, SubgraphError> {
        let res = self
            .transport
            .post_json(&self.url, &json!({ "query": query }))
            .await?;
        if !res.is_ok() {
            return Err(SubgraphError::Status {
                status: res.status,
                body: res.body,
            });
        }
        let mut body: Value = serde_json::from_str(&res.body)?;
        if let Some(errors) = body.get("errors").filter(|e| !e.is_null()) {
            return Err(SubgraphError::Graphql(errors.to_string()));
        }
        body.get_mut("data")
            .map(Value::take)
            .ok_or_else(|| SubgraphError::Missing("data".to_string()))
    }
}

pub struct UniswapV3Subgraph {
    client: SubgraphClient,
}

impl UniswapV3Subgraph {
    pub fn new(url: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            client: SubgraphClient::new(url, transport),
        }
    }

    pub fn pools_query(pool_ids: &[&str], block: Option<u64>) -> String {
        let ids = pool_ids
            .iter()
            .map(|id| format!("\"{}\"", id.to_lowercase()))
            .collect::<Vec<_>>()
            .join(",");
        let block_arg = block
            .map(|b| format!("block: {{number: {b}}}, "))
            .unwrap_or_default();
        format!(
            "{{ pools({block_arg}where: {{id_in: [{ids}]}}) {{ id token0 {{ id symbol name }} token1 {{ id symbol name }} token0Price token1Price totalValueLockedUSD }} }}"
        )
    }

    pub async fn pools(&self, pool_ids: &[&str], block: Option<u64>) -> Result<Vec<Value>, SubgraphError> {
        let mut data = self.client.query(&Self::pools_query(pool_ids, block)).await?;
        debug!(?block, "pools response");
        match data.get_mut("pools").map(Value::take) {
            Some(Value::Array(pools)) => Ok(pools),
            _ => Err(SubgraphError::Missing("pools".to_string())),
        }
    }

    /// WETH price in USDC (`token0Price` of the USDC/WETH pool) at `block`.
    pub async fn weth_price(&self, block: Option<u64>) -> Result<String, SubgraphError> {
        let pools = self.pools(&[USDC_WETH_POOL], block).await?;
        if pools.len() > 1 {
            warn!(count = pools.len(), "expected one pool, using the first");
        }
        let pool = pools
            .first()
            .ok_or_else(|| SubgraphError::Missing("pool".to_string()))?;
        match pool.get("token0Price") {
            Some(Value::String(p)) => Ok(p.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(SubgraphError::Missing("token0Price".to_string())),
        }
    }
}

pub struct EthereumBlocksSubgraph {
    client: SubgraphClient,
}

impl EthereumBlocksSubgraph {
    pub fn new(url: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            client: SubgraphClient::new(url, transport),
        }
    }

    /// Timestamps recorded for block `number` (normally exactly one).
    pub async fn timestamps_for_block(&self, number: u64) -> Result<Vec<u64>, SubgraphError> {
        let query = format!(
            "{{ blocks(first: 1, orderBy: timestamp, orderDirection: desc, where: {{number_in: [\"{number}\"]}}) {{ id number timestamp }} }}"
        );
        self.block_field(&query, "timestamp").await
    }

    /// Number of the last block strictly before `unix`.
    pub async fn blocks_before_timestamp(&self, unix: u64) -> Result<Vec<u64>, SubgraphError> {
        let query = format!(
            "{{ blocks(first: 1, orderBy: timestamp, orderDirection: desc, where: {{timestamp_lt: \"{unix}\"}}) {{ id number timestamp }} }}"
        );
        self.block_field(&query, "number").await
    }

    async fn block_field(&self, query: &str, field: &str) -> Result<Vec<u64>, SubgraphError> {
        let data = self.client.query(query).await?;
        let blocks = data
            .get("blocks")
            .and_then(Value::as_array)
            .ok_or_else(|| SubgraphError::Missing("blocks".to_string()))?;
        blocks
            .iter()
            .map(|b| {
                b.get(field)
                    .and_then(as_u64)
                    .ok_or_else(|| SubgraphError::Missing(format!("blocks.{field}")))
            })
            .collect()
    }
}

/// Subgraphs send big numbers as strings.
fn as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}
