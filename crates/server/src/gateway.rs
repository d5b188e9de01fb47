// Blockstash - Cached Chain Data Service
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Upstream chain access
//!
//! [`ChainGateway`] is the only way the rest of the service talks to the node.
//! [`HttpGateway`] implements it with plain JSON-RPC over HTTP.

use crate::{
    error::GatewayError,
    types::{BlockRecord, BlockSelector, ReceiptRecord, TransactionRecord},
};
use alloy_primitives::{Address, Bytes, B256, U256, U64};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// Common rate limit error patterns found in various RPC providers
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "ratelimit",
    "too many requests",
    "cu limit exceeded",
    "compute units exceeded",
    "quota exceeded",
    "throttled",
    "exceeded the allowed rps",
    "request limit",
];

/// JSON-RPC error codes some providers use for throttling
const RATE_LIMIT_CODES: &[i64] = &[429, -32005, -32098, -32099];

/// Read access to the upstream chain
///
/// Every method is a pure read-through. `NotFound` means the node answered
/// and has no such data (e.g. a future block); `Upstream` means the node could
/// not be asked or answered badly. Timeouts are the implementation's concern.
#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// Fetches a block by number or tag, with its transactions when `full`
    async fn fetch_block(
        &self,
        selector: BlockSelector,
        full: bool,
    ) -> Result<BlockRecord, GatewayError>;

    /// Fetches a transaction by hash
    async fn fetch_transaction(&self, hash: B256) -> Result<TransactionRecord, GatewayError>;

    /// Fetches a receipt by transaction hash; `from` is left unresolved
    async fn fetch_receipt(&self, hash: B256) -> Result<ReceiptRecord, GatewayError>;

    /// Resolves the sender of the transaction at `index` within `block_hash`
    async fn fetch_sender(&self, block_hash: B256, index: u64) -> Result<Address, GatewayError>;
}

/// [`ChainGateway`] backed by a single JSON-RPC node over HTTP
pub struct HttpGateway {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
    requests: AtomicU64,
}

impl HttpGateway {
    /// Creates a gateway for `url`; every request is bounded by `timeout`
    pub fn new(url: impl Into<String>, timeout: Duration) -> eyre::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url: url.into(), next_id: AtomicU64::new(1), requests: AtomicU64::new(0) })
    }

    /// The upstream node URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of JSON-RPC requests sent so far
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Sends one JSON-RPC call and returns its `result`, which may be `null`
    async fn call(&self, method: &str, params: Value) -> Result<Value, GatewayError> {
        let request = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        });

        self.requests.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                warn!("Request {} to {} failed: {}", method, self.url, e);
                GatewayError::Upstream(format!("{method} request failed: {e}"))
            })?;

        let status = response.status();
        let response_text = response.text().await.map_err(|e| {
            GatewayError::Upstream(format!("failed to read {method} response body: {e}"))
        })?;
        let json_result = serde_json::from_str::<Value>(&response_text);

        if is_rate_limit_response(status, &response_text, json_result.as_ref().ok()) {
            warn!("Upstream {} is rate limiting {}", self.url, method);
            return Err(GatewayError::Upstream(format!("{method} rate limited by upstream")));
        }

        if !status.is_success() {
            return Err(GatewayError::Upstream(format!("{method} returned HTTP {status}")));
        }

        let mut response_json = json_result.map_err(|e| {
            GatewayError::Upstream(format!(
                "invalid JSON from upstream for {method}: {e} ({}...)",
                response_text.chars().take(200).collect::<String>()
            ))
        })?;

        if let Some(error) = response_json.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
            let message = error.get("message").and_then(Value::as_str).unwrap_or("unknown error");
            return Err(GatewayError::Upstream(format!("{method} failed with {code}: {message}")));
        }

        debug!("{} answered in {}ms", method, start.elapsed().as_millis());

        response_json
            .get_mut("result")
            .map(Value::take)
            .ok_or_else(|| GatewayError::Upstream(format!("{method} response has no result")))
    }

    /// Like [`Self::call`], mapping a `null` result to `NotFound`
    async fn call_for<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
        what: impl FnOnce() -> String,
    ) -> Result<(T, Value), GatewayError> {
        let result = self.call(method, params).await?;
        if result.is_null() {
            return Err(GatewayError::NotFound(what()));
        }
        let decoded = decode(method, result.clone())?;
        Ok((decoded, result))
    }
}

#[async_trait]
impl ChainGateway for HttpGateway {
    async fn fetch_block(
        &self,
        selector: BlockSelector,
        full: bool,
    ) -> Result<BlockRecord, GatewayError> {
        let (block, _): (RpcBlock, _) = self
            .call_for("eth_getBlockByNumber", json!([selector.rpc_param(), full]), || {
                format!("block {selector}")
            })
            .await?;
        block.into_record(full)
    }

    async fn fetch_transaction(&self, hash: B256) -> Result<TransactionRecord, GatewayError> {
        let (tx, _): (RpcTransaction, _) = self
            .call_for("eth_getTransactionByHash", json!([hash]), || format!("transaction {hash}"))
            .await?;
        Ok(tx.into_record(None))
    }

    async fn fetch_receipt(&self, hash: B256) -> Result<ReceiptRecord, GatewayError> {
        let (receipt, raw): (RpcReceipt, _) = self
            .call_for("eth_getTransactionReceipt", json!([hash]), || format!("receipt {hash}"))
            .await?;
        Ok(receipt.into_record(raw.to_string()))
    }

    async fn fetch_sender(&self, block_hash: B256, index: u64) -> Result<Address, GatewayError> {
        let (tx, _): (RpcTransaction, _) = self
            .call_for(
                "eth_getTransactionByBlockHashAndIndex",
                json!([block_hash, format!("{index:#x}")]),
                || format!("transaction {index} of block {block_hash}"),
            )
            .await?;
        tx.from.ok_or_else(|| {
            GatewayError::Upstream(format!("transaction {index} of block {block_hash} has no sender"))
        })
    }
}

/// Detects throttling by HTTP status, response text, or JSON-RPC error
fn is_rate_limit_response(status: StatusCode, response_text: &str, json: Option<&Value>) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
        return true;
    }

    let text_lower = response_text.to_lowercase();
    if RATE_LIMIT_PATTERNS.iter().any(|pattern| text_lower.contains(pattern)) {
        return true;
    }

    json.and_then(|json| json.get("error"))
        .and_then(|error| error.get("code"))
        .and_then(Value::as_i64)
        .is_some_and(|code| RATE_LIMIT_CODES.contains(&code))
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Result<T, GatewayError> {
    serde_json::from_value(value)
        .map_err(|e| GatewayError::Upstream(format!("malformed {method} payload: {e}")))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcBlock {
    number: U64,
    hash: B256,
    parent_hash: B256,
    timestamp: U64,
    transactions_root: B256,
    #[serde(default)]
    transactions: Vec<Value>,
}

impl RpcBlock {
    fn into_record(self, full: bool) -> Result<BlockRecord, GatewayError> {
        let number = self.number.to::<u64>();

        let transactions = if full {
            let txs = self
                .transactions
                .into_iter()
                .map(|tx| {
                    decode::<RpcTransaction>("eth_getBlockByNumber", tx)
                        .map(|tx| tx.into_record(Some(number)))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Some(txs)
        } else {
            None
        };

        Ok(BlockRecord {
            number,
            hash: self.hash,
            parent_hash: self.parent_hash,
            timestamp: self.timestamp.to::<u64>(),
            transactions_root: self.transactions_root,
            transactions,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    hash: B256,
    nonce: U64,
    #[serde(default)]
    from: Option<Address>,
    #[serde(default)]
    to: Option<Address>,
    value: U256,
    gas: U64,
    #[serde(default)]
    gas_price: Option<U256>,
    #[serde(default)]
    input: Bytes,
    #[serde(default)]
    block_number: Option<U64>,
    #[serde(default)]
    transaction_index: Option<U64>,
}

impl RpcTransaction {
    /// `block_number` overrides the payload's; pending transactions get 0
    fn into_record(self, block_number: Option<u64>) -> TransactionRecord {
        TransactionRecord {
            hash: self.hash,
            nonce: self.nonce.to::<u64>(),
            to: self.to,
            value: self.value,
            gas_limit: self.gas.to::<u64>(),
            gas_price: self.gas_price.unwrap_or_default(),
            input: self.input,
            block_number: block_number
                .or_else(|| self.block_number.map(|n| n.to::<u64>()))
                .unwrap_or_default(),
            transaction_index: self.transaction_index.map(|i| i.to::<u64>()),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: B256,
    block_hash: B256,
    block_number: U64,
    transaction_index: U64,
    #[serde(default)]
    contract_address: Option<Address>,
    gas_used: U64,
    #[serde(default)]
    status: Option<U64>,
    #[serde(default)]
    to: Option<Address>,
    #[serde(default)]
    logs: Vec<Value>,
}

impl RpcReceipt {
    fn into_record(self, raw: String) -> ReceiptRecord {
        let now = crate::types::now_millis();
        ReceiptRecord {
            transaction_hash: self.transaction_hash,
            block_hash: self.block_hash,
            block_number: self.block_number.to::<u64>(),
            transaction_index: self.transaction_index.to::<u64>(),
            contract_address: self.contract_address,
            gas_used: self.gas_used.to::<u64>(),
            status: self.status.map(|s| s.to::<u64>()).unwrap_or_default(),
            from: None,
            to: self.to,
            log_count: self.logs.len() as u64,
            raw,
            created_at: now,
            updated_at: now,
        }
    }
}
