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

//! Test doubles and fixtures shared by unit and integration tests

use crate::{
    cache::{FastCache, MemoryCache},
    error::{CacheError, GatewayError, StoreError},
    gateway::ChainGateway,
    metrics::Counter,
    store::{PersistentStore, SqliteStore, StoreCounts},
    types::{BlockRecord, BlockSelector, ReceiptRecord, TransactionRecord},
};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

/// The four upstream operations, for scripting and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayCall {
    /// `fetch_block`
    Block,
    /// `fetch_transaction`
    Transaction,
    /// `fetch_receipt`
    Receipt,
    /// `fetch_sender`
    Sender,
}

enum Scripted {
    Fail(GatewayError),
    Panic,
}

#[derive(Default)]
struct MockState {
    blocks: HashMap<BlockSelector, BlockRecord>,
    transactions: HashMap<B256, TransactionRecord>,
    receipts: HashMap<B256, ReceiptRecord>,
    senders: HashMap<(B256, u64), Address>,
    next: HashMap<GatewayCall, VecDeque<Scripted>>,
    always: HashMap<GatewayCall, GatewayError>,
    calls: HashMap<GatewayCall, u64>,
    delay: Option<Duration>,
}

/// In-memory [`ChainGateway`] with scripted failures and call counters
///
/// Unknown items answer `NotFound`. One-shot scripts (`fail_next`,
/// `panic_next`) run before sticky failures (`fail_always`).
#[derive(Default)]
pub struct MockGateway {
    state: Mutex<MockState>,
}

impl MockGateway {
    /// Creates an empty gateway
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `block` for `selector`, stripped of its body for header-only fetches
    pub fn insert_block(&self, selector: BlockSelector, block: BlockRecord) {
        self.state.lock().blocks.insert(selector, block);
    }

    /// Serves a transaction by its hash
    pub fn insert_transaction(&self, tx: TransactionRecord) {
        self.state.lock().transactions.insert(tx.hash, tx);
    }

    /// Serves a receipt by its transaction hash
    pub fn insert_receipt(&self, receipt: ReceiptRecord) {
        self.state.lock().receipts.insert(receipt.transaction_hash, receipt);
    }

    /// Serves the sender of transaction `index` in `block_hash`
    pub fn insert_sender(&self, block_hash: B256, index: u64, sender: Address) {
        self.state.lock().senders.insert((block_hash, index), sender);
    }

    /// Fails the next `call` with `err`
    pub fn fail_next(&self, call: GatewayCall, err: GatewayError) {
        self.state.lock().next.entry(call).or_default().push_back(Scripted::Fail(err));
    }

    /// Panics inside the next `call`
    pub fn panic_next(&self, call: GatewayCall) {
        self.state.lock().next.entry(call).or_default().push_back(Scripted::Panic);
    }

    /// Fails every `call` with `err` until cleared
    pub fn fail_always(&self, call: GatewayCall, err: GatewayError) {
        self.state.lock().always.insert(call, err);
    }

    /// Drops every scripted failure for `call`
    pub fn clear_failures(&self, call: GatewayCall) {
        let mut state = self.state.lock();
        state.next.remove(&call);
        state.always.remove(&call);
    }

    /// Delays every answer by `delay`
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = Some(delay);
    }

    /// Number of times `call` was made
    pub fn calls(&self, call: GatewayCall) -> u64 {
        self.state.lock().calls.get(&call).copied().unwrap_or_default()
    }

    /// Number of calls of any kind
    pub fn total_calls(&self) -> u64 {
        self.state.lock().calls.values().sum()
    }

    /// Counts the call and applies its script, then answers with `lookup`
    async fn answer<T>(
        &self,
        call: GatewayCall,
        what: String,
        lookup: impl FnOnce(&MockState) -> Option<T>,
    ) -> Result<T, GatewayError> {
        let delay = {
            let mut state = self.state.lock();
            *state.calls.entry(call).or_default() += 1;
            state.delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.next.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(Scripted::Fail(err)) => return Err(err),
            Some(Scripted::Panic) => panic!("scripted panic in {call:?}"),
            None => {}
        }
        if let Some(err) = state.always.get(&call) {
            return Err(err.clone());
        }
        lookup(state).ok_or(GatewayError::NotFound(what))
    }
}

#[async_trait]
impl ChainGateway for MockGateway {
    async fn fetch_block(
        &self,
        selector: BlockSelector,
        full: bool,
    ) -> Result<BlockRecord, GatewayError> {
        self.answer(GatewayCall::Block, format!("block {selector}"), |state| {
            let block = state.blocks.get(&selector)?.clone();
            Some(if full { block } else { block.without_transactions() })
        })
        .await
    }

    async fn fetch_transaction(&self, hash: B256) -> Result<TransactionRecord, GatewayError> {
        self.answer(GatewayCall::Transaction, format!("transaction {hash}"), |state| {
            state.transactions.get(&hash).cloned()
        })
        .await
    }

    async fn fetch_receipt(&self, hash: B256) -> Result<ReceiptRecord, GatewayError> {
        self.answer(GatewayCall::Receipt, format!("receipt {hash}"), |state| {
            let mut receipt = state.receipts.get(&hash)?.clone();
            receipt.from = None;
            Some(receipt)
        })
        .await
    }

    async fn fetch_sender(&self, block_hash: B256, index: u64) -> Result<Address, GatewayError> {
        self.answer(
            GatewayCall::Sender,
            format!("transaction {index} of block {block_hash}"),
            |state| state.senders.get(&(block_hash, index)).copied(),
        )
        .await
    }
}

/// [`PersistentStore`] wrapper counting calls, with failure injection
pub struct CountingStore<S = SqliteStore> {
    inner: S,
    reads: Counter,
    writes: Counter,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl<S: PersistentStore> CountingStore<S> {
    /// Wraps `inner`
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            reads: Counter::default(),
            writes: Counter::default(),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// The wrapped store
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Read calls so far
    pub fn reads(&self) -> u64 {
        self.reads.get()
    }

    /// Write calls so far, including failed ones
    pub fn writes(&self) -> u64 {
        self.writes.get()
    }

    /// Makes every read fail
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Makes every write fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    fn read(&self) -> Result<(), StoreError> {
        self.reads.incr();
        check(&self.fail_reads)
    }

    fn write(&self) -> Result<(), StoreError> {
        self.writes.incr();
        check(&self.fail_writes)
    }
}

impl CountingStore<SqliteStore> {
    /// Row counts of the wrapped SQLite store
    pub fn counts(&self) -> Result<StoreCounts, StoreError> {
        self.inner.counts()
    }
}

fn check(flag: &AtomicBool) -> Result<(), StoreError> {
    if flag.load(Ordering::Relaxed) {
        let code = rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR);
        return Err(rusqlite::Error::SqliteFailure(code, Some("injected failure".into())).into());
    }
    Ok(())
}

impl<S: PersistentStore> PersistentStore for CountingStore<S> {
    fn save_block(&self, block: &BlockRecord, full: bool) -> Result<(), StoreError> {
        self.write()?;
        self.inner.save_block(block, full)
    }

    fn get_block(&self, number: u64, full: bool) -> Result<Option<BlockRecord>, StoreError> {
        self.read()?;
        self.inner.get_block(number, full)
    }

    fn save_transaction(&self, tx: &TransactionRecord) -> Result<(), StoreError> {
        self.write()?;
        self.inner.save_transaction(tx)
    }

    fn get_transaction(&self, hash: B256) -> Result<Option<TransactionRecord>, StoreError> {
        self.read()?;
        self.inner.get_transaction(hash)
    }

    fn save_receipt(&self, receipt: &ReceiptRecord) -> Result<(), StoreError> {
        self.write()?;
        self.inner.save_receipt(receipt)
    }

    fn get_receipt(&self, hash: B256) -> Result<Option<ReceiptRecord>, StoreError> {
        self.read()?;
        self.inner.get_receipt(hash)
    }
}

/// [`FastCache`] wrapper counting calls, with failure injection
pub struct CountingCache<C = MemoryCache> {
    inner: C,
    reads: Counter,
    writes: Counter,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    last_ttl: Mutex<Option<Duration>>,
}

impl<C: FastCache> CountingCache<C> {
    /// Wraps `inner`
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            reads: Counter::default(),
            writes: Counter::default(),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            last_ttl: Mutex::new(None),
        }
    }

    /// The wrapped cache
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Read calls so far
    pub fn reads(&self) -> u64 {
        self.reads.get()
    }

    /// Write calls so far, including failed ones
    pub fn writes(&self) -> u64 {
        self.writes.get()
    }

    /// TTL of the most recent write
    pub fn last_ttl(&self) -> Option<Duration> {
        *self.last_ttl.lock()
    }

    /// Makes every read fail
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Makes every write fail
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }
}

#[async_trait]
impl<C: FastCache> FastCache for CountingCache<C> {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        self.reads.incr();
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(CacheError::Backend("injected failure".into()));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), CacheError> {
        self.writes.incr();
        *self.last_ttl.lock() = Some(ttl);
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(CacheError::Backend("injected failure".into()));
        }
        self.inner.set(key, value, ttl).await
    }
}

/// Deterministic chain data, as records and as upstream JSON-RPC payloads
pub mod fixtures {
    use crate::types::{BlockRecord, ReceiptRecord, TransactionRecord};
    use alloy_primitives::{Address, Bytes, B256, U256};
    use chrono::{DateTime, Utc};
    use serde_json::{json, Value};

    fn tagged(tag: u8, seed: u64) -> B256 {
        let mut hash = B256::left_padding_from(&seed.to_be_bytes());
        hash.0[0] = tag;
        hash
    }

    /// Hash of block `number`
    pub fn block_hash(number: u64) -> B256 {
        tagged(0xbb, number)
    }

    /// A transaction hash derived from `seed`
    pub fn tx_hash(seed: u64) -> B256 {
        tagged(0xee, seed)
    }

    /// Timestamp of block `number`, twelve-second slots
    pub fn timestamp(number: u64) -> u64 {
        1_700_000_000 + number * 12
    }

    /// Sender of every fixture transaction
    pub fn sender() -> Address {
        Address::repeat_byte(0x5e)
    }

    /// Recipient of every fixture call
    pub fn recipient() -> Address {
        Address::repeat_byte(0xde)
    }

    /// A transaction; `to = None` makes it a contract creation
    pub fn transaction(
        hash: B256,
        block_number: u64,
        index: u64,
        to: Option<Address>,
    ) -> TransactionRecord {
        let input = match to {
            Some(_) => Bytes::new(),
            None => Bytes::from_static(&[0x60, 0x80, 0x60, 0x40, 0x52]),
        };
        TransactionRecord {
            hash,
            nonce: index,
            to,
            value: U256::from(1_000_000_000_000_000_000u128),
            gas_limit: 21_000,
            gas_price: U256::from(30_000_000_000u64),
            input,
            block_number,
            transaction_index: Some(index),
        }
    }

    /// Block `number`; when `full`, a transfer and a contract creation
    pub fn block(number: u64, full: bool) -> BlockRecord {
        let transactions = full.then(|| {
            vec![
                transaction(tx_hash(number * 1000), number, 0, Some(recipient())),
                transaction(tx_hash(number * 1000 + 1), number, 1, None),
            ]
        });
        BlockRecord {
            number,
            hash: block_hash(number),
            parent_hash: block_hash(number.saturating_sub(1)),
            timestamp: timestamp(number),
            transactions_root: tagged(0x77, number),
            transactions,
        }
    }

    /// A successful receipt with two logs, sent by [`sender`] to [`recipient`]
    pub fn receipt(hash: B256, block_number: u64, index: u64) -> ReceiptRecord {
        let stamp = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_123).unwrap_or_default();
        ReceiptRecord {
            transaction_hash: hash,
            block_hash: block_hash(block_number),
            block_number,
            transaction_index: index,
            contract_address: None,
            gas_used: 21_000,
            status: 1,
            from: Some(sender()),
            to: Some(recipient()),
            log_count: 2,
            raw: rpc_receipt(hash, block_number, index).to_string(),
            created_at: stamp,
            updated_at: stamp,
        }
    }

    /// `eth_getTransactionByHash` payload for `tx`
    pub fn rpc_transaction(tx: &TransactionRecord) -> Value {
        json!({
            "hash": tx.hash,
            "nonce": format!("{:#x}", tx.nonce),
            "from": sender(),
            "to": tx.to,
            "value": tx.value,
            "gas": format!("{:#x}", tx.gas_limit),
            "gasPrice": tx.gas_price,
            "input": tx.input,
            "blockHash": block_hash(tx.block_number),
            "blockNumber": format!("{:#x}", tx.block_number),
            "transactionIndex": tx.transaction_index.map(|i| format!("{i:#x}")),
            "type": "0x0",
        })
    }

    /// `eth_getBlockByNumber` payload for block `number`
    pub fn rpc_block(number: u64, full: bool) -> Value {
        let record = block(number, true);
        let transactions: Vec<Value> = record
            .transactions
            .iter()
            .flatten()
            .map(|tx| if full { rpc_transaction(tx) } else { json!(tx.hash) })
            .collect();

        json!({
            "number": format!("{number:#x}"),
            "hash": record.hash,
            "parentHash": record.parent_hash,
            "timestamp": format!("{:#x}", record.timestamp),
            "transactionsRoot": record.transactions_root,
            "miner": Address::ZERO,
            "gasUsed": "0xa410",
            "gasLimit": "0x1c9c380",
            "transactions": transactions,
        })
    }

    /// `eth_getTransactionReceipt` payload
    pub fn rpc_receipt(hash: B256, block_number: u64, index: u64) -> Value {
        let log = |i: u64| {
            json!({
                "address": recipient(),
                "topics": [tagged(0x10, i)],
                "data": "0x",
                "logIndex": format!("{i:#x}"),
            })
        };
        json!({
            "transactionHash": hash,
            "blockHash": block_hash(block_number),
            "blockNumber": format!("{block_number:#x}"),
            "transactionIndex": format!("{index:#x}"),
            "from": sender(),
            "to": recipient(),
            "contractAddress": null,
            "cumulativeGasUsed": "0xa410",
            "gasUsed": "0x5208",
            "status": "0x1",
            "logs": [log(0), log(1)],
            "type": "0x2",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockTag;

    #[tokio::test]
    async fn test_mock_gateway_scripts_run_in_order() {
        let gateway = MockGateway::new();
        gateway.insert_block(BlockTag::Head.into(), fixtures::block(1, true));
        gateway.fail_next(GatewayCall::Block, GatewayError::Upstream("first".into()));
        gateway.fail_always(GatewayCall::Block, GatewayError::Upstream("sticky".into()));

        let head = BlockSelector::Tag(BlockTag::Head);
        assert_eq!(
            gateway.fetch_block(head, true).await.unwrap_err(),
            GatewayError::Upstream("first".into())
        );
        assert_eq!(
            gateway.fetch_block(head, true).await.unwrap_err(),
            GatewayError::Upstream("sticky".into())
        );

        gateway.clear_failures(GatewayCall::Block);
        assert!(gateway.fetch_block(head, true).await.unwrap().is_full());
        assert!(!gateway.fetch_block(head, false).await.unwrap().is_full());
        assert_eq!(gateway.calls(GatewayCall::Block), 4);
        assert_eq!(gateway.total_calls(), 4);
    }

    #[test]
    fn test_fixture_block_bodies_agree() {
        let full = fixtures::block(3, true);
        assert_eq!(full.clone().without_transactions(), fixtures::block(3, false));
        assert_eq!(full.transactions.map(|txs| txs.len()), Some(2));
    }
}
