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

//! Tiered lookup: fast cache, then persistent store, then upstream
//!
//! Tag selectors are mutable pointers and are only ever answered from the fast
//! cache or upstream. Numeric selectors and hashes are immutable once mined, so
//! they are answered from the persistent store and written back into it.
//! Write-back is best-effort: a failed cache or store write is logged and the
//! fetched value is still returned.

use crate::{
    cache::{get_typed, set_typed, FastCache},
    error::{GatewayError, ResolveResult},
    gateway::ChainGateway,
    metrics::ResolverMetrics,
    store::PersistentStore,
    types::{
        parse_tx_hash, BlockRecord, BlockSelector, BlockTag, ReceiptRecord, TransactionRecord,
    },
};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, warn};

/// The resolution chain shared by the read API
pub struct Resolver {
    gateway: Arc<dyn ChainGateway>,
    store: Arc<dyn PersistentStore>,
    cache: Arc<dyn FastCache>,
    tag_ttl: Duration,
    metrics: ResolverMetrics,
}

impl Resolver {
    /// Creates a resolver; tag blocks fetched on a cache miss live for `tag_ttl`
    pub fn new(
        gateway: Arc<dyn ChainGateway>,
        store: Arc<dyn PersistentStore>,
        cache: Arc<dyn FastCache>,
        tag_ttl: Duration,
    ) -> Self {
        Self { gateway, store, cache, tag_ttl, metrics: ResolverMetrics::default() }
    }

    /// Live counters
    pub fn metrics(&self) -> &ResolverMetrics {
        &self.metrics
    }

    /// Resolves a block by number or tag
    pub async fn resolve_block(
        &self,
        selector: BlockSelector,
        full: bool,
    ) -> ResolveResult<BlockRecord> {
        match selector {
            BlockSelector::Tag(tag) => self.resolve_tag(tag, full).await,
            BlockSelector::Number(number) => self.resolve_number(number, full).await,
        }
    }

    /// Resolves a mined transaction by hash
    pub async fn resolve_transaction(&self, hash: &str) -> ResolveResult<TransactionRecord> {
        let hash = parse_tx_hash(hash)?;

        if let Some(tx) = self.store.get_transaction(hash)? {
            self.metrics.store_hits.incr();
            return Ok(tx);
        }
        self.metrics.store_misses.incr();

        let mut tx = self.fetch("transaction", self.gateway.fetch_transaction(hash)).await?;
        // A transaction without a receipt is not mined yet
        let receipt = self.fetch("receipt", self.gateway.fetch_receipt(hash)).await?;
        tx.block_number = receipt.block_number;
        tx.transaction_index.get_or_insert(receipt.transaction_index);

        if let Err(err) = self.store.save_transaction(&tx) {
            self.metrics.write_back_failures.incr();
            warn!(%hash, "Failed to persist transaction: {}", err);
        }
        Ok(tx)
    }

    /// Resolves a receipt by transaction hash, including its sender when recoverable
    pub async fn resolve_receipt(&self, hash: &str) -> ResolveResult<ReceiptRecord> {
        let hash = parse_tx_hash(hash)?;

        if let Some(receipt) = self.store.get_receipt(hash)? {
            self.metrics.store_hits.incr();
            return Ok(receipt);
        }
        self.metrics.store_misses.incr();

        let mut receipt = self.fetch("receipt", self.gateway.fetch_receipt(hash)).await?;

        match self.fetch("transaction", self.gateway.fetch_transaction(hash)).await {
            Ok(tx) => receipt.to = tx.to,
            Err(err) => debug!(%hash, "Keeping receipt recipient, transaction lookup failed: {}", err),
        }

        match self
            .fetch("sender", self.gateway.fetch_sender(receipt.block_hash, receipt.transaction_index))
            .await
        {
            Ok(sender) => receipt.from = Some(sender),
            Err(err) => {
                self.metrics.sender_recovery_failures.incr();
                warn!(%hash, "Could not recover sender, returning receipt without it: {}", err);
            }
        }

        if let Err(err) = self.store.save_receipt(&receipt) {
            self.metrics.write_back_failures.incr();
            warn!(%hash, "Failed to persist receipt: {}", err);
        }
        Ok(receipt)
    }

    async fn resolve_tag(&self, tag: BlockTag, full: bool) -> ResolveResult<BlockRecord> {
        let key = tag.cache_key();

        match get_typed::<BlockRecord>(self.cache.as_ref(), &key).await {
            Ok(Some(block)) if full && !block.is_full() => {
                debug!(%tag, number = block.number, "Cached block has no body, refetching");
            }
            Ok(Some(block)) => {
                self.metrics.cache_hits.incr();
                debug!(%tag, number = block.number, "Tag served from cache");
                return Ok(if full { block } else { block.without_transactions() });
            }
            Ok(None) => {}
            Err(err) => warn!(%tag, "Cache read failed, treating as miss: {}", err),
        }
        self.metrics.cache_misses.incr();

        let block = self.fetch("block", self.gateway.fetch_block(tag.into(), full)).await?;

        if let Err(err) = set_typed(self.cache.as_ref(), &key, &block, self.tag_ttl).await {
            self.metrics.write_back_failures.incr();
            warn!(%tag, "Failed to cache block: {}", err);
        }
        self.persist_block(&block, full);
        Ok(block)
    }

    async fn resolve_number(&self, number: u64, full: bool) -> ResolveResult<BlockRecord> {
        if let Some(block) = self.store.get_block(number, full)? {
            self.metrics.store_hits.incr();
            return Ok(block);
        }
        self.metrics.store_misses.incr();

        let block = self.fetch("block", self.gateway.fetch_block(number.into(), full)).await?;
        self.persist_block(&block, full);
        Ok(block)
    }

    fn persist_block(&self, block: &BlockRecord, full: bool) {
        if let Err(err) = self.store.save_block(block, full) {
            self.metrics.write_back_failures.incr();
            warn!(number = block.number, "Failed to persist block: {}", err);
        }
    }

    /// Runs one upstream call, counting it and logging upstream failures
    async fn fetch<T>(
        &self,
        what: &str,
        call: impl Future<Output = Result<T, GatewayError>>,
    ) -> ResolveResult<T> {
        self.metrics.gateway_fetches.incr();
        call.await.map_err(|err| {
            match &err {
                GatewayError::NotFound(item) => debug!("Upstream has no {}", item),
                GatewayError::Upstream(reason) => {
                    self.metrics.gateway_failures.incr();
                    warn!("Upstream {} fetch failed: {}", what, reason);
                }
            }
            err.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::MemoryCache,
        error::ResolveError,
        store::SqliteStore,
        testing::{fixtures, CountingCache, CountingStore, GatewayCall, MockGateway},
    };
    use tracing::info;

    const TTL: Duration = Duration::from_secs(10);

    struct Harness {
        gateway: Arc<MockGateway>,
        store: Arc<CountingStore<SqliteStore>>,
        cache: Arc<CountingCache<MemoryCache>>,
        resolver: Resolver,
    }

    fn harness() -> Harness {
        let gateway = Arc::new(MockGateway::new());
        let store = Arc::new(CountingStore::new(SqliteStore::in_memory().unwrap()));
        let cache = Arc::new(CountingCache::new(MemoryCache::new(64)));
        let resolver = Resolver::new(gateway.clone(), store.clone(), cache.clone(), TTL);
        Harness { gateway, store, cache, resolver }
    }

    #[tokio::test]
    async fn test_numeric_block_fetched_once() {
        blockstash_common::logging::ensure_test_logging(None);
        info!("Testing numeric block write-back");

        let h = harness();
        h.gateway.insert_block(100.into(), fixtures::block(100, true));

        let first = h.resolver.resolve_block(100.into(), false).await.unwrap();
        let second = h.resolver.resolve_block(100.into(), false).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, fixtures::block(100, false));
        assert_eq!(h.gateway.calls(GatewayCall::Block), 1);
        // Numeric lookups never touch the fast cache
        assert_eq!(h.cache.reads(), 0);
        assert_eq!(h.cache.writes(), 0);

        let stats = h.resolver.metrics().snapshot();
        assert_eq!(stats.store_hits, 1);
        assert_eq!(stats.store_misses, 1);
    }

    #[tokio::test]
    async fn test_full_request_upgrades_stored_header() {
        blockstash_common::logging::ensure_test_logging(None);

        let h = harness();
        h.gateway.insert_block(7.into(), fixtures::block(7, true));

        h.resolver.resolve_block(7.into(), false).await.unwrap();
        let full = h.resolver.resolve_block(7.into(), true).await.unwrap();
        assert_eq!(full, fixtures::block(7, true));
        assert_eq!(h.gateway.calls(GatewayCall::Block), 2);

        let again = h.resolver.resolve_block(7.into(), true).await.unwrap();
        assert_eq!(again, full);
        assert_eq!(h.gateway.calls(GatewayCall::Block), 2);
    }

    #[tokio::test]
    async fn test_tag_served_from_cache_after_miss() {
        blockstash_common::logging::ensure_test_logging(None);
        info!("Testing tag cache write-back");

        let h = harness();
        h.gateway.insert_block(BlockTag::Head.into(), fixtures::block(500, true));

        let fetched = h.resolver.resolve_block(BlockTag::Head.into(), true).await.unwrap();
        assert_eq!(fetched, fixtures::block(500, true));
        assert_eq!(h.cache.writes(), 1);

        let cached = h.resolver.resolve_block(BlockTag::Head.into(), false).await.unwrap();
        assert_eq!(cached, fixtures::block(500, false));
        assert_eq!(h.gateway.calls(GatewayCall::Block), 1);

        // The tag path also persisted the block under its number
        let stored = h.resolver.resolve_block(500.into(), true).await.unwrap();
        assert_eq!(stored, fetched);
        assert_eq!(h.gateway.calls(GatewayCall::Block), 1);

        let stats = h.resolver.metrics().snapshot();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tag_refetched_once_cache_entry_expires() {
        blockstash_common::logging::ensure_test_logging(None);
        info!("Testing tag expiry");

        let h = harness();
        h.gateway.insert_block(BlockTag::Head.into(), fixtures::block(500, true));

        let first = h.resolver.resolve_block(BlockTag::Head.into(), true).await.unwrap();
        assert_eq!(first.number, 500);

        // The chain moves on, but the cached head is still live
        h.gateway.insert_block(BlockTag::Head.into(), fixtures::block(501, true));
        tokio::time::advance(TTL - Duration::from_secs(1)).await;
        let cached = h.resolver.resolve_block(BlockTag::Head.into(), true).await.unwrap();
        assert_eq!(cached.number, 500);
        assert_eq!(h.gateway.calls(GatewayCall::Block), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let refreshed = h.resolver.resolve_block(BlockTag::Head.into(), true).await.unwrap();
        assert_eq!(refreshed, fixtures::block(501, true));
        assert_eq!(h.gateway.calls(GatewayCall::Block), 2);

        let stats = h.resolver.metrics().snapshot();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 2);
    }

    #[tokio::test]
    async fn test_header_only_cache_entry_misses_full_request() {
        blockstash_common::logging::ensure_test_logging(None);

        let h = harness();
        h.gateway.insert_block(BlockTag::Safe.into(), fixtures::block(480, true));

        h.resolver.resolve_block(BlockTag::Safe.into(), false).await.unwrap();
        let full = h.resolver.resolve_block(BlockTag::Safe.into(), true).await.unwrap();

        assert!(full.is_full());
        assert_eq!(h.gateway.calls(GatewayCall::Block), 2);
    }

    #[tokio::test]
    async fn test_not_found_is_never_cached() {
        blockstash_common::logging::ensure_test_logging(None);
        info!("Testing not-found propagation");

        let h = harness();
        for _ in 0..2 {
            let err = h.resolver.resolve_block(99_999_999.into(), false).await.unwrap_err();
            assert!(matches!(err, ResolveError::NotFound(_)));
            let err = h.resolver.resolve_block(BlockTag::Finalized.into(), false).await.unwrap_err();
            assert!(matches!(err, ResolveError::NotFound(_)));
        }

        assert_eq!(h.gateway.calls(GatewayCall::Block), 4);
        assert_eq!(h.store.writes(), 0);
        assert_eq!(h.cache.writes(), 0);
        assert_eq!(h.resolver.metrics().snapshot().gateway_failures, 0);
    }

    #[tokio::test]
    async fn test_upstream_failure_writes_nothing() {
        blockstash_common::logging::ensure_test_logging(None);

        let h = harness();
        h.gateway.insert_block(BlockTag::Head.into(), fixtures::block(500, true));
        h.gateway.fail_always(GatewayCall::Block, GatewayError::Upstream("connection reset".into()));

        let err = h.resolver.resolve_block(BlockTag::Head.into(), true).await.unwrap_err();
        assert_eq!(err, ResolveError::Upstream("connection reset".into()));
        let err = h.resolver.resolve_block(500.into(), true).await.unwrap_err();
        assert!(matches!(err, ResolveError::Upstream(_)));

        assert_eq!(h.store.writes(), 0);
        assert_eq!(h.cache.writes(), 0);
        assert_eq!(h.resolver.metrics().snapshot().gateway_failures, 2);
    }

    #[tokio::test]
    async fn test_validation_precedes_any_io() {
        blockstash_common::logging::ensure_test_logging(None);
        info!("Testing validation before I/O");

        let h = harness();
        let err = h.resolver.resolve_transaction("not-a-hash").await.unwrap_err();
        assert!(matches!(err, ResolveError::Validation(_)));
        let err = h.resolver.resolve_receipt("0x1234").await.unwrap_err();
        assert!(matches!(err, ResolveError::Validation(_)));

        assert_eq!(h.gateway.total_calls(), 0);
        assert_eq!(h.store.reads(), 0);
        assert_eq!(h.cache.reads(), 0);
    }

    #[tokio::test]
    async fn test_transaction_takes_block_number_from_receipt() {
        blockstash_common::logging::ensure_test_logging(None);
        info!("Testing transaction assembly");

        let h = harness();
        let hash = fixtures::tx_hash(77);
        let mut pending_view = fixtures::transaction(hash, 0, 3, Some(fixtures::recipient()));
        pending_view.transaction_index = None;
        h.gateway.insert_transaction(pending_view);
        h.gateway.insert_receipt(fixtures::receipt(hash, 42, 3));

        let tx = h.resolver.resolve_transaction(&hash.to_string()).await.unwrap();
        assert_eq!(tx.block_number, 42);
        assert_eq!(tx.transaction_index, Some(3));

        let again = h.resolver.resolve_transaction(&hash.to_string()).await.unwrap();
        assert_eq!(again, tx);
        assert_eq!(h.gateway.calls(GatewayCall::Transaction), 1);
        assert_eq!(h.gateway.calls(GatewayCall::Receipt), 1);
    }

    #[tokio::test]
    async fn test_unmined_transaction_is_not_found() {
        blockstash_common::logging::ensure_test_logging(None);

        let h = harness();
        let hash = fixtures::tx_hash(78);
        h.gateway.insert_transaction(fixtures::transaction(hash, 0, 0, None));

        let err = h.resolver.resolve_transaction(&hash.to_string()).await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
        assert_eq!(h.store.writes(), 0);
    }

    #[tokio::test]
    async fn test_receipt_with_sender() {
        blockstash_common::logging::ensure_test_logging(None);

        let h = harness();
        let hash = fixtures::tx_hash(90);
        let mut receipt = fixtures::receipt(hash, 42, 1);
        receipt.from = None;
        receipt.to = None;
        h.gateway.insert_receipt(receipt.clone());
        h.gateway.insert_transaction(fixtures::transaction(hash, 42, 1, Some(fixtures::recipient())));
        h.gateway.insert_sender(receipt.block_hash, 1, fixtures::sender());

        let resolved = h.resolver.resolve_receipt(&hash.to_string()).await.unwrap();
        assert_eq!(resolved.from, Some(fixtures::sender()));
        assert_eq!(resolved.to, Some(fixtures::recipient()));

        let stored = h.resolver.resolve_receipt(&hash.to_string()).await.unwrap();
        assert_eq!(stored, resolved);
        assert_eq!(h.gateway.calls(GatewayCall::Receipt), 1);
    }

    #[tokio::test]
    async fn test_receipt_partial_success_without_sender() {
        blockstash_common::logging::ensure_test_logging(None);
        info!("Testing receipt partial success");

        let h = harness();
        let hash = fixtures::tx_hash(91);
        let mut receipt = fixtures::receipt(hash, 42, 2);
        receipt.from = None;
        h.gateway.insert_receipt(receipt.clone());
        h.gateway.fail_always(GatewayCall::Sender, GatewayError::Upstream("timeout".into()));

        let resolved = h.resolver.resolve_receipt(&hash.to_string()).await.unwrap();
        assert_eq!(resolved.from, None);
        assert_eq!(resolved.transaction_hash, hash);
        assert_eq!(resolved.block_number, 42);
        // The transaction lookup found nothing, so the receipt's own recipient stays
        assert_eq!(resolved.to, receipt.to);

        assert_eq!(h.store.writes(), 1);
        assert_eq!(h.resolver.metrics().snapshot().sender_recovery_failures, 1);
    }

    #[tokio::test]
    async fn test_write_back_failure_is_swallowed() {
        blockstash_common::logging::ensure_test_logging(None);
        info!("Testing best-effort write-back");

        let h = harness();
        h.gateway.insert_block(12.into(), fixtures::block(12, false));
        h.gateway.insert_block(BlockTag::Head.into(), fixtures::block(12, false));
        h.store.fail_writes(true);
        h.cache.fail_writes(true);

        assert_eq!(h.resolver.resolve_block(12.into(), false).await.unwrap().number, 12);
        assert_eq!(h.resolver.resolve_block(BlockTag::Head.into(), false).await.unwrap().number, 12);
        // Cache write and store write on the tag path, store write on the numeric path
        assert_eq!(h.resolver.metrics().snapshot().write_back_failures, 3);
    }

    #[tokio::test]
    async fn test_store_read_failure_is_storage_error() {
        blockstash_common::logging::ensure_test_logging(None);

        let h = harness();
        h.gateway.insert_block(12.into(), fixtures::block(12, false));
        h.store.fail_reads(true);

        let err = h.resolver.resolve_block(12.into(), false).await.unwrap_err();
        assert!(matches!(err, ResolveError::Storage(_)));
        assert_eq!(h.gateway.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_cache_read_failure_is_a_miss() {
        blockstash_common::logging::ensure_test_logging(None);

        let h = harness();
        h.gateway.insert_block(BlockTag::Finalized.into(), fixtures::block(450, true));
        h.cache.fail_reads(true);

        let block = h.resolver.resolve_block(BlockTag::Finalized.into(), true).await.unwrap();
        assert_eq!(block.number, 450);
        assert_eq!(h.gateway.calls(GatewayCall::Block), 1);
    }
}
