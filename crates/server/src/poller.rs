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

//! Background pollers keeping the tag entries of the fast cache warm
//!
//! Each [`TagPoller`] owns one task that refetches its tag on a fixed interval
//! and overwrites `block:<tag>` in the cache. A failing or panicking tick is
//! logged and counted; the loop keeps going until cancelled.

use crate::{
    cache::{set_typed, FastCache},
    error::PollerError,
    gateway::ChainGateway,
    metrics::{PollerMetrics, PollerStats},
    types::BlockTag,
};
use futures::{future::join_all, FutureExt};
use parking_lot::Mutex;
use std::{any::Any, collections::BTreeMap, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a poller; `Stopped` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    /// Built, task not spawned yet
    Created,
    /// Task running
    Running,
    /// Cancellation requested, task winding down
    Cancelling,
    /// Task exited (or never started)
    Stopped,
}

/// Poll interval per tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    /// Interval for `head`
    pub head: Duration,
    /// Interval for `finalized`
    pub finalized: Duration,
    /// Interval for `safe`
    pub safe: Duration,
}

impl PollSchedule {
    /// Same interval for every tag
    pub const fn uniform(every: Duration) -> Self {
        Self { head: every, finalized: every, safe: every }
    }

    /// Interval for `tag`
    pub const fn interval(&self, tag: BlockTag) -> Duration {
        match tag {
            BlockTag::Head => self.head,
            BlockTag::Finalized => self.finalized,
            BlockTag::Safe => self.safe,
        }
    }

    /// Longest interval of the three
    pub fn longest(&self) -> Duration {
        self.head.max(self.finalized).max(self.safe)
    }
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self::uniform(Duration::from_secs(5))
    }
}

/// TTL of entries written every `every`: at least `cache_ttl`, and long enough
/// to outlive a refresh that finishes up to half an interval late
pub fn warm_ttl(cache_ttl: Duration, every: Duration) -> Duration {
    cache_ttl.max(every + every / 2)
}

/// What one tick needs, shared with the spawned task
struct TickContext {
    tag: BlockTag,
    full: bool,
    ttl: Duration,
    gateway: Arc<dyn ChainGateway>,
    cache: Arc<dyn FastCache>,
}

impl TickContext {
    async fn tick(&self) -> Result<u64, PollerError> {
        let block = self.gateway.fetch_block(self.tag.into(), self.full).await?;
        set_typed(self.cache.as_ref(), &self.tag.cache_key(), &block, self.ttl).await?;
        Ok(block.number)
    }
}

/// Periodic refresher for one tag
pub struct TagPoller {
    ctx: Arc<TickContext>,
    interval: Duration,
    state: Arc<watch::Sender<PollerState>>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<PollerMetrics>,
}

impl TagPoller {
    /// Creates a poller for `tag`; entries it writes live for [`warm_ttl`]
    pub fn new(
        tag: BlockTag,
        every: Duration,
        cache_ttl: Duration,
        full: bool,
        gateway: Arc<dyn ChainGateway>,
        cache: Arc<dyn FastCache>,
    ) -> Self {
        let ctx = TickContext { tag, full, ttl: warm_ttl(cache_ttl, every), gateway, cache };
        let (state, _) = watch::channel(PollerState::Created);
        Self {
            ctx: Arc::new(ctx),
            interval: every,
            state: Arc::new(state),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
            metrics: Arc::new(PollerMetrics::default()),
        }
    }

    /// Tag this poller refreshes
    pub fn tag(&self) -> BlockTag {
        self.ctx.tag
    }

    /// Current lifecycle state
    pub fn state(&self) -> PollerState {
        *self.state.borrow()
    }

    /// Watches lifecycle transitions
    pub fn subscribe(&self) -> watch::Receiver<PollerState> {
        self.state.subscribe()
    }

    /// Tick counters
    pub fn stats(&self) -> PollerStats {
        self.metrics.snapshot()
    }

    /// Spawns the polling task; only valid from `Created`
    pub fn start(&self) -> Result<(), PollerError> {
        let mut handle = self.handle.lock();

        let mut previous = PollerState::Created;
        let started = self.state.send_if_modified(|state| {
            previous = *state;
            if *state == PollerState::Created {
                *state = PollerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(PollerError::InvalidState { tag: self.ctx.tag, state: previous });
        }

        let task = run(
            self.ctx.clone(),
            self.interval,
            self.cancel.clone(),
            self.state.clone(),
            self.metrics.clone(),
        );
        *handle = Some(tokio::spawn(task));
        Ok(())
    }

    /// Cancels the task and waits for it to exit
    ///
    /// Safe to call repeatedly and concurrently; every caller returns once the
    /// poller is `Stopped`.
    pub async fn stop(&self) {
        self.state.send_if_modified(|state| match *state {
            PollerState::Created => {
                *state = PollerState::Stopped;
                true
            }
            PollerState::Running => {
                *state = PollerState::Cancelling;
                true
            }
            PollerState::Cancelling | PollerState::Stopped => false,
        });
        self.cancel.cancel();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(tag = %self.ctx.tag, "Poller task ended abnormally: {}", err);
            }
            self.state.send_replace(PollerState::Stopped);
        }

        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == PollerState::Stopped).await;
    }
}

async fn run(
    ctx: Arc<TickContext>,
    every: Duration,
    cancel: CancellationToken,
    state: Arc<watch::Sender<PollerState>>,
    metrics: Arc<PollerMetrics>,
) {
    let tag = ctx.tag;
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(%tag, "Poller started, refreshing every {:?}", every);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = AssertUnwindSafe(ctx.tick()).catch_unwind() => outcome,
        };

        match outcome {
            Ok(Ok(number)) => {
                metrics.ticks_ok.incr();
                debug!(%tag, number, "Refreshed tag");
            }
            Ok(Err(err)) => {
                metrics.ticks_failed.incr();
                warn!(%tag, "Poll failed: {}", err);
            }
            Err(panic) => {
                metrics.ticks_failed.incr();
                error!(%tag, "Poll panicked: {}", panic_message(panic.as_ref()));
            }
        }
    }

    state.send_replace(PollerState::Stopped);
    info!(%tag, "Poller stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// One poller per tag
pub struct TagPollers {
    pollers: Vec<TagPoller>,
}

impl TagPollers {
    /// Creates a poller for every tag following `schedule`
    pub fn new(
        schedule: PollSchedule,
        cache_ttl: Duration,
        full: bool,
        gateway: Arc<dyn ChainGateway>,
        cache: Arc<dyn FastCache>,
    ) -> Self {
        let pollers = BlockTag::ALL
            .into_iter()
            .map(|tag| {
                TagPoller::new(
                    tag,
                    schedule.interval(tag),
                    cache_ttl,
                    full,
                    gateway.clone(),
                    cache.clone(),
                )
            })
            .collect();
        Self { pollers }
    }

    /// Starts every poller
    pub fn start(&self) -> Result<(), PollerError> {
        self.pollers.iter().try_for_each(TagPoller::start)
    }

    /// Stops every poller and waits for all of them
    pub async fn stop(&self) {
        join_all(self.pollers.iter().map(|poller| poller.stop())).await;
    }

    /// The poller for `tag`
    pub fn get(&self, tag: BlockTag) -> Option<&TagPoller> {
        self.pollers.iter().find(|poller| poller.tag() == tag)
    }

    /// Tick counters keyed by tag label
    pub fn stats(&self) -> BTreeMap<String, PollerStats> {
        self.pollers.iter().map(|poller| (poller.tag().to_string(), poller.stats())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::{get_typed, MemoryCache},
        error::GatewayError,
        testing::{fixtures, GatewayCall, MockGateway},
        types::BlockRecord,
    };
    use tokio::time::{sleep, timeout};
    use tracing::info;

    const EVERY: Duration = Duration::from_secs(5);
    const TTL: Duration = Duration::from_secs(10);

    fn head_poller(gateway: &Arc<MockGateway>, cache: &Arc<MemoryCache>) -> TagPoller {
        TagPoller::new(BlockTag::Head, EVERY, TTL, true, gateway.clone(), cache.clone())
    }

    async fn cached_head(cache: &MemoryCache) -> Option<BlockRecord> {
        get_typed(cache, &BlockTag::Head.cache_key()).await.unwrap()
    }

    #[test]
    fn test_warm_ttl_spans_late_refresh() {
        assert_eq!(warm_ttl(TTL, EVERY), TTL);
        assert_eq!(warm_ttl(EVERY, EVERY), Duration::from_millis(7_500));
        assert_eq!(warm_ttl(Duration::ZERO, Duration::from_secs(60)), Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_outlives_slow_refresh() {
        blockstash_common::logging::ensure_test_logging(None);
        info!("Testing warm cache across a slow tick");

        let gateway = Arc::new(MockGateway::new());
        let cache = Arc::new(MemoryCache::new(16));
        gateway.insert_block(BlockTag::Head.into(), fixtures::block(100, true));

        // Cache TTL equal to the interval
        let poller =
            TagPoller::new(BlockTag::Head, EVERY, EVERY, true, gateway.clone(), cache.clone());
        poller.start().unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(cached_head(&cache).await.map(|b| b.number), Some(100));

        // The second tick starts at 5s and only lands at 7s
        gateway.set_delay(Duration::from_secs(2));
        gateway.insert_block(BlockTag::Head.into(), fixtures::block(101, true));
        sleep(Duration::from_millis(6_890)).await;
        assert_eq!(cached_head(&cache).await.map(|b| b.number), Some(100));

        sleep(Duration::from_millis(200)).await;
        assert_eq!(cached_head(&cache).await.map(|b| b.number), Some(101));
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_refreshes_tag() {
        blockstash_common::logging::ensure_test_logging(None);
        info!("Testing tag freshness");

        let gateway = Arc::new(MockGateway::new());
        let cache = Arc::new(MemoryCache::new(16));
        gateway.insert_block(BlockTag::Head.into(), fixtures::block(100, true));

        let poller = head_poller(&gateway, &cache);
        poller.start().unwrap();
        assert_eq!(poller.state(), PollerState::Running);

        // First tick is immediate
        sleep(Duration::from_millis(10)).await;
        assert_eq!(cached_head(&cache).await, Some(fixtures::block(100, true)));

        gateway.insert_block(BlockTag::Head.into(), fixtures::block(101, true));
        sleep(EVERY).await;
        assert_eq!(cached_head(&cache).await.map(|b| b.number), Some(101));

        assert_eq!(poller.stats(), PollerStats { ticks_ok: 2, ticks_failed: 0 });
        poller.stop().await;
        assert_eq!(poller.state(), PollerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_survives_errors_and_panics() {
        blockstash_common::logging::ensure_test_logging(None);
        info!("Testing poller resilience");

        let gateway = Arc::new(MockGateway::new());
        let cache = Arc::new(MemoryCache::new(16));
        gateway.insert_block(BlockTag::Head.into(), fixtures::block(200, true));
        gateway.fail_next(GatewayCall::Block, GatewayError::Upstream("503".into()));
        gateway.panic_next(GatewayCall::Block);

        let poller = head_poller(&gateway, &cache);
        poller.start().unwrap();

        sleep(Duration::from_millis(10)).await;
        assert!(cached_head(&cache).await.is_none());

        sleep(EVERY).await;
        assert!(cached_head(&cache).await.is_none());
        assert_eq!(poller.state(), PollerState::Running);

        sleep(EVERY).await;
        assert_eq!(cached_head(&cache).await.map(|b| b.number), Some(200));
        assert_eq!(poller.stats(), PollerStats { ticks_ok: 1, ticks_failed: 2 });

        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_inflight_fetch() {
        blockstash_common::logging::ensure_test_logging(None);

        let gateway = Arc::new(MockGateway::new());
        let cache = Arc::new(MemoryCache::new(16));
        gateway.insert_block(BlockTag::Head.into(), fixtures::block(300, true));
        gateway.set_delay(Duration::from_secs(3600));

        let poller = head_poller(&gateway, &cache);
        poller.start().unwrap();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(gateway.calls(GatewayCall::Block), 1);

        timeout(Duration::from_secs(1), poller.stop()).await.expect("stop should not wait for the fetch");
        assert_eq!(poller.state(), PollerState::Stopped);
        assert_eq!(poller.stats().ticks_ok, 0);
        assert!(cached_head(&cache).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_concurrent_safe() {
        blockstash_common::logging::ensure_test_logging(None);
        info!("Testing repeated and concurrent stop");

        let gateway = Arc::new(MockGateway::new());
        let cache = Arc::new(MemoryCache::new(16));
        gateway.insert_block(BlockTag::Head.into(), fixtures::block(1, true));

        let poller = head_poller(&gateway, &cache);
        poller.start().unwrap();
        sleep(Duration::from_millis(10)).await;

        let mut states = poller.subscribe();
        tokio::join!(poller.stop(), poller.stop(), poller.stop());
        assert_eq!(*states.borrow_and_update(), PollerState::Stopped);

        poller.stop().await;
        assert!(matches!(
            poller.start(),
            Err(PollerError::InvalidState { state: PollerState::Stopped, .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        blockstash_common::logging::ensure_test_logging(None);

        let gateway = Arc::new(MockGateway::new());
        let cache = Arc::new(MemoryCache::new(16));
        let poller = head_poller(&gateway, &cache);

        poller.stop().await;
        assert_eq!(poller.state(), PollerState::Stopped);
        assert!(poller.start().is_err());
        assert_eq!(gateway.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_is_rejected() {
        blockstash_common::logging::ensure_test_logging(None);

        let gateway = Arc::new(MockGateway::new());
        let cache = Arc::new(MemoryCache::new(16));
        let poller = head_poller(&gateway, &cache);

        poller.start().unwrap();
        assert!(matches!(
            poller.start(),
            Err(PollerError::InvalidState { state: PollerState::Running, .. })
        ));
        poller.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_tag_pollers_cover_every_tag() {
        blockstash_common::logging::ensure_test_logging(None);
        info!("Testing the poller set");

        let gateway = Arc::new(MockGateway::new());
        let cache = Arc::new(MemoryCache::new(16));
        for (tag, number) in [(BlockTag::Head, 30), (BlockTag::Safe, 20), (BlockTag::Finalized, 10)] {
            gateway.insert_block(tag.into(), fixtures::block(number, true));
        }

        let schedule = PollSchedule {
            head: Duration::from_secs(2),
            finalized: Duration::from_secs(10),
            safe: Duration::from_secs(5),
        };
        assert_eq!(schedule.longest(), Duration::from_secs(10));

        let pollers = TagPollers::new(schedule, TTL, false, gateway.clone(), cache.clone());
        pollers.start().unwrap();
        sleep(Duration::from_millis(10)).await;

        for (tag, number) in [(BlockTag::Head, 30), (BlockTag::Safe, 20), (BlockTag::Finalized, 10)] {
            let block: BlockRecord = get_typed(cache.as_ref(), &tag.cache_key()).await.unwrap().unwrap();
            assert_eq!(block.number, number);
            assert!(!block.is_full());
        }

        sleep(Duration::from_secs(10)).await;
        let stats = pollers.stats();
        assert_eq!(stats["head"].ticks_ok, 6);
        assert_eq!(stats["safe"].ticks_ok, 3);
        assert_eq!(stats["finalized"].ticks_ok, 2);

        pollers.stop().await;
        assert!(BlockTag::ALL
            .into_iter()
            .all(|tag| pollers.get(tag).map(TagPoller::state) == Some(PollerState::Stopped)));
    }
}
