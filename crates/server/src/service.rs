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

//! Service wiring: builder, background tasks and the HTTP surface

use crate::{
    admission::AdmissionController,
    api::{ApiError, ReadApi},
    cache::{FastCache, MemoryCache},
    config::ServiceConfig,
    gateway::{ChainGateway, HttpGateway},
    health::HealthService,
    metrics::ServiceStats,
    poller::{PollSchedule, TagPollers},
    resolver::Resolver,
    store::{PersistentStore, SqliteStore},
    types::{BlockRecord, ReceiptRecord, TransactionRecord},
};
use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::Method,
    routing::get,
    Json, Router,
};
use eyre::Result;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

/// Builder for [`Service`] with a fluent API over [`ServiceConfig`]
///
/// Components left unset are built from the configuration: an
/// [`HttpGateway`], a [`SqliteStore`] and a [`MemoryCache`].
///
/// ```no_run
/// # use blockstash_server::service::ServiceBuilder;
/// # async fn example() -> eyre::Result<()> {
/// let service = ServiceBuilder::new()
///     .rpc_url("http://127.0.0.1:8545")
///     .admission(100, std::time::Duration::from_secs(60))
///     .build()?;
/// service.serve("127.0.0.1:8547".parse()?).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ServiceBuilder {
    config: ServiceConfig,
    gateway: Option<Arc<dyn ChainGateway>>,
    store: Option<Arc<dyn PersistentStore>>,
    cache: Option<Arc<dyn FastCache>>,
}

impl ServiceBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration
    pub fn from_config(config: ServiceConfig) -> Self {
        Self { config, ..Self::default() }
    }

    /// Set the upstream JSON-RPC URL
    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.config.upstream.rpc_url = url.into();
        self
    }

    /// Set the upstream request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.upstream.request_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the SQLite database file
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage.database_path = Some(path.into());
        self
    }

    /// Set the TTL of tag entries in the fast cache
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache.ttl_secs = ttl.as_secs();
        self
    }

    /// Set the maximum number of fast cache entries
    pub fn max_cache_items(mut self, max_items: usize) -> Self {
        self.config.cache.max_items = max_items;
        self
    }

    /// Set the per-client request budget
    pub fn admission(mut self, rate: u32, window: Duration) -> Self {
        self.config.admission.rate = rate;
        self.config.admission.window_secs = window.as_secs();
        self
    }

    /// Poll every tag at the same interval
    pub fn poll_interval(self, every: Duration) -> Self {
        self.poll_schedule(PollSchedule::uniform(every))
    }

    /// Poll each tag at its own interval
    pub fn poll_schedule(mut self, schedule: PollSchedule) -> Self {
        self.config.poller.head_interval_secs = schedule.head.as_secs();
        self.config.poller.finalized_interval_secs = schedule.finalized.as_secs();
        self.config.poller.safe_interval_secs = schedule.safe.as_secs();
        self
    }

    /// Whether pollers fetch blocks with their transactions
    pub fn full_blocks(mut self, full: bool) -> Self {
        self.config.poller.full_blocks = full;
        self
    }

    /// Use this upstream instead of an [`HttpGateway`]
    pub fn gateway(mut self, gateway: Arc<dyn ChainGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Use this store instead of a [`SqliteStore`]
    pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use this cache instead of a [`MemoryCache`]
    pub fn cache(mut self, cache: Arc<dyn FastCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Validate the configuration and wire every component
    ///
    /// Nothing runs until [`Service::start`] or [`Service::serve`].
    pub fn build(self) -> Result<Service> {
        let config = self.config;
        config.validate()?;

        let mut observed = Observed::default();

        let gateway: Arc<dyn ChainGateway> = match self.gateway {
            Some(gateway) => gateway,
            None => {
                let http = Arc::new(HttpGateway::new(
                    config.upstream.rpc_url.clone(),
                    config.upstream.request_timeout(),
                )?);
                info!("Using upstream node at {}", http.url());
                observed.gateway = Some(http.clone());
                http
            }
        };

        let store: Arc<dyn PersistentStore> = match self.store {
            Some(store) => store,
            None => {
                let sqlite = Arc::new(SqliteStore::open(config.storage.resolve_database_path()?)?);
                observed.store = Some(sqlite.clone());
                sqlite
            }
        };

        let cache: Arc<dyn FastCache> = match self.cache {
            Some(cache) => cache,
            None => {
                let memory = Arc::new(MemoryCache::new(config.cache.max_items));
                observed.cache = Some(memory.clone());
                memory
            }
        };

        let resolver =
            Arc::new(Resolver::new(gateway.clone(), store, cache.clone(), config.tag_ttl()));
        let admission =
            Arc::new(AdmissionController::new(config.admission.rate, config.admission.window()));
        let pollers = TagPollers::new(
            config.poller.schedule(),
            config.cache_ttl(),
            config.poller.full_blocks,
            gateway,
            cache,
        );

        Ok(Service {
            api: Arc::new(ReadApi::new(resolver, admission)),
            pollers: Arc::new(pollers),
            health: Arc::new(HealthService::new()),
            config: Arc::new(config),
            observed: Arc::new(observed),
            cancel: CancellationToken::new(),
            started: Arc::new(AtomicBool::new(false)),
            sweeper: Arc::new(Mutex::new(None)),
        })
    }
}

/// Concrete components the builder created itself, kept for `/stats`
#[derive(Default)]
struct Observed {
    gateway: Option<Arc<HttpGateway>>,
    store: Option<Arc<SqliteStore>>,
    cache: Option<Arc<MemoryCache>>,
}

/// The running service: read API, tag pollers and admission sweeper
///
/// Cheap to clone; every clone shares the same components.
#[derive(Clone)]
pub struct Service {
    api: Arc<ReadApi>,
    pollers: Arc<TagPollers>,
    health: Arc<HealthService>,
    config: Arc<ServiceConfig>,
    observed: Arc<Observed>,
    cancel: CancellationToken,
    started: Arc<AtomicBool>,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Service {
    /// Builder with default settings
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::new()
    }

    /// The read API
    pub fn api(&self) -> &Arc<ReadApi> {
        &self.api
    }

    /// The tag pollers
    pub fn pollers(&self) -> &TagPollers {
        &self.pollers
    }

    /// The effective configuration
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Starts the pollers and the admission sweeper; later calls do nothing
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.pollers.start()?;
        let sweeper = self.api.admission().spawn_sweeper(self.cancel.child_token());
        *self.sweeper.lock() = Some(sweeper);
        info!("Background tasks started");
        Ok(())
    }

    /// Stops the HTTP server, the pollers and the sweeper, waiting for all of them
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.pollers.stop().await;

        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            if let Err(err) = sweeper.await {
                warn!("Admission sweeper ended abnormally: {}", err);
            }
        }
        info!("Background tasks stopped");
    }

    /// Whether [`Self::shutdown`] was requested
    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Snapshot of every counter
    pub async fn stats(&self) -> ServiceStats {
        let cache = match &self.observed.cache {
            Some(cache) => Some(cache.detailed_stats().await),
            None => None,
        };
        let store = self.observed.store.as_ref().and_then(|store| match store.counts() {
            Ok(counts) => Some(counts),
            Err(err) => {
                warn!("Failed to count stored rows: {}", err);
                None
            }
        });

        ServiceStats {
            uptime_seconds: self.health.uptime(),
            upstream_requests: self.observed.gateway.as_ref().map(|g| g.request_count()),
            resolver: self.api.resolver().metrics().snapshot(),
            pollers: self.pollers.stats(),
            admission: self.api.admission().stats(),
            cache,
            store,
        }
    }

    /// The HTTP routes
    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/v1/eth/block/{block}", get(handle_block))
            .route("/api/v1/eth/tx/{hash}", get(handle_transaction))
            .route("/api/v1/eth/tx_receipt/{hash}", get(handle_receipt))
            .route("/health", get(handle_health))
            .route("/info", get(handle_info))
            .route("/stats", get(handle_stats))
            .layer(TraceLayer::new_for_http())
            .layer(
                CorsLayer::new()
                    .allow_methods([Method::GET])
                    .allow_headers(Any)
                    .allow_origin(Any),
            )
            .with_state(self.clone())
    }

    /// Binds `addr` and serves until [`Self::shutdown`]
    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_with_listener(listener).await
    }

    /// Serves on an already bound listener until [`Self::shutdown`]
    pub async fn serve_with_listener(self, listener: TcpListener) -> Result<()> {
        self.start()?;
        info!("Blockstash listening on {}", listener.local_addr()?);

        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();
        let cancel = self.cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

        self.shutdown().await;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct BlockQuery {
    full: Option<String>,
}

/// Reads a boolean query flag: `1`/`t`/`true` in any common casing is true,
/// anything else (including a missing flag) is false
fn parse_flag(value: Option<&str>) -> bool {
    matches!(value, Some("1" | "t" | "T" | "true" | "TRUE" | "True"))
}

fn client_key(peer: SocketAddr) -> String {
    peer.ip().to_string()
}

async fn handle_block(
    State(service): State<Service>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(block): Path<String>,
    Query(query): Query<BlockQuery>,
) -> Result<Json<BlockRecord>, ApiError> {
    let full = parse_flag(query.full.as_deref());
    let block = service.api.fetch_block(&client_key(peer), &block, full).await?;
    Ok(Json(block))
}

async fn handle_transaction(
    State(service): State<Service>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(hash): Path<String>,
) -> Result<Json<TransactionRecord>, ApiError> {
    Ok(Json(service.api.fetch_transaction(&client_key(peer), &hash).await?))
}

async fn handle_receipt(
    State(service): State<Service>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(hash): Path<String>,
) -> Result<Json<ReceiptRecord>, ApiError> {
    Ok(Json(service.api.fetch_receipt(&client_key(peer), &hash).await?))
}

async fn handle_health(State(service): State<Service>) -> Json<Value> {
    Json(service.health.ping())
}

async fn handle_info(State(service): State<Service>) -> Json<Value> {
    Json(service.health.info())
}

async fn handle_stats(State(service): State<Service>) -> Json<ServiceStats> {
    Json(service.stats().await)
}
